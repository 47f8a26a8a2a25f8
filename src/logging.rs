//! Logging and performance profiling sinks.
//!
//! The `log` facade is backed by a JSON-lines file writer so records
//! never touch the terminal the reader is drawing on. The profile sink
//! appends `{phase, millis}` lines for the expensive phases.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use log::{LevelFilter, Log, Metadata, Record};

/// JSON-lines sink behind the `log` facade.
struct JsonLogger {
    file: Mutex<File>,
    level: LevelFilter,
}

impl Log for JsonLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = serde_json::json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "level": record.level().to_string().to_lowercase(),
            "target": record.target(),
            "message": record.args().to_string(),
        });
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{line}");
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/// Parse a `--log-level` / `SHOKO_LOG_LEVEL` value.
pub fn parse_level(value: &str) -> Option<LevelFilter> {
    match value.to_ascii_lowercase().as_str() {
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        "fatal" => Some(LevelFilter::Error),
        _ => None,
    }
}

/// Install the file logger. With no path and no debug flag, logging
/// stays off so the terminal is untouched.
pub fn init(debug: bool, log_path: Option<PathBuf>, level: Option<LevelFilter>) {
    let level = level.unwrap_or(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let path = match log_path {
        Some(path) => path,
        None if debug => crate::config::config_root().join("shoko.log"),
        None => return,
    };
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let file = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("shoko: cannot open log file {}: {e}", path.display());
            return;
        }
    };

    let logger = Box::new(JsonLogger {
        file: Mutex::new(file),
        level,
    });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}

// ============================================================================
// Performance profile
// ============================================================================

static PROFILE: OnceLock<Mutex<File>> = OnceLock::new();

/// Enable the profile sink at the given path.
pub fn init_profile(path: &Path) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => {
            let _ = PROFILE.set(Mutex::new(file));
        }
        Err(e) => eprintln!("shoko: cannot open profile file {}: {e}", path.display()),
    }
}

/// Record a completed phase. A no-op unless profiling is enabled.
pub fn profile_phase(phase: &str, started: Instant) {
    let Some(file) = PROFILE.get() else {
        return;
    };
    let line = serde_json::json!({
        "phase": phase,
        "millis": started.elapsed().as_millis() as u64,
    });
    if let Ok(mut file) = file.lock() {
        let _ = writeln!(file, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parsing() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level("WARN"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("fatal"), Some(LevelFilter::Error));
        assert_eq!(parse_level("verbose"), None);
    }
}
