//! Configuration snapshot and on-disk paths.
//!
//! The core consumes a [`Config`] by value; persistence lives under the
//! XDG config root, the book cache under the XDG cache root, both in a
//! `shoko/` sub-directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::store::write_json_atomic;
use crate::error::{Error, Result};
use crate::layout::{LineSpacing, PageNumbering, ViewMode};

const CONFIG_FILE: &str = "config.json";

/// User-facing settings consumed by the reading core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub view_mode: ViewMode,
    pub line_spacing: LineSpacing,
    pub page_numbering: PageNumbering,
    pub show_page_numbers: bool,
    pub image_rendering: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            view_mode: ViewMode::Single,
            line_spacing: LineSpacing::Normal,
            page_numbering: PageNumbering::Dynamic,
            show_page_numbers: true,
            image_rendering: false,
        }
    }
}

impl Config {
    /// Load from the config root; unreadable or invalid files keep the
    /// defaults.
    pub fn load(config_dir: &Path) -> Self {
        let path = config_dir.join(CONFIG_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("invalid {}: {e}; using defaults", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, config_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(config_dir).map_err(|e| Error::CacheWrite {
            path: config_dir.to_path_buf(),
            source: e,
        })?;
        write_json_atomic(&config_dir.join(CONFIG_FILE), self)
    }

    /// Set one field from a string value. Invalid input leaves the
    /// field untouched and reports which value was rejected.
    pub fn set(&mut self, field: &str, value: &str) -> Result<()> {
        match field {
            "view_mode" => {
                self.view_mode = match value {
                    "single" => ViewMode::Single,
                    "split" => ViewMode::Split,
                    other => return Err(Error::validation(field, format!("unknown mode '{other}'"))),
                };
            }
            "line_spacing" => {
                self.line_spacing = match value {
                    "compact" => LineSpacing::Compact,
                    "normal" => LineSpacing::Normal,
                    "relaxed" => LineSpacing::Relaxed,
                    other => {
                        return Err(Error::validation(field, format!("unknown spacing '{other}'")));
                    }
                };
            }
            "page_numbering" => {
                self.page_numbering = match value {
                    "dynamic" => PageNumbering::Dynamic,
                    "absolute" => PageNumbering::Absolute,
                    other => {
                        return Err(Error::validation(field, format!("unknown policy '{other}'")));
                    }
                };
            }
            "show_page_numbers" => {
                self.show_page_numbers = parse_bool(field, value)?;
            }
            "image_rendering" => {
                self.image_rendering = parse_bool(field, value)?;
            }
            other => {
                return Err(Error::validation(other, "unknown setting"));
            }
        }
        Ok(())
    }
}

fn parse_bool(field: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "on" | "yes" => Ok(true),
        "false" | "0" | "off" | "no" => Ok(false),
        other => Err(Error::validation(field, format!("expected a boolean, got '{other}'"))),
    }
}

/// `${XDG_CONFIG_HOME:-~/.config}/shoko/`
pub fn config_root() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", dirs::config_dir).join("shoko")
}

/// `${XDG_CACHE_HOME:-~/.cache}/shoko/`
pub fn cache_root() -> PathBuf {
    xdg_dir("XDG_CACHE_HOME", dirs::cache_dir).join("shoko")
}

fn xdg_dir(env_var: &str, fallback: fn() -> Option<PathBuf>) -> PathBuf {
    match std::env::var_os(env_var) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => fallback().unwrap_or_else(|| PathBuf::from(".")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = Config::default();
        assert_eq!(config.view_mode, ViewMode::Single);
        assert_eq!(config.page_numbering, PageNumbering::Dynamic);
        assert!(!config.image_rendering);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.set("view_mode", "split").unwrap();
        config.set("line_spacing", "relaxed").unwrap();
        config.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path());
        assert_eq!(loaded, config);
    }

    #[test]
    fn invalid_value_keeps_previous() {
        let mut config = Config::default();
        config.set("line_spacing", "relaxed").unwrap();
        let err = config.set("line_spacing", "triple").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(config.line_spacing, LineSpacing::Relaxed);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), b"{not json").unwrap();
        assert_eq!(Config::load(dir.path()), Config::default());
    }

    #[test]
    fn boolean_parsing_accepts_common_forms() {
        let mut config = Config::default();
        config.set("image_rendering", "on").unwrap();
        assert!(config.image_rendering);
        config.set("image_rendering", "0").unwrap();
        assert!(!config.image_rendering);
        assert!(config.set("show_page_numbers", "maybe").is_err());
    }
}
