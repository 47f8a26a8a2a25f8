//! CLI entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use shoko::app::App;
use shoko::config::{Config, cache_root, config_root};
use shoko::error::Error;
use shoko::term::{CrosstermPort, RecorderPort, TerminalPort, test_mode_requested};
use shoko::{logging, zip};

/// Terminal EPUB reader.
#[derive(Parser, Debug)]
#[command(name = "shoko", version, about)]
struct Args {
    /// EPUB file (or cache pointer) to open; omit for the library picker.
    path: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short = 'd', long)]
    debug: bool,

    /// JSON log file path.
    #[arg(long, value_name = "PATH")]
    log: Option<PathBuf>,

    /// Log level: debug, info, warn, error, fatal.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Performance profile output path.
    #[arg(long, value_name = "PATH")]
    profile: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let debug = args.debug || std::env::var("DEBUG").is_ok_and(|v| v == "1");
    let log_path = args
        .log
        .or_else(|| std::env::var_os("SHOKO_LOG_PATH").map(PathBuf::from));
    let level = args
        .log_level
        .or_else(|| std::env::var("SHOKO_LOG_LEVEL").ok())
        .and_then(|v| logging::parse_level(&v));
    logging::init(debug, log_path, level);

    let profile = args
        .profile
        .or_else(|| std::env::var_os("SHOKO_PROFILE_PATH").map(PathBuf::from));
    if let Some(path) = &profile {
        logging::init_profile(path);
    }

    // Validate the path up front so unreadable input exits with 2
    // before the terminal is touched.
    if let Some(path) = &args.path {
        if !path.exists() {
            eprintln!("shoko: {}: no such file", path.display());
            return ExitCode::from(2);
        }
        if path.is_file()
            && let Err(e @ (Error::FileNotFound(_) | Error::Io(_))) = zip::ZipReader::open(path)
                .map(|_| ())
        {
            eprintln!("shoko: {}: {e}", path.display());
            return ExitCode::from(2);
        }
    }

    let config_dir = config_root();
    let config = Config::load(&config_dir);

    let port: Box<dyn TerminalPort> = if test_mode_requested() {
        Box::new(RecorderPort::new(80, 24).quit_when_drained())
    } else {
        Box::new(CrosstermPort::new())
    };

    let mut app = App::new(config, config_dir, cache_root(), port);
    match app.run(args.path.as_deref()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {e}");
            eprintln!("shoko: {e}");
            ExitCode::from(1)
        }
    }
}
