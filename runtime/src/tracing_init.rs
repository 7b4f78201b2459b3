//! Structured logging setup shared by the daemon and the CLI front doors.
//!
//! Grounded in the CLI's `init_tracing`, adapted for a headless runtime: a
//! daemon has no terminal to protect, so when the log file can't be opened it
//! falls back to stderr rather than going silent.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the global tracing subscriber.
///
/// Filter comes from `RUST_LOG` if set, else `default_level`, else `"info"`.
/// Logs go to `<state_dir>/logs/coworker.log` when that file can be opened,
/// falling back to stderr.
pub fn init_tracing(state_dir: &Path, default_level: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::try_new("info").expect("info filter is valid"));

    match open_log_file(state_dir) {
        Ok((log_path, file)) => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .with(env_filter)
                .init();
            tracing::info!(path = %log_path.display(), "logging initialized");
        }
        Err(err) => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(std::io::stderr))
                .with(env_filter)
                .init();
            tracing::warn!("failed to open log file, logging to stderr instead: {err}");
        }
    }
}

fn open_log_file(state_dir: &Path) -> std::io::Result<(PathBuf, std::fs::File)> {
    let log_dir = state_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join("coworker.log");
    let file = OpenOptions::new().create(true).append(true).open(&log_path)?;
    Ok((log_path, file))
}
