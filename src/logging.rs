//! Logging setup for embedders of the cache engine.
//!
//! Installs structured logging with dual output: a non-ANSI file layer
//! (non-blocking writer) and a stdout layer, filtered via `RUST_LOG`
//! with an `info` default. The engine itself only emits `tracing`
//! events; calling this is optional when the host application already
//! installs a subscriber.

use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default directory for log files.
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Default log file name.
pub const DEFAULT_LOG_FILE: &str = "platecache.log";

/// Keeps the non-blocking file writer alive.
///
/// Dropping the guard flushes and closes the log file, so it must
/// outlive everything that logs.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Initializes logging to `log_dir/log_file` and stdout.
///
/// Creates the log directory if needed and truncates any previous log
/// file so each session starts clean.
///
/// # Errors
///
/// Returns the I/O error when the directory cannot be created or the
/// file cannot be truncated, or an error when another global subscriber
/// is already installed.
pub fn init_logging(log_dir: &str, log_file: &str) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(log_dir)?;
    fs::write(Path::new(log_dir).join(log_file), "")?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_ansi(true);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| io::Error::other(format!("subscriber already installed: {e}")))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
