//! Logging setup.
//!
//! Installs a global `tracing` subscriber with:
//! - Console output on stdout
//! - Optional daily-rolling log files written off the hot path
//! - A level filter from configuration, overridable with `RUST_LOG`

use std::fs;
use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::Result;

/// Log file name prefix inside the configured directory
pub const LOG_FILE_PREFIX: &str = "geo-uplink.log";

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping this guard flushes and closes the log file writer.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize logging.
///
/// # Errors
///
/// Returns error if the log directory cannot be created or a global
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard> {
    let (file_layer, file_guard) = match config.dir.as_deref() {
        Some(dir) => {
            prepare_log_dir(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter(&config.level))
        .with(file_layer)
        .with(stdout_layer)
        .try_init()?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// `RUST_LOG` if set and valid, otherwise `default_level`
fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn prepare_log_dir<P: AsRef<Path>>(dir: P) -> io::Result<()> {
    fs::create_dir_all(dir)
}
