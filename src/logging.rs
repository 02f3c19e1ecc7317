//! Tracing subscriber setup.
//!
//! Interactive runs log to stderr. Service runs have no console, so they log
//! to a daily-rolling file instead.

use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;

use crate::config::LoggingConfig;
use crate::errors::{LicenseError, LicenseResult};

/// File name prefix of the rolling service log.
pub const LOG_FILE_PREFIX: &str = "licmon.log";

/// Parse a configured level name.
pub fn parse_level(level: &str) -> LicenseResult<Level> {
    level
        .parse::<Level>()
        .map_err(|_| LicenseError::ConfigError(format!("unknown log level '{level}'")))
}

/// Install the global subscriber for an interactive run.
pub fn init_console(config: &LoggingConfig) -> LicenseResult<()> {
    let level = parse_level(&config.level)?;
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| LicenseError::ConfigError(format!("failed to install logger: {e}")))
}

/// Install the global subscriber for service mode, writing to `dir`.
///
/// The returned guard flushes buffered lines on drop and must live as long
/// as the process logs.
pub fn init_file(config: &LoggingConfig, dir: &Path) -> LicenseResult<WorkerGuard> {
    let level = parse_level(&config.level)?;
    std::fs::create_dir_all(dir)?;

    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(|e| LicenseError::ConfigError(format!("failed to install logger: {e}")))?;

    Ok(guard)
}
