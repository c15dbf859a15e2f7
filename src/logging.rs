//! Subscriber setup
//!
//! Logs never go to stdout: in stdio mode stdout carries the protocol.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::error::{Result, RpcError};

/// Checked after `RUST_LOG`, before the configured level
pub const LOG_ENV: &str = "RIDGE_JSONRPC_LOG";

/// Keeps the file writer flushing; drop it only at exit
#[must_use]
pub struct LoggingGuard {
    _appender: Option<WorkerGuard>,
}

pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env(LOG_ENV))
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber, writing to `log_file` or stderr
pub fn init(level: &str, log_file: Option<&Path>) -> Result<LoggingGuard> {
    let filter = env_filter(level);

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| RpcError::Config(format!("Failed to install logger: {}", e)))?;
        return Ok(LoggingGuard { _appender: None });
    };

    let file_name = path
        .file_name()
        .ok_or_else(|| RpcError::Config(format!("Invalid log file {}", path.display())))?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| RpcError::Config(format!("Failed to install logger: {}", e)))?;

    Ok(LoggingGuard {
        _appender: Some(guard),
    })
}
