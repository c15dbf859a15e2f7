use std::path::PathBuf;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("session {0} is closed")]
    SessionClosed(u64),

    #[error("session is already shutting down")]
    AlreadyShuttingDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, RpcError>;
