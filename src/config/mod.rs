use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, RpcError};
use crate::rpc::server::{ServerOptions, DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_MAX_LOGGED_BYTES};
use crate::transport::codec::DEFAULT_MAX_FRAME_SIZE;

const CONFIG_DIR: &str = "ridge-jsonrpc";
const MAIN_CONFIG_FILE: &str = "config.toml";

/// Address used by the TCP and WebSocket transports when none is configured
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7658";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    /// Log to this file instead of stderr
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Tcp,
    #[value(name = "websocket")]
    WebSocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::WebSocket => write!(f, "websocket"),
        }
    }
}

impl TransportKind {
    /// stdin is read on a blocking thread that cannot be cancelled, so a
    /// runtime serving stdio can only stop once stdin yields or closes
    pub fn reads_blocking_stdin(self) -> bool {
        matches!(self, TransportKind::Stdio)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: TransportKind,
    pub listen: String,
    /// Handlers executing at once per session; 0 removes the bound
    pub max_concurrent_requests: usize,
    pub max_frame_size: usize,
    pub max_logged_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stdio,
            listen: DEFAULT_LISTEN.to_string(),
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_logged_bytes: DEFAULT_MAX_LOGGED_BYTES,
        }
    }
}

impl ServerConfig {
    pub fn options(&self) -> ServerOptions {
        ServerOptions {
            max_concurrent_requests: (self.max_concurrent_requests > 0)
                .then_some(self.max_concurrent_requests),
            max_frame_size: self.max_frame_size,
            max_logged_bytes: self.max_logged_bytes,
        }
    }
}

impl AppConfig {
    /// Load from `explicit` if given, otherwise from the platform config
    /// directory. Only the implicit file may be missing or broken; an
    /// explicit one must exist and parse.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load_explicit(path),
            None => Ok(Self::default_path()
                .and_then(|path| Self::load_toml_file(&path))
                .unwrap_or_default()),
        }
    }

    /// `~/.config/ridge-jsonrpc/config.toml` or the platform equivalent
    pub fn default_path() -> Option<PathBuf> {
        BaseDirs::new().map(|dirs| dirs.config_dir().join(CONFIG_DIR).join(MAIN_CONFIG_FILE))
    }

    fn load_explicit(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RpcError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| RpcError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    fn load_toml_file<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RpcError::Config(format!("Failed to serialize config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.server.transport, TransportKind::Stdio);
        assert_eq!(config.server.max_concurrent_requests, 64);
        assert_eq!(config.server.options(), ServerOptions::default());
    }

    #[test]
    fn test_app_config_serialization() {
        let mut config = AppConfig::default();
        config.server.transport = TransportKind::WebSocket;
        config.general.log_file = Some(PathBuf::from("/tmp/rpc.log"));

        let toml_str = config.to_toml().unwrap();
        assert!(toml_str.contains("transport = \"websocket\""));
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\ntransport = \"tcp\"\nmax_concurrent_requests = 0").unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.server.transport, TransportKind::Tcp);
        assert_eq!(config.server.listen, DEFAULT_LISTEN);
        assert_eq!(config.general, GeneralConfig::default());
        assert_eq!(config.server.options().max_concurrent_requests, None);
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        match AppConfig::load(Some(&path)) {
            Err(RpcError::ConfigNotFound { path: missing }) => assert_eq!(missing, path),
            other => panic!("expected ConfigNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_explicit_invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\ntransport = \"carrier-pigeon\"").unwrap();
        assert!(matches!(
            AppConfig::load(Some(file.path())),
            Err(RpcError::Config(_))
        ));
    }

    #[test]
    fn test_only_stdio_reads_blocking_stdin() {
        assert!(TransportKind::Stdio.reads_blocking_stdin());
        assert!(!TransportKind::Tcp.reads_blocking_stdin());
        assert!(!TransportKind::WebSocket.reads_blocking_stdin());
    }

    #[test]
    fn test_implicit_broken_file_falls_back_to_default() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not toml at all [").unwrap();
        let config: Option<AppConfig> = AppConfig::load_toml_file(file.path());
        assert!(config.is_none());
    }
}
