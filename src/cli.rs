use clap::Parser;
use std::path::PathBuf;

use crate::config::{AppConfig, TransportKind};

/// Ridge JSON-RPC: language-server style JSON-RPC 2.0 endpoint over stdio, TCP or WebSocket
#[derive(Parser, Debug, Clone)]
#[command(name = "ridge-jsonrpc")]
#[command(author = "RidgetopAI")]
#[command(version)]
#[command(about = "JSON-RPC 2.0 server for language tooling", long_about = None)]
pub struct Cli {
    /// Config file to use instead of the one in the platform config directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Transport to serve on
    #[arg(short, long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Listen address for the tcp and websocket transports
    #[arg(short, long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Handlers allowed to run at once per connection (0 = unbounded)
    #[arg(long, value_name = "N")]
    pub max_concurrent_requests: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Values given on the command line win over the config file
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(transport) = self.transport {
            config.server.transport = transport;
        }
        if let Some(listen) = &self.listen {
            config.server.listen = listen.clone();
        }
        if let Some(max) = self.max_concurrent_requests {
            config.server.max_concurrent_requests = max;
        }
        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
        if let Some(file) = &self.log_file {
            config.general.log_file = Some(file.clone());
        }
    }
}
