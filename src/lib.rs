//! Ridge JSON-RPC: a JSON-RPC 2.0 server engine for language servers
//!
//! Messages arrive over stdio, TCP or WebSocket connections. Each
//! connection gets a [`rpc::Session`] that dispatches requests to
//! registered handlers concurrently, supports `$/cancelRequest` and tears
//! down cleanly when the client goes away.

pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod rpc;
pub mod transport;
