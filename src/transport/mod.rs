//! Connection transports
//!
//! A session talks to exactly one connection, which is either a byte
//! stream carrying Content-Length framed messages (stdio, TCP) or a
//! message stream that already delivers one JSON document per message
//! (WebSocket). Both are exposed through the same pair of traits so the
//! session logic is written once.
//!
//! # Components
//!
//! - [`codec`] - Content-Length framing
//! - [`stream`] - byte-stream adapter
//! - [`websocket`] - message-stream adapter

pub mod codec;
pub mod stream;
pub mod websocket;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::WebSocketStream;

pub use stream::{ByteStreamReader, ByteStreamWriter};
pub use websocket::{WebSocketReader, WebSocketWriter};

/// Transport-level failures
#[derive(Error, Debug)]
pub enum TransportError {
    /// End of stream or orderly close by the peer
    #[error("connection closed")]
    Closed,

    /// Malformed Content-Length header
    #[error("framing error: {0}")]
    Framing(String),

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

impl TransportError {
    /// The byte stream can no longer be delimited
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            TransportError::Framing(_) | TransportError::FrameTooLarge { .. }
        )
    }
}

/// Read side of a connection: one complete JSON document per call
#[async_trait]
pub trait FrameReader: Send {
    async fn read_frame(&mut self) -> Result<Bytes, TransportError>;

    /// Whether `err` ends the connection. Non-fatal errors drop the
    /// current message and the session keeps reading.
    fn is_fatal(&self, err: &TransportError) -> bool {
        let _ = err;
        true
    }

    /// Upper bound for a single message, where the transport enforces one
    fn set_max_frame_size(&mut self, max: usize) {
        let _ = max;
    }
}

/// Write side of a connection: one complete JSON document per call
#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, body: &[u8]) -> Result<(), TransportError>;

    /// Close the underlying connection. Must be idempotent.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// One client connection, split into its read and write halves
pub struct Connection {
    pub(crate) reader: Box<dyn FrameReader>,
    pub(crate) writer: Box<dyn FrameWriter>,
    pub(crate) peer: String,
}

impl Connection {
    pub fn new(
        reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            reader,
            writer,
            peer: peer.into(),
        }
    }

    /// Content-Length framed connection over any byte stream
    pub fn byte_stream<R, W>(reader: R, writer: W, peer: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = stream::pair(reader, writer);
        Self::new(Box::new(reader), Box::new(writer), peer)
    }

    /// Process stdin/stdout
    pub fn stdio() -> Self {
        Self::byte_stream(tokio::io::stdin(), tokio::io::stdout(), "stdio")
    }

    /// Raw TCP socket
    pub fn tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "tcp".to_string());
        let (read_half, write_half) = stream.into_split();
        Self::byte_stream(read_half, write_half, peer)
    }

    /// Established WebSocket: one text message per JSON document
    pub fn websocket<S>(ws: WebSocketStream<S>, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = websocket::pair(ws);
        Self::new(Box::new(reader), Box::new(writer), peer)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}
