//! In-memory client used by the session and server tests

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::protocol::{self, Message, Notification, Request, RequestId, Response};
use super::server::Server;
use crate::transport::codec::{self, DEFAULT_MAX_FRAME_SIZE};
use crate::transport::{stream, Connection, FrameReader, TransportError};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(100);

/// Poll `condition` until it holds, failing the test after a few seconds
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Reader fed from a channel; I/O errors are non-fatal, anything else
/// ends the session. A dropped sender reads as end of stream.
pub struct ScriptedReader {
    frames: mpsc::UnboundedReceiver<Result<Bytes, TransportError>>,
}

pub fn scripted_reader() -> (mpsc::UnboundedSender<Result<Bytes, TransportError>>, ScriptedReader) {
    let (tx, frames) = mpsc::unbounded_channel();
    (tx, ScriptedReader { frames })
}

#[async_trait]
impl FrameReader for ScriptedReader {
    async fn read_frame(&mut self) -> Result<Bytes, TransportError> {
        self.frames.recv().await.unwrap_or(Err(TransportError::Closed))
    }

    fn is_fatal(&self, err: &TransportError) -> bool {
        !matches!(err, TransportError::Io(_))
    }
}

/// Client end of a Content-Length framed in-memory connection
pub struct TestClient {
    writer: Option<DuplexStream>,
    reader: BufReader<DuplexStream>,
}

impl TestClient {
    pub fn connect(server: &Server) -> Self {
        let (client_write, server_read) = tokio::io::duplex(64 * 1024);
        let (server_write, client_read) = tokio::io::duplex(64 * 1024);
        server.serve(Connection::byte_stream(server_read, server_write, "test"));
        Self {
            writer: Some(client_write),
            reader: BufReader::new(client_read),
        }
    }

    /// Serve a session whose inbound side is `reader`; only the server's
    /// output reaches this client
    pub fn connect_reader(server: &Server, reader: Box<dyn FrameReader>) -> Self {
        let (server_write, client_read) = tokio::io::duplex(64 * 1024);
        let (_, writer) = stream::pair(tokio::io::empty(), server_write);
        server.serve(Connection::new(reader, Box::new(writer), "scripted"));
        Self {
            writer: None,
            reader: BufReader::new(client_read),
        }
    }

    fn writer(&mut self) -> &mut DuplexStream {
        self.writer.as_mut().expect("client already disconnected")
    }

    /// Write unframed bytes
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        let writer = self.writer();
        writer.write_all(bytes).await.unwrap();
        writer.flush().await.unwrap();
    }

    /// Frame and write `body` as-is
    pub async fn send_raw(&mut self, body: &[u8]) {
        codec::write_frame(self.writer(), body).await.unwrap();
    }

    pub async fn send(&mut self, message: &Message) {
        let body = message.to_vec().unwrap();
        self.send_raw(&body).await;
    }

    pub async fn request(&mut self, id: impl Into<RequestId>, method: &str, params: Value) {
        self.send(&Request::new(id, method, params).into()).await;
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send(&Notification::new(method, params).into()).await;
    }

    /// Close the client's write side; the server sees end of stream
    pub async fn disconnect(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
    }

    pub async fn read_raw(&mut self) -> Vec<u8> {
        let frame = timeout(WAIT, codec::read_frame(&mut self.reader, DEFAULT_MAX_FRAME_SIZE))
            .await
            .expect("timed out waiting for a message")
            .expect("failed to read a message");
        frame.to_vec()
    }

    pub async fn read_message(&mut self) -> Message {
        let body = self.read_raw().await;
        protocol::decode(&body).expect("server sent an invalid message")
    }

    pub async fn read_response(&mut self) -> Response {
        match self.read_message().await {
            Message::Response(response) => response,
            other => panic!("expected a response, got {:?}", other),
        }
    }

    /// Nothing more arrives for a short while
    pub async fn assert_silent(&mut self) {
        if let Ok(frame) = timeout(QUIET, codec::read_frame(&mut self.reader, DEFAULT_MAX_FRAME_SIZE)).await {
            panic!("unexpected message: {:?}", frame);
        }
    }

    /// The server closed its side of the connection
    pub async fn assert_closed(&mut self) {
        let result = timeout(WAIT, codec::read_frame(&mut self.reader, DEFAULT_MAX_FRAME_SIZE))
            .await
            .expect("connection was not closed");
        assert!(
            matches!(result, Err(TransportError::Closed)),
            "expected end of stream, got {:?}",
            result
        );
    }
}
