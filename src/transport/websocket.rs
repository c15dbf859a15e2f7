//! WebSocket transport: one text message carries one JSON document

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;

use super::{FrameReader, FrameWriter, TransportError};

type WsSink<S> = SplitSink<WebSocketStream<S>, WsMessage>;

pub fn pair<S>(ws: WebSocketStream<S>) -> (WebSocketReader<S>, WebSocketWriter<S>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (sink, stream) = ws.split();
    (
        WebSocketReader { stream },
        WebSocketWriter {
            sink: Mutex::new(sink),
        },
    )
}

pub struct WebSocketReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameReader for WebSocketReader<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn read_frame(&mut self) -> Result<Bytes, TransportError> {
        loop {
            match self.stream.next().await {
                None => return Err(TransportError::Closed),
                Some(Ok(WsMessage::Text(text))) => return Ok(Bytes::from(text.to_string())),
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::debug!("WebSocket close frame: {:?}", frame);
                    return Err(TransportError::Closed);
                }
                // Binary, ping and pong frames carry no JSON-RPC traffic
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    fn is_fatal(&self, err: &TransportError) -> bool {
        match err {
            // Oversized message: drop it and keep the connection
            TransportError::WebSocket(tungstenite::Error::Capacity(_)) => false,
            _ => true,
        }
    }
}

/// The sink forbids concurrent writers, so it sits behind its own lock.
/// The session's write lock is always taken first.
pub struct WebSocketWriter<S> {
    sink: Mutex<WsSink<S>>,
}

#[async_trait]
impl<S> FrameWriter for WebSocketWriter<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn write_frame(&mut self, body: &[u8]) -> Result<(), TransportError> {
        let text = std::str::from_utf8(body)
            .map_err(|e| TransportError::Framing(format!("message is not UTF-8: {}", e)))?
            .to_owned();
        self.sink.lock().await.send(WsMessage::text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.sink.lock().await.close().await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
