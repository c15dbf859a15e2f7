//! Byte-stream transport (stdio, raw sockets)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use super::codec::{self, DEFAULT_MAX_FRAME_SIZE};
use super::{FrameReader, FrameWriter, TransportError};

/// Build the two halves of a byte-stream connection. Closing the writer
/// makes every later read return end-of-stream.
pub fn pair<R, W>(reader: R, writer: W) -> (ByteStreamReader<R>, ByteStreamWriter<W>)
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let closed = Arc::new(AtomicBool::new(false));
    (
        ByteStreamReader {
            reader: BufReader::new(reader),
            closed: closed.clone(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        },
        ByteStreamWriter { writer, closed },
    )
}

pub struct ByteStreamReader<R> {
    reader: BufReader<R>,
    closed: Arc<AtomicBool>,
    max_frame_size: usize,
}

#[async_trait]
impl<R> FrameReader for ByteStreamReader<R>
where
    R: AsyncRead + Send + Unpin,
{
    async fn read_frame(&mut self) -> Result<Bytes, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        codec::read_frame(&mut self.reader, self.max_frame_size).await
    }

    fn set_max_frame_size(&mut self, max: usize) {
        self.max_frame_size = max;
    }
}

pub struct ByteStreamWriter<W> {
    writer: W,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl<W> FrameWriter for ByteStreamWriter<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn write_frame(&mut self, body: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        codec::write_frame(&mut self.writer, body).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.writer.shutdown().await?;
        Ok(())
    }
}
