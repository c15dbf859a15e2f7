//! Content-Length framing for byte-stream transports
//!
//! LSP uses a single HTTP-like header before each JSON body:
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! {"jsonrpc": "2.0", ...}
//! ```
//! The reader is deliberately strict: the header name must come first,
//! the value must be terminated by CRLFCRLF within [`MAX_HEADER_VALUE_BYTES`],
//! and anything else is a framing error.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;

/// Header name, compared case-insensitively
pub const CONTENT_LENGTH: &[u8] = b"content-length:";

/// Bytes allowed between the header name and the end of CRLFCRLF
pub const MAX_HEADER_VALUE_BYTES: usize = 20;

/// Default upper bound for a single body
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Header reader state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    /// Reading the length value
    Value,
    FirstCr,
    FirstLf,
    SecondCr,
    /// CRLFCRLF seen
    Done,
}

impl HeaderState {
    fn advance(self, byte: u8) -> Result<Self, TransportError> {
        match (self, byte) {
            (HeaderState::Value, b'\r') => Ok(HeaderState::FirstCr),
            (HeaderState::Value, b'\n') => Err(framing("line feed before carriage return")),
            (HeaderState::Value, _) => Ok(HeaderState::Value),
            (HeaderState::FirstCr, b'\n') => Ok(HeaderState::FirstLf),
            (HeaderState::FirstLf, b'\r') => Ok(HeaderState::SecondCr),
            (HeaderState::SecondCr, b'\n') => Ok(HeaderState::Done),
            (state, byte) => Err(framing(format!(
                "unexpected byte 0x{:02x} in header terminator ({:?})",
                byte, state
            ))),
        }
    }
}

fn framing(message: impl Into<String>) -> TransportError {
    TransportError::Framing(message.into())
}

/// Map end-of-stream to [`TransportError::Closed`]
fn eof_as_closed(err: std::io::Error) -> TransportError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Io(err)
    }
}

/// Read one Content-Length framed body
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Bytes, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut name = [0u8; CONTENT_LENGTH.len()];
    reader.read_exact(&mut name).await.map_err(eof_as_closed)?;
    if !name.eq_ignore_ascii_case(CONTENT_LENGTH) {
        return Err(framing(format!(
            "expected Content-Length header, got {:?}",
            String::from_utf8_lossy(&name)
        )));
    }

    let mut value = Vec::with_capacity(MAX_HEADER_VALUE_BYTES);
    let mut state = HeaderState::Value;
    for _ in 0..MAX_HEADER_VALUE_BYTES {
        let byte = reader.read_u8().await.map_err(eof_as_closed)?;
        state = state.advance(byte)?;
        match state {
            HeaderState::Value => value.push(byte),
            HeaderState::Done => break,
            _ => {}
        }
    }
    if state != HeaderState::Done {
        return Err(framing(format!(
            "header not terminated within {} bytes",
            MAX_HEADER_VALUE_BYTES
        )));
    }

    let length = parse_length(&value)?;
    if length > max_frame_size {
        return Err(TransportError::FrameTooLarge {
            size: length,
            limit: max_frame_size,
        });
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.map_err(eof_as_closed)?;
    Ok(Bytes::from(body))
}

fn parse_length(value: &[u8]) -> Result<usize, TransportError> {
    let text = std::str::from_utf8(value)
        .map_err(|_| framing("Content-Length value is not UTF-8"))?
        .trim();
    text.parse::<usize>()
        .map_err(|e| framing(format!("invalid Content-Length {:?}: {}", text, e)))
}

/// Header for a body of `len` bytes
pub fn header(len: usize) -> String {
    format!("Content-Length: {}\r\n\r\n", len)
}

/// Write one framed body: header, then payload, then flush
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(header(body.len()).as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::duplex;

    async fn read_bytes(input: &[u8]) -> Result<Bytes, TransportError> {
        let mut reader = input;
        read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await
    }

    #[tokio::test]
    async fn test_read_frame() {
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"foo","params":{}}"#;
        let mut input = header(body.len()).into_bytes();
        input.extend_from_slice(body);
        input.extend_from_slice(b"Content-Length: 2\r\n\r\n{}");

        let mut reader = &input[..];
        let first = read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(&first[..], &body[..]);
        let second = read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(&second[..], b"{}");
        assert!(matches!(
            read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_header_name_is_case_insensitive() {
        let frame = read_bytes(b"CONTENT-length:2\r\n\r\n[]").await.unwrap();
        assert_eq!(&frame[..], b"[]");
    }

    #[rstest]
    #[case::wrong_prefix(&b"Content-Type: 2\r\n\r\n{}"[..])]
    #[case::non_numeric(&b"content-length: abc\r\n\r\n"[..])]
    #[case::stray_byte_after_cr(&b"Content-Length: 2\rx\n\r\n{}"[..])]
    #[case::lf_without_cr(&b"Content-Length: 2\n\r\n{}"[..])]
    #[case::double_cr(&b"Content-Length: 2\r\r\n\r\n{}"[..])]
    #[case::second_header(&b"Content-Length: 2\r\nContent-Type: x\r\n\r\n{}"[..])]
    #[case::unterminated(&b"Content-Length: 000000000000000000000002\r\n\r\n{}"[..])]
    #[case::negative(&b"Content-Length: -2\r\n\r\n{}"[..])]
    #[tokio::test]
    async fn test_malformed_header_is_framing_error(#[case] input: &[u8]) {
        let err = read_bytes(input).await.unwrap_err();
        assert!(err.is_framing(), "expected framing error, got {:?}", err);
    }

    #[tokio::test]
    async fn test_truncated_body_is_closed() {
        let err = read_bytes(b"Content-Length: 10\r\n\r\n{}").await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn test_frame_size_limit() {
        let mut reader = &b"Content-Length: 100\r\n\r\n"[..];
        let err = read_frame(&mut reader, 10).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::FrameTooLarge { size: 100, limit: 10 }
        ));
        assert!(err.is_framing());
    }

    #[tokio::test]
    async fn test_write_then_read_over_duplex() {
        let (mut a, mut b) = duplex(64);
        let body = br#"{"jsonrpc":"2.0","method":"test","params":{}}"#.to_vec();
        let expected = body.clone();

        let writer = tokio::spawn(async move {
            write_frame(&mut a, &body).await.unwrap();
        });

        let frame = read_frame(&mut b, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(&frame[..], &expected[..]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_frame_format() {
        let mut out = Vec::new();
        write_frame(&mut out, b"{}").await.unwrap();
        assert_eq!(out, b"Content-Length: 2\r\n\r\n{}");
    }
}
