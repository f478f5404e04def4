//! Incremental line decoding for the control channel

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line exceeds {0} bytes without a terminator")]
    LineTooLong(usize),

    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

/// Decoder for LF-terminated control lines.
pub struct LineCodec;

impl LineCodec {
    /// Maximum accepted line length. Control lines are a keyword plus at
    /// most one port number; anything near this limit is a broken peer.
    pub const MAX_LINE_LEN: usize = 1024;

    /// Decode one line from the buffer.
    ///
    /// Returns `Ok(Some(line))` with the terminator stripped and surrounding
    /// whitespace trimmed, `Ok(None)` if no complete line is buffered yet,
    /// or an error for oversized or non-UTF-8 input.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<String>, CodecError> {
        let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
            if buf.len() > Self::MAX_LINE_LEN {
                return Err(CodecError::LineTooLong(Self::MAX_LINE_LEN));
            }
            return Ok(None);
        };

        if pos > Self::MAX_LINE_LEN {
            return Err(CodecError::LineTooLong(Self::MAX_LINE_LEN));
        }

        let line = buf.split_to(pos);
        buf.advance(1); // the terminator itself

        let text = std::str::from_utf8(&line).map_err(|_| CodecError::InvalidUtf8)?;
        Ok(Some(text.trim().to_string()))
    }
}

/// Reads control lines from a socket read half, buffering partial input.
pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Read the next complete line.
    ///
    /// Returns `Ok(None)` once the peer has closed the connection; a partial
    /// line at EOF is discarded, since a session that ends mid-line is over
    /// either way.
    pub async fn next_line(&mut self) -> Result<Option<String>, CodecError> {
        loop {
            if let Some(line) = LineCodec::decode(&mut self.buf)? {
                return Ok(Some(line));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_complete_line() {
        let mut buf = BytesMut::from(&b"CONNECT\n"[..]);
        let line = LineCodec::decode(&mut buf).unwrap();
        assert_eq!(line.as_deref(), Some("CONNECT"));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_incomplete() {
        let mut buf = BytesMut::from(&b"PORT 491"[..]);
        assert_eq!(LineCodec::decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"52\n");
        let line = LineCodec::decode(&mut buf).unwrap();
        assert_eq!(line.as_deref(), Some("PORT 49152"));
    }

    #[test]
    fn test_decode_multiple_lines() {
        let mut buf = BytesMut::from(&b"CONNECT\nPORT 49152\nPONG\n"[..]);
        assert_eq!(LineCodec::decode(&mut buf).unwrap().as_deref(), Some("CONNECT"));
        assert_eq!(
            LineCodec::decode(&mut buf).unwrap().as_deref(),
            Some("PORT 49152")
        );
        assert_eq!(LineCodec::decode(&mut buf).unwrap().as_deref(), Some("PONG"));
        assert_eq!(LineCodec::decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_decode_trims_carriage_return() {
        let mut buf = BytesMut::from(&b"PING\r\n"[..]);
        assert_eq!(LineCodec::decode(&mut buf).unwrap().as_deref(), Some("PING"));
    }

    #[test]
    fn test_decode_oversized_line() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&vec![b'A'; LineCodec::MAX_LINE_LEN + 2]);
        assert!(matches!(
            LineCodec::decode(&mut buf),
            Err(CodecError::LineTooLong(_))
        ));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let mut buf = BytesMut::from(&[0xff, 0xfe, b'\n'][..]);
        assert!(matches!(
            LineCodec::decode(&mut buf),
            Err(CodecError::InvalidUtf8)
        ));
    }

    #[tokio::test]
    async fn test_line_reader_across_chunks() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = LineReader::new(server);

        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut client = client;
            client.write_all(b"NEW 10").await.unwrap();
            client.write_all(b"000\nPI").await.unwrap();
            client.write_all(b"NG\n").await.unwrap();
            // dropping the writer closes the stream
        });

        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("NEW 10000"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("PING"));
        assert_eq!(reader.next_line().await.unwrap(), None);

        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_line_reader_discards_partial_line_at_eof() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = LineReader::new(server);

        {
            use tokio::io::AsyncWriteExt;
            let mut client = client;
            client.write_all(b"PARTIAL").await.unwrap();
        }

        assert_eq!(reader.next_line().await.unwrap(), None);
    }
}
