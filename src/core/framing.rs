//! CR LF line framing
//!
//! Serial and Telnet devices terminate every message with `\r\n`. Bytes arrive
//! at arbitrary chunk boundaries, so [`LineFramer`] accumulates them and only
//! yields a message once all of it plus the delimiter has arrived.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Message delimiter for serial/Telnet framing and outbound commands
pub const DELIMITER: &[u8] = b"\r\n";

/// Default cap on bytes buffered without seeing a delimiter
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Framing errors
#[derive(Error, Debug)]
pub enum FrameError {
    /// The accumulator grew past its cap without a delimiter
    #[error("frame exceeds {limit} bytes without a delimiter")]
    Overflow {
        /// Configured cap
        limit: usize,
    },

    /// I/O error (required by the codec traits)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec splitting on CR LF, trimming whitespace and skipping empty messages
#[derive(Debug, Clone, Copy)]
pub struct CrLfCodec {
    max_frame_len: usize,
}

impl CrLfCodec {
    /// Create a codec with the default frame cap
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Set the frame cap
    #[must_use]
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Get the frame cap
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for CrLfCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(DELIMITER.len()).position(|w| w == DELIMITER)
}

impl Decoder for CrLfCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, FrameError> {
        loop {
            let Some(index) = find_delimiter(src) else {
                if src.len() > self.max_frame_len {
                    src.clear();
                    return Err(FrameError::Overflow {
                        limit: self.max_frame_len,
                    });
                }
                return Ok(None);
            };

            let frame = src.split_to(index);
            src.advance(DELIMITER.len());

            let text = String::from_utf8_lossy(&frame);
            let message = text.trim();
            if !message.is_empty() {
                return Ok(Some(message.to_string()));
            }
        }
    }
}

impl Encoder<&str> for CrLfCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.reserve(item.len() + DELIMITER.len());
        dst.put_slice(item.as_bytes());
        dst.put_slice(DELIMITER);
        Ok(())
    }
}

/// Encode one outbound command terminated by CR LF
pub fn encode_line(text: &str) -> Bytes {
    let mut dst = BytesMut::with_capacity(text.len() + DELIMITER.len());
    dst.put_slice(text.as_bytes());
    dst.put_slice(DELIMITER);
    dst.freeze()
}

/// Stateful accumulator turning raw chunks into complete messages
#[derive(Debug, Default)]
pub struct LineFramer {
    codec: CrLfCodec,
    buffer: BytesMut,
}

impl LineFramer {
    /// Create a framer with the default frame cap
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a framer with a custom frame cap
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            codec: CrLfCodec::new().with_max_frame_len(max_frame_len),
            buffer: BytesMut::new(),
        }
    }

    /// Append a raw chunk to the accumulator
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Yield every complete message currently buffered.
    ///
    /// Scanning stops when no delimiter remains; the remainder stays buffered
    /// for the next [`feed`](Self::feed).
    pub fn drain(&mut self) -> Drain<'_> {
        Drain { framer: self }
    }

    /// Bytes waiting for a delimiter
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial message
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Lazy iterator over complete messages, see [`LineFramer::drain`]
#[derive(Debug)]
pub struct Drain<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Drain<'_> {
    type Item = Result<String, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        let framer = &mut *self.framer;
        framer.codec.decode(&mut framer.buffer).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(framer: &mut LineFramer) -> Vec<String> {
        framer.drain().map(|m| m.unwrap()).collect()
    }

    #[test]
    fn test_fragmented_chunks() {
        let mut framer = LineFramer::new();
        let mut messages = Vec::new();

        for chunk in [&b"AB"[..], b"C\r\n", b"DE\r\n"] {
            framer.feed(chunk);
            messages.extend(collect(&mut framer));
        }

        assert_eq!(messages, vec!["ABC", "DE"]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_empty_messages_dropped() {
        let mut framer = LineFramer::new();
        framer.feed(b"\r\n\r\n");
        assert!(collect(&mut framer).is_empty());

        framer.feed(b"   \r\n\t\r\n");
        assert!(collect(&mut framer).is_empty());
    }

    #[test]
    fn test_delimiter_split_across_chunks() {
        let mut framer = LineFramer::new();
        framer.feed(b"OK\r");
        assert!(collect(&mut framer).is_empty());
        assert_eq!(framer.buffered(), 3);

        framer.feed(b"\nNEXT");
        assert_eq!(collect(&mut framer), vec!["OK"]);
        assert_eq!(framer.buffered(), 4);
    }

    #[test]
    fn test_surrounding_whitespace_trimmed() {
        let mut framer = LineFramer::new();
        framer.feed(b"  TEMP 21.5 \r\n");
        assert_eq!(collect(&mut framer), vec!["TEMP 21.5"]);
    }

    #[test]
    fn test_overflow_discards_buffer() {
        let mut framer = LineFramer::with_max_frame_len(8);
        framer.feed(b"0123456789");

        let results: Vec<_> = framer.drain().collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(FrameError::Overflow { limit: 8 })));
        assert_eq!(framer.buffered(), 0);

        framer.feed(b"ok\r\n");
        assert_eq!(collect(&mut framer), vec!["ok"]);
    }

    #[test]
    fn test_encode_appends_crlf() {
        let mut codec = CrLfCodec::new();
        let mut dst = BytesMut::new();
        codec.encode("STATUS", &mut dst).unwrap();
        assert_eq!(&dst[..], b"STATUS\r\n");
        assert_eq!(&encode_line("")[..], b"\r\n");
    }
}
