//! Telnet wire helpers
//!
//! Only enough of RFC 854 to get past option offers: IAC triplets are consumed
//! and discarded without replying. On top of that, [`TelnetReader`] scans for
//! the ASCII markers the devices use to synchronize the login handshake and to
//! terminate every command response.

use crate::core::framing::encode_line;
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Interpret As Command
pub const IAC: u8 = 255;

/// Prompt that precedes the login command
pub const PASSWORD_PROMPT: &str = "Password: ";

/// Marker sent when the device is ready for the next command
pub const READY_MARKER: &str = "GPL:";

/// Telnet session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelnetConfig {
    /// Login command sent at the password prompt
    pub password: String,
    /// Dial timeout per attempt (ms)
    pub dial_timeout_ms: u64,
    /// Window for skipping option negotiation (ms)
    pub negotiation_timeout_ms: u64,
    /// Window for each handshake marker (ms)
    pub marker_timeout_ms: u64,
    /// Handshake attempts before giving up
    pub attempts: u32,
    /// Pause between attempts (ms)
    pub retry_backoff_ms: u64,
    /// Window for a command response (ms)
    pub response_timeout_ms: u64,
    /// Total window for discarding stale bytes (ms)
    pub drain_window_ms: u64,
    /// Quiet period that ends a stale-byte drain (ms)
    pub drain_poll_ms: u64,
    /// Discard a banner before negotiating
    pub drain_banner: bool,
}

impl TelnetConfig {
    /// Default timings with the given login command
    pub fn new(password: &str) -> Self {
        Self {
            password: password.to_string(),
            ..Self::default()
        }
    }

    /// Set the number of handshake attempts
    #[must_use]
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the login command
    #[must_use]
    pub fn password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    /// Dial timeout
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Negotiation window
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Marker window
    pub fn marker_timeout(&self) -> Duration {
        Duration::from_millis(self.marker_timeout_ms)
    }

    /// Backoff between attempts
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Response window
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Stale-byte drain window
    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms)
    }

    /// Stale-byte drain quiet period
    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms.max(1))
    }
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self {
            password: "Help".to_string(),
            dial_timeout_ms: 2_000,
            negotiation_timeout_ms: 2_000,
            marker_timeout_ms: 2_000,
            attempts: 3,
            retry_backoff_ms: 200,
            response_timeout_ms: 5_000,
            drain_window_ms: 500,
            drain_poll_ms: 50,
            drain_banner: false,
        }
    }
}

/// Failure while scanning for a marker
#[derive(Error, Debug)]
pub enum ScanError {
    /// The marker did not arrive in time
    #[error("{marker:?} not received within {window:?}")]
    Timeout {
        /// Awaited marker
        marker: &'static str,
        /// Window that expired
        window: Duration,
        /// Text read before giving up
        partial: String,
    },

    /// The stream failed
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Buffered cursor over a Telnet byte stream.
///
/// Bytes read past a marker stay in the buffer for the next scan.
#[derive(Debug)]
pub struct TelnetReader<S> {
    stream: S,
    pending: BytesMut,
}

impl<S> TelnetReader<S> {
    /// Wrap a connected stream
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            pending: BytesMut::with_capacity(4096),
        }
    }

    /// The underlying stream
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Consume the reader, dropping buffered bytes
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Bytes read but not consumed yet
    pub fn buffered(&self) -> &[u8] {
        &self.pending
    }
}

impl<S: AsyncRead + Unpin> TelnetReader<S> {
    async fn fill(&mut self) -> io::Result<()> {
        self.pending.reserve(1024);
        let n = self.stream.read_buf(&mut self.pending).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ));
        }
        Ok(())
    }

    async fn fill_to(&mut self, len: usize) -> io::Result<()> {
        while self.pending.len() < len {
            self.fill().await?;
        }
        Ok(())
    }

    async fn next_byte(&mut self) -> io::Result<u8> {
        self.fill_to(1).await?;
        Ok(self.pending.get_u8())
    }

    /// Discard leading IAC triplets.
    ///
    /// Stops at the first non-IAC byte, leaving it buffered. A window that
    /// expires means there is nothing (more) to negotiate.
    pub async fn skip_negotiation(&mut self, window: Duration) -> io::Result<()> {
        match tokio::time::timeout(window, self.skip_iac_prefix()).await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }

    async fn skip_iac_prefix(&mut self) -> io::Result<()> {
        loop {
            self.fill_to(1).await?;
            if self.pending[0] != IAC {
                return Ok(());
            }
            self.fill_to(3).await?;
            self.pending.advance(3);
        }
    }

    /// Read until `marker` has been seen, discarding IAC triplets on the way.
    /// Returns everything read up to and including the marker.
    pub async fn read_until(
        &mut self,
        marker: &'static str,
        window: Duration,
    ) -> Result<String, ScanError> {
        let mut seen = Vec::new();
        let scan = self.scan_into(marker.as_bytes(), &mut seen);

        let result = tokio::time::timeout(window, scan).await;
        match result {
            Ok(Ok(())) => Ok(String::from_utf8_lossy(&seen).into_owned()),
            Ok(Err(e)) => Err(ScanError::Io(e)),
            Err(_) => Err(ScanError::Timeout {
                marker,
                window,
                partial: String::from_utf8_lossy(&seen).into_owned(),
            }),
        }
    }

    async fn scan_into(&mut self, marker: &[u8], seen: &mut Vec<u8>) -> io::Result<()> {
        loop {
            let byte = self.next_byte().await?;
            if byte == IAC {
                self.fill_to(2).await?;
                self.pending.advance(2);
                continue;
            }
            seen.push(byte);
            if seen.ends_with(marker) {
                return Ok(());
            }
        }
    }

    /// Read a command response terminated by `marker`.
    ///
    /// Returns the text before the marker; the marker is consumed. Only the
    /// tail that could complete a marker straddling a read boundary is scanned
    /// again after each read.
    pub async fn read_response(
        &mut self,
        marker: &'static str,
        window: Duration,
    ) -> Result<String, ScanError> {
        let mut scanned = 0;
        let search = self.fill_until_marker(marker.as_bytes(), &mut scanned);

        let result = tokio::time::timeout(window, search).await;
        match result {
            Ok(Ok(index)) => {
                let response = self.pending.split_to(index);
                self.pending.advance(marker.len());
                Ok(String::from_utf8_lossy(&response).into_owned())
            }
            Ok(Err(e)) => Err(ScanError::Io(e)),
            Err(_) => {
                let partial = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                Err(ScanError::Timeout {
                    marker,
                    window,
                    partial,
                })
            }
        }
    }

    async fn fill_until_marker(&mut self, marker: &[u8], scanned: &mut usize) -> io::Result<usize> {
        loop {
            let start = scanned.saturating_sub(marker.len() - 1);
            if let Some(pos) = self.pending[start..]
                .windows(marker.len())
                .position(|w| w == marker)
            {
                return Ok(start + pos);
            }
            *scanned = self.pending.len();
            self.fill().await?;
        }
    }

    /// Discard stale bytes: everything buffered, plus whatever arrives until
    /// the stream stays quiet for `poll` or `window` has passed.
    pub async fn drain_stale(&mut self, window: Duration, poll: Duration) -> io::Result<usize> {
        let mut discarded = self.pending.len();
        self.pending.clear();

        let deadline = Instant::now() + window;
        let mut scratch = [0u8; 1024];
        while Instant::now() < deadline {
            match tokio::time::timeout(poll, self.stream.read(&mut scratch)).await {
                Err(_) | Ok(Ok(0)) => break,
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(e),
            }
        }
        Ok(discarded)
    }
}

impl<S: AsyncWrite + Unpin> TelnetReader<S> {
    /// Write `text` followed by CR LF
    pub async fn write_line(&mut self, text: &str) -> io::Result<()> {
        self.stream.write_all(&encode_line(text)).await?;
        self.stream.flush().await
    }
}

/// Drop the echoed command line and trim what remains
pub fn strip_echo(response: &str) -> String {
    match response.find('\n') {
        Some(index) => response[index + 1..].trim().to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_skip_negotiation_stops_at_data() {
        let (local, mut device) = tokio::io::duplex(256);
        let mut reader = TelnetReader::new(local);

        device
            .write_all(&[IAC, 253, 1, IAC, 251, 3, b'P'])
            .await
            .unwrap();
        reader.skip_negotiation(WINDOW).await.unwrap();
        assert_eq!(reader.buffered(), b"P");
    }

    #[tokio::test]
    async fn test_skip_negotiation_quiet_stream() {
        let (local, _device) = tokio::io::duplex(256);
        let mut reader = TelnetReader::new(local);
        let result = reader.skip_negotiation(Duration::from_millis(30)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_read_until_discards_iac() {
        let (local, mut device) = tokio::io::duplex(256);
        let mut reader = TelnetReader::new(local);

        device.write_all(b"banner\r\nPass").await.unwrap();
        device.write_all(&[IAC, 251, 1]).await.unwrap();
        device.write_all(b"word: ").await.unwrap();

        let text = reader.read_until(PASSWORD_PROMPT, WINDOW).await.unwrap();
        assert_eq!(text, "banner\r\nPassword: ");
    }

    #[tokio::test]
    async fn test_read_until_timeout() {
        let (local, mut device) = tokio::io::duplex(256);
        let mut reader = TelnetReader::new(local);
        device.write_all(b"login: ").await.unwrap();

        let result = reader
            .read_until(PASSWORD_PROMPT, Duration::from_millis(50))
            .await;
        assert!(matches!(
            result,
            Err(ScanError::Timeout { partial, .. }) if partial == "login: "
        ));
    }

    #[tokio::test]
    async fn test_response_marker_split_across_reads() {
        let (local, mut device) = tokio::io::duplex(256);
        let mut reader = TelnetReader::new(local);

        let feeder = tokio::spawn(async move {
            device.write_all(b"echo\r\nresultline\r\nGP").await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            device.write_all(b"L:next").await.unwrap();
            device
        });

        let raw = reader.read_response(READY_MARKER, WINDOW).await.unwrap();
        assert_eq!(raw, "echo\r\nresultline\r\n");
        assert_eq!(strip_echo(&raw), "resultline");
        assert_eq!(reader.buffered(), b"next");
        drop(feeder.await.unwrap());
    }

    #[tokio::test]
    async fn test_response_eof_is_io_error() {
        let (local, device) = tokio::io::duplex(256);
        let mut reader = TelnetReader::new(local);
        drop(device);

        let result = reader.read_response(READY_MARKER, WINDOW).await;
        assert!(matches!(result, Err(ScanError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_drain_stale_discards_buffered() {
        let (local, mut device) = tokio::io::duplex(256);
        let mut reader = TelnetReader::new(local);
        device.write_all(b"old output\r\n").await.unwrap();

        let discarded = reader
            .drain_stale(Duration::from_millis(200), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(discarded, 12);
        assert!(reader.buffered().is_empty());
    }

    #[test]
    fn test_strip_echo() {
        assert_eq!(strip_echo("STATUS\r\n  ready \r\n"), "ready");
        assert_eq!(strip_echo("no newline"), "");
    }

    #[tokio::test]
    async fn test_scripted_login() {
        let stream = tokio_test::io::Builder::new()
            .read(&[IAC, 251, 1])
            .read(b"Password: ")
            .write(b"Help\r\n")
            .read(b"Welcome\r\nGPL:")
            .build();
        let mut reader = TelnetReader::new(stream);

        reader.skip_negotiation(WINDOW).await.unwrap();
        reader.read_until(PASSWORD_PROMPT, WINDOW).await.unwrap();
        reader.write_line("Help").await.unwrap();
        let banner = reader.read_until(READY_MARKER, WINDOW).await.unwrap();
        assert!(banner.ends_with(READY_MARKER));
        assert!(reader.buffered().is_empty());
    }
}
