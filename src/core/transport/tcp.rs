//! TCP transport implementation

use super::{Link, Opener, TransportError, TransportKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// TCP connection options. The `host:port` address is the connection id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Dial timeout in milliseconds
    pub timeout_ms: u64,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl TcpConfig {
    /// Default options (3s dial timeout, `TCP_NODELAY` on)
    pub fn new() -> Self {
        Self {
            timeout_ms: 3_000,
            nodelay: true,
        }
    }

    /// Set dial timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Dial timeout
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Dial `addr` within `timeout`
pub(crate) async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
}

/// Opens raw TCP connections
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpOpener;

#[async_trait]
impl Opener for TcpOpener {
    type Params = TcpConfig;

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn open(&self, id: &str, params: &TcpConfig) -> Result<Link, TransportError> {
        let stream = dial(id, params.dial_timeout()).await?;

        if params.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }

        debug!("Dialed {}", id);
        let (reader, writer) = stream.into_split();
        Ok(Link::new(reader, writer))
    }
}
