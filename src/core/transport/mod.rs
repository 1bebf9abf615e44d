//! Transport layer for the supported connection kinds
//!
//! Supports:
//! - Serial ports (RS-232, RS-485, USB-Serial), CR LF framed
//! - Raw TCP connections, delivered as opaque chunks
//! - Telnet sessions with a login handshake

mod platform;
mod serial;
mod tcp;
pub mod telnet;

pub use platform::{is_already_closed, is_closed_handle, is_dead_peer};
pub use serial::{list_ports, SerialConfig, SerialFlowControl, SerialOpener, SerialParity};
pub use tcp::{TcpConfig, TcpOpener};
pub(crate) use tcp::dial;
pub use telnet::TelnetConfig;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Connection parameters, one variant per transport kind
#[derive(Debug, Clone)]
pub enum Transport {
    /// Serial port connection
    Serial(SerialConfig),
    /// Raw TCP connection
    Tcp(TcpConfig),
    /// Telnet session
    Telnet(TelnetConfig),
}

impl Transport {
    /// Kind of this transport
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Serial(_) => TransportKind::Serial,
            Self::Tcp(_) => TransportKind::Tcp,
            Self::Telnet(_) => TransportKind::Telnet,
        }
    }
}

/// Transport kind identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Serial port
    Serial,
    /// Raw TCP
    Tcp,
    /// Telnet
    Telnet,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => write!(f, "Serial"),
            Self::Tcp => write!(f, "TCP"),
            Self::Telnet => write!(f, "Telnet"),
        }
    }
}

/// How a read task turns bytes into events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// CR LF delimited messages
    Lines,
    /// Every chunk is one event
    Raw,
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection timeout
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Telnet login handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A disconnect was requested while the connection was being set up
    #[error("Aborted: {0}")]
    Aborted(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Boxed read half of a link
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a link
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open byte stream, split so the read task and senders never contend
pub struct Link {
    /// Owned by the read task
    pub reader: BoxedReader,
    /// Owned by the connection record
    pub writer: BoxedWriter,
}

impl Link {
    /// Build a link from separate halves
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Split a duplex stream into a link
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Opens links of one transport kind
#[async_trait]
pub trait Opener: Send + Sync + 'static {
    /// Kind-specific connection parameters
    type Params: Send + Sync + 'static;

    /// Transport kind produced by this opener
    fn kind(&self) -> TransportKind;

    /// Framing applied by the read task
    fn framing(&self) -> Framing {
        match self.kind() {
            TransportKind::Tcp => Framing::Raw,
            TransportKind::Serial | TransportKind::Telnet => Framing::Lines,
        }
    }

    /// Open the transport identified by `id`
    async fn open(&self, id: &str, params: &Self::Params) -> Result<Link, TransportError>;
}

/// Connection id for socket transports
pub fn socket_id(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}
