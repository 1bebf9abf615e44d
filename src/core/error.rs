//! Error taxonomy surfaced to callers of the registries

use super::session::TelnetState;
use super::transport::TransportError;
use std::io;
use thiserror::Error;

/// Communication errors, each tagged with the connection id
#[derive(Error, Debug)]
pub enum CommError {
    /// Open, dial or handshake failure
    #[error("{id}: connect failed: {source}")]
    Connect {
        /// Connection id
        id: String,
        /// Underlying transport failure
        #[source]
        source: TransportError,
    },

    /// No record for this id
    #[error("{0} is not connected")]
    NotConnected(String),

    /// Closing the transport failed for a reason other than "already closed"
    #[error("{id}: close failed: {source}")]
    Close {
        /// Connection id
        id: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Write failed
    #[error("{id}: send failed: {source}")]
    Send {
        /// Connection id
        id: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Reading a correlated response failed
    #[error("{id}: read failed: {source}")]
    Read {
        /// Connection id
        id: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// A Telnet marker did not arrive within its window
    #[error("{id}: {marker:?} not found while {state}")]
    Protocol {
        /// Connection id
        id: String,
        /// State the session was in
        state: TelnetState,
        /// Marker that was awaited
        marker: &'static str,
        /// Text accumulated before giving up
        partial: String,
    },
}

impl CommError {
    /// Connection id the error refers to
    pub fn id(&self) -> &str {
        match self {
            Self::Connect { id, .. }
            | Self::Close { id, .. }
            | Self::Send { id, .. }
            | Self::Read { id, .. }
            | Self::Protocol { id, .. } => id,
            Self::NotConnected(id) => id,
        }
    }

    pub(crate) fn connect(id: &str, source: TransportError) -> Self {
        Self::Connect {
            id: id.to_string(),
            source,
        }
    }

    pub(crate) fn send(id: &str, source: io::Error) -> Self {
        Self::Send {
            id: id.to_string(),
            source,
        }
    }
}
