//! Inbound events delivered from read tasks to the application

use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

/// Sending side handed to a registry on connect
pub type EventSink = mpsc::Sender<InboundEvent>;

/// Default capacity for event channels
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Kind of inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// A decoded message (a line for serial, a raw chunk for TCP)
    Data,
    /// A fatal read error; the connection is gone after this
    Error,
    /// Informational notice, e.g. the peer closed the connection
    Info,
}

impl EventKind {
    /// Bracketed log tag for this kind
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Data => "RECV",
            Self::Error => "ERRO",
            Self::Info => "INFO",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One event produced by a read task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundEvent {
    /// Connection the event came from
    pub source: String,
    /// Event kind
    pub kind: EventKind,
    /// Event text
    pub payload: String,
}

impl InboundEvent {
    /// Data event
    pub fn data(source: &str, payload: impl Into<String>) -> Self {
        Self::new(source, EventKind::Data, payload)
    }

    /// Error event
    pub fn error(source: &str, payload: impl Into<String>) -> Self {
        Self::new(source, EventKind::Error, payload)
    }

    /// Info event
    pub fn info(source: &str, payload: impl Into<String>) -> Self {
        Self::new(source, EventKind::Info, payload)
    }

    fn new(source: &str, kind: EventKind, payload: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            kind,
            payload: payload.into(),
        }
    }
}

/// Create a bounded event channel
pub fn channel(capacity: usize) -> (EventSink, mpsc::Receiver<InboundEvent>) {
    mpsc::channel(capacity)
}
