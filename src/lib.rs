//! # Nexus Core Library
//!
//! Device communication layer with support for:
//! - Serial ports (RS-232, RS-485, USB-Serial adapters), CR LF framed
//! - Raw TCP connections
//! - Telnet sessions with a password handshake
//!
//! ## Features
//!
//! - Multiple simultaneous connections, at most one per id
//! - Inbound events over a bounded channel
//! - Journal logging with backpressure
//! - CLI with exit codes
//!
//! ## Example
//!
//! ```rust,no_run
//! use nexus_core::{AppConfig, Hub, TcpConfig, Transport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (hub, mut events) = Hub::new(AppConfig::default());
//!     hub.connect("192.168.1.20:4001", &Transport::Tcp(TcpConfig::default()))
//!         .await?;
//!
//!     hub.send("192.168.1.20:4001", "STATUS").await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("[{}] {}: {}", event.kind, event.source, event.payload);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{ExitCodes, OutputFormat};
pub use crate::config::AppConfig;
pub use crate::core::error::CommError;
pub use crate::core::event::{EventKind, InboundEvent};
pub use crate::core::framing::LineFramer;
pub use crate::core::hub::Hub;
pub use crate::core::logger::{AsyncLogger, LogBook, LogTag};
pub use crate::core::registry::{Registry, RegistryConfig, SerialRegistry, TcpRegistry};
pub use crate::core::session::{TelnetRegistry, TelnetState};
pub use crate::core::transport::{
    SerialConfig, SerialFlowControl, SerialParity, TcpConfig, TelnetConfig, Transport,
    TransportError, TransportKind,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
