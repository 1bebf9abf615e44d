//! Core module containing the main functionality of Nexus
//!
//! This module provides:
//! - Transport layer for the supported connection kinds (Serial, TCP, Telnet)
//! - CR LF framing of inbound byte streams
//! - Connection registries with one read task per connection
//! - Telnet session state machine with command/response correlation
//! - Journal logging on a dedicated writer thread
//! - The `Hub` composition root tying them together

pub mod error;
pub mod event;
pub mod framing;
pub mod hub;
pub mod logger;
pub mod registry;
pub mod session;
pub mod transport;
