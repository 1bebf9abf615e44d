//! CLI Module
//!
//! Provides command-line interface functionality including:
//! - Exit codes for automation
//! - Text and JSON rendering of inbound events

pub mod exit_codes;

pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes};

use crate::core::event::InboundEvent;

/// Output format for events and replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Render an inbound event
pub fn format_event(event: &InboundEvent, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => format!("[{}] {}: {}", event.kind, event.source, event.payload),
        OutputFormat::Json => serde_json::to_string(event).unwrap_or_default(),
    }
}

/// Render the correlated reply to a Telnet command
pub fn format_reply(source: &str, reply: &str, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => reply.to_string(),
        OutputFormat::Json => serde_json::json!({
            "source": source,
            "kind": "Reply",
            "payload": reply,
        })
        .to_string(),
    }
}
