//! WebSocket message types
//!
//! Only the server-to-client side is typed; outgoing requests are built with
//! `serde_json::json!`.

use serde::Deserialize;
use serde_json::Value;

/// Message received from Home Assistant
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<ErrorInfo>,
    },
    Event {
        id: u64,
        event: EventMessage,
    },
    Pong {
        id: u64,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Parse a text frame, which may carry a single message or a coalesced array
    pub fn parse_frame(text: &str) -> Result<Vec<ServerMessage>, serde_json::Error> {
        if text.trim_start().starts_with('[') {
            serde_json::from_str(text)
        } else {
            serde_json::from_str(text).map(|msg| vec![msg])
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Payload of an `event` message
#[derive(Debug, Clone, Deserialize)]
pub struct EventMessage {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}
