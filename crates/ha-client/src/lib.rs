//! WebSocket command channel to Home Assistant
//!
//! [`WsClient`] speaks the Home Assistant WebSocket API: it authenticates
//! with a long-lived access token, correlates requests with their results by
//! message id, pushes `state_changed` events to subscribers and reconnects
//! on its own when the connection drops.

mod client;
mod config;
mod types;

pub use client::{ConnectionEvent, WsClient};
pub use config::{reconnect_delay, ClientConfig};
pub use types::{ErrorInfo, EventMessage, ServerMessage};
