//! Connection settings

use std::time::Duration;

/// Deadline for the auth handshake
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for a single request/result exchange
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Reconnect attempts after an unexpected close
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

const RECONNECT_BASE_MS: u64 = 1_000;
const RECONNECT_CAP_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP(S) base URL of the Home Assistant instance
    pub base_url: String,

    /// Long-lived access token
    pub token: String,

    pub auth_timeout: Duration,
    pub request_timeout: Duration,
    pub max_reconnect_attempts: u32,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }

    /// WebSocket endpoint derived from the base URL
    pub fn ws_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let url = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{}/api/websocket", url)
    }
}

/// Delay before reconnect attempt `attempt` (1-based)
pub fn reconnect_delay(attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(RECONNECT_BASE_MS.saturating_mul(factor).min(RECONNECT_CAP_MS))
}
