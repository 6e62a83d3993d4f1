//! Contract of the remote command channel
//!
//! The panel only needs two things from the connection to Home Assistant:
//! a way to send a service call and a way to fetch the full entity list.
//! State pushes are consumed by the host and fed into the snapshot store.

use async_trait::async_trait;
use thiserror::Error;

use crate::{EntitySnapshot, ServiceCall};

/// Errors surfaced by a command channel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("not connected to Home Assistant")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("authentication rejected: {0}")]
    AuthInvalid(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("request rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Coarse classification of a failure, used to pick the user-facing message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    Connection,
    Authentication,
    Communication,
}

impl ChannelError {
    pub fn cause(&self) -> FailureCause {
        match self {
            ChannelError::NotConnected
            | ChannelError::Transport(_)
            | ChannelError::ConnectionClosed => FailureCause::Connection,
            ChannelError::AuthInvalid(_) => FailureCause::Authentication,
            ChannelError::Rejected { code, .. } if code == "unauthorized" => {
                FailureCause::Authentication
            }
            ChannelError::Timeout(_)
            | ChannelError::Rejected { .. }
            | ChannelError::Protocol(_) => FailureCause::Communication,
        }
    }
}

/// Sends commands to the remote system
///
/// `call_service` resolves once the remote side acknowledged the call,
/// not once the entity actually changed state.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn call_service(&self, call: ServiceCall) -> Result<(), ChannelError>;

    async fn get_states(&self) -> Result<Vec<EntitySnapshot>, ChannelError>;
}
