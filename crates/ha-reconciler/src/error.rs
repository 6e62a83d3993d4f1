//! Error types for the application root

use ha_core::{Action, ChannelError, Domain, EntityId};
use thiserror::Error;

/// Errors raised before a command ever reaches the reconciler
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HomeError {
    #[error("entity {0} is not known")]
    UnknownEntity(EntityId),

    #[error("entity {0} is not controllable")]
    UnsupportedDomain(EntityId),

    #[error("{domain} entities do not support {action:?}")]
    UnsupportedAction { domain: Domain, action: Action },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
