//! User-facing notices emitted when a command ends badly

use ha_core::{EntityId, FailureCause};

/// Terminal failure of a command, to be shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The command could not be sent at all
    SendFailed {
        entity_id: EntityId,
        cause: FailureCause,
        detail: String,
    },
    /// No confirming snapshot arrived before the deadline
    DeviceNotResponding { entity_id: EntityId },
}

impl Notice {
    pub fn entity_id(&self) -> &EntityId {
        match self {
            Notice::SendFailed { entity_id, .. } | Notice::DeviceNotResponding { entity_id } => {
                entity_id
            }
        }
    }

    /// Message to display
    pub fn message(&self) -> &'static str {
        match self {
            Notice::SendFailed {
                cause: FailureCause::Connection,
                ..
            } => "Connection to Home Assistant lost",
            Notice::SendFailed {
                cause: FailureCause::Authentication,
                ..
            } => "Home Assistant rejected the credentials",
            Notice::SendFailed {
                cause: FailureCause::Communication,
                ..
            } => "Communication error with Home Assistant",
            Notice::DeviceNotResponding { .. } => "Device not responding",
        }
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.entity_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_by_cause() {
        let entity_id: EntityId = "light.kitchen".parse().unwrap();
        let send_failed = |cause| Notice::SendFailed {
            entity_id: entity_id.clone(),
            cause,
            detail: String::new(),
        };

        assert_eq!(
            send_failed(FailureCause::Connection).message(),
            "Connection to Home Assistant lost"
        );
        assert_eq!(
            send_failed(FailureCause::Authentication).message(),
            "Home Assistant rejected the credentials"
        );
        assert_eq!(
            send_failed(FailureCause::Communication).message(),
            "Communication error with Home Assistant"
        );

        let timeout = Notice::DeviceNotResponding {
            entity_id: entity_id.clone(),
        };
        assert_eq!(timeout.to_string(), "Device not responding (light.kitchen)");
    }
}
