//! Core types for the Home Assistant panel
//!
//! This crate provides the types shared by every other crate in the
//! workspace: EntityId, EntitySnapshot, the supported Domain set, ServiceCall,
//! and the CommandChannel contract the remote connection has to fulfil.

mod channel;
mod domains;
mod entity_id;
mod service_call;
mod snapshot;

pub use channel::{ChannelError, CommandChannel, FailureCause};
pub use domains::{Action, Command, Domain};
pub use entity_id::{EntityId, EntityIdError};
pub use service_call::{ServiceCall, ServiceTarget};
pub use snapshot::EntitySnapshot;

/// State value reported for entities the integration cannot reach
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// State value reported before the integration knows anything
pub const STATE_UNKNOWN: &str = "unknown";

/// Event payloads pushed by the remote system
pub mod events {
    use super::*;

    /// Event type for state changes
    pub const STATE_CHANGED: &str = "state_changed";

    /// Data for STATE_CHANGED events
    ///
    /// A `None` new_state means the entity was removed.
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        #[serde(default)]
        pub old_state: Option<EntitySnapshot>,
        #[serde(default)]
        pub new_state: Option<EntitySnapshot>,
    }
}

#[cfg(test)]
mod tests {
    use super::events::StateChangedData;
    use serde_json::json;

    #[test]
    fn test_state_changed_from_wire() {
        let data: StateChangedData = serde_json::from_value(json!({
            "entity_id": "light.kitchen",
            "old_state": {"entity_id": "light.kitchen", "state": "off", "attributes": {}},
            "new_state": {
                "entity_id": "light.kitchen",
                "state": "on",
                "attributes": {"brightness": 200},
                "last_changed": "2026-01-07T10:00:00+00:00",
                "last_updated": "2026-01-07T10:00:00+00:00",
                "context": {"id": "01HX", "parent_id": null, "user_id": null}
            }
        }))
        .unwrap();

        assert_eq!(data.entity_id.to_string(), "light.kitchen");
        assert_eq!(data.old_state.unwrap().state, "off");
        let new_state = data.new_state.unwrap();
        assert_eq!(new_state.state, "on");
        assert_eq!(new_state.attribute::<u8>("brightness"), Some(200));
    }

    #[test]
    fn test_state_changed_removal() {
        let data: StateChangedData = serde_json::from_value(json!({
            "entity_id": "switch.heater",
            "old_state": {"entity_id": "switch.heater", "state": "on", "attributes": {}},
            "new_state": null
        }))
        .unwrap();

        assert!(data.new_state.is_none());
    }
}
