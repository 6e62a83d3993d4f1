//! Authoritative snapshot of one entity as last reported by the remote system

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EntityId, STATE_UNAVAILABLE, STATE_UNKNOWN};

/// The latest known state of an entity
///
/// Snapshots are replaced wholesale when a newer one arrives; there is no
/// merging of attributes between two snapshots of the same entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// The entity this snapshot belongs to
    pub entity_id: EntityId,

    /// The state value (e.g., "on", "off", "opening", "unavailable")
    pub state: String,

    /// Free-form attributes reported alongside the state
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// When the state value last changed, if reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<DateTime<Utc>>,

    /// When the snapshot was last written, if reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl EntitySnapshot {
    /// Create a snapshot without attributes or timestamps
    pub fn new(entity_id: EntityId, state: impl Into<String>) -> Self {
        Self {
            entity_id,
            state: state.into(),
            attributes: HashMap::new(),
            last_changed: None,
            last_updated: None,
        }
    }

    /// Builder-style attribute insertion
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn is_unavailable(&self) -> bool {
        self.state == STATE_UNAVAILABLE
    }

    pub fn is_unknown(&self) -> bool {
        self.state == STATE_UNKNOWN
    }

    /// Display name, falling back to the entity id
    pub fn friendly_name(&self) -> String {
        self.attributes
            .get("friendly_name")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| self.entity_id.to_string())
    }

    /// Get an attribute value by key
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl PartialEq for EntitySnapshot {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps are bookkeeping, not state
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}
