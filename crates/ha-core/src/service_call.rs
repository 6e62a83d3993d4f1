//! Service call sent to the remote system

use serde::{Deserialize, Serialize};

use crate::{Command, EntityId};

/// Entities or areas a service call applies to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTarget {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_id: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub area_id: Vec<String>,
}

impl ServiceTarget {
    pub fn entity(entity_id: &EntityId) -> Self {
        Self {
            entity_id: vec![entity_id.to_string()],
            area_id: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entity_id.is_empty() && self.area_id.is_empty()
    }
}

/// A call to a remote service (e.g., `light.turn_on`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    /// The domain the service belongs to (e.g., "light", "cover")
    pub domain: String,

    /// The service name (e.g., "turn_on", "open_cover")
    pub service: String,

    /// Extra service data (brightness, position, ...)
    #[serde(default)]
    pub service_data: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ServiceTarget>,
}

impl ServiceCall {
    pub fn new(
        domain: impl Into<String>,
        service: impl Into<String>,
        service_data: serde_json::Value,
        target: Option<ServiceTarget>,
    ) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            service_data,
            target,
        }
    }

    /// Build the call that carries out `command` on a single entity
    pub fn for_command(command: &Command, entity_id: &EntityId) -> Self {
        Self::new(
            command.domain.as_str(),
            command.service,
            serde_json::Value::Object(Default::default()),
            Some(ServiceTarget::entity(entity_id)),
        )
    }

    /// Full service identifier (domain.service)
    pub fn service_id(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Action, Domain};
    use serde_json::json;

    #[test]
    fn test_for_command() {
        let entity_id: EntityId = "cover.garage".parse().unwrap();
        let command = Domain::Cover.command(Action::Close, "open").unwrap();
        let call = ServiceCall::for_command(&command, &entity_id);

        assert_eq!(call.service_id(), "cover.close_cover");
        assert_eq!(
            call.target.as_ref().map(|t| t.entity_id.clone()),
            Some(vec!["cover.garage".to_string()])
        );
    }

    #[test]
    fn test_target_serialization_skips_empty() {
        let target = ServiceTarget::entity(&"light.kitchen".parse().unwrap());
        assert_eq!(
            serde_json::to_value(&target).unwrap(),
            json!({"entity_id": ["light.kitchen"]})
        );
        assert!(ServiceTarget::default().is_empty());
    }
}
