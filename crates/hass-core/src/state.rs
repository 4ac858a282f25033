//! State type representing an entity's state as reported by the hub

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Context, EntityId};

/// A snapshot of an entity's state at a point in time
///
/// States arrive inside `state_changed` events and state listings. The
/// value is always a string; everything structured lives in `attributes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// The entity this state belongs to
    pub entity_id: EntityId,

    /// The state value (e.g., "on", "off", "23.5", "unavailable")
    pub state: String,

    /// Additional attributes associated with the state
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// When the state value last changed
    pub last_changed: DateTime<Utc>,

    /// When the state was last written, even if the value didn't change
    pub last_updated: DateTime<Utc>,

    /// Context of the change that produced this state
    pub context: Context,
}

impl State {
    /// Create a state with the current timestamp, mainly for test fixtures
    pub fn new(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            state: state.into(),
            attributes,
            last_changed: now,
            last_updated: now,
            context,
        }
    }

    /// Check if the state value represents an unavailable entity
    pub fn is_unavailable(&self) -> bool {
        self.state == "unavailable"
    }

    /// Check if the state value represents an unknown state
    pub fn is_unknown(&self) -> bool {
        self.state == "unknown"
    }

    /// Get an attribute value by key, deserialized to the requested type
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_helpers() {
        let id = EntityId::new("light", "kitchen").unwrap();
        let mut attributes = HashMap::new();
        attributes.insert("brightness".to_string(), json!(128));

        let state = State::new(id, "on", attributes, Context::new());
        assert!(!state.is_unavailable());
        assert!(!state.is_unknown());
        assert_eq!(state.attribute::<u8>("brightness"), Some(128));
        assert_eq!(state.attribute::<u8>("missing"), None);
    }

    #[test]
    fn test_state_deserializes_hub_payload() {
        let json = r#"{
            "entity_id": "sensor.temperature",
            "state": "23.5",
            "attributes": {"unit_of_measurement": "°C"},
            "last_changed": "2024-05-01T10:00:00+00:00",
            "last_updated": "2024-05-01T10:00:00+00:00",
            "context": {"id": "01HV0000000000000000000000"}
        }"#;

        let state: State = serde_json::from_str(json).unwrap();
        assert_eq!(state.entity_id.domain(), "sensor");
        assert_eq!(state.state, "23.5");
        assert!(state.context.user_id.is_none());
    }
}
