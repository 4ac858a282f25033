//! Event types fired by the hub and received over subscriptions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Context, EntityId, State};

/// Event type identifier used to key subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventType(String);

impl EventType {
    /// Create a new event type
    pub fn new(event_type: impl Into<String>) -> Self {
        Self(event_type.into())
    }

    /// Get the event type as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The wildcard type that subscribes to every event
    pub fn any() -> Self {
        Self(crate::events::ANY.to_string())
    }

    /// Check if this is the wildcard type
    pub fn is_any(&self) -> bool {
        self.0 == crate::events::ANY
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fired hub event as delivered inside an `event` frame
///
/// The data payload stays opaque JSON until a consumer asks for a concrete
/// shape via [`HassEvent::deserialize_data`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HassEvent {
    /// The type of event
    pub event_type: EventType,

    /// The event data
    pub data: serde_json::Value,

    /// Origin of the event (local, remote)
    pub origin: EventOrigin,

    /// When the event was fired on the hub
    pub time_fired: DateTime<Utc>,

    /// Context tracking the origin and causality
    pub context: Context,
}

impl HassEvent {
    /// Deserialize the event data to the specified type
    pub fn deserialize_data<T: serde::de::DeserializeOwned>(
        &self,
    ) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// Origin of an event
///
/// Hubs have historically emitted both lowercase and uppercase spellings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
    /// Event originated on the hub itself
    #[default]
    #[serde(alias = "LOCAL")]
    Local,
    /// Event came from a remote source
    #[serde(alias = "REMOTE")]
    Remote,
}

/// Data payload of a `state_changed` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangedEvent {
    pub entity_id: EntityId,
    #[serde(default)]
    pub old_state: Option<State>,
    #[serde(default)]
    pub new_state: Option<State>,
}

impl StateChangedEvent {
    /// The domain of the entity whose state changed
    pub fn domain(&self) -> &str {
        self.entity_id.domain()
    }
}
