//! Core Home Assistant types shared by the WebSocket client
//!
//! This crate provides the fundamental types a client works with when
//! talking to a Home Assistant hub: EntityId, State, HassEvent, Context
//! and the well-known event type names.

mod context;
mod entity_id;
mod event;
mod state;

pub use context::Context;
pub use entity_id::{EntityId, EntityIdError};
pub use event::{EventOrigin, EventType, HassEvent, StateChangedEvent};
pub use state::State;

/// Well-known event types fired by a Home Assistant hub
pub mod events {
    /// Event type for state changes
    pub const STATE_CHANGED: &str = "state_changed";

    /// Event type for service calls
    pub const CALL_SERVICE: &str = "call_service";

    /// Event type for service registrations
    pub const SERVICE_REGISTERED: &str = "service_registered";

    /// Event type for Home Assistant start
    pub const HOMEASSISTANT_START: &str = "homeassistant_start";

    /// Event type for Home Assistant stop
    pub const HOMEASSISTANT_STOP: &str = "homeassistant_stop";

    /// Filter value requesting every event type
    pub const ANY: &str = "*";
}
