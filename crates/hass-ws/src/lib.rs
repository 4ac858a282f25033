//! Home Assistant WebSocket client
//!
//! One persistent, authenticated connection to a hub, multiplexing many
//! concurrently outstanding commands and event subscriptions, with
//! automatic reconnection and subscription restoration.
//!
//! This crate is organized into:
//! - `messages` - Wire message types (tagged by the JSON `type` field)
//! - `pending` - Correlation of sent commands to their responses
//! - `subscription` - One server subscription fanned out to many callbacks
//! - `connection` - Lifecycle, read/dispatch loops, reconnection
//! - `client` - The public [`HassWebSocketClient`] facade
//! - `state_changed` - Entity/domain listeners over one shared subscription

mod client;
mod connection;
mod error;
mod messages;
mod pending;
mod state_changed;
mod subscription;

pub use client::HassWebSocketClient;
pub use connection::{ConnectionParameters, ConnectionState};
pub use error::{ClientError, ClientResult};
pub use messages::{CommandMessage, CommandResult, ErrorCode, ErrorInfo};
pub use state_changed::{StateChangedCallback, StateChangedEventListener};
pub use subscription::EventCallback;

// Cancellation signals are part of the public API surface.
pub use tokio_util::sync::CancellationToken;
