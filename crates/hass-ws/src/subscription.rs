//! Registry fanning one server subscription out to many local callbacks

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use hass_core::{events, HassEvent};
use tracing::{debug, warn};

use crate::messages::EventMessage;

/// Callback invoked for every event a subscription delivers
///
/// Callbacks are identified by `Arc` pointer identity: unregistering
/// requires the same `Arc` that was registered.
pub type EventCallback = Arc<dyn Fn(&HassEvent) + Send + Sync + 'static>;

/// One server-side subscription and the local callbacks fanned out from it
struct SocketEventSubscription {
    /// Hub-assigned id; tags every event frame this subscription produces.
    /// Invalidated by any disconnection and overwritten during restoration.
    subscription_id: u64,
    callbacks: Vec<EventCallback>,
}

/// Maps event-type keys to their single server subscription
///
/// The hub is asked to subscribe exactly once per key; additional local
/// registrations only grow the callback set. Add/remove for the same key is
/// serialized through a per-key async lock because both are check-then-act
/// sequences spanning a server round-trip.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, SocketEventSubscription>>,
    key_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The async lock serializing add/remove for one key
    pub fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    /// Snapshot of all registered keys, used for restoration
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    /// Create the entry for a key after a successful server subscribe
    pub fn insert(&self, key: &str, subscription_id: u64) {
        self.entries.lock().unwrap().insert(
            key.to_string(),
            SocketEventSubscription {
                subscription_id,
                callbacks: Vec::new(),
            },
        );
    }

    /// Overwrite the server id for a key (subscription restoration)
    pub fn set_subscription_id(&self, key: &str, subscription_id: u64) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(key) {
            entry.subscription_id = subscription_id;
        }
    }

    /// The server id currently stored for a key
    pub fn subscription_id(&self, key: &str) -> Option<u64> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|entry| entry.subscription_id)
    }

    /// Add a callback to an existing entry; false when the entry is missing
    pub fn add_callback(&self, key: &str, callback: EventCallback) -> bool {
        match self.entries.lock().unwrap().get_mut(key) {
            Some(entry) => {
                entry.callbacks.push(callback);
                true
            }
            None => false,
        }
    }

    /// Remove a callback by identity
    ///
    /// Returns the remaining callback count, or None when the key or the
    /// callback was never registered (no side effects in that case).
    pub fn remove_callback(&self, key: &str, callback: &EventCallback) -> Option<usize> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(key)?;
        let position = entry
            .callbacks
            .iter()
            .position(|registered| Arc::ptr_eq(registered, callback))?;
        entry.callbacks.remove(position);
        Some(entry.callbacks.len())
    }

    /// Discard the entry for a key after a successful server unsubscribe
    pub fn remove_entry(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Total number of local callback registrations across all keys
    pub fn subscriptions_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.callbacks.len())
            .sum()
    }

    /// Drop every callback and entry (client disposal)
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Deliver one queued event frame to the matching callback sets
    ///
    /// The specific key and the wildcard key are looked up independently;
    /// each fires only if its stored subscription id matches the frame's id,
    /// since both are separate server-side subscriptions.
    pub fn dispatch(&self, message: &EventMessage) {
        let event: HassEvent = match serde_json::from_value(message.event.clone()) {
            Ok(event) => event,
            Err(error) => {
                warn!(%error, id = message.id, "undecodable event payload; discarding");
                return;
            }
        };

        let callbacks: Vec<EventCallback> = {
            let entries = self.entries.lock().unwrap();
            [event.event_type.as_str(), events::ANY]
                .iter()
                .filter_map(|key| entries.get(*key))
                .filter(|entry| entry.subscription_id == message.id)
                .flat_map(|entry| entry.callbacks.iter().cloned())
                .collect()
        };

        if callbacks.is_empty() {
            debug!(
                id = message.id,
                event_type = %event.event_type,
                "event without matching subscription; discarding"
            );
        }
        for callback in callbacks {
            callback(&event);
        }
    }
}
