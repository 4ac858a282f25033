//! Fan-out of one `state_changed` subscription to entity and domain listeners

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use hass_core::{events, HassEvent, StateChangedEvent};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::HassWebSocketClient;
use crate::error::{ClientError, ClientResult};
use crate::subscription::EventCallback;

/// Backoff before retrying a failed subscription reconciliation
const RECONCILE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Callback invoked with every matching decoded state change
///
/// Identified by `Arc` pointer identity, like engine event callbacks.
pub type StateChangedCallback = Arc<dyn Fn(&StateChangedEvent) + Send + Sync + 'static>;

/// Multiplexes state-change interest from many consumers over one
/// hub subscription
///
/// Consumers register per entity id or per domain; the single underlying
/// `state_changed` subscription is opened when the first registration
/// arrives and closed when the last one leaves. Reconciliation runs on a
/// background worker signalled through a capacity-1 slot, so bursts of
/// register/unregister churn collapse into one pass.
pub struct StateChangedEventListener {
    shared: Arc<ListenerShared>,
}

struct ListenerShared {
    client: HassWebSocketClient,
    maps: Mutex<ListenerMaps>,
    /// Capacity-1 reconciliation signal; `notify_one` stores at most one
    /// permit, which is exactly the coalescing the worker relies on
    refresh: Notify,
    shutdown: CancellationToken,
    /// The one callback registered with the engine; kept for identity so
    /// unsubscribing removes precisely this registration
    socket_callback: EventCallback,
}

/// Listener maps and the actual-subscription flag, under a single lock
///
/// The derived "should be open" boolean is computed from these maps under
/// the same lock that mutates them, closing the lost-wakeup window between
/// a flip and its signal.
#[derive(Default)]
struct ListenerMaps {
    by_entity_id: HashMap<String, Vec<StateChangedCallback>>,
    by_domain: HashMap<String, Vec<StateChangedCallback>>,
    subscription_active: bool,
}

impl ListenerMaps {
    fn wants_subscription(&self) -> bool {
        !self.by_entity_id.is_empty() || !self.by_domain.is_empty()
    }

    fn is_converged(&self) -> bool {
        self.wants_subscription() == self.subscription_active
    }
}

enum MapKind {
    Entity,
    Domain,
}

impl StateChangedEventListener {
    /// Create a listener over the given client and start its worker
    pub fn new(client: HassWebSocketClient) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<ListenerShared>| {
            let weak = weak.clone();
            let socket_callback: EventCallback = Arc::new(move |event: &HassEvent| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_state_changed(event);
                }
            });
            ListenerShared {
                client,
                maps: Mutex::new(ListenerMaps::default()),
                refresh: Notify::new(),
                shutdown: CancellationToken::new(),
                socket_callback,
            }
        });

        tokio::spawn(reconciliation_worker(shared.clone()));
        Self { shared }
    }

    /// Register a callback for state changes of one entity
    pub fn subscribe_entity_state_changed(&self, entity_id: &str, callback: StateChangedCallback) {
        self.shared.register(MapKind::Entity, entity_id, callback);
    }

    /// Remove an entity registration; false when it was never registered
    pub fn unsubscribe_entity_state_changed(
        &self,
        entity_id: &str,
        callback: &StateChangedCallback,
    ) -> bool {
        self.shared.unregister(MapKind::Entity, entity_id, callback)
    }

    /// Register a callback for state changes of every entity in a domain
    pub fn subscribe_domain_state_changed(&self, domain: &str, callback: StateChangedCallback) {
        self.shared.register(MapKind::Domain, domain, callback);
    }

    /// Remove a domain registration; false when it was never registered
    pub fn unsubscribe_domain_state_changed(
        &self,
        domain: &str,
        callback: &StateChangedCallback,
    ) -> bool {
        self.shared.unregister(MapKind::Domain, domain, callback)
    }

    /// Whether the underlying hub subscription is currently open
    pub fn is_subscription_active(&self) -> bool {
        self.shared.maps.lock().unwrap().subscription_active
    }

    /// Suspend until desired and actual subscription state converge
    ///
    /// Polls at a short interval; returns false when the wait was abandoned.
    /// At least one of `timeout` and `cancel` must be supplied.
    pub async fn wait_for_subscription_completed(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> ClientResult<bool> {
        if timeout.is_none() && cancel.is_none() {
            return Err(ClientError::Configuration(
                "either a timeout or a cancellation signal must be supplied".into(),
            ));
        }

        let poll = HassWebSocketClient::convergence_poll_interval();
        let wait = async {
            loop {
                if self.shared.maps.lock().unwrap().is_converged() {
                    return true;
                }
                tokio::time::sleep(poll).await;
            }
        };
        let guarded = async {
            match cancel {
                Some(cancel) => tokio::select! {
                    _ = cancel.cancelled() => false,
                    converged = wait => converged,
                },
                None => wait.await,
            }
        };
        match timeout {
            Some(timeout) => Ok(tokio::time::timeout(timeout, guarded)
                .await
                .unwrap_or(false)),
            None => Ok(guarded.await),
        }
    }

    /// Stop the reconciliation worker permanently
    pub fn dispose(&self) {
        self.shared.shutdown.cancel();
    }
}

impl Drop for StateChangedEventListener {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl ListenerShared {
    fn map_mut<'a>(
        maps: &'a mut ListenerMaps,
        kind: &MapKind,
    ) -> &'a mut HashMap<String, Vec<StateChangedCallback>> {
        match kind {
            MapKind::Entity => &mut maps.by_entity_id,
            MapKind::Domain => &mut maps.by_domain,
        }
    }

    fn register(&self, kind: MapKind, key: &str, callback: StateChangedCallback) {
        let mut maps = self.maps.lock().unwrap();
        let wanted_before = maps.wants_subscription();
        Self::map_mut(&mut maps, &kind)
            .entry(key.to_string())
            .or_default()
            .push(callback);
        if maps.wants_subscription() != wanted_before {
            self.refresh.notify_one();
        }
    }

    fn unregister(&self, kind: MapKind, key: &str, callback: &StateChangedCallback) -> bool {
        let mut maps = self.maps.lock().unwrap();
        let wanted_before = maps.wants_subscription();
        let map = Self::map_mut(&mut maps, &kind);

        let Some(callbacks) = map.get_mut(key) else {
            return false;
        };
        let Some(position) = callbacks
            .iter()
            .position(|registered| Arc::ptr_eq(registered, callback))
        else {
            return false;
        };
        callbacks.remove(position);
        if callbacks.is_empty() {
            map.remove(key);
        }

        if maps.wants_subscription() != wanted_before {
            self.refresh.notify_one();
        }
        true
    }

    /// One reconciliation pass: compare desired vs actual, issue at most one
    /// engine call, re-signal on failure
    async fn update_subscription(&self) {
        let (wanted, active) = {
            let maps = self.maps.lock().unwrap();
            (maps.wants_subscription(), maps.subscription_active)
        };
        if wanted == active {
            return;
        }

        let succeeded = if wanted {
            self.client
                .add_event_handler_subscription(
                    self.socket_callback.clone(),
                    events::STATE_CHANGED,
                    None,
                )
                .await
                .unwrap_or_else(|error| {
                    warn!(%error, "opening state_changed subscription failed");
                    false
                })
        } else {
            self.client
                .remove_event_handler_subscription(
                    &self.socket_callback,
                    events::STATE_CHANGED,
                    None,
                )
                .await
                .unwrap_or_else(|error| {
                    warn!(%error, "closing state_changed subscription failed");
                    false
                })
        };

        if succeeded {
            self.maps.lock().unwrap().subscription_active = wanted;
        } else {
            // Failures are retried from the worker, never surfaced to the
            // registering caller.
            self.refresh.notify_one();
            tokio::time::sleep(RECONCILE_RETRY_BACKOFF).await;
        }
    }

    fn on_state_changed(&self, event: &HassEvent) {
        let changed: StateChangedEvent = match event.deserialize_data() {
            Ok(changed) => changed,
            Err(error) => {
                warn!(%error, "undecodable state_changed payload; discarding");
                return;
            }
        };

        // Entity-keyed and domain-keyed sets fire independently; one event
        // may reach both.
        let callbacks: Vec<StateChangedCallback> = {
            let maps = self.maps.lock().unwrap();
            let entity_key = changed.entity_id.to_string();
            maps.by_entity_id
                .get(&entity_key)
                .into_iter()
                .flatten()
                .chain(maps.by_domain.get(changed.domain()).into_iter().flatten())
                .cloned()
                .collect()
        };

        if callbacks.is_empty() {
            debug!(entity_id = %changed.entity_id, "state change without listeners");
        }
        for callback in callbacks {
            callback(&changed);
        }
    }
}

async fn reconciliation_worker(shared: Arc<ListenerShared>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = shared.refresh.notified() => {}
        }
        shared.update_subscription().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: Arc<AtomicUsize>) -> StateChangedCallback {
        Arc::new(move |_changed| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn state_changed_event(entity_id: &str) -> HassEvent {
        serde_json::from_value(json!({
            "event_type": "state_changed",
            "data": {
                "entity_id": entity_id,
                "old_state": null,
                "new_state": null
            },
            "origin": "LOCAL",
            "time_fired": "2024-05-01T10:00:00+00:00",
            "context": {"id": "ctx"}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_entity_and_domain_listeners_both_fire() {
        let listener = StateChangedEventListener::new(HassWebSocketClient::new());
        let entity_hits = Arc::new(AtomicUsize::new(0));
        let domain_hits = Arc::new(AtomicUsize::new(0));

        listener.subscribe_entity_state_changed("light.kitchen", counting(entity_hits.clone()));
        listener.subscribe_domain_state_changed("light", counting(domain_hits.clone()));

        listener
            .shared
            .on_state_changed(&state_changed_event("light.kitchen"));
        assert_eq!(entity_hits.load(Ordering::SeqCst), 1);
        assert_eq!(domain_hits.load(Ordering::SeqCst), 1);

        // A different entity in the same domain only reaches the domain set.
        listener
            .shared
            .on_state_changed(&state_changed_event("light.hallway"));
        assert_eq!(entity_hits.load(Ordering::SeqCst), 1);
        assert_eq!(domain_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_registration_has_no_effect() {
        let listener = StateChangedEventListener::new(HassWebSocketClient::new());
        let callback = counting(Arc::new(AtomicUsize::new(0)));

        assert!(!listener.unsubscribe_entity_state_changed("light.kitchen", &callback));

        listener.subscribe_entity_state_changed("light.kitchen", callback.clone());
        let other = counting(Arc::new(AtomicUsize::new(0)));
        assert!(!listener.unsubscribe_entity_state_changed("light.kitchen", &other));
        assert!(listener.unsubscribe_entity_state_changed("light.kitchen", &callback));
    }

    #[tokio::test]
    async fn test_wait_for_subscription_requires_a_deadline() {
        let listener = StateChangedEventListener::new(HassWebSocketClient::new());
        let error = listener
            .wait_for_subscription_completed(None, None)
            .await
            .unwrap_err();
        assert!(matches!(error, ClientError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_converged_when_no_listeners_and_no_subscription() {
        let listener = StateChangedEventListener::new(HassWebSocketClient::new());
        let converged = listener
            .wait_for_subscription_completed(Some(Duration::from_millis(50)), None)
            .await
            .unwrap();
        assert!(converged);
        assert!(!listener.is_subscription_active());
    }
}
