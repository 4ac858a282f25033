//! Public client facade over the connection engine

use std::sync::Arc;
use std::time::Duration;

use hass_core::events;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::{self, ConnectionInner, ConnectionParameters, ConnectionState};
use crate::error::{ClientError, ClientResult};
use crate::messages::{CommandMessage, CommandResult, IncomingMessage, OutgoingMessage};
use crate::subscription::EventCallback;

/// Interval at which waits poll conditions that have no wake-up signal
const CONVERGENCE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A Home Assistant WebSocket client
///
/// Maintains one persistent, authenticated connection to a hub and
/// multiplexes concurrently outstanding commands and event subscriptions
/// over it. Handles are cheap clones sharing one engine; all operations are
/// safe to call concurrently.
///
/// Suspending operations take an optional [`CancellationToken`]; the engine
/// applies no implicit timeouts, so callers own their deadlines.
#[derive(Clone)]
pub struct HassWebSocketClient {
    inner: Arc<ConnectionInner>,
}

impl HassWebSocketClient {
    /// Create a disconnected client with automatic reconnection enabled
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ConnectionInner::new()),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect and authenticate against the hub
    ///
    /// `retries` bounds how many times transport-level failures are retried;
    /// a negative value retries indefinitely and then requires a
    /// cancellation signal. Fails with `InvalidState` unless currently
    /// disconnected, and with `Authentication` (never retried) when the hub
    /// rejects the access token.
    pub async fn connect(
        &self,
        params: ConnectionParameters,
        retries: i32,
        cancel: Option<&CancellationToken>,
    ) -> ClientResult<()> {
        self.inner.ensure_not_disposed()?;
        if retries < 0 && cancel.is_none() {
            return Err(ClientError::Configuration(
                "a cancellation signal is required when retrying indefinitely".into(),
            ));
        }
        let state = self.inner.state();
        if state != ConnectionState::Disconnected {
            return Err(ClientError::InvalidState(state));
        }

        self.inner.reset_close_token();
        connection::establish(&self.inner, &params, retries, cancel).await?;

        // Retain parameters for the reconnection supervisor, then start
        // draining push events.
        self.inner.store_params(params);
        let events_rx = self.inner.create_event_queue();
        tokio::spawn(connection::dispatch_loop(self.inner.clone(), events_rx));
        Ok(())
    }

    /// Close the connection and stop any reconnection in progress
    ///
    /// No-op when already fully disconnected. Cancels every pending request
    /// and invalidates server subscription ids; registered callbacks stay in
    /// place for a later connect.
    pub async fn close(&self, cancel: Option<&CancellationToken>) -> ClientResult<()> {
        self.inner.ensure_not_disposed()?;
        if self.inner.state() == ConnectionState::Disconnected && !self.inner.is_reconnecting() {
            return Ok(());
        }
        if let Some(cancel) = cancel {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
        }

        self.inner.cancel_close_token();
        // Wait out any in-flight connect attempt before releasing resources.
        let _guard = self.inner.lock_connect().await;
        connection::clear_resources(&self.inner).await;
        Ok(())
    }

    /// Tear down permanently; every later operation fails with `Disposed`
    pub fn dispose(&self) {
        if self.inner.mark_disposed() {
            return;
        }
        debug!("disposing client");
        self.inner.cancel_close_token();
        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.set_is_reconnecting(false);
        self.inner.registry.clear();
        self.inner.pending.cancel_all();
        self.inner.clear_client_state();
    }

    /// Suspend until the client reports Connected
    ///
    /// Returns false when the wait was abandoned (timeout or cancellation)
    /// or the client is fully closed. At least one of `timeout` and `cancel`
    /// must be supplied to avoid a never-ending wait.
    pub async fn wait_for_connection(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> ClientResult<bool> {
        if timeout.is_none() && cancel.is_none() {
            return Err(ClientError::Configuration(
                "either a timeout or a cancellation signal must be supplied".into(),
            ));
        }
        if let Some(timeout) = timeout {
            if timeout.is_zero() {
                return Err(ClientError::Configuration(
                    "timeout must be greater than zero".into(),
                ));
            }
        }

        let wait = async {
            let mut states = self.inner.subscribe_states();
            loop {
                match self.inner.state() {
                    ConnectionState::Connected => return true,
                    ConnectionState::Disconnected
                        if !self.inner.has_params() && !self.inner.is_reconnecting() =>
                    {
                        return false
                    }
                    _ => {}
                }
                match states.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };

        let guarded = async {
            match cancel {
                Some(cancel) => tokio::select! {
                    _ = cancel.cancelled() => false,
                    connected = wait => connected,
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

    // =========================================================================
    // Commands
    // =========================================================================

    /// Send an identifiable command and await its correlated result
    pub async fn send_command_with_result(
        &self,
        command: CommandMessage,
        cancel: Option<&CancellationToken>,
    ) -> ClientResult<CommandResult> {
        let (_, result) = self.send_command_raw(command.into(), cancel).await?;
        Ok(result)
    }

    /// Send an identifiable command and report only hub-side success
    pub async fn send_command_with_success(
        &self,
        command: CommandMessage,
        cancel: Option<&CancellationToken>,
    ) -> ClientResult<bool> {
        let (_, result) = self.send_command_raw(command.into(), cancel).await?;
        Ok(result.success)
    }

    /// Probe hub liveness with a `ping`
    pub async fn send_ping(&self, cancel: Option<&CancellationToken>) -> ClientResult<bool> {
        let (_, result) = self.send_command_raw(OutgoingMessage::Ping, cancel).await?;
        Ok(result.success)
    }

    /// Send one identifiable message and await its response by id
    ///
    /// Cancellation abandons the local wait and removes the correlation
    /// entry; it never retracts a frame the transport already accepted, so
    /// the hub may still process the command.
    async fn send_command_raw(
        &self,
        message: OutgoingMessage,
        cancel: Option<&CancellationToken>,
    ) -> ClientResult<(u64, CommandResult)> {
        self.inner.ensure_not_disposed()?;
        let state = self.inner.state();
        if state != ConnectionState::Connected {
            return Err(ClientError::InvalidState(state));
        }
        if let Some(cancel) = cancel {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
        }

        let close = self.inner.close_token();
        let (response_tx, response_rx) = oneshot::channel();
        let id = connection::send_message(&self.inner, &message, Some(response_tx)).await?;

        let response = connection::cancellable(&close, cancel, async {
            response_rx.await.map_err(|_| ClientError::Cancelled)
        })
        .await;

        match response {
            Ok(IncomingMessage::Result(result)) => Ok((id, result.into())),
            Ok(IncomingMessage::Pong { .. }) => Ok((id, CommandResult::succeeded())),
            Ok(other) => Err(ClientError::Protocol(format!(
                "unexpected response for command: {other:?}"
            ))),
            Err(error) => {
                self.inner.pending.remove(id);
                Err(error)
            }
        }
    }

    // =========================================================================
    // Event Subscriptions
    // =========================================================================

    /// Register a callback for an event type, or every type with `"*"`
    ///
    /// The hub is subscribed at most once per event type; later
    /// registrations for the same type only join the existing fan-out.
    /// Returns false when the hub rejects the subscribe command.
    pub async fn add_event_handler_subscription(
        &self,
        callback: EventCallback,
        event_type: &str,
        cancel: Option<&CancellationToken>,
    ) -> ClientResult<bool> {
        self.inner.ensure_not_disposed()?;
        let key = Self::validated_key(event_type)?;

        let key_lock = self.inner.registry.key_lock(key);
        let _guard = key_lock.lock().await;

        if !self.inner.registry.contains(key) {
            let message = OutgoingMessage::SubscribeEvents {
                event_type: (key != events::ANY).then(|| key.to_string()),
            };
            let (id, result) = self.send_command_raw(message, cancel).await?;
            if !result.success {
                return Ok(false);
            }
            self.inner.registry.insert(key, id);
        }
        self.inner.registry.add_callback(key, callback);
        Ok(true)
    }

    /// Unregister a previously added callback by identity
    ///
    /// When the last callback for an event type leaves, the hub-side
    /// subscription is closed and the entry discarded on success. Removing a
    /// registration that does not exist returns false with no side effects.
    pub async fn remove_event_handler_subscription(
        &self,
        callback: &EventCallback,
        event_type: &str,
        cancel: Option<&CancellationToken>,
    ) -> ClientResult<bool> {
        self.inner.ensure_not_disposed()?;
        let key = Self::validated_key(event_type)?;

        let key_lock = self.inner.registry.key_lock(key);
        let _guard = key_lock.lock().await;

        match self.inner.registry.remove_callback(key, callback) {
            None => Ok(false),
            Some(0) => {
                let Some(subscription) = self.inner.registry.subscription_id(key) else {
                    return Ok(false);
                };
                let message = OutgoingMessage::UnsubscribeEvents { subscription };
                let (_, result) = self.send_command_raw(message, cancel).await?;
                if !result.success {
                    return Ok(false);
                }
                self.inner.registry.remove_entry(key);
                Ok(true)
            }
            Some(_) => Ok(true),
        }
    }

    fn validated_key(event_type: &str) -> ClientResult<&str> {
        let key = event_type.trim();
        if key.is_empty() {
            return Err(ClientError::Configuration(
                "event type cannot be empty".into(),
            ));
        }
        Ok(key)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// The current lifecycle state
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Observable stream of state transitions, fired only on actual change
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.subscribe_states()
    }

    /// Whether lost connections are re-established automatically
    pub fn automatic_reconnection(&self) -> bool {
        self.inner.automatic_reconnection()
    }

    /// Toggle automatic reconnection
    ///
    /// With it disabled the client simply reports Disconnected on transport
    /// loss; bounded-attempt policies live with the caller.
    pub fn set_automatic_reconnection(&self, enabled: bool) {
        self.inner.set_automatic_reconnection(enabled);
    }

    /// Whether a reconnection is currently in progress
    pub fn is_reconnecting(&self) -> bool {
        self.inner.is_reconnecting()
    }

    /// Number of commands still awaiting their response
    pub fn pending_requests_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of local callback registrations across all event types
    pub fn subscriptions_count(&self) -> usize {
        self.inner.registry.subscriptions_count()
    }

    /// Hub version negotiated during the last successful handshake
    pub fn ha_version(&self) -> Option<String> {
        self.inner.ha_version()
    }

    /// Whether the client has been disposed
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Poll interval used by condition waits without a wake-up signal
    pub(crate) fn convergence_poll_interval() -> Duration {
        CONVERGENCE_POLL_INTERVAL
    }
}

impl Default for HassWebSocketClient {
    fn default() -> Self {
        Self::new()
    }
}
