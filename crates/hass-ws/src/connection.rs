//! Connection lifecycle: handshake, read loop, dispatch loop, reconnection
//!
//! One physical WebSocket connection backs the whole client. The read loop
//! is the sole transport reader and never invokes callbacks itself; queued
//! push events are drained by a separate dispatch loop so slow callbacks
//! cannot stall the connection. Writes go through a one-writer-at-a-time
//! gate that also owns the correlation id counter, making id assignment
//! atomic with the frame write.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hass_core::events;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ClientError, ClientResult};
use crate::messages::{EventMessage, IncomingMessage, OutgoingMessage, ResultMessage};
use crate::pending::PendingRequests;
use crate::subscription::SubscriptionRegistry;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Interval between transport-level connect attempts when retrying
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle states of the client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; commands and subscriptions are rejected
    Disconnected,
    /// Opening the WebSocket
    Connecting,
    /// Socket open, performing the auth handshake
    Authenticating,
    /// Reconnected, silently re-establishing prior subscriptions
    Restoring,
    /// Fully connected and listening for commands
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Restoring => "restoring",
            ConnectionState::Connected => "connected",
        };
        write!(f, "{name}")
    }
}

// =============================================================================
// Connection Parameters
// =============================================================================

/// Endpoint and credential used to open and authenticate a connection
///
/// Retained while connected or reconnecting; cleared on explicit close.
#[derive(Debug, Clone)]
pub struct ConnectionParameters {
    endpoint: Url,
    access_token: String,
}

impl ConnectionParameters {
    /// Create parameters from a WebSocket endpoint (`ws://` or `wss://`)
    pub fn new(endpoint: Url, access_token: impl Into<String>) -> ClientResult<Self> {
        if endpoint.scheme() != "ws" && endpoint.scheme() != "wss" {
            return Err(ClientError::Configuration(format!(
                "invalid endpoint scheme '{}', expected ws or wss",
                endpoint.scheme()
            )));
        }
        Ok(Self {
            endpoint,
            access_token: access_token.into(),
        })
    }

    /// Derive parameters from a hub base URL (e.g. `http://localhost:8123`)
    ///
    /// Maps http(s) to ws(s) and appends the `/api/websocket` path.
    pub fn from_instance_base_url(
        base_url: &str,
        access_token: impl Into<String>,
    ) -> ClientResult<Self> {
        let mut endpoint = Url::parse(base_url)
            .map_err(|error| ClientError::Configuration(format!("invalid base url: {error}")))?;
        let scheme = match endpoint.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ClientError::Configuration(format!(
                    "invalid base url scheme '{other}'"
                )))
            }
        };
        endpoint
            .set_scheme(scheme)
            .map_err(|_| ClientError::Configuration("invalid base url".into()))?;
        endpoint.set_path("/api/websocket");
        Self::new(endpoint, access_token)
    }

    /// The WebSocket endpoint this client connects to
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub(crate) fn access_token(&self) -> &str {
        &self.access_token
    }
}

// =============================================================================
// Shared Connection State
// =============================================================================

/// The write half of the socket plus the correlation id counter
///
/// Living behind one async mutex, this is the send serializer: whoever
/// holds the lock assigns the next id and writes the frame before anyone
/// else can interleave.
pub(crate) struct SendGate {
    sink: WsSink,
    next_id: u64,
}

/// State shared between the public client handle and the background workers
pub(crate) struct ConnectionInner {
    state: Mutex<ConnectionState>,
    state_events: broadcast::Sender<ConnectionState>,
    /// Serializes connect attempts against teardown
    connect_lock: tokio::sync::Mutex<()>,
    pub(crate) sender: tokio::sync::Mutex<Option<SendGate>>,
    pub(crate) pending: PendingRequests,
    pub(crate) registry: SubscriptionRegistry,
    events_tx: Mutex<Option<mpsc::UnboundedSender<EventMessage>>>,
    params: Mutex<Option<ConnectionParameters>>,
    close_token: Mutex<CancellationToken>,
    automatic_reconnection: AtomicBool,
    is_reconnecting: AtomicBool,
    disposed: AtomicBool,
    ha_version: Mutex<Option<String>>,
}

impl ConnectionInner {
    pub fn new() -> Self {
        let (state_events, _) = broadcast::channel(32);
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            state_events,
            connect_lock: tokio::sync::Mutex::new(()),
            sender: tokio::sync::Mutex::new(None),
            pending: PendingRequests::new(),
            registry: SubscriptionRegistry::new(),
            events_tx: Mutex::new(None),
            params: Mutex::new(None),
            close_token: Mutex::new(CancellationToken::new()),
            automatic_reconnection: AtomicBool::new(true),
            is_reconnecting: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            ha_version: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Publish a state transition; observers are only notified on change
    pub fn set_state(&self, new_state: ConnectionState) {
        let mut state = self.state.lock().unwrap();
        if *state != new_state {
            *state = new_state;
            let _ = self.state_events.send(new_state);
        }
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_events.subscribe()
    }

    pub fn close_token(&self) -> CancellationToken {
        self.close_token.lock().unwrap().clone()
    }

    pub fn cancel_close_token(&self) {
        self.close_token.lock().unwrap().cancel();
    }

    /// Install a fresh teardown token for a new connection lifetime
    pub fn reset_close_token(&self) {
        *self.close_token.lock().unwrap() = CancellationToken::new();
    }

    pub async fn lock_connect(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.connect_lock.lock().await
    }

    pub fn store_params(&self, params: ConnectionParameters) {
        *self.params.lock().unwrap() = Some(params);
    }

    pub fn has_params(&self) -> bool {
        self.params.lock().unwrap().is_some()
    }

    pub fn automatic_reconnection(&self) -> bool {
        self.automatic_reconnection.load(Ordering::SeqCst)
    }

    pub fn set_automatic_reconnection(&self, enabled: bool) {
        self.automatic_reconnection.store(enabled, Ordering::SeqCst);
    }

    pub fn is_reconnecting(&self) -> bool {
        self.is_reconnecting.load(Ordering::SeqCst)
    }

    pub fn set_is_reconnecting(&self, reconnecting: bool) {
        self.is_reconnecting.store(reconnecting, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Mark disposed; returns whether it already was
    pub fn mark_disposed(&self) -> bool {
        self.disposed.swap(true, Ordering::SeqCst)
    }

    pub fn ensure_not_disposed(&self) -> ClientResult<()> {
        if self.is_disposed() {
            return Err(ClientError::Disposed);
        }
        Ok(())
    }

    pub fn ha_version(&self) -> Option<String> {
        self.ha_version.lock().unwrap().clone()
    }

    /// Create the push-event queue and return its consuming end
    pub fn create_event_queue(&self) -> mpsc::UnboundedReceiver<EventMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events_tx.lock().unwrap() = Some(tx);
        rx
    }

    /// Hand a push event to the dispatch loop
    pub fn queue_event(&self, event: EventMessage) {
        match self.events_tx.lock().unwrap().as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    warn!("event queue closed; push event discarded");
                }
            }
            None => warn!("no event queue yet; push event discarded"),
        }
    }

    /// Drop state tied to the physical connection on a reconnection-eligible
    /// disconnect: the gate, and every request that can no longer be answered
    pub async fn drop_socket_state(&self) {
        *self.sender.lock().await = None;
        self.pending.cancel_all();
    }

    /// Synchronous part of disposal: retained parameters and the event queue
    pub fn clear_client_state(&self) {
        *self.params.lock().unwrap() = None;
        let _ = self.events_tx.lock().unwrap().take();
        // Dropping the sink half closes the socket once the read loop lets
        // go of the other half; contention here means a teardown is already
        // in progress elsewhere.
        if let Ok(mut gate) = self.sender.try_lock() {
            let _ = gate.take();
        }
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Run an operation under the connection teardown token plus an optional
/// caller-supplied cancellation signal
pub(crate) async fn cancellable<T, F>(
    close: &CancellationToken,
    cancel: Option<&CancellationToken>,
    operation: F,
) -> ClientResult<T>
where
    F: std::future::Future<Output = ClientResult<T>>,
{
    match cancel {
        Some(cancel) => tokio::select! {
            _ = close.cancelled() => Err(ClientError::Cancelled),
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            result = operation => result,
        },
        None => tokio::select! {
            _ = close.cancelled() => Err(ClientError::Cancelled),
            result = operation => result,
        },
    }
}

// =============================================================================
// Sending
// =============================================================================

/// Serialize and write one frame under the send gate
///
/// For identifiable messages the id is assigned and the caller's response
/// expectation registered before the frame hits the wire, so the response
/// cannot race the registration. Returns the assigned id (0 for `auth`).
pub(crate) async fn send_message(
    inner: &ConnectionInner,
    message: &OutgoingMessage,
    awaiter: Option<oneshot::Sender<IncomingMessage>>,
) -> ClientResult<u64> {
    let mut guard = inner.sender.lock().await;
    let gate = guard
        .as_mut()
        .ok_or(ClientError::InvalidState(ConnectionState::Disconnected))?;

    let id = if message.is_identifiable() {
        gate.next_id + 1
    } else {
        0
    };
    let frame = message.to_frame((id > 0).then_some(id))?;
    if id > 0 {
        gate.next_id = id;
        if let Some(awaiter) = awaiter {
            inner.pending.register(id, awaiter);
        }
    }

    if let Err(error) = gate.sink.send(Message::Text(frame)).await {
        if id > 0 {
            inner.pending.remove(id);
        }
        return Err(error.into());
    }
    Ok(id)
}

// =============================================================================
// Connecting
// =============================================================================

/// Run the connect sequence, consuming the retry budget on transport errors
///
/// A negative budget retries indefinitely; the caller is responsible for
/// making that cancellable. Authentication rejections are terminal and never
/// retried.
pub(crate) async fn establish(
    inner: &Arc<ConnectionInner>,
    params: &ConnectionParameters,
    retries: i32,
    cancel: Option<&CancellationToken>,
) -> ClientResult<()> {
    let close = inner.close_token();
    inner.set_state(ConnectionState::Connecting);

    let mut remaining = retries;
    loop {
        let guard = inner.lock_connect().await;
        let attempt = cancellable(&close, cancel, establish_once(inner, params, &close)).await;
        drop(guard);

        let error = match attempt {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        let retry = error.is_retryable() && (retries < 0 || remaining > 0);
        if !retry {
            clear_resources(inner).await;
            return Err(error);
        }
        remaining -= 1;

        warn!(%error, "connect attempt failed; retrying in {RETRY_INTERVAL:?}");
        let slept = cancellable(&close, cancel, async {
            tokio::time::sleep(RETRY_INTERVAL).await;
            Ok(())
        })
        .await;
        if slept.is_err() {
            clear_resources(inner).await;
            return Err(ClientError::Cancelled);
        }
    }
}

/// One connect attempt: open the socket, handshake, restore, spawn the reader
async fn establish_once(
    inner: &Arc<ConnectionInner>,
    params: &ConnectionParameters,
    close: &CancellationToken,
) -> ClientResult<()> {
    let (mut socket, _response) = connect_async(params.endpoint().as_str()).await?;
    inner.set_state(ConnectionState::Authenticating);

    match next_handshake_message(&mut socket).await? {
        IncomingMessage::AuthRequired { ha_version } => {
            debug!(%ha_version, "hub requested authentication");
        }
        other => {
            return Err(ClientError::Protocol(format!(
                "expected auth_required as first frame, got {other:?}"
            )))
        }
    }

    let auth = OutgoingMessage::Auth {
        access_token: params.access_token().to_string(),
    };
    socket.send(Message::Text(auth.to_frame(None)?)).await?;

    let ha_version = match next_handshake_message(&mut socket).await? {
        IncomingMessage::AuthOk { ha_version } => ha_version,
        IncomingMessage::AuthInvalid { message } => {
            return Err(ClientError::Authentication(message))
        }
        other => {
            return Err(ClientError::Protocol(format!(
                "unexpected message during authentication: {other:?}"
            )))
        }
    };
    *inner.ha_version.lock().unwrap() = Some(ha_version.clone());

    // The id counter restarts with every physical connection.
    let (sink, mut source) = socket.split();
    *inner.sender.lock().await = Some(SendGate { sink, next_id: 0 });

    if inner.is_reconnecting() {
        restore_subscriptions(inner, &mut source, close).await?;
    }
    inner.set_is_reconnecting(false);
    inner.set_state(ConnectionState::Connected);
    info!(version = %ha_version, "authentication succeeded; client connected");

    tokio::spawn(read_loop(inner.clone(), source, close.clone()));
    Ok(())
}

/// Read the next decoded frame while the socket is still unsplit
async fn next_handshake_message(socket: &mut WsStream) -> ClientResult<IncomingMessage> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text).map_err(|error| {
                    ClientError::Protocol(format!("undecodable handshake frame: {error}"))
                });
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ClientError::Transport(tungstenite::Error::ConnectionClosed));
            }
            Some(Ok(_)) => continue,
            Some(Err(error)) => return Err(error.into()),
        }
    }
}

/// Re-issue every registered subscription before the client reports Connected
///
/// Runs while the read loop is not yet started, reading the socket directly.
/// Each key is retried until the hub accepts it; its stored server id is
/// overwritten with the new one. Events arriving mid-restoration are queued
/// for the dispatch loop, not lost.
async fn restore_subscriptions(
    inner: &Arc<ConnectionInner>,
    source: &mut WsSource,
    close: &CancellationToken,
) -> ClientResult<()> {
    let keys = inner.registry.keys();
    info!(count = keys.len(), "restoring event subscriptions");

    for key in keys {
        inner.set_state(ConnectionState::Restoring);
        loop {
            if close.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            let message = OutgoingMessage::SubscribeEvents {
                event_type: (key != events::ANY).then(|| key.clone()),
            };
            let id = send_message(inner, &message, None).await?;
            let result = await_result(inner, source, id).await?;
            if result.success {
                inner.registry.set_subscription_id(&key, id);
                break;
            }
            warn!(key = %key, "subscription restore rejected by hub; retrying");
        }
    }
    Ok(())
}

/// Read frames until the result for the given id arrives
async fn await_result(
    inner: &Arc<ConnectionInner>,
    source: &mut WsSource,
    id: u64,
) -> ClientResult<ResultMessage> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<IncomingMessage>(&text)
            {
                Ok(IncomingMessage::Result(result)) if result.id == id => return Ok(result),
                Ok(IncomingMessage::Event(event)) => inner.queue_event(event),
                Ok(other) => debug!(?other, "frame ignored during restoration"),
                Err(error) => warn!(%error, "undecodable frame during restoration; discarding"),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(ClientError::Transport(tungstenite::Error::ConnectionClosed));
            }
            Some(Ok(_)) => continue,
            Some(Err(error)) => return Err(error.into()),
        }
    }
}

// =============================================================================
// Read Loop
// =============================================================================

/// Sole transport reader: classifies frames and never runs callbacks
pub(crate) fn read_loop(
    inner: Arc<ConnectionInner>,
    mut source: WsSource,
    close: CancellationToken,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        loop {
            tokio::select! {
                _ = close.cancelled() => {
                    // Teardown owns resource cleanup; a later connection may
                    // already have installed a new gate by the time this runs.
                    debug!("read loop stopped by teardown");
                    return;
                }
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => handle_frame(&inner, &text),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "hub closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(%error, "transport failure while reading");
                        break;
                    }
                    None => {
                        debug!("transport stream ended");
                        break;
                    }
                }
            }
        }

        handle_disconnection(&inner, &close).await;
    })
}

/// Classify one inbound frame: correlated response or push event
fn handle_frame(inner: &Arc<ConnectionInner>, text: &str) {
    match serde_json::from_str::<IncomingMessage>(text) {
        Ok(IncomingMessage::Event(event)) => inner.queue_event(event),
        Ok(IncomingMessage::Result(result)) => {
            let id = result.id;
            inner.pending.settle(id, IncomingMessage::Result(result));
        }
        Ok(IncomingMessage::Pong { id }) => {
            inner.pending.settle(id, IncomingMessage::Pong { id });
        }
        Ok(other) => warn!(?other, "unexpected message outside handshake; discarding"),
        Err(error) => warn!(%error, "undecodable frame; discarding"),
    }
}

/// React to the transport going away without an explicit close
async fn handle_disconnection(inner: &Arc<ConnectionInner>, close: &CancellationToken) {
    // An explicit close or dispose owns the teardown; a later connection
    // may already be live, so this connection must not touch shared state.
    if close.is_cancelled() {
        return;
    }

    // Release socket state before publishing Disconnected so a racing
    // connect cannot observe leftovers from this connection.
    inner.drop_socket_state().await;
    inner.set_state(ConnectionState::Disconnected);

    let params = inner.params.lock().unwrap().clone();
    match params {
        Some(params) if inner.automatic_reconnection() => {
            inner.set_is_reconnecting(true);
            info!("connection lost unexpectedly; reconnecting");
            let inner = inner.clone();
            tokio::spawn(async move {
                // Indefinite retry; only the teardown token stops it.
                if let Err(error) = establish(&inner, &params, -1, None).await {
                    warn!(%error, "reconnection abandoned");
                }
            });
        }
        _ => clear_resources(inner).await,
    }
}

// =============================================================================
// Dispatch Loop
// =============================================================================

/// Drains the push-event queue and fans events out through the registry
///
/// Deliberately separate from the read loop: dispatch completion is never
/// ordered relative to subsequent transport reads, so a slow callback can
/// only delay later events, not the connection.
pub(crate) async fn dispatch_loop(
    inner: Arc<ConnectionInner>,
    mut events_rx: mpsc::UnboundedReceiver<EventMessage>,
) {
    while let Some(event) = events_rx.recv().await {
        inner.registry.dispatch(&event);
    }
    debug!("event dispatch loop ended");
}

// =============================================================================
// Teardown
// =============================================================================

/// Release everything tied to the current connection lifetime
pub(crate) async fn clear_resources(inner: &Arc<ConnectionInner>) {
    inner.set_state(ConnectionState::Disconnected);
    inner.set_is_reconnecting(false);
    *inner.params.lock().unwrap() = None;

    if let Some(mut gate) = inner.sender.lock().await.take() {
        let _ = gate.sink.close().await;
    }
    inner.pending.cancel_all();
    // Dropping the queue sender lets the dispatch loop run dry and end.
    let _ = inner.events_tx.lock().unwrap().take();
}
