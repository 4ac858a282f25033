//! In-process mock hub for exercising the client end to end
//!
//! Speaks just enough of the hub WebSocket API for the engine tests:
//! the auth handshake, subscribe/unsubscribe bookkeeping, ping, and an
//! echo response for any other command. Test knobs allow delaying
//! responses, swallowing auth frames, firing events, and force-closing
//! every connected client.

// Not every test binary uses every fixture helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hass_ws::{ConnectionParameters, ConnectionState, HassWebSocketClient};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub const ACCESS_TOKEN: &str = "test-long-lived-access-token";
pub const HUB_VERSION: &str = "2026.1.1";

/// Control messages pushed into a connected client session
enum HubCtl {
    Event { event_type: String, data: Value },
    Close,
}

#[derive(Default)]
struct HubState {
    connection_count: AtomicUsize,
    subscribe_count: AtomicUsize,
    unsubscribe_count: AtomicUsize,
    /// Delay applied before answering any identifiable request
    response_delay: Mutex<Option<Duration>>,
    /// When set, auth frames are swallowed and the handshake never finishes
    ignore_auth: AtomicBool,
    clients: Mutex<Vec<mpsc::UnboundedSender<HubCtl>>>,
}

pub struct MockHub {
    addr: SocketAddr,
    state: Arc<HubState>,
    accept_task: JoinHandle<()>,
}

/// Opt-in log output for test debugging (`RUST_LOG=hass_ws=debug`)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

impl MockHub {
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock hub");
        let addr = listener.local_addr().expect("mock hub addr");
        let state = Arc::new(HubState::default());

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(client_session(accept_state.clone(), stream));
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub fn params(&self) -> ConnectionParameters {
        self.params_with_token(ACCESS_TOKEN)
    }

    pub fn params_with_token(&self, token: &str) -> ConnectionParameters {
        let endpoint = url::Url::parse(&format!("ws://{}/api/websocket", self.addr)).unwrap();
        ConnectionParameters::new(endpoint, token).unwrap()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connection_count.load(Ordering::SeqCst)
    }

    pub fn subscribe_count(&self) -> usize {
        self.state.subscribe_count.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.state.unsubscribe_count.load(Ordering::SeqCst)
    }

    pub fn set_response_delay(&self, delay: Option<Duration>) {
        *self.state.response_delay.lock().unwrap() = delay;
    }

    pub fn set_ignore_auth(&self, ignore: bool) {
        self.state.ignore_auth.store(ignore, Ordering::SeqCst);
    }

    /// Deliver an event to every subscription matching its type
    pub fn fire_event(&self, event_type: &str, data: Value) {
        let clients = self.state.clients.lock().unwrap();
        for client in clients.iter() {
            let _ = client.send(HubCtl::Event {
                event_type: event_type.to_string(),
                data: data.clone(),
            });
        }
    }

    /// Fire a `state_changed` event for one entity
    pub fn fire_state_changed(&self, entity_id: &str) {
        self.fire_event(
            "state_changed",
            json!({
                "entity_id": entity_id,
                "old_state": null,
                "new_state": {
                    "entity_id": entity_id,
                    "state": "on",
                    "attributes": {},
                    "last_changed": chrono::Utc::now().to_rfc3339(),
                    "last_updated": chrono::Utc::now().to_rfc3339(),
                    "context": {"id": "01HV0000000000000000000000"}
                }
            }),
        );
    }

    /// Force-close every connected client socket
    pub fn close_clients(&self) {
        let clients = self.state.clients.lock().unwrap();
        for client in clients.iter() {
            let _ = client.send(HubCtl::Close);
        }
    }
}

impl Drop for MockHub {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn client_session(state: Arc<HubState>, stream: TcpStream) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    state.connection_count.fetch_add(1, Ordering::SeqCst);

    let auth_required = json!({"type": "auth_required", "ha_version": HUB_VERSION});
    if ws
        .send(Message::Text(auth_required.to_string()))
        .await
        .is_err()
    {
        return;
    }

    // Authentication phase
    loop {
        let frame = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return,
        };
        let Ok(message) = serde_json::from_str::<Value>(&frame) else {
            continue;
        };
        if message["type"] != "auth" {
            continue;
        }
        if state.ignore_auth.load(Ordering::SeqCst) {
            continue;
        }
        if message["access_token"] == ACCESS_TOKEN {
            let auth_ok = json!({"type": "auth_ok", "ha_version": HUB_VERSION});
            if ws.send(Message::Text(auth_ok.to_string())).await.is_err() {
                return;
            }
            break;
        }
        let auth_invalid = json!({"type": "auth_invalid", "message": "Invalid access token"});
        let _ = ws.send(Message::Text(auth_invalid.to_string())).await;
        return;
    }

    let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel();
    state.clients.lock().unwrap().push(ctl_tx);

    // subscription id -> event type filter (None = wildcard)
    let mut subscriptions: HashMap<u64, Option<String>> = HashMap::new();

    loop {
        tokio::select! {
            ctl = ctl_rx.recv() => match ctl {
                Some(HubCtl::Event { event_type, data }) => {
                    for (subscription_id, filter) in &subscriptions {
                        let matches = match filter {
                            Some(subscribed) => *subscribed == event_type,
                            None => true,
                        };
                        if !matches {
                            continue;
                        }
                        let frame = json!({
                            "id": subscription_id,
                            "type": "event",
                            "event": {
                                "event_type": event_type,
                                "data": data,
                                "origin": "LOCAL",
                                "time_fired": chrono::Utc::now().to_rfc3339(),
                                "context": {"id": "01HV0000000000000000000000"}
                            }
                        });
                        if ws.send(Message::Text(frame.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(HubCtl::Close) | None => {
                    let _ = ws.close(None).await;
                    return;
                }
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if handle_request(&state, &mut ws, &mut subscriptions, &text)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(_)) => return,
            },
        }
    }
}

async fn handle_request(
    state: &HubState,
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    subscriptions: &mut HashMap<u64, Option<String>>,
    text: &str,
) -> Result<(), ()> {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        return Ok(());
    };
    let id = message["id"].as_u64().unwrap_or(0);

    let delay = *state.response_delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let response = match message["type"].as_str() {
        Some("subscribe_events") => {
            state.subscribe_count.fetch_add(1, Ordering::SeqCst);
            let filter = message["event_type"].as_str().map(str::to_string);
            subscriptions.insert(id, filter);
            json!({"id": id, "type": "result", "success": true, "result": null})
        }
        Some("unsubscribe_events") => {
            state.unsubscribe_count.fetch_add(1, Ordering::SeqCst);
            match message["subscription"].as_u64() {
                Some(subscription) if subscriptions.remove(&subscription).is_some() => {
                    json!({"id": id, "type": "result", "success": true, "result": null})
                }
                _ => json!({
                    "id": id, "type": "result", "success": false,
                    "error": {"code": "not_found", "message": "Unknown subscription"}
                }),
            }
        }
        Some("ping") => json!({"id": id, "type": "pong"}),
        // Any other command echoes its own frame back as the result.
        _ => json!({"id": id, "type": "result", "success": true, "result": message}),
    };

    ws.send(Message::Text(response.to_string()))
        .await
        .map_err(|_| ())
}

/// Collect every state transition into a shared vector
pub fn record_states(client: &HassWebSocketClient) -> Arc<Mutex<Vec<ConnectionState>>> {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let mut states = client.state_changes();
    let recorder = transitions.clone();
    tokio::spawn(async move {
        while let Ok(state) = states.recv().await {
            recorder.lock().unwrap().push(state);
        }
    });
    transitions
}

/// Poll a condition until it holds or the deadline passes
pub async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = tokio::time::Instant::now();
    while started.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
