//! WebSocket hot-reload and shared-state broadcast hub.
//!
//! The hub owns the set of live connections. Each connection gets a bounded
//! outgoing channel; a per-connection task moves messages onto the socket
//! under a send deadline, so one stuck peer cannot accumulate unbounded
//! backlog or stall the broadcaster. Within a connection, delivery order is
//! the send order; across connections broadcasts are fire-and-forget.
//!
//! A failed send never removes a connection; only the connection's own close
//! (or a dead socket observed by its task) does. This keeps one broken peer
//! from affecting delivery to the others.

use crate::protocol::{HmrMessage, now_millis};
use crate::state::{SharedStateStore, StateEntry, StateError, Validator};
use crate::watcher::WatchEvent;
use axum::body::Body;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Identifies one WebSocket connection for the lifetime of the hub.
pub type ConnectionId = u64;

/// Outgoing frames queued per connection before back-pressure drops apply.
const CHANNEL_CAPACITY: usize = 64;

/// Deadline for a single socket write; a slower peer is disconnected.
const SEND_DEADLINE: Duration = Duration::from_secs(5);

struct HubInner {
    connections: RwLock<HashMap<ConnectionId, mpsc::Sender<HmrMessage>>>,
    next_id: AtomicU64,
    state: SharedStateStore,
}

/// Shared handle to the hub. Cheap to clone.
#[derive(Clone)]
pub struct HmrHub {
    inner: Arc<HubInner>,
}

impl Default for HmrHub {
    fn default() -> Self {
        Self::new()
    }
}

impl HmrHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                connections: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                state: SharedStateStore::new(),
            }),
        }
    }

    /// The shared-state store backing this hub.
    pub fn state(&self) -> &SharedStateStore {
        &self.inner.state
    }

    /// Get or create a shared-state entry (idempotent).
    pub fn create_state(
        &self,
        key: impl Into<String>,
        initial: Value,
        validator: Option<Validator>,
    ) -> Arc<StateEntry> {
        self.inner.state.create(key, initial, validator)
    }

    /// Set a shared-state value and notify subscribed connections.
    ///
    /// Runs through the entry's validated `set` path; on success, a
    /// `state:update` is sent to exactly the connections subscribed to the
    /// key.
    pub fn set_state(&self, key: &str, value: Value) -> Result<(), StateError> {
        let entry = self
            .inner
            .state
            .get(key)
            .ok_or_else(|| StateError::UnknownKey(key.to_string()))?;

        let (_old, new) = entry.set(value)?;

        let update = HmrMessage::StateUpdate {
            key: key.to_string(),
            value: new,
            timestamp: now_millis(),
        };
        for id in entry.subscribers() {
            self.send_to(id, update.clone());
        }
        Ok(())
    }

    /// Subscribe a connection to a key and send it the current value.
    ///
    /// The entry is created (with a null value) when it does not exist yet,
    /// so an early subscriber is never left stale.
    pub fn subscribe(&self, id: ConnectionId, key: &str) {
        let entry = self.inner.state.create(key, Value::Null, None);
        entry.subscribe(id);
        self.send_to(
            id,
            HmrMessage::StateInit {
                key: key.to_string(),
                value: entry.get(),
                timestamp: now_millis(),
            },
        );
    }

    /// Drop a connection's subscription to a key.
    pub fn unsubscribe(&self, id: ConnectionId, key: &str) {
        if let Some(entry) = self.inner.state.get(key) {
            entry.unsubscribe(id);
        }
    }

    /// Register a new connection and queue its greeting.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<HmrMessage>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        // The greeting goes into the channel before the sender is shared,
        // so it is always the first frame the client sees.
        let _ = tx.try_send(HmrMessage::Connected {
            timestamp: now_millis(),
        });

        self.inner.connections.write().insert(id, tx);
        info!(connection = id, "hmr client connected");
        (id, rx)
    }

    /// Remove a connection from the hub and from every subscriber set.
    pub fn unregister(&self, id: ConnectionId) {
        self.inner.connections.write().remove(&id);
        self.inner.state.remove_connection(id);
        info!(connection = id, "hmr client disconnected");
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Send to every open connection.
    ///
    /// Per-connection failures (full or closed channel) are ignored here;
    /// connections are only removed by their own close path.
    pub fn broadcast(&self, message: HmrMessage) {
        let connections = self.inner.connections.read();
        for (id, tx) in connections.iter() {
            if tx.try_send(message.clone()).is_err() {
                debug!(connection = id, "dropping frame for unreachable client");
            }
        }
    }

    /// Broadcast the HMR message for a file-watcher event.
    ///
    /// Added and changed files produce targeted `update`s; a removed file
    /// invalidates module graphs, so a full `reload` is requested instead.
    pub fn broadcast_file_event(&self, event: &WatchEvent) {
        let timestamp = now_millis();
        let message = match event {
            WatchEvent::Added(path) | WatchEvent::Changed(path) => HmrMessage::Update {
                path: path.to_string_lossy().into_owned(),
                timestamp,
            },
            WatchEvent::Removed(path) => HmrMessage::Reload {
                path: path.to_string_lossy().into_owned(),
                timestamp,
            },
        };
        self.broadcast(message);
    }

    /// Close every connection (used during shutdown). Dropping the senders
    /// ends each connection task, which sends the WS close frame.
    pub fn close_all(&self) {
        let drained: Vec<ConnectionId> = {
            let mut connections = self.inner.connections.write();
            let ids = connections.keys().copied().collect();
            connections.clear();
            ids
        };
        for id in drained {
            self.inner.state.remove_connection(id);
        }
    }

    fn send_to(&self, id: ConnectionId, message: HmrMessage) {
        if let Some(tx) = self.inner.connections.read().get(&id) {
            if tx.try_send(message).is_err() {
                debug!(connection = id, "dropping frame for unreachable client");
            }
        }
    }

    /// Route a client-originated text frame.
    ///
    /// Only the `state:*` requests mutate anything; `state:change` goes
    /// through the same validated `set` path as server-side writes.
    pub fn handle_client_message(&self, id: ConnectionId, text: &str) {
        let message: HmrMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(err) => {
                debug!(connection = id, error = %err, "unparseable client frame");
                return;
            }
        };

        match message {
            HmrMessage::StateSubscribe { key } => self.subscribe(id, &key),
            HmrMessage::StateUnsubscribe { key } => self.unsubscribe(id, &key),
            HmrMessage::StateChange { key, value } => {
                if let Err(err) = self.set_state(&key, value) {
                    debug!(connection = id, error = %err, "state change rejected");
                }
            }
            other => {
                debug!(connection = id, message = ?other, "ignoring server-only frame from client");
            }
        }
    }
}

/// Axum handler upgrading `GET /__quay_hmr__`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<HmrHub>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Per-connection task: pump queued frames onto the socket and route
/// incoming frames back into the hub.
async fn handle_socket(mut socket: WebSocket, hub: HmrHub) {
    let (id, mut rx) = hub.register();

    loop {
        tokio::select! {
            queued = rx.recv() => {
                let Some(message) = queued else {
                    // Hub dropped our sender (shutdown).
                    break;
                };
                let json = match serde_json::to_string(&message) {
                    Ok(j) => j,
                    Err(err) => {
                        warn!(connection = id, error = %err, "failed to encode frame");
                        continue;
                    }
                };
                match tokio::time::timeout(SEND_DEADLINE, socket.send(Message::Text(json.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        warn!(connection = id, "send deadline exceeded, dropping client");
                        break;
                    }
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => hub.handle_client_message(id, text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary/ping/pong are not part of the protocol
                    Some(Err(err)) => {
                        debug!(connection = id, error = %err, "websocket error");
                        break;
                    }
                }
            }
        }
    }

    hub.unregister(id);
    let _ = socket.send(Message::Close(None)).await;
}

/// Serve the browser bootstrap script.
pub async fn hmr_client_script() -> impl IntoResponse {
    const HMR_CLIENT: &str = include_str!("../assets/hmr-client.js");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/javascript; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(HMR_CLIENT))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
