use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message};
use stormforge_core::roles::Identity;
use stormforge_core::sync::lock;
use stormforge_core::types::Timestamp;
use stormforge_events::Scope;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

/// Default depth of each connection's outbound queue.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Channel sender half for pushing messages to a WebSocket connection.
pub type WsSender = mpsc::Sender<Message>;

/// Result of queueing a message for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The outbound queue is full: the client is not reading.
    Full,
    /// No such connection, or its socket task has ended.
    Gone,
}

/// Metadata for a single WebSocket connection.
pub struct WsConnection {
    pub identity: Identity,
    pub scope: Scope,
    /// Channel sender for outbound messages to this connection.
    pub sender: WsSender,
    pub connected_at: Timestamp,
    /// Last time any frame arrived from the client.
    last_seen: Mutex<Instant>,
}

/// Manages all active WebSocket connections.
///
/// Thread-safe via interior `RwLock`; designed to be wrapped in `Arc` and
/// shared across the application. Outbound queues are bounded and never
/// waited on: a full queue is reported to the caller as [`Delivery::Full`].
pub struct WsManager {
    connections: RwLock<HashMap<String, WsConnection>>,
    capacity: usize,
}

impl WsManager {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OUTBOUND_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register a new connection.
    ///
    /// Returns the receiver half of the message channel so the caller can
    /// forward messages to the WebSocket sink.
    pub async fn add(
        &self,
        conn_id: String,
        identity: Identity,
        scope: Scope,
    ) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let conn = WsConnection {
            identity,
            scope,
            sender: tx,
            connected_at: chrono::Utc::now(),
            last_seen: Mutex::new(Instant::now()),
        };
        self.connections.write().await.insert(conn_id, conn);
        rx
    }

    pub async fn remove(&self, conn_id: &str) {
        self.connections.write().await.remove(conn_id);
    }

    /// Record inbound activity on a connection.
    pub async fn touch(&self, conn_id: &str) {
        if let Some(conn) = self.connections.read().await.get(conn_id) {
            *lock(&conn.last_seen) = Instant::now();
        }
    }

    /// Queue a message for one connection. Returns `false` if it was not
    /// queued.
    pub async fn send_to(&self, conn_id: &str, message: Message) -> bool {
        self.deliver(conn_id, message).await == Delivery::Queued
    }

    pub async fn deliver(&self, conn_id: &str, message: Message) -> Delivery {
        match self.connections.read().await.get(conn_id) {
            Some(conn) => match conn.sender.try_send(message) {
                Ok(()) => Delivery::Queued,
                Err(TrySendError::Full(_)) => Delivery::Full,
                Err(TrySendError::Closed(_)) => Delivery::Gone,
            },
            None => Delivery::Gone,
        }
    }

    /// Return the current number of active connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send a Close frame to every connection, then clear the map.
    pub async fn shutdown_all(&self) {
        let mut conns = self.connections.write().await;
        let count = conns.len();
        for conn in conns.values() {
            let _ = conn.sender.try_send(Message::Close(None));
        }
        conns.clear();
        tracing::info!(count, "Closed all WebSocket connections");
    }

    /// Send a Ping frame to every connected client.
    pub async fn ping_all(&self) {
        let conns = self.connections.read().await;
        for conn in conns.values() {
            let _ = conn.sender.try_send(Message::Ping(Bytes::new()));
        }
    }

    /// Close and remove every connection that has been silent for longer
    /// than `timeout`. Returns the ids removed.
    pub async fn reap_stale(&self, timeout: Duration) -> Vec<String> {
        let mut conns = self.connections.write().await;
        let stale: Vec<String> = conns
            .iter()
            .filter(|(_, conn)| lock(&conn.last_seen).elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            if let Some(conn) = conns.remove(id) {
                let _ = conn.sender.try_send(Message::Close(Some(CloseFrame {
                    code: axum::extract::ws::close_code::AWAY,
                    reason: "heartbeat timeout".into(),
                })));
                tracing::info!(
                    conn_id = %id,
                    user_id = conn.identity.user_id,
                    scope = ?conn.scope,
                    "Dropping silent WebSocket connection"
                );
            }
        }
        stale
    }
}

impl Default for WsManager {
    fn default() -> Self {
        Self::new()
    }
}
