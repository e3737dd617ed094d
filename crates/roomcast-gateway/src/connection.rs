//! One client connection over a duplex transport.
//!
//! A [`Connection`] owns the outbound side of the transport (an unbounded
//! channel drained by the server's write task) and mirrors the set of rooms
//! that currently contain it. Membership changes go through the owning
//! [`Namespace`] so both sides stay in step.

use crate::namespace::Namespace;
use chrono::{DateTime, Utc};
use roomcast_core::{id, Envelope};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// A registered client connection.
pub struct Connection {
    /// Opaque unique id, generated at accept time.
    id: String,

    /// Authenticated identity, set by middleware during the handshake.
    user_id: Option<String>,

    /// Path of the owning namespace.
    namespace_path: String,

    /// The owning namespace.
    namespace: Weak<Namespace>,

    self_ref: Weak<Connection>,
    state: RwLock<ConnectionState>,

    /// Names of rooms that currently contain this connection.
    rooms: RwLock<HashSet<String>>,

    /// Outbound frames, drained by the transport write task.
    outbound: mpsc::UnboundedSender<String>,

    connected_at: DateTime<Utc>,
}

impl Connection {
    pub(crate) fn new(
        namespace: Weak<Namespace>,
        namespace_path: &str,
        outbound: mpsc::UnboundedSender<String>,
        user_id: Option<String>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id: id::uuid(),
            user_id,
            namespace_path: namespace_path.to_string(),
            namespace,
            self_ref: weak.clone(),
            state: RwLock::new(ConnectionState::Open),
            rooms: RwLock::new(HashSet::new()),
            outbound,
            connected_at: Utc::now(),
        })
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Authenticated user id, when middleware established one.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Path of the owning namespace.
    pub fn namespace_path(&self) -> &str {
        &self.namespace_path
    }

    /// The owning namespace, while it is alive.
    pub fn namespace(&self) -> Option<Arc<Namespace>> {
        self.namespace.upgrade()
    }

    /// Accept timestamp.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Whether the connection accepts outbound frames.
    pub async fn is_open(&self) -> bool {
        self.state().await == ConnectionState::Open
    }

    /// Write a frame if open; silently drop otherwise. Never errors on a
    /// closed peer.
    pub async fn send(&self, envelope: &Envelope) {
        if *self.state.read().await != ConnectionState::Open {
            debug!(connection = %self.id, "send on non-open connection dropped");
            return;
        }

        if self.outbound.send(envelope.to_json()).is_err() {
            debug!(connection = %self.id, "send after transport teardown dropped");
        }
    }

    /// Names of rooms that currently contain this connection.
    pub async fn room_names(&self) -> Vec<String> {
        self.rooms.read().await.iter().cloned().collect()
    }

    /// Whether this connection is currently in `room`.
    pub async fn in_room(&self, room: &str) -> bool {
        self.rooms.read().await.contains(room)
    }

    /// Join a room through the owning namespace.
    pub async fn join(&self, room: &str) {
        let (Some(ns), Some(me)) = (self.namespace.upgrade(), self.self_ref.upgrade()) else {
            return;
        };
        ns.join_room(&me, room).await;
    }

    /// Leave a room through the owning namespace.
    pub async fn leave(&self, room: &str) {
        let (Some(ns), Some(me)) = (self.namespace.upgrade(), self.self_ref.upgrade()) else {
            return;
        };
        ns.leave_room(&me, room).await;
    }

    /// Close the connection: remove it from every room, cancel its scheduled
    /// tasks, and fire the disconnect notification. All cleanup completes
    /// before this returns, so no later broadcast can target the connection.
    pub async fn close(&self) {
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Open {
                return;
            }
            *state = ConnectionState::Closing;
        }

        if let Some(ns) = self.namespace.upgrade() {
            ns.disconnect(&self.id).await;
        }

        *self.state.write().await = ConnectionState::Closed;
        debug!(connection = %self.id, "connection closed");
    }

    pub(crate) async fn track_room(&self, room: &str) {
        self.rooms.write().await.insert(room.to_string());
    }

    pub(crate) async fn forget_room(&self, room: &str) {
        self.rooms.write().await.remove(room);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("namespace", &self.namespace_path)
            .field("user_id", &self.user_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NamespaceRegistry;

    async fn open_connection() -> (Arc<Connection>, mpsc::UnboundedReceiver<String>) {
        let registry: &'static NamespaceRegistry = Box::leak(Box::new(NamespaceRegistry::new()));
        let ns = registry.namespace("/chat").await;
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ns.connect(tx, Default::default()).await.unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn test_send_writes_frame_while_open() {
        let (conn, mut rx) = open_connection().await;
        let envelope = Envelope::system("/chat", None, "ping", serde_json::json!(1));

        conn.send(&envelope).await;
        let frame = rx.try_recv().unwrap();
        let parsed: Envelope = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed.event(), "ping");
    }

    #[tokio::test]
    async fn test_send_after_close_is_dropped() {
        let (conn, mut rx) = open_connection().await;
        conn.close().await;
        assert_eq!(conn.state().await, ConnectionState::Closed);

        let envelope = Envelope::system("/chat", None, "ping", serde_json::json!(1));
        conn.send(&envelope).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_survives_dropped_receiver() {
        let (conn, rx) = open_connection().await;
        drop(rx);

        // Must not error or panic on a torn-down transport.
        let envelope = Envelope::system("/chat", None, "ping", serde_json::json!(1));
        conn.send(&envelope).await;
        assert!(conn.is_open().await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, _rx) = open_connection().await;
        conn.close().await;
        conn.close().await;
        assert_eq!(conn.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_namespace_backref() {
        let (conn, _rx) = open_connection().await;
        assert_eq!(conn.namespace_path(), "/chat");
        let ns = conn.namespace().unwrap();
        assert_eq!(ns.path(), "/chat");
        assert!(ns.connection(conn.id()).await.is_some());
    }
}
