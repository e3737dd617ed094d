//! Namespaces: named partitions of the connection space.
//!
//! A namespace owns its rooms, its registered connections, the middleware
//! chain run once per new connection, and the dispatch of inbound client
//! frames. Control events (`joinRoom`, `leaveRoom`, `roomMessage`) are
//! handled by the namespace itself; application events route to handlers
//! registered with [`Namespace::on`].

use crate::connection::Connection;
use crate::error::GatewayError;
use crate::protocol::{self, ClientCommand, ClientFrame};
use crate::room::{Room, RoomPolicy, RoomRelay};
use crate::tasks::TaskManager;
use async_trait::async_trait;
use futures::future::BoxFuture;
use roomcast_broker::{
    namespace_topic, room_topic, Broker, BrokerMessage, StateStore, Subscription,
    SubscriptionHandler,
};
use roomcast_core::Envelope;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Path of the default namespace.
pub const DEFAULT_NAMESPACE: &str = "/";

/// Normalize a namespace path: empty becomes `/`, everything else gains a
/// leading slash.
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        DEFAULT_NAMESPACE.to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Connection metadata delivered to the middleware chain.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Query-string parameters from the upgrade request.
    pub query: HashMap<String, String>,

    /// Headers from the upgrade request.
    pub headers: HashMap<String, String>,

    /// Authenticated identity, recorded by middleware on success.
    pub user_id: Option<String>,
}

/// A connect-time middleware step.
///
/// Middleware runs once per new connection, in registration order, each
/// step receiving the handshake the previous one produced. The first error
/// rejects the handshake: an error frame goes to the transport and the
/// connection is never registered.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Inspect (and possibly annotate) the handshake.
    async fn handle(&self, handshake: Handshake) -> Result<Handshake, GatewayError>;
}

/// Adapt a closure into a [`Middleware`].
pub fn middleware_fn<F>(f: F) -> Arc<dyn Middleware>
where
    F: Fn(Handshake) -> BoxFuture<'static, Result<Handshake, GatewayError>>
        + Send
        + Sync
        + 'static,
{
    struct FnMiddleware<F>(F);

    #[async_trait]
    impl<F> Middleware for FnMiddleware<F>
    where
        F: Fn(Handshake) -> BoxFuture<'static, Result<Handshake, GatewayError>>
            + Send
            + Sync
            + 'static,
    {
        async fn handle(&self, handshake: Handshake) -> Result<Handshake, GatewayError> {
            (self.0)(handshake).await
        }
    }

    Arc::new(FnMiddleware(f))
}

/// Handler for application-defined events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an inbound application event.
    async fn handle(&self, connection: Arc<Connection>, envelope: Envelope);
}

/// Observer for connection lifecycle notifications.
#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    /// Called after a connection passes middleware and is registered.
    async fn on_connect(&self, _connection: Arc<Connection>) {}

    /// Called after a connection is removed from the namespace.
    async fn on_disconnect(&self, _connection: Arc<Connection>) {}
}

/// A named partition of the connection space.
pub struct Namespace {
    path: String,
    process_id: String,
    broker: Option<Arc<dyn Broker>>,
    state: Option<Arc<dyn StateStore>>,
    tasks: Arc<TaskManager>,
    default_policy: RoomPolicy,
    self_ref: Weak<Namespace>,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
    lifecycle: RwLock<Vec<Arc<dyn LifecycleHandler>>>,

    /// Broker channel for namespace-wide events, when bridged.
    subscription: Mutex<Option<Subscription>>,
}

impl Namespace {
    pub(crate) fn new(
        path: &str,
        process_id: &str,
        broker: Option<Arc<dyn Broker>>,
        state: Option<Arc<dyn StateStore>>,
        tasks: Arc<TaskManager>,
        default_policy: RoomPolicy,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            path: path.to_string(),
            process_id: process_id.to_string(),
            broker,
            state,
            tasks,
            default_policy,
            self_ref: weak.clone(),
            rooms: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            middleware: RwLock::new(Vec::new()),
            handlers: RwLock::new(HashMap::new()),
            lifecycle: RwLock::new(Vec::new()),
            subscription: Mutex::new(None),
        })
    }

    /// Namespace path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Identity of this gateway process.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Owner key for scheduled tasks scoped to this namespace.
    pub fn task_owner(&self) -> String {
        format!("ns:{}", self.path)
    }

    /// Append a middleware step to the chain.
    pub async fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.write().await.push(middleware);
    }

    /// Register a handler for an application-defined event.
    pub async fn on(&self, event: &str, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.insert(event.to_string(), handler);
    }

    /// Register a lifecycle observer.
    pub async fn on_lifecycle(&self, handler: Arc<dyn LifecycleHandler>) {
        self.lifecycle.write().await.push(handler);
    }

    /// Admit a new transport: run the middleware chain, then register the
    /// connection and fire the connect notification. On rejection an error
    /// frame is sent over `outbound` and nothing is registered.
    pub async fn connect(
        &self,
        outbound: mpsc::UnboundedSender<String>,
        mut handshake: Handshake,
    ) -> Result<Arc<Connection>, GatewayError> {
        let chain: Vec<Arc<dyn Middleware>> = self.middleware.read().await.clone();
        for middleware in chain {
            handshake = match middleware.handle(handshake).await {
                Ok(handshake) => handshake,
                Err(e) => {
                    warn!(namespace = %self.path, error = %e, "handshake rejected by middleware");
                    let frame = protocol::error_frame(&self.path, e.reason_code(), &e.to_string());
                    let _ = outbound.send(frame.to_json());
                    return Err(GatewayError::MiddlewareRejected {
                        reason: e.to_string(),
                    });
                }
            };
        }

        let conn = Connection::new(
            self.self_ref.clone(),
            &self.path,
            outbound,
            handshake.user_id.clone(),
        );
        self.connections
            .write()
            .await
            .insert(conn.id().to_string(), conn.clone());
        info!(
            namespace = %self.path,
            connection = %conn.id(),
            user = ?handshake.user_id,
            "connection registered"
        );

        let observers: Vec<Arc<dyn LifecycleHandler>> = self.lifecycle.read().await.clone();
        for observer in observers {
            observer.on_connect(conn.clone()).await;
        }

        Ok(conn)
    }

    /// Look up a registered connection.
    pub async fn connection(&self, conn_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(conn_id).cloned()
    }

    /// Ids of all registered connections.
    pub async fn connection_ids(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Look up a room by name.
    pub async fn room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Names of all rooms.
    pub async fn room_names(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Get a room, creating it with the namespace default policy.
    pub async fn get_or_create_room(&self, name: &str) -> Arc<Room> {
        self.get_or_create_room_with(name, self.default_policy.clone())
            .await
    }

    /// Get a room, creating it with an explicit policy. Creation is
    /// idempotent keyed by name; an existing room keeps its policy.
    pub async fn get_or_create_room_with(&self, name: &str, policy: RoomPolicy) -> Arc<Room> {
        if let Some(existing) = self.rooms.read().await.get(name) {
            return existing.clone();
        }

        let room = {
            let mut rooms = self.rooms.write().await;
            if let Some(existing) = rooms.get(name) {
                return existing.clone();
            }
            let room = Room::new(
                name,
                policy,
                &self.path,
                &self.process_id,
                self.broker.clone(),
                self.self_ref.clone(),
            );
            rooms.insert(name.to_string(), room.clone());
            room
        };

        if let Some(broker) = &self.broker {
            let relay = Arc::new(RoomRelay::new(&room));
            match broker.subscribe(&room_topic(&self.path, name), relay).await {
                Ok(sub) => room.set_subscription(sub).await,
                Err(e) => {
                    warn!(
                        namespace = %self.path,
                        room = name,
                        error = %e,
                        "room broker subscription failed"
                    );
                }
            }
        }

        info!(namespace = %self.path, room = name, "room created");
        room
    }

    /// Add a connection to a room, updating both the room's member set and
    /// the connection's own membership mirror.
    pub async fn join_room(&self, conn: &Arc<Connection>, room_name: &str) {
        if conn.namespace_path() != self.path {
            warn!(
                namespace = %self.path,
                connection = %conn.id(),
                "cross-namespace join rejected"
            );
            return;
        }

        let room = self.get_or_create_room(room_name).await;
        room.add(conn.clone()).await;

        if let Some(state) = &self.state {
            if let Err(e) = state.add_user_to_room(&self.path, room_name, conn.id()).await {
                warn!(namespace = %self.path, room = room_name, error = %e, "state store add failed");
            }
        }
    }

    /// Remove a connection from a room.
    pub async fn leave_room(&self, conn: &Arc<Connection>, room_name: &str) {
        let Some(room) = self.room(room_name).await else {
            debug!(namespace = %self.path, room = room_name, "leave for unknown room ignored");
            return;
        };
        room.remove(conn.id()).await;

        if let Some(state) = &self.state {
            if let Err(e) = state
                .remove_user_from_room(&self.path, room_name, conn.id())
                .await
            {
                warn!(namespace = %self.path, room = room_name, error = %e, "state store remove failed");
            }
        }
    }

    /// Tear down a registered connection: drop it from every room, cancel
    /// its scheduled tasks, and fire the disconnect notification.
    pub(crate) async fn disconnect(&self, conn_id: &str) {
        let removed = self.connections.write().await.remove(conn_id);
        let Some(conn) = removed else { return };

        for room_name in conn.room_names().await {
            if let Some(room) = self.room(&room_name).await {
                room.remove(conn_id).await;
            }
            if let Some(state) = &self.state {
                if let Err(e) = state
                    .remove_user_from_room(&self.path, &room_name, conn_id)
                    .await
                {
                    warn!(namespace = %self.path, room = %room_name, error = %e, "state store remove failed");
                }
            }
        }

        self.tasks.stop_all(conn_id).await;

        let observers: Vec<Arc<dyn LifecycleHandler>> = self.lifecycle.read().await.clone();
        for observer in observers {
            observer.on_disconnect(conn.clone()).await;
        }

        info!(namespace = %self.path, connection = %conn_id, "connection removed");
    }

    /// Dispatch one inbound client frame. Control events are handled here;
    /// application events route to registered handlers. Malformed or
    /// unknown frames are logged and dropped, never surfaced as errors.
    pub async fn handle_client_message(&self, conn_id: &str, frame: ClientFrame) {
        let Some(conn) = self.connection(conn_id).await else {
            warn!(
                namespace = %self.path,
                connection = conn_id,
                "frame from unregistered connection dropped"
            );
            return;
        };

        match ClientCommand::from_frame(frame) {
            Ok(ClientCommand::JoinRoom { room }) => self.join_room(&conn, &room).await,
            Ok(ClientCommand::LeaveRoom { room }) => self.leave_room(&conn, &room).await,
            Ok(ClientCommand::RoomMessage { room, payload }) => {
                self.relay_room_message(&conn, &room, payload).await;
            }
            Ok(ClientCommand::Custom { event, payload }) => {
                self.dispatch_custom(&conn, &event, payload).await;
            }
            Err(e) => {
                warn!(
                    namespace = %self.path,
                    connection = conn_id,
                    error = %e,
                    "malformed control frame dropped"
                );
            }
        }
    }

    /// Relay a `roomMessage` after verifying current membership. A sender
    /// outside the room gets its message dropped with a warning: no frame
    /// reaches any member and no error reaches the caller.
    async fn relay_room_message(&self, conn: &Arc<Connection>, room_name: &str, payload: Value) {
        let room = self.room(room_name).await;
        let authorized = match &room {
            Some(room) => room.contains(conn.id()).await,
            None => false,
        };

        if !authorized {
            warn!(
                namespace = %self.path,
                room = room_name,
                connection = %conn.id(),
                "roomMessage into a room the connection never joined dropped"
            );
            return;
        }

        if let Some(room) = room {
            room.broadcast(protocol::ROOM_MESSAGE_EVENT, payload, Some(conn.id()))
                .await;
        }
    }

    /// Route an application event to its registered handler.
    async fn dispatch_custom(&self, conn: &Arc<Connection>, event: &str, payload: Value) {
        let handler = self.handlers.read().await.get(event).cloned();
        let Some(handler) = handler else {
            debug!(namespace = %self.path, event, "no handler for event, dropped");
            return;
        };

        match Envelope::new(self.path.as_str(), None, event, payload, conn.id(), None) {
            Ok(envelope) => handler.handle(conn.clone(), envelope).await,
            Err(e) => warn!(namespace = %self.path, error = %e, "invalid application event dropped"),
        }
    }

    /// Start a server-pushed broadcast scoped to one room. Chain further
    /// [`BroadcastBuilder::to`] calls for a logical OR of target rooms.
    pub fn to(&self, room: impl Into<String>) -> BroadcastBuilder {
        BroadcastBuilder {
            namespace: self.self_ref.clone(),
            rooms: vec![room.into()],
        }
    }

    /// Alias for [`Namespace::to`].
    pub fn in_room(&self, room: impl Into<String>) -> BroadcastBuilder {
        self.to(room)
    }

    /// Broadcast a namespace-wide event to every local connection and, when
    /// bridged, to peer processes over the namespace topic.
    pub async fn emit(&self, event: &str, payload: Value) {
        let envelope = Envelope::system(&self.path, None, event, payload);
        self.deliver_local(&envelope).await;

        if let Some(broker) = &self.broker {
            let message = BrokerMessage::new(self.process_id.clone(), envelope);
            broker.publish(&namespace_topic(&self.path), &message).await;
        }
    }

    /// Deliver a namespace-wide envelope to local connections, excluding
    /// the envelope's sender.
    pub(crate) async fn deliver_local(&self, envelope: &Envelope) {
        let targets: Vec<Arc<Connection>> = {
            let connections = self.connections.read().await;
            connections
                .values()
                .filter(|conn| conn.id() != envelope.sender())
                .cloned()
                .collect()
        };

        for conn in targets {
            conn.send(envelope).await;
        }
    }

    /// Total members of a room across every process, when a state store is
    /// configured; the local member count otherwise.
    pub async fn global_count(&self, room_name: &str) -> usize {
        if let Some(state) = &self.state {
            match state.count_in_room(&self.path, room_name).await {
                Ok(count) => return count,
                Err(e) => {
                    warn!(namespace = %self.path, room = room_name, error = %e, "state store count failed");
                }
            }
        }

        match self.room(room_name).await {
            Some(room) => room.len().await,
            None => 0,
        }
    }

    /// Remove a room from the registry and destroy it.
    pub async fn destroy_room(&self, name: &str) {
        let removed = self.rooms.write().await.remove(name);
        if let Some(room) = removed {
            self.tasks.stop_all(&room.task_owner()).await;
            room.destroy().await;
        }
    }

    /// Shutdown support: close every connection, destroy every room, and
    /// drop the namespace's broker channel.
    pub async fn clear(&self) {
        let conns: Vec<Arc<Connection>> =
            self.connections.read().await.values().cloned().collect();
        for conn in conns {
            conn.close().await;
        }

        let names: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        for name in names {
            self.destroy_room(&name).await;
        }

        let subscription = self.subscription.lock().await.take();
        if let Some(sub) = subscription {
            if let Some(broker) = &self.broker {
                if let Err(e) = broker.unsubscribe(&sub).await {
                    warn!(namespace = %self.path, error = %e, "namespace broker unsubscribe failed");
                }
            }
        }

        self.tasks.stop_all(&self.task_owner()).await;
        info!(namespace = %self.path, "namespace cleared");
    }

    pub(crate) async fn set_subscription(&self, subscription: Subscription) {
        *self.subscription.lock().await = Some(subscription);
    }
}

/// Fluent emitter for server-pushed broadcasts, composable over rooms.
pub struct BroadcastBuilder {
    namespace: Weak<Namespace>,
    rooms: Vec<String>,
}

impl BroadcastBuilder {
    /// Add another target room (logical OR).
    pub fn to(mut self, room: impl Into<String>) -> Self {
        let room = room.into();
        if !self.rooms.contains(&room) {
            self.rooms.push(room);
        }
        self
    }

    /// Emit to the union of target rooms' members, once per connection,
    /// forwarding each room's copy to the broker.
    pub async fn emit(self, event: &str, payload: Value) {
        let Some(ns) = self.namespace.upgrade() else {
            return;
        };

        let mut seen: HashSet<String> = HashSet::new();
        for name in &self.rooms {
            let Some(room) = ns.room(name).await else {
                continue;
            };
            if room.is_destroyed() {
                continue;
            }

            let envelope = Envelope::system(ns.path(), Some(name.as_str()), event, payload.clone());
            for conn in room.members_snapshot().await {
                if seen.insert(conn.id().to_string()) {
                    conn.send(&envelope).await;
                }
            }
            room.forward(&envelope).await;
        }
    }
}

/// Relays broker traffic on the namespace topic into local delivery.
pub(crate) struct NamespaceRelay {
    namespace: Weak<Namespace>,
    process_id: String,
}

impl NamespaceRelay {
    pub(crate) fn new(namespace: &Arc<Namespace>) -> Self {
        Self {
            namespace: Arc::downgrade(namespace),
            process_id: namespace.process_id.clone(),
        }
    }
}

#[async_trait]
impl SubscriptionHandler for NamespaceRelay {
    async fn handle(&self, message: BrokerMessage) {
        if message.origin == self.process_id {
            return;
        }

        let Some(ns) = self.namespace.upgrade() else {
            return;
        };
        ns.deliver_local(&message.envelope).await;
    }
}
