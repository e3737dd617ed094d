//! Rooms: named subsets of connections, the unit of targeted broadcast.
//!
//! A room holds local connections only. When a broker is configured it also
//! bridges to the room's bus topic so peer processes can fan the same event
//! out to their own members. Two independent exclusions prevent echo: the
//! author's connection id is skipped on local delivery, and a process never
//! re-broadcasts a bus message it published itself.

use crate::connection::Connection;
use crate::namespace::Namespace;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roomcast_broker::{room_topic, Broker, BrokerMessage, Subscription, SubscriptionHandler};
use roomcast_core::{Envelope, SYSTEM_SENDER};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Room lifecycle policy.
#[derive(Debug, Clone)]
pub struct RoomPolicy {
    /// Destroy the room when it stays empty past the grace period.
    pub auto_delete_empty: bool,

    /// Grace period before an empty room is destroyed. Zero destroys
    /// immediately on the last leave.
    pub empty_timeout: Duration,
}

impl Default for RoomPolicy {
    fn default() -> Self {
        Self {
            auto_delete_empty: false,
            empty_timeout: Duration::from_secs(30),
        }
    }
}

impl RoomPolicy {
    /// Policy that auto-deletes empty rooms after `empty_timeout`.
    pub fn auto_delete(empty_timeout: Duration) -> Self {
        Self {
            auto_delete_empty: true,
            empty_timeout,
        }
    }
}

/// A named set of local connections within one namespace.
pub struct Room {
    name: String,
    namespace_path: String,
    created_at: DateTime<Utc>,
    policy: RoomPolicy,
    process_id: String,
    broker: Option<Arc<dyn Broker>>,
    namespace: Weak<Namespace>,
    self_ref: Weak<Room>,
    members: RwLock<HashMap<String, Arc<Connection>>>,
    destroyed: AtomicBool,

    /// Pending auto-delete timer, present only while draining.
    grace: Mutex<Option<JoinHandle<()>>>,

    /// Broker channel bound to this room, when bridged.
    subscription: Mutex<Option<Subscription>>,
}

impl Room {
    pub(crate) fn new(
        name: &str,
        policy: RoomPolicy,
        namespace_path: &str,
        process_id: &str,
        broker: Option<Arc<dyn Broker>>,
        namespace: Weak<Namespace>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name: name.to_string(),
            namespace_path: namespace_path.to_string(),
            created_at: Utc::now(),
            policy,
            process_id: process_id.to_string(),
            broker,
            namespace,
            self_ref: weak.clone(),
            members: RwLock::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
            grace: Mutex::new(None),
            subscription: Mutex::new(None),
        })
    }

    /// Room name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the owning namespace.
    pub fn namespace_path(&self) -> &str {
        &self.namespace_path
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether [`destroy`] has run; a dead room ignores every call.
    ///
    /// [`destroy`]: Room::destroy
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Number of local members.
    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    /// Whether the room has no local members.
    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }

    /// Whether `conn_id` is a local member.
    pub async fn contains(&self, conn_id: &str) -> bool {
        self.members.read().await.contains_key(conn_id)
    }

    /// Ids of all local members.
    pub async fn member_ids(&self) -> Vec<String> {
        self.members.read().await.keys().cloned().collect()
    }

    /// Owner key for scheduled tasks scoped to this room.
    pub fn task_owner(&self) -> String {
        format!("room:{}:{}", self.namespace_path, self.name)
    }

    pub(crate) async fn members_snapshot(&self) -> Vec<Arc<Connection>> {
        self.members.read().await.values().cloned().collect()
    }

    /// Add a member. Idempotent; a no-op on members and on destroyed rooms.
    /// Cancels a pending auto-delete timer.
    pub(crate) async fn add(&self, conn: Arc<Connection>) {
        if self.is_destroyed() {
            debug!(room = %self.name, "add on destroyed room ignored");
            return;
        }

        {
            let mut members = self.members.write().await;
            if members.contains_key(conn.id()) {
                return;
            }
            members.insert(conn.id().to_string(), conn.clone());
        }
        conn.track_room(&self.name).await;

        if let Some(timer) = self.grace.lock().await.take() {
            timer.abort();
            debug!(room = %self.name, "pending auto-delete cancelled by rejoin");
        }

        debug!(
            namespace = %self.namespace_path,
            room = %self.name,
            connection = %conn.id(),
            "joined room"
        );
    }

    /// Remove a member. Idempotent. When this empties the room and an
    /// auto-delete policy exists, the grace timer starts (or keeps running).
    pub(crate) async fn remove(&self, conn_id: &str) {
        if self.is_destroyed() {
            return;
        }

        let (removed, emptied) = {
            let mut members = self.members.write().await;
            match members.remove(conn_id) {
                Some(conn) => (conn, members.is_empty()),
                None => return,
            }
        };
        removed.forget_room(&self.name).await;

        debug!(
            namespace = %self.namespace_path,
            room = %self.name,
            connection = %conn_id,
            "left room"
        );

        if emptied && self.policy.auto_delete_empty {
            self.schedule_auto_delete().await;
        }
    }

    /// Fan an event out to every local member except `sender`, and forward
    /// it to the room's bus topic when a broker is configured.
    pub async fn broadcast(&self, event: &str, payload: Value, sender: Option<&str>) {
        if self.is_destroyed() {
            return;
        }

        let sender = sender.unwrap_or(SYSTEM_SENDER);
        let envelope = match Envelope::new(
            self.namespace_path.as_str(),
            Some(self.name.as_str()),
            event,
            payload,
            sender,
            None,
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(room = %self.name, error = %e, "invalid broadcast dropped");
                return;
            }
        };

        self.deliver_local(&envelope).await;
        self.forward(&envelope).await;
    }

    /// Deliver to local members, excluding the envelope's sender.
    pub(crate) async fn deliver_local(&self, envelope: &Envelope) {
        let targets: Vec<Arc<Connection>> = {
            let members = self.members.read().await;
            members
                .values()
                .filter(|conn| conn.id() != envelope.sender())
                .cloned()
                .collect()
        };

        for conn in targets {
            conn.send(envelope).await;
        }
    }

    /// Publish an envelope on the room's bus topic, stamped with this
    /// process's identity so peers can exclude it on the way back.
    pub(crate) async fn forward(&self, envelope: &Envelope) {
        let Some(broker) = &self.broker else { return };
        let message = BrokerMessage::new(self.process_id.clone(), envelope.clone());
        broker
            .publish(&room_topic(&self.namespace_path, &self.name), &message)
            .await;
    }

    /// Tear the room down: cancel the grace timer, unsubscribe the broker
    /// channel, clear membership, and mark the room dead. Safe to call more
    /// than once.
    pub(crate) async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(timer) = self.grace.lock().await.take() {
            timer.abort();
        }

        let subscription = self.subscription.lock().await.take();
        if let Some(sub) = subscription {
            if let Some(broker) = &self.broker {
                if let Err(e) = broker.unsubscribe(&sub).await {
                    warn!(room = %self.name, error = %e, "room broker unsubscribe failed");
                }
            }
        }

        let members: Vec<Arc<Connection>> = {
            let mut members = self.members.write().await;
            members.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &members {
            conn.forget_room(&self.name).await;
        }

        info!(namespace = %self.namespace_path, room = %self.name, "room destroyed");
    }

    pub(crate) async fn set_subscription(&self, subscription: Subscription) {
        *self.subscription.lock().await = Some(subscription);
    }

    async fn schedule_auto_delete(&self) {
        let mut slot = self.grace.lock().await;
        if slot.is_some() {
            // A timer from an earlier drain is still running; reuse it.
            return;
        }

        let Some(room) = self.self_ref.upgrade() else {
            return;
        };
        let grace = self.policy.empty_timeout;
        debug!(room = %self.name, grace = ?grace, "room empty, auto-delete scheduled");

        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            room.expire_if_empty().await;
        }));
    }

    /// Grace timer body: destroy the room if it is still empty.
    async fn expire_if_empty(&self) {
        // The timer has consumed itself; clear the slot so destroy() does
        // not abort the task that is running it.
        self.grace.lock().await.take();

        if self.is_destroyed() || !self.members.read().await.is_empty() {
            return;
        }

        match self.namespace.upgrade() {
            Some(ns) => ns.destroy_room(&self.name).await,
            None => self.destroy().await,
        }
    }
}

/// Relays broker traffic on the room's topic into local delivery.
pub(crate) struct RoomRelay {
    room: Weak<Room>,
    process_id: String,
}

impl RoomRelay {
    pub(crate) fn new(room: &Arc<Room>) -> Self {
        Self {
            room: Arc::downgrade(room),
            process_id: room.process_id.clone(),
        }
    }
}

#[async_trait]
impl SubscriptionHandler for RoomRelay {
    async fn handle(&self, message: BrokerMessage) {
        // Never re-broadcast our own publishes; the author's local delivery
        // already happened on the originating process.
        if message.origin == self.process_id {
            return;
        }

        let Some(room) = self.room.upgrade() else {
            return;
        };
        room.deliver_local(&message.envelope).await;
    }
}
