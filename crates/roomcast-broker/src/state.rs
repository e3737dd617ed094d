//! Cross-process room membership view.
//!
//! Each gateway process only knows its own sockets; the [`StateStore`]
//! answers global questions like "how many users total are in this room".
//! It is observability/lookup only — local broadcast correctness never
//! depends on it. Entries carry a bounded time-to-live so a process that
//! crashes without deregistering self-heals out of the view.

use crate::error::{BrokerError, Result};
use crate::topic::room_topic;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Default membership entry time-to-live.
const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// External store for room membership visible across processes.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Establish backend resources. A failure here is fatal at gateway
    /// startup, like [`Broker::connect`].
    ///
    /// [`Broker::connect`]: crate::Broker::connect
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Release backend resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Record a connection as a member of a room.
    async fn add_user_to_room(&self, ns: &str, room: &str, conn_id: &str) -> Result<()>;

    /// Remove a connection from a room.
    async fn remove_user_from_room(&self, ns: &str, room: &str, conn_id: &str) -> Result<()>;

    /// All live member connection ids across every process.
    async fn users_in_room(&self, ns: &str, room: &str) -> Result<Vec<String>>;

    /// Live member count across every process.
    async fn count_in_room(&self, ns: &str, room: &str) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// MemoryStateStore
// ---------------------------------------------------------------------------

/// In-process membership store for single-instance deployments and tests.
pub struct MemoryStateStore {
    ttl: Duration,
    entries: RwLock<HashMap<(String, String), HashMap<String, Instant>>>,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl MemoryStateStore {
    /// Create a store whose entries expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn key(ns: &str, room: &str) -> (String, String) {
        (ns.to_string(), room.to_string())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn add_user_to_room(&self, ns: &str, room: &str, conn_id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries
            .entry(Self::key(ns, room))
            .or_default()
            .insert(conn_id.to_string(), Instant::now() + self.ttl);
        Ok(())
    }

    async fn remove_user_from_room(&self, ns: &str, room: &str, conn_id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(members) = entries.get_mut(&Self::key(ns, room)) {
            members.remove(conn_id);
            if members.is_empty() {
                entries.remove(&Self::key(ns, room));
            }
        }
        Ok(())
    }

    async fn users_in_room(&self, ns: &str, room: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.write().await;
        let Some(members) = entries.get_mut(&Self::key(ns, room)) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        members.retain(|_, expires| *expires > now);

        let mut users: Vec<String> = members.keys().cloned().collect();
        users.sort();
        Ok(users)
    }

    async fn count_in_room(&self, ns: &str, room: &str) -> Result<usize> {
        Ok(self.users_in_room(ns, room).await?.len())
    }
}

// ---------------------------------------------------------------------------
// RedisStateStore
// ---------------------------------------------------------------------------

/// Redis-backed membership store for multi-instance deployments.
///
/// Members live in a sorted set per room, scored by their expiry epoch;
/// stale scores are pruned on every read, which is what lets entries from a
/// crashed process age out.
pub struct RedisStateStore {
    url: String,
    ttl: Duration,
    conn: RwLock<Option<ConnectionManager>>,
}

impl RedisStateStore {
    /// Create a store for the given Redis URL. No connection is made until
    /// [`StateStore::connect`].
    pub fn new(url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            url: url.into(),
            ttl,
            conn: RwLock::new(None),
        }
    }

    fn member_key(ns: &str, room: &str) -> String {
        format!("{}:members", room_topic(ns, room))
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        self.conn.read().await.clone().ok_or(BrokerError::Closed)
    }

    async fn prune(conn: &mut ConnectionManager, key: &str) -> Result<()> {
        let now = Utc::now().timestamp() as f64;
        let _: i64 = conn.zrembyscore(key, "-inf", now).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn connect(&self) -> Result<()> {
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        *self.conn.write().await = Some(manager);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.conn.write().await = None;
        Ok(())
    }

    async fn add_user_to_room(&self, ns: &str, room: &str, conn_id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let key = Self::member_key(ns, room);
        let expires = (Utc::now().timestamp() + self.ttl.as_secs() as i64) as f64;
        let _: i64 = conn.zadd(&key, conn_id, expires).await?;
        Ok(())
    }

    async fn remove_user_from_room(&self, ns: &str, room: &str, conn_id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let key = Self::member_key(ns, room);
        let _: i64 = conn.zrem(&key, conn_id).await?;
        Ok(())
    }

    async fn users_in_room(&self, ns: &str, room: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let key = Self::member_key(ns, room);
        Self::prune(&mut conn, &key).await?;
        let users: Vec<String> = conn.zrange(&key, 0, -1).await?;
        Ok(users)
    }

    async fn count_in_room(&self, ns: &str, room: &str) -> Result<usize> {
        let mut conn = self.connection().await?;
        let key = Self::member_key(ns, room);
        Self::prune(&mut conn, &key).await?;
        let count: i64 = conn.zcard(&key).await?;
        Ok(count as usize)
    }
}
