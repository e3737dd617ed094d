//! In-process broker: a direct call-through with no serialization.
//!
//! Used for single-instance deployments and for tests, where two gateway
//! registries sharing one `LocalBroker` stand in for two processes sharing
//! a bus.

use crate::error::{BrokerError, Result};
use crate::traits::{Broker, BrokerMessage, Subscription, SubscriptionHandler};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// In-process publish/subscribe broker.
pub struct LocalBroker {
    /// Handlers by topic, keyed by subscription token.
    subscribers: RwLock<HashMap<String, HashMap<u64, Arc<dyn SubscriptionHandler>>>>,

    /// Token source for subscription handles.
    next_token: AtomicU64,

    /// Set once `close` has been called; further calls are no-ops.
    closed: AtomicBool,
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBroker {
    /// Create a new local broker.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of topics with at least one handler.
    pub async fn topic_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.write().await.clear();
        Ok(())
    }

    async fn publish(&self, topic: &str, message: &BrokerMessage) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(topic, "publish on closed broker dropped");
            return;
        }

        // Snapshot handlers before awaiting them so a handler that calls
        // back into the broker never deadlocks against this read lock.
        let handlers: Vec<Arc<dyn SubscriptionHandler>> = {
            let subscribers = self.subscribers.read().await;
            match subscribers.get(topic) {
                Some(for_topic) => for_topic.values().cloned().collect(),
                None => return,
            }
        };

        for handler in handlers {
            handler.handle(message.clone()).await;
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<Subscription> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.write().await;
        subscribers
            .entry(topic.to_string())
            .or_default()
            .insert(token, handler);

        debug!(topic, token, "local subscription added");
        Ok(Subscription::new(topic, token))
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        let mut subscribers = self.subscribers.write().await;
        if let Some(for_topic) = subscribers.get_mut(subscription.topic()) {
            for_topic.remove(&subscription.token());
            if for_topic.is_empty() {
                subscribers.remove(subscription.topic());
            }
        }
        Ok(())
    }
}
