//! Core broker traits and the cross-process message record.

use crate::Result;
use async_trait::async_trait;
use roomcast_core::Envelope;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A message relayed between gateway processes.
///
/// Carries both mandatory echo-suppression fields: the author's connection
/// id rides inside `envelope.sender`, and `origin` names the publishing
/// process so it never re-broadcasts its own traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Identity of the publishing process.
    pub origin: String,

    /// The envelope being relayed.
    pub envelope: Envelope,
}

impl BrokerMessage {
    /// Create a new broker message.
    pub fn new(origin: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            origin: origin.into(),
            envelope,
        }
    }
}

/// Callback invoked for every message arriving on a subscribed topic.
#[async_trait]
pub trait SubscriptionHandler: Send + Sync {
    /// Handle one received message.
    async fn handle(&self, message: BrokerMessage);
}

/// Cancellation handle returned by [`Broker::subscribe`].
///
/// Pass it back to [`Broker::unsubscribe`] to stop delivery to the handler
/// it was issued for. Handles are not interchangeable between brokers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    topic: String,
    token: u64,
}

impl Subscription {
    pub(crate) fn new(topic: impl Into<String>, token: u64) -> Self {
        Self {
            topic: topic.into(),
            token,
        }
    }

    /// Topic this subscription listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }
}

/// Publish/subscribe transport between gateway processes.
///
/// Purely transport: adapters own no domain state. Multiple local handlers
/// on one topic share a single underlying bus subscription; the adapter
/// fans received messages out to all of them.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish backend resources. A failure here is fatal at gateway
    /// startup — the server must not run silently non-distributed.
    async fn connect(&self) -> Result<()>;

    /// Release backend resources. Remaining subscriptions stop delivering.
    async fn close(&self) -> Result<()>;

    /// Publish a message on a topic. Best-effort: transport failures are
    /// logged and swallowed so the publishing request path never observes
    /// them, and the call returns within a bounded time.
    async fn publish(&self, topic: &str, message: &BrokerMessage);

    /// Register a handler for a topic. Returns the cancellation handle.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<Subscription>;

    /// Cancel a subscription previously returned by [`subscribe`].
    ///
    /// [`subscribe`]: Broker::subscribe
    async fn unsubscribe(&self, subscription: &Subscription) -> Result<()>;
}
