//! Redis-backed broker for multi-instance deployments.
//!
//! Messages are serialized to JSON and carried over Redis pub/sub. A single
//! background reader task owns the pub/sub connection; topic changes reach
//! it over a command channel. Received payloads are structurally validated
//! with [`Envelope::is_valid`] before any handler runs, so foreign traffic
//! on a shared Redis never reaches the gateway.

use crate::error::{BrokerError, Result};
use crate::traits::{Broker, BrokerMessage, Subscription, SubscriptionHandler};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use roomcast_core::Envelope;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on a single publish round-trip.
const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Handlers by topic, keyed by subscription token.
type TopicHandlers = HashMap<String, HashMap<u64, Arc<dyn SubscriptionHandler>>>;

/// Topic changes sent to the reader task.
enum TopicCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Redis pub/sub broker.
pub struct RedisBroker {
    url: String,
    publish_timeout: Duration,
    subscribers: Arc<RwLock<TopicHandlers>>,
    next_token: AtomicU64,
    publisher: RwLock<Option<ConnectionManager>>,
    commands: RwLock<Option<mpsc::UnboundedSender<TopicCommand>>>,
    shutdown: CancellationToken,
}

impl RedisBroker {
    /// Create a broker for the given Redis URL. No connection is made until
    /// [`Broker::connect`].
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_token: AtomicU64::new(0),
            publisher: RwLock::new(None),
            commands: RwLock::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Override the bounded publish timeout.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn connect(&self) -> Result<()> {
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        let mut pubsub = client
            .get_async_connection()
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?
            .into_pubsub();

        // Topics registered before connect get their bus subscription now.
        let initial: Vec<String> = self.subscribers.read().await.keys().cloned().collect();
        for topic in &initial {
            pubsub
                .subscribe(topic)
                .await
                .map_err(|e| BrokerError::Connect(e.to_string()))?;
        }

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        *self.publisher.write().await = Some(publisher);
        *self.commands.write().await = Some(cmd_tx);

        let subscribers = self.subscribers.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            // The message stream mutably borrows the pub/sub connection, so
            // each loop turn resolves one step inside a scope, then applies
            // it with the connection free again.
            enum Step {
                Message(Option<::redis::Msg>),
                Command(Option<TopicCommand>),
                Stop,
            }

            loop {
                let step = {
                    let mut stream = pubsub.on_message();
                    tokio::select! {
                        maybe = stream.next() => Step::Message(maybe),
                        command = cmd_rx.recv() => Step::Command(command),
                        _ = shutdown.cancelled() => Step::Stop,
                    }
                };

                match step {
                    Step::Message(Some(msg)) => dispatch(&subscribers, msg).await,
                    Step::Message(None) => {
                        warn!("redis pub/sub stream ended");
                        break;
                    }
                    Step::Command(Some(TopicCommand::Subscribe(topic))) => {
                        if let Err(e) = pubsub.subscribe(&topic).await {
                            warn!(topic, error = %e, "redis subscribe failed");
                        }
                    }
                    Step::Command(Some(TopicCommand::Unsubscribe(topic))) => {
                        if let Err(e) = pubsub.unsubscribe(&topic).await {
                            warn!(topic, error = %e, "redis unsubscribe failed");
                        }
                    }
                    Step::Command(None) | Step::Stop => break,
                }
            }
            debug!("redis pub/sub reader stopped");
        });

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        *self.commands.write().await = None;
        *self.publisher.write().await = None;
        self.subscribers.write().await.clear();
        Ok(())
    }

    async fn publish(&self, topic: &str, message: &BrokerMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic, error = %e, "unserializable broker message dropped");
                return;
            }
        };

        let Some(mut conn) = self.publisher.read().await.clone() else {
            warn!(topic, "publish before connect dropped");
            return;
        };

        let topic_owned = topic.to_string();
        let send = async move {
            let _: i64 = conn.publish(topic_owned, payload).await?;
            Ok::<(), redis::RedisError>(())
        };

        match tokio::time::timeout(self.publish_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(topic, error = %e, "redis publish failed"),
            Err(_) => {
                warn!(topic, timeout = ?self.publish_timeout, "redis publish timed out");
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<Subscription> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let first_for_topic = {
            let mut subscribers = self.subscribers.write().await;
            let for_topic = subscribers.entry(topic.to_string()).or_default();
            let first = for_topic.is_empty();
            for_topic.insert(token, handler);
            first
        };

        // One underlying bus subscription per topic regardless of how many
        // local handlers share it. Before connect, registration alone is
        // enough: connect() subscribes every known topic.
        if first_for_topic {
            if let Some(commands) = self.commands.read().await.as_ref() {
                commands
                    .send(TopicCommand::Subscribe(topic.to_string()))
                    .map_err(|_| BrokerError::Closed)?;
            }
        }

        Ok(Subscription::new(topic, token))
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        let last_for_topic = {
            let mut subscribers = self.subscribers.write().await;
            match subscribers.get_mut(subscription.topic()) {
                Some(for_topic) => {
                    for_topic.remove(&subscription.token());
                    if for_topic.is_empty() {
                        subscribers.remove(subscription.topic());
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if last_for_topic {
            if let Some(commands) = self.commands.read().await.as_ref() {
                let _ = commands.send(TopicCommand::Unsubscribe(subscription.topic().to_string()));
            }
        }

        Ok(())
    }
}

/// Decode and structurally validate a bus payload.
fn parse_broker_payload(payload: &str) -> Option<BrokerMessage> {
    let value: Value = serde_json::from_str(payload).ok()?;
    if !value.get("origin").is_some_and(Value::is_string) {
        return None;
    }
    let envelope = value.get("envelope")?;
    if !Envelope::is_valid(envelope) {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Fan a received bus message out to the topic's local handlers.
async fn dispatch(subscribers: &RwLock<TopicHandlers>, msg: redis::Msg) {
    let topic = msg.get_channel_name().to_string();
    let payload: String = match msg.get_payload() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(topic, error = %e, "undecodable redis payload dropped");
            return;
        }
    };

    let Some(message) = parse_broker_payload(&payload) else {
        warn!(topic, "malformed broker payload dropped");
        return;
    };

    let handlers: Vec<Arc<dyn SubscriptionHandler>> = {
        let subscribers = subscribers.read().await;
        match subscribers.get(&topic) {
            Some(for_topic) => for_topic.values().cloned().collect(),
            None => return,
        }
    };

    for handler in handlers {
        handler.handle(message.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Sink;

    #[async_trait]
    impl SubscriptionHandler for Sink {
        async fn handle(&self, _message: BrokerMessage) {}
    }

    fn valid_payload() -> String {
        let envelope = Envelope::system("/chat", Some("general"), "ping", json!(1));
        serde_json::to_string(&BrokerMessage::new("proc-1", envelope)).unwrap()
    }

    #[test]
    fn test_parse_broker_payload_accepts_valid() {
        let message = parse_broker_payload(&valid_payload()).unwrap();
        assert_eq!(message.origin, "proc-1");
        assert_eq!(message.envelope.event(), "ping");
    }

    #[test]
    fn test_parse_broker_payload_rejects_non_json() {
        assert!(parse_broker_payload("not json").is_none());
    }

    #[test]
    fn test_parse_broker_payload_rejects_missing_origin() {
        let envelope = Envelope::system("/", None, "ping", Value::Null);
        let payload = serde_json::to_string(&json!({ "envelope": envelope })).unwrap();
        assert!(parse_broker_payload(&payload).is_none());
    }

    #[test]
    fn test_parse_broker_payload_rejects_foreign_envelope() {
        let payload = r#"{"origin": "p1", "envelope": {"kind": "not-an-envelope"}}"#;
        assert!(parse_broker_payload(payload).is_none());
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_registers_topic() {
        let broker = RedisBroker::new("redis://127.0.0.1:6379");
        let sub = broker.subscribe("t", Arc::new(Sink)).await.unwrap();
        assert_eq!(sub.topic(), "t");
        assert_eq!(broker.subscribers.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_before_connect_is_dropped() {
        let broker = RedisBroker::new("redis://127.0.0.1:6379");
        let envelope = Envelope::system("/", None, "ping", Value::Null);
        // Must return without contacting any backend.
        broker.publish("t", &BrokerMessage::new("p", envelope)).await;
    }

    #[tokio::test]
    async fn test_subscribe_after_close_is_rejected() {
        let broker = RedisBroker::new("redis://127.0.0.1:6379");
        broker.close().await.unwrap();
        let result = broker.subscribe("t", Arc::new(Sink)).await;
        assert!(matches!(result, Err(BrokerError::Closed)));
    }
}
