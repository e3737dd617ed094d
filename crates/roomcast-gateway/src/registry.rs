//! Process-wide namespace registry.
//!
//! An explicitly constructed, explicitly owned object — never module-level
//! state — so several independent gateway instances can coexist in one
//! process (which is exactly how the multi-instance tests simulate a
//! cluster). The registry carries the per-process identity used for broker
//! origin exclusion and the shared handles every namespace inherits.

use crate::error::GatewayError;
use crate::namespace::{normalize_path, Namespace, NamespaceRelay};
use crate::room::RoomPolicy;
use crate::tasks::TaskManager;
use roomcast_broker::{
    namespace_topic, Broker, LocalBroker, MemoryStateStore, RedisBroker, RedisStateStore,
    StateStore,
};
use roomcast_core::config::{BrokerMode, Config, StateMode};
use roomcast_core::id;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Registry of namespaces for one gateway instance.
pub struct NamespaceRegistry {
    process_id: String,
    broker: Option<Arc<dyn Broker>>,
    state: Option<Arc<dyn StateStore>>,
    tasks: Arc<TaskManager>,
    default_policy: RoomPolicy,
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
}

impl Default for NamespaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceRegistry {
    /// Create a registry with a generated process identity and no backends.
    pub fn new() -> Self {
        Self {
            process_id: id::process_id(),
            broker: None,
            state: None,
            tasks: Arc::new(TaskManager::new()),
            default_policy: RoomPolicy::default(),
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    /// Build a registry with the backends the configuration selects.
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        config.validate()?;

        let mut registry = Self::new().with_default_room_policy(RoomPolicy {
            auto_delete_empty: config.rooms.auto_delete_empty,
            empty_timeout: Duration::from_millis(config.rooms.empty_timeout_ms),
        });

        registry = match config.broker.mode {
            BrokerMode::Local => registry.with_broker(Arc::new(LocalBroker::new())),
            BrokerMode::Redis => {
                let url = config.broker.url.clone().ok_or_else(|| {
                    GatewayError::Internal("broker.url required for redis mode".to_string())
                })?;
                registry.with_broker(Arc::new(RedisBroker::new(url)))
            }
        };

        let ttl = Duration::from_secs(config.state.ttl_secs);
        registry = match config.state.mode {
            StateMode::Memory => registry.with_state_store(Arc::new(MemoryStateStore::new(ttl))),
            StateMode::Redis => {
                let url = config.state.url.clone().ok_or_else(|| {
                    GatewayError::Internal("state.url required for redis mode".to_string())
                })?;
                registry.with_state_store(Arc::new(RedisStateStore::new(url, ttl)))
            }
        };

        Ok(registry)
    }

    /// Attach a broker for cross-process fan-out.
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Attach a state store for the cross-process membership view.
    pub fn with_state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Override the default policy for lazily-created rooms.
    pub fn with_default_room_policy(mut self, policy: RoomPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Override the generated process identity (tests pin these).
    pub fn with_process_id(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = process_id.into();
        self
    }

    /// Identity of this gateway process.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// The shared scheduled-task manager.
    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// The configured broker, if any.
    pub fn broker(&self) -> Option<&Arc<dyn Broker>> {
        self.broker.as_ref()
    }

    /// Get a namespace by path, creating it lazily on first reference.
    pub async fn namespace(&self, path: &str) -> Arc<Namespace> {
        let path = normalize_path(path);
        if let Some(ns) = self.namespaces.read().await.get(&path) {
            return ns.clone();
        }

        let ns = {
            let mut namespaces = self.namespaces.write().await;
            if let Some(existing) = namespaces.get(&path) {
                return existing.clone();
            }
            let ns = Namespace::new(
                &path,
                &self.process_id,
                self.broker.clone(),
                self.state.clone(),
                self.tasks.clone(),
                self.default_policy.clone(),
            );
            namespaces.insert(path.clone(), ns.clone());
            ns
        };

        if let Some(broker) = &self.broker {
            let relay = Arc::new(NamespaceRelay::new(&ns));
            match broker.subscribe(&namespace_topic(&path), relay).await {
                Ok(sub) => ns.set_subscription(sub).await,
                Err(e) => {
                    warn!(namespace = %path, error = %e, "namespace broker subscription failed");
                }
            }
        }

        info!(namespace = %path, "namespace created");
        ns
    }

    /// Look up a namespace without creating it.
    pub async fn get(&self, path: &str) -> Option<Arc<Namespace>> {
        self.namespaces.read().await.get(&normalize_path(path)).cloned()
    }

    /// Paths of all namespaces.
    pub async fn namespace_paths(&self) -> Vec<String> {
        self.namespaces.read().await.keys().cloned().collect()
    }

    /// Number of namespaces.
    pub async fn namespace_count(&self) -> usize {
        self.namespaces.read().await.len()
    }

    /// Total registered connections across all namespaces.
    pub async fn connection_count(&self) -> usize {
        let namespaces: Vec<Arc<Namespace>> =
            self.namespaces.read().await.values().cloned().collect();
        let mut total = 0;
        for ns in namespaces {
            total += ns.connection_count().await;
        }
        total
    }

    /// Connect the configured backends. Failures are fatal: the gateway
    /// must not come up silently non-distributed.
    pub async fn connect_backends(&self) -> Result<(), GatewayError> {
        if let Some(broker) = &self.broker {
            broker.connect().await?;
            info!("broker connected");
        }
        if let Some(state) = &self.state {
            state.connect().await?;
            info!("state store connected");
        }
        Ok(())
    }

    /// Tear everything down: clear every namespace, then close backends.
    pub async fn shutdown(&self) {
        let namespaces: Vec<Arc<Namespace>> = {
            let mut map = self.namespaces.write().await;
            map.drain().map(|(_, ns)| ns).collect()
        };
        for ns in namespaces {
            ns.clear().await;
        }

        if let Some(state) = &self.state {
            if let Err(e) = state.close().await {
                warn!(error = %e, "state store close failed");
            }
        }
        if let Some(broker) = &self.broker {
            if let Err(e) = broker.close().await {
                warn!(error = %e, "broker close failed");
            }
        }
        info!("gateway registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_namespace_creation_is_lazy_and_idempotent() {
        let registry = NamespaceRegistry::new();
        assert_eq!(registry.namespace_count().await, 0);

        let a = registry.namespace("/chat").await;
        let b = registry.namespace("chat").await;
        assert!(Arc::ptr_eq(&a, &b), "normalized paths share one namespace");
        assert_eq!(registry.namespace_count().await, 1);

        assert!(registry.get("/chat").await.is_some());
        assert!(registry.get("/other").await.is_none());
    }

    #[tokio::test]
    async fn test_namespaces_inherit_process_id() {
        let registry = NamespaceRegistry::new().with_process_id("proc-a");
        let ns = registry.namespace("/chat").await;
        assert_eq!(ns.process_id(), "proc-a");
    }

    #[tokio::test]
    async fn test_from_config_defaults() {
        let config = Config::default();
        let registry = NamespaceRegistry::from_config(&config).unwrap();
        assert!(registry.broker().is_some());
        registry.connect_backends().await.unwrap();
    }

    #[tokio::test]
    async fn test_from_config_rejects_invalid() {
        let mut config = Config::default();
        config.gateway.port = 0;
        assert!(NamespaceRegistry::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_clears_namespaces() {
        let registry = NamespaceRegistry::new();
        registry.namespace("/chat").await;
        registry.namespace("/game").await;

        registry.shutdown().await;
        assert_eq!(registry.namespace_count().await, 0);
    }
}
