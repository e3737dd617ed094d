//! Gateway configuration: schema, loading, and validation.
//!
//! Configuration files are JSON5 (comments and trailing commas allowed).
//! Every section has sensible defaults so an empty document is a valid
//! single-instance configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server bind and connection limits.
    #[serde(default)]
    pub gateway: GatewaySection,

    /// Cross-process message bus.
    #[serde(default)]
    pub broker: BrokerSection,

    /// Cross-process membership store.
    #[serde(default)]
    pub state: StateSection,

    /// Default room lifecycle policy.
    #[serde(default)]
    pub rooms: RoomsSection,
}

/// Server bind and connection limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    /// Bind address.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port number.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable CORS on the upgrade endpoint.
    #[serde(default = "default_true")]
    pub cors: bool,

    /// Maximum concurrent connections across all namespaces.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cors: true,
            max_connections: default_max_connections(),
        }
    }
}

/// Which broker backend fans events out across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    /// In-process call-through; single-instance deployments and tests.
    Local,
    /// Redis pub/sub; multi-instance deployments.
    Redis,
}

/// Cross-process message bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    /// Backend selection.
    #[serde(default = "default_broker_mode")]
    pub mode: BrokerMode,

    /// Connection URL (required for `redis` mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            mode: BrokerMode::Local,
            url: None,
        }
    }
}

/// Which backend holds the cross-process membership view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateMode {
    /// In-process map; single-instance deployments and tests.
    Memory,
    /// Redis sorted sets; multi-instance deployments.
    Redis,
}

/// Cross-process membership store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSection {
    /// Backend selection.
    #[serde(default = "default_state_mode")]
    pub mode: StateMode,

    /// Connection URL (required for `redis` mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Entry time-to-live in seconds. Bounded so a crashed process
    /// self-heals out of the membership view.
    #[serde(default = "default_state_ttl")]
    pub ttl_secs: u64,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            mode: StateMode::Memory,
            url: None,
            ttl_secs: default_state_ttl(),
        }
    }
}

/// Default room lifecycle policy, applied to lazily-created rooms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsSection {
    /// Destroy rooms that stay empty past the grace period.
    #[serde(default)]
    pub auto_delete_empty: bool,

    /// Grace period in milliseconds before an empty room is destroyed.
    /// Zero destroys immediately on the last leave.
    #[serde(default = "default_empty_timeout")]
    pub empty_timeout_ms: u64,
}

impl Default for RoomsSection {
    fn default() -> Self {
        Self {
            auto_delete_empty: false,
            empty_timeout_ms: default_empty_timeout(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    17717
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    1024
}

fn default_broker_mode() -> BrokerMode {
    BrokerMode::Local
}

fn default_state_mode() -> StateMode {
    StateMode::Memory
}

fn default_state_ttl() -> u64 {
    60
}

fn default_empty_timeout() -> u64 {
    30_000
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate the configuration, collecting all errors before returning.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.gateway.port == 0 {
            errors.push("gateway.port cannot be 0".to_string());
        }

        if self.gateway.max_connections == 0 {
            errors.push("gateway.max_connections cannot be 0".to_string());
        }

        if self.broker.mode == BrokerMode::Redis && self.broker.url.is_none() {
            errors.push("broker.url is required when broker.mode is 'redis'".to_string());
        }

        if self.state.mode == StateMode::Redis && self.state.url.is_none() {
            errors.push("state.url is required when state.mode is 'redis'".to_string());
        }

        if self.state.ttl_secs == 0 {
            errors.push("state.ttl_secs cannot be 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config.gateway.bind, "127.0.0.1");
        assert_eq!(config.gateway.port, 17717);
        assert!(config.gateway.cors);
        assert_eq!(config.broker.mode, BrokerMode::Local);
        assert_eq!(config.state.mode, StateMode::Memory);
        assert_eq!(config.state.ttl_secs, 60);
        assert!(!config.rooms.auto_delete_empty);
        assert_eq!(config.rooms.empty_timeout_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_json5_with_comments() {
        let config = Config::parse(
            r#"{
                // multi-instance deployment
                broker: { mode: "redis", url: "redis://127.0.0.1:6379" },
                rooms: { auto_delete_empty: true, empty_timeout_ms: 5000, },
            }"#,
        )
        .unwrap();

        assert_eq!(config.broker.mode, BrokerMode::Redis);
        assert_eq!(config.broker.url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert!(config.rooms.auto_delete_empty);
        assert_eq!(config.rooms.empty_timeout_ms, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_invalid_document() {
        assert!(Config::parse("not valid json5").is_err());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.gateway.port = 0;
        config.broker.mode = BrokerMode::Redis;
        config.state.ttl_secs = 0;

        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("gateway.port"));
        assert!(message.contains("broker.url"));
        assert!(message.contains("state.ttl_secs"));
    }

    #[test]
    fn test_load_nonexistent_path() {
        let result = Config::load(Path::new("/nonexistent/roomcast.json5"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
