//! Broker error types.

use thiserror::Error;

/// Broker result type alias.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors from the broker and state backends.
///
/// Only lifecycle operations (`connect`, `subscribe`, state lookups) surface
/// these; publishing is best-effort and never propagates transport failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Backend connection failed. Fatal at gateway startup.
    #[error("Broker connect failed: {0}")]
    Connect(String),

    /// Subscription could not be established.
    #[error("Subscribe failed on '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },

    /// Payload could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The backend did not answer within the bounded timeout.
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The adapter has been closed.
    #[error("Broker is closed")]
    Closed,

    /// Underlying Redis failure.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
