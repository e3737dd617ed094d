//! Gateway error types.

use crate::protocol::reason;
use roomcast_broker::BrokerError;
use roomcast_core::error::{ConfigError, ValidationError};
use thiserror::Error;

/// Errors that can occur in the gateway.
///
/// Per-connection failures never escape to the namespace or server: a
/// malformed frame or an unauthorized room message is logged and dropped at
/// the point it is detected. These variants surface on the handshake path
/// and at startup, where failures are meaningful to the caller.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed envelope or control frame.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The middleware chain rejected the connection.
    #[error("Handshake rejected: {reason}")]
    MiddlewareRejected { reason: String },

    /// The sender is not allowed to perform the operation.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Broker or state backend failure (fatal at startup).
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The configured bind address could not be parsed.
    #[error("Invalid bind address: {0}")]
    BindAddr(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Reason code carried in error frames sent to clients.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => reason::VALIDATION,
            Self::Unauthorized(_) => reason::UNAUTHORIZED,
            Self::MiddlewareRejected { .. } => reason::MIDDLEWARE,
            _ => reason::INTERNAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(
            GatewayError::Unauthorized("nope".to_string()).reason_code(),
            reason::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::MiddlewareRejected {
                reason: "no token".to_string()
            }
            .reason_code(),
            reason::MIDDLEWARE
        );
        assert_eq!(
            GatewayError::Validation(ValidationError::MissingField("event")).reason_code(),
            reason::VALIDATION
        );
        assert_eq!(
            GatewayError::Internal("boom".to_string()).reason_code(),
            reason::INTERNAL
        );
    }
}
