//! # roomcast-gateway
//!
//! Distributed real-time room/namespace messaging gateway.
//!
//! This crate provides:
//! - Namespaces and rooms over persistent WebSocket connections
//! - Connect-time middleware and application event handlers
//! - Cross-process fan-out through a pluggable broker, with echo and
//!   relay-loop suppression
//! - Scheduled tasks bound to connection/room/namespace lifecycles

pub mod connection;
pub mod error;
pub mod namespace;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod tasks;

pub use connection::{Connection, ConnectionState};
pub use error::GatewayError;
pub use namespace::{
    middleware_fn, normalize_path, BroadcastBuilder, EventHandler, Handshake, LifecycleHandler,
    Middleware, Namespace, DEFAULT_NAMESPACE,
};
pub use protocol::{ClientCommand, ClientFrame};
pub use registry::NamespaceRegistry;
pub use room::{Room, RoomPolicy};
pub use server::{Gateway, GatewayConfig, DEFAULT_PORT};
pub use tasks::{LivenessFn, TaskFn, TaskManager};

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
