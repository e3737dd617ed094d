//! # roomcast-core
//!
//! Core types, configuration, and utilities for Roomcast.
//!
//! This crate provides the shared vocabulary used across all Roomcast crates:
//!
//! - **Envelope**: the canonical immutable event record exchanged between
//!   clients, the gateway, and the broker
//! - **Configuration**: loading, validation, and defaults for gateway config
//! - **Errors**: the validation/configuration error taxonomy
//! - **Identifiers**: connection, trace, and process identity generation

pub mod config;
pub mod envelope;
pub mod error;
pub mod id;

// Re-exports for convenience
pub use config::Config;
pub use envelope::{Envelope, SCHEMA_VERSION, SYSTEM_SENDER};
pub use error::{Error, Result, ValidationError};
