//! ID generation utilities.

use uuid::Uuid;

/// Generate a new UUID v4.
pub fn uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a short random ID (8 hex characters).
pub fn short_id() -> String {
    let bytes: [u8; 4] = rand::random();
    hex::encode(bytes)
}

/// Generate a trace ID for cross-process correlation (16 hex characters).
pub fn trace_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}

/// Generate the identity of this gateway process.
///
/// Combines the host name with a random suffix so two processes on the same
/// machine remain distinguishable. Used by the broker layer to suppress
/// re-broadcast of messages a process published itself.
pub fn process_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{}-{}", host, short_id())
}
