//! Shared helpers for Roomcast integration tests.

use roomcast_core::Envelope;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Install a `RUST_LOG`-driven subscriber, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// How long a test waits for a frame that should arrive.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a test waits to prove a frame does NOT arrive.
pub const SILENCE_TIMEOUT: Duration = Duration::from_millis(200);

/// Parse a wire frame into an envelope, panicking on malformed input.
pub fn parse_envelope(frame: &str) -> Envelope {
    serde_json::from_str(frame).expect("frame should be a valid envelope")
}
