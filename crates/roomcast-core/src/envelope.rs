//! The canonical message envelope.
//!
//! Every event exchanged between clients, the gateway, and the broker is an
//! [`Envelope`]: an immutable record of where the event belongs (namespace,
//! optional room), what it is (event tag), who sent it, and when. Fields are
//! private; once constructed an envelope is never mutated.

use crate::error::ValidationError;
use crate::id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire schema version stamped on every envelope.
pub const SCHEMA_VERSION: u8 = 1;

/// Sender value used for gateway-originated (server-pushed) envelopes.
pub const SYSTEM_SENDER: &str = "system";

/// An immutable event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    id: String,
    ns: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    room: Option<String>,
    event: String,
    sender: String,
    #[serde(default)]
    payload: Value,
    ts: DateTime<Utc>,
    v: u8,
    trace_id: String,
}

impl Envelope {
    /// Create a new envelope.
    ///
    /// `ns` and `event` are mandatory; an empty value for either fails with
    /// [`ValidationError::MissingField`]. A `room` of `None` means the event
    /// is namespace-wide. The id and timestamp are generated here; the trace
    /// id is freshly generated when not supplied.
    pub fn new(
        ns: impl Into<String>,
        room: Option<&str>,
        event: impl Into<String>,
        payload: Value,
        sender: impl Into<String>,
        trace_id: Option<String>,
    ) -> Result<Self, ValidationError> {
        let ns = ns.into();
        if ns.is_empty() {
            return Err(ValidationError::MissingField("ns"));
        }
        let event = event.into();
        if event.is_empty() {
            return Err(ValidationError::MissingField("event"));
        }

        Ok(Self {
            id: id::uuid(),
            ns,
            room: room.map(|r| r.to_string()),
            event,
            sender: sender.into(),
            payload,
            ts: Utc::now(),
            v: SCHEMA_VERSION,
            trace_id: trace_id.unwrap_or_else(id::trace_id),
        })
    }

    /// Build a gateway-originated envelope.
    ///
    /// Infallible variant of [`Envelope::new`] for server-pushed events whose
    /// tags are fixed at the call site: an empty namespace falls back to `/`
    /// and an empty event tag to `message` instead of erroring.
    pub fn system(ns: &str, room: Option<&str>, event: &str, payload: Value) -> Self {
        let ns = if ns.is_empty() { "/" } else { ns };
        let event = if event.is_empty() { "message" } else { event };

        Self {
            id: id::uuid(),
            ns: ns.to_string(),
            room: room.map(|r| r.to_string()),
            event: event.to_string(),
            sender: SYSTEM_SENDER.to_string(),
            payload,
            ts: Utc::now(),
            v: SCHEMA_VERSION,
            trace_id: id::trace_id(),
        }
    }

    /// Structural validity check for JSON received from a broker.
    ///
    /// Returns `false` for malformed or foreign payloads instead of erroring:
    /// the candidate must be an object carrying non-empty string `id`, `ns`,
    /// and `event` fields and a string `ts` timestamp.
    pub fn is_valid(candidate: &Value) -> bool {
        let Some(obj) = candidate.as_object() else {
            return false;
        };

        let non_empty_str =
            |key: &str| obj.get(key).and_then(Value::as_str).is_some_and(|s| !s.is_empty());

        non_empty_str("id")
            && non_empty_str("ns")
            && non_empty_str("event")
            && obj.get("ts").is_some_and(Value::is_string)
    }

    /// Unique envelope id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Namespace path the event belongs to.
    pub fn ns(&self) -> &str {
        &self.ns
    }

    /// Target room, or `None` for a namespace-wide event.
    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    /// Event tag.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Originating connection id, or [`SYSTEM_SENDER`].
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Opaque payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Creation timestamp.
    pub fn ts(&self) -> DateTime<Utc> {
        self.ts
    }

    /// Wire schema version.
    pub fn version(&self) -> u8 {
        self.v
    }

    /// Trace id for cross-process correlation.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Whether the envelope was produced by the gateway rather than a client.
    pub fn is_system(&self) -> bool {
        self.sender == SYSTEM_SENDER
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
