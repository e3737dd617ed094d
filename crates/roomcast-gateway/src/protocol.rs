//! Client wire protocol.
//!
//! Every server-to-client frame is a full [`Envelope`]. Client-to-server
//! frames are the minimal subset [`ClientFrame`]; the gateway fills in
//! namespace, room, and sender server-side. The reserved control events are
//! decoded into the closed [`ClientCommand`] enum; everything else routes to
//! the namespace's registered application handlers unchanged.

use roomcast_core::{Envelope, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved event: join a room.
pub const JOIN_ROOM_EVENT: &str = "joinRoom";

/// Reserved event: leave a room.
pub const LEAVE_ROOM_EVENT: &str = "leaveRoom";

/// Reserved event: send a message into a joined room.
pub const ROOM_MESSAGE_EVENT: &str = "roomMessage";

/// Event tag of gateway error frames.
pub const ERROR_EVENT: &str = "error";

/// Reason codes carried in error frames.
pub mod reason {
    pub const VALIDATION: &str = "validation";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const MIDDLEWARE: &str = "middleware";
    pub const INTERNAL: &str = "internal";
}

/// A client-to-server frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Event tag; reserved names are handled by the gateway itself.
    pub event: String,

    /// Target room, when not carried inside the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,

    /// Opaque payload.
    #[serde(default)]
    pub payload: Value,
}

impl ClientFrame {
    /// Create a new frame.
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            room: None,
            payload: Value::Null,
        }
    }

    /// Set the target room.
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A decoded client command: the closed set of control events plus the
/// application-defined escape hatch.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    JoinRoom { room: String },
    LeaveRoom { room: String },
    RoomMessage { room: String, payload: Value },
    Custom { event: String, payload: Value },
}

impl ClientCommand {
    /// Decode a frame. Reserved events with a missing or empty room target
    /// fail with [`ValidationError`]; unreserved events pass through as
    /// [`ClientCommand::Custom`].
    pub fn from_frame(frame: ClientFrame) -> Result<Self, ValidationError> {
        if frame.event.is_empty() {
            return Err(ValidationError::MissingField("event"));
        }

        match frame.event.as_str() {
            JOIN_ROOM_EVENT => Ok(Self::JoinRoom {
                room: target_room(&frame)?,
            }),
            LEAVE_ROOM_EVENT => Ok(Self::LeaveRoom {
                room: target_room(&frame)?,
            }),
            ROOM_MESSAGE_EVENT => {
                let room = target_room(&frame)?;
                let payload = frame
                    .payload
                    .get("payload")
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(Self::RoomMessage { room, payload })
            }
            _ => Ok(Self::Custom {
                event: frame.event,
                payload: frame.payload,
            }),
        }
    }
}

/// Room targeted by a control frame: the `room` field or `payload.roomId`.
fn target_room(frame: &ClientFrame) -> Result<String, ValidationError> {
    if let Some(room) = frame.room.as_deref() {
        if !room.is_empty() {
            return Ok(room.to_string());
        }
    }

    frame
        .payload
        .get("roomId")
        .and_then(Value::as_str)
        .filter(|room| !room.is_empty())
        .map(str::to_string)
        .ok_or(ValidationError::MissingField("roomId"))
}

/// Build a server-to-client error frame.
pub fn error_frame(ns: &str, code: &str, message: &str) -> Envelope {
    Envelope::system(
        ns,
        None,
        ERROR_EVENT,
        serde_json::json!({ "code": code, "message": message }),
    )
}
