//! Broker topic naming convention.
//!
//! Room-scoped channels are `gateway:<ns>:room:<room>`; namespace-wide
//! channels are `gateway:<ns>`. Every adapter implementation shares these
//! names so processes running different backends never miss each other.

/// Topic carrying events for one room.
pub fn room_topic(ns: &str, room: &str) -> String {
    format!("gateway:{}:room:{}", ns, room)
}

/// Topic carrying namespace-wide events.
pub fn namespace_topic(ns: &str) -> String {
    format!("gateway:{}", ns)
}
