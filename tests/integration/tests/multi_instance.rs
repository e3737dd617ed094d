//! Two gateway instances sharing one broker.
//!
//! Each registry stands in for a separate process: distinct process ids,
//! one shared `LocalBroker` as the bus. These tests pin down the two echo
//! exclusions — per-message sender and per-process origin — and that a
//! relayed message arrives exactly once.

use roomcast_broker::{Broker, LocalBroker, MemoryStateStore, StateStore};
use roomcast_gateway::protocol::{JOIN_ROOM_EVENT, ROOM_MESSAGE_EVENT};
use roomcast_gateway::{ClientFrame, Connection, Namespace, NamespaceRegistry};
use roomcast_integration_tests::{init_tracing, parse_envelope};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn cluster_pair() -> (NamespaceRegistry, NamespaceRegistry) {
    init_tracing();
    let broker: Arc<dyn Broker> = Arc::new(LocalBroker::new());
    let state: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new(Duration::from_secs(60)));
    let p1 = NamespaceRegistry::new()
        .with_process_id("p1")
        .with_broker(broker.clone())
        .with_state_store(state.clone());
    let p2 = NamespaceRegistry::new()
        .with_process_id("p2")
        .with_broker(broker)
        .with_state_store(state);
    (p1, p2)
}

async fn open(ns: &Arc<Namespace>) -> (Arc<Connection>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = ns.connect(tx, Default::default()).await.unwrap();
    (conn, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

#[tokio::test]
async fn test_room_message_relays_across_instances_exactly_once() {
    let (p1, p2) = cluster_pair();
    let ns1 = p1.namespace("/chat").await;
    let ns2 = p2.namespace("/chat").await;

    let (receiver, mut rx_receiver) = open(&ns1).await;
    let (sender, mut rx_sender) = open(&ns2).await;

    receiver.join("general").await;
    sender.join("general").await;

    ns2.handle_client_message(
        sender.id(),
        ClientFrame::new(ROOM_MESSAGE_EVENT)
            .with_payload(json!({"roomId": "general", "payload": {"text": "hi from p2"}})),
    )
    .await;

    // The p1-side member receives exactly one copy.
    let frames = drain(&mut rx_receiver);
    assert_eq!(frames.len(), 1);
    let envelope = parse_envelope(&frames[0]);
    assert_eq!(envelope.event(), ROOM_MESSAGE_EVENT);
    assert_eq!(envelope.sender(), sender.id());
    assert_eq!(envelope.payload()["text"], json!("hi from p2"));

    // The author receives zero copies of its own message, even though its
    // own process also heard the broker message back.
    assert!(drain(&mut rx_sender).is_empty());
}

#[tokio::test]
async fn test_origin_exclusion_prevents_relay_loops() {
    let (p1, p2) = cluster_pair();
    let ns1 = p1.namespace("/chat").await;
    let ns2 = p2.namespace("/chat").await;

    let (local_member, mut rx_local) = open(&ns1).await;
    let (remote_member, mut rx_remote) = open(&ns2).await;
    local_member.join("general").await;
    remote_member.join("general").await;

    let room = ns1.room("general").await.unwrap();
    room.broadcast("tick", json!({"n": 1}), None).await;

    // One copy locally, one copy via the broker on the peer; the
    // originating process must not re-deliver its own broker message.
    assert_eq!(drain(&mut rx_local).len(), 1);
    assert_eq!(drain(&mut rx_remote).len(), 1);
}

#[tokio::test]
async fn test_namespace_emit_crosses_instances_once() {
    let (p1, p2) = cluster_pair();
    let ns1 = p1.namespace("/chat").await;
    let ns2 = p2.namespace("/chat").await;

    let (_a, mut rx_a) = open(&ns1).await;
    let (_b, mut rx_b) = open(&ns2).await;

    ns1.emit("maintenance", json!({"minutes": 5})).await;

    let to_a = drain(&mut rx_a);
    let to_b = drain(&mut rx_b);
    assert_eq!(to_a.len(), 1);
    assert_eq!(to_b.len(), 1);
    assert_eq!(parse_envelope(&to_b[0]).event(), "maintenance");
}

#[tokio::test]
async fn test_messages_stay_inside_their_room() {
    let (p1, p2) = cluster_pair();
    let ns1 = p1.namespace("/chat").await;
    let ns2 = p2.namespace("/chat").await;

    let (general_member, mut rx_general) = open(&ns1).await;
    let (other_member, mut rx_other) = open(&ns2).await;
    general_member.join("general").await;
    other_member.join("random").await;

    let (sender, _rx_sender) = open(&ns2).await;
    sender.join("general").await;
    ns2.handle_client_message(
        sender.id(),
        ClientFrame::new(ROOM_MESSAGE_EVENT)
            .with_payload(json!({"roomId": "general", "payload": "scoped"})),
    )
    .await;

    assert_eq!(drain(&mut rx_general).len(), 1);
    assert!(drain(&mut rx_other).is_empty());
}

#[tokio::test]
async fn test_state_store_sees_membership_from_both_instances() {
    let (p1, p2) = cluster_pair();
    let ns1 = p1.namespace("/chat").await;
    let ns2 = p2.namespace("/chat").await;

    let (a, _rx_a) = open(&ns1).await;
    let (b, _rx_b) = open(&ns2).await;
    a.join("general").await;
    b.join("general").await;

    // Each instance holds one local member but sees two globally.
    assert_eq!(ns1.room("general").await.unwrap().len().await, 1);
    assert_eq!(ns1.global_count("general").await, 2);
    assert_eq!(ns2.global_count("general").await, 2);

    b.close().await;
    assert_eq!(ns1.global_count("general").await, 1);
}

#[tokio::test]
async fn test_join_via_control_frame_then_cross_instance_delivery() {
    let (p1, p2) = cluster_pair();
    let ns1 = p1.namespace("/chat").await;
    let ns2 = p2.namespace("/chat").await;

    let (receiver, mut rx_receiver) = open(&ns1).await;
    ns1.handle_client_message(
        receiver.id(),
        ClientFrame::new(JOIN_ROOM_EVENT).with_payload(json!({"roomId": "general"})),
    )
    .await;

    let room2 = ns2.get_or_create_room("general").await;
    room2.broadcast("update", json!({"rev": 7}), None).await;

    let frames = drain(&mut rx_receiver);
    assert_eq!(frames.len(), 1);
    assert_eq!(parse_envelope(&frames[0]).event(), "update");
}

#[tokio::test]
async fn test_shutdown_unsubscribes_everything() {
    let broker = Arc::new(LocalBroker::new());
    let p1 = NamespaceRegistry::new()
        .with_process_id("p1")
        .with_broker(broker.clone() as Arc<dyn Broker>);

    let ns = p1.namespace("/chat").await;
    let (conn, _rx) = open(&ns).await;
    conn.join("general").await;
    assert!(broker.topic_count().await > 0);

    p1.shutdown().await;
    assert_eq!(broker.topic_count().await, 0);
}
