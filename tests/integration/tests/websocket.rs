//! End-to-end tests over real WebSocket transports.
//!
//! A gateway server runs on an ephemeral port; tokio-tungstenite clients
//! drive the wire protocol exactly as a browser or SDK would.

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use roomcast_broker::{Broker, LocalBroker};
use roomcast_gateway::{middleware_fn, Gateway, GatewayConfig, GatewayError, NamespaceRegistry};
use roomcast_integration_tests::{init_tracing, parse_envelope, RECV_TIMEOUT, SILENCE_TIMEOUT};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_gateway() -> (SocketAddr, Arc<NamespaceRegistry>) {
    init_tracing();
    let registry = Arc::new(
        NamespaceRegistry::new().with_broker(Arc::new(LocalBroker::new()) as Arc<dyn Broker>),
    );
    let gateway = Gateway::new(GatewayConfig::default(), registry.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        gateway.serve(listener).await.unwrap();
    });

    (addr, registry)
}

async fn ws_connect(addr: SocketAddr, path: &str) -> Result<WsClient> {
    let (client, _response) = connect_async(format!("ws://{addr}{path}")).await?;
    Ok(client)
}

async fn send_json(client: &mut WsClient, value: serde_json::Value) -> Result<()> {
    client.send(Message::Text(value.to_string())).await?;
    Ok(())
}

async fn recv_text(client: &mut WsClient) -> Result<String> {
    let deadline = tokio::time::timeout(RECV_TIMEOUT, async {
        while let Some(message) = client.next().await {
            if let Message::Text(text) = message? {
                return Ok(text);
            }
        }
        Err(anyhow::anyhow!("stream ended without a text frame"))
    });
    deadline.await?
}

async fn expect_silence(client: &mut WsClient) {
    let result = tokio::time::timeout(SILENCE_TIMEOUT, client.next()).await;
    assert!(result.is_err(), "expected no frame, got {:?}", result);
}

#[tokio::test]
async fn test_join_and_room_message_round_trip() -> Result<()> {
    let (addr, _registry) = start_gateway().await;
    let mut alice = ws_connect(addr, "/ws/chat").await?;
    let mut bob = ws_connect(addr, "/ws/chat").await?;

    send_json(&mut alice, json!({"event": "joinRoom", "payload": {"roomId": "general"}})).await?;
    send_json(&mut bob, json!({"event": "joinRoom", "payload": {"roomId": "general"}})).await?;
    // Joins are fire-and-forget; give the server a beat to register both.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    send_json(
        &mut alice,
        json!({"event": "roomMessage", "payload": {"roomId": "general", "payload": {"text": "hello"}}}),
    )
    .await?;

    let frame = recv_text(&mut bob).await?;
    let envelope = parse_envelope(&frame);
    assert_eq!(envelope.event(), "roomMessage");
    assert_eq!(envelope.ns(), "/chat");
    assert_eq!(envelope.room(), Some("general"));
    assert_eq!(envelope.payload()["text"], json!("hello"));

    // The author never hears its own message back.
    expect_silence(&mut alice).await;
    Ok(())
}

#[tokio::test]
async fn test_room_message_without_membership_is_dropped() -> Result<()> {
    let (addr, _registry) = start_gateway().await;
    let mut member = ws_connect(addr, "/ws/chat").await?;
    let mut outsider = ws_connect(addr, "/ws/chat").await?;

    send_json(&mut member, json!({"event": "joinRoom", "payload": {"roomId": "general"}})).await?;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    send_json(
        &mut outsider,
        json!({"event": "roomMessage", "payload": {"roomId": "general", "payload": "sneak"}}),
    )
    .await?;

    expect_silence(&mut member).await;
    expect_silence(&mut outsider).await;
    Ok(())
}

#[tokio::test]
async fn test_middleware_rejection_sends_error_frame_and_closes() -> Result<()> {
    let (addr, registry) = start_gateway().await;

    // Register the middleware before any client reaches the namespace.
    let secure = registry.namespace("/secure").await;
    secure
        .use_middleware(middleware_fn(|mut handshake| {
            Box::pin(async move {
                let token_ok =
                    handshake.query.get("token").map(String::as_str) == Some("letmein");
                if token_ok {
                    handshake.user_id = Some("user-1".to_string());
                    Ok(handshake)
                } else {
                    Err(GatewayError::Unauthorized("bad token".to_string()))
                }
            })
        }))
        .await;

    let mut rejected = ws_connect(addr, "/ws/secure").await?;
    let frame = recv_text(&mut rejected).await?;
    let envelope = parse_envelope(&frame);
    assert_eq!(envelope.event(), "error");
    assert_eq!(envelope.payload()["code"], json!("unauthorized"));

    // The transport closes after the error frame; no connection registered.
    let rest = tokio::time::timeout(RECV_TIMEOUT, rejected.next()).await?;
    assert!(!matches!(rest, Some(Ok(Message::Text(_)))));
    assert_eq!(registry.namespace("/secure").await.connection_count().await, 0);

    // The right token passes the same chain.
    let mut accepted = ws_connect(addr, "/ws/secure?token=letmein").await?;
    send_json(&mut accepted, json!({"event": "joinRoom", "payload": {"roomId": "vault"}})).await?;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(registry.namespace("/secure").await.connection_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_server_pushed_broadcast_reaches_clients() -> Result<()> {
    let (addr, registry) = start_gateway().await;
    let mut client = ws_connect(addr, "/ws").await?;

    send_json(&mut client, json!({"event": "joinRoom", "payload": {"roomId": "updates"}})).await?;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let ns = registry.namespace("/").await;
    ns.to("updates").emit("deploy", json!({"version": "1.2.3"})).await;

    let envelope = parse_envelope(&recv_text(&mut client).await?);
    assert_eq!(envelope.event(), "deploy");
    assert!(envelope.is_system());
    assert_eq!(envelope.payload()["version"], json!("1.2.3"));
    Ok(())
}

#[tokio::test]
async fn test_disconnect_cleans_up_membership() -> Result<()> {
    let (addr, registry) = start_gateway().await;
    let mut client = ws_connect(addr, "/ws/chat").await?;

    send_json(&mut client, json!({"event": "joinRoom", "payload": {"roomId": "general"}})).await?;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let ns = registry.namespace("/chat").await;
    assert_eq!(ns.room("general").await.unwrap().len().await, 1);

    client.close(None).await?;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert_eq!(ns.connection_count().await, 0);
    assert_eq!(ns.room("general").await.unwrap().len().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_malformed_frames_do_not_kill_the_connection() -> Result<()> {
    let (addr, registry) = start_gateway().await;
    let mut client = ws_connect(addr, "/ws/chat").await?;

    client.send(Message::Text("this is not json".to_string())).await?;
    send_json(&mut client, json!({"event": "joinRoom", "payload": {}})).await?;
    send_json(&mut client, json!({"event": "joinRoom", "payload": {"roomId": "general"}})).await?;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // The bad frames were dropped; the good join still landed.
    let ns = registry.namespace("/chat").await;
    assert_eq!(ns.connection_count().await, 1);
    assert_eq!(ns.room("general").await.unwrap().len().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_health_endpoint_reports_connections() -> Result<()> {
    let (addr, _registry) = start_gateway().await;
    let _client = ws_connect(addr, "/ws/chat").await?;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"status\":\"ok\""));
    assert!(response.contains("\"connections\":1"));
    Ok(())
}
