//! The WebSocket gateway server.
//!
//! Accepts raw connections over axum's WebSocket upgrade, resolves the
//! target namespace from the request path, and hands the handshake to the
//! namespace's middleware chain. Each socket gets a read task (inbound
//! frames → namespace dispatch) and a write task (outbound channel →
//! socket); whichever ends first tears the other down and closes the
//! connection.

use crate::error::GatewayError;
use crate::namespace::{Handshake, DEFAULT_NAMESPACE};
use crate::protocol::ClientFrame;
use crate::registry::NamespaceRegistry;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, Method, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use roomcast_core::config::Config;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Default gateway port.
pub const DEFAULT_PORT: u16 = 17717;

/// Gateway server configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind address.
    pub bind: String,

    /// Port number.
    pub port: u16,

    /// Enable CORS on the HTTP surface.
    pub cors: bool,

    /// Maximum concurrent connections across all namespaces.
    pub max_connections: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            cors: true,
            max_connections: 1024,
        }
    }
}

impl From<&Config> for GatewayConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind: config.gateway.bind.clone(),
            port: config.gateway.port,
            cors: config.gateway.cors,
            max_connections: config.gateway.max_connections,
        }
    }
}

/// The WebSocket gateway server.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<NamespaceRegistry>,
}

#[derive(Clone)]
struct ServerState {
    registry: Arc<NamespaceRegistry>,
    max_connections: usize,
}

impl Gateway {
    /// Create a gateway around an existing registry.
    pub fn new(config: GatewayConfig, registry: Arc<NamespaceRegistry>) -> Self {
        Self { config, registry }
    }

    /// Build a gateway (registry and backends included) from configuration.
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let registry = NamespaceRegistry::from_config(config)?;
        Ok(Self::new(GatewayConfig::from(config), Arc::new(registry)))
    }

    /// The namespace registry, for registering middleware and handlers.
    pub fn registry(&self) -> &Arc<NamespaceRegistry> {
        &self.registry
    }

    /// Run the gateway server until the listener fails.
    pub async fn run(&self) -> Result<(), GatewayError> {
        // Backend failures abort startup; running without the configured
        // broker would silently break cross-process delivery.
        self.registry.connect_backends().await?;

        let addr = self.bind_address()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(GatewayError::Io)?;
        info!(%addr, "starting gateway server");
        self.serve(listener).await
    }

    /// Serve on an already-bound listener. Unlike [`Gateway::run`] this does
    /// not connect backends first; tests bind port 0 and call this directly.
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> Result<(), GatewayError> {
        axum::serve(listener, self.router())
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let state = ServerState {
            registry: self.registry.clone(),
            max_connections: self.config.max_connections,
        };

        let mut router = Router::new()
            .route("/ws", get(ws_default_handler))
            .route("/ws/:namespace", get(ws_namespace_handler))
            .route("/health", get(health_handler))
            .with_state(state);

        if self.config.cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods([Method::GET]),
            );
        }

        router.layer(TraceLayer::new_for_http())
    }

    fn bind_address(&self) -> Result<SocketAddr, GatewayError> {
        let ip: IpAddr = self
            .config
            .bind
            .parse()
            .map_err(|_| GatewayError::BindAddr(self.config.bind.clone()))?;
        Ok(SocketAddr::from((ip, self.config.port)))
    }
}

async fn ws_default_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    upgrade(ws, state, DEFAULT_NAMESPACE.to_string(), query, headers).await
}

async fn ws_namespace_handler(
    ws: WebSocketUpgrade,
    Path(namespace): Path<String>,
    State(state): State<ServerState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    upgrade(ws, state, namespace, query, headers).await
}

async fn upgrade(
    ws: WebSocketUpgrade,
    state: ServerState,
    namespace: String,
    query: HashMap<String, String>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    if state.registry.connection_count().await >= state.max_connections {
        warn!(
            max = state.max_connections,
            "max connections reached, rejecting upgrade"
        );
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let headers = collect_headers(&headers);
    Ok(ws.on_upgrade(move |socket| {
        handle_socket(socket, state.registry, namespace, query, headers)
    }))
}

/// Headers forwarded to middleware, reduced to valid UTF-8 values.
fn collect_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

async fn handle_socket(
    socket: WebSocket,
    registry: Arc<NamespaceRegistry>,
    namespace: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
) {
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut rx) = mpsc::unbounded_channel::<String>();

    let ns = registry.namespace(&namespace).await;
    let handshake = Handshake {
        query,
        headers,
        user_id: None,
    };

    let conn = match ns.connect(outbound, handshake).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!(error = %e, "handshake failed, closing transport");
            // Flush the queued error frame, then drop the transport.
            while let Ok(frame) = rx.try_recv() {
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
            return;
        }
    };

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let reader_ns = ns.clone();
    let conn_id = conn.id().to_string();
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => reader_ns.handle_client_message(&conn_id, frame).await,
                    Err(e) => {
                        warn!(connection = %conn_id, error = %e, "malformed frame dropped");
                    }
                },
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!(connection = %conn_id, error = %e, "websocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    // Whichever side ends first tears the other down.
    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        _ = &mut send_task => recv_task.abort(),
    }

    conn.close().await;
}

/// Health check handler.
async fn health_handler(State(state): State<ServerState>) -> Json<serde_json::Value> {
    let connections = state.registry.connection_count().await;
    let namespaces = state.registry.namespace_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "connections": connections,
        "namespaces": namespaces,
    }))
}
