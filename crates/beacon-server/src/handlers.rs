//! Connection handlers for Beacon server.
//!
//! This module handles the connection lifecycle, event dispatch into the
//! relay and the HTTP lookup endpoints.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use beacon_core::{
    Handled, MemoryRouteDirectory, MemoryStore, Relay, RelayConfig, RouteDirectory,
    RouteGeometry, RouterConfig, StoreWriter,
};
use beacon_protocol::{
    codec, ClientEvent, Encoding, ProtocolError, ServerEvent, SnapshotEntry, PROTOCOL_VERSION,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Errors that end a connection.
#[derive(Debug, Error)]
enum ConnectionError {
    #[error("Encoding failed: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("WebSocket send failed: {0}")]
    Send(#[from] axum::Error),
}

/// Shared server state.
pub struct AppState {
    /// The relay.
    pub relay: Arc<Relay>,
    /// Route geometry lookup.
    pub routes: Arc<dyn RouteDirectory>,
    /// Server configuration.
    pub config: Config,
    next_connection: AtomicU64,
}

impl AppState {
    /// Create new app state backed by the in-memory store.
    ///
    /// Must be called inside a Tokio runtime; the store writer is spawned
    /// here.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let writer = StoreWriter::spawn(Arc::new(MemoryStore::new()), config.store.queue_capacity);
        let relay_config = RelayConfig {
            router: RouterConfig {
                max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
                ..RouterConfig::default()
            },
            outbox_capacity: config.limits.outbox_capacity,
        };

        Self {
            relay: Arc::new(Relay::new(relay_config, writer)),
            routes: Arc::new(MemoryRouteDirectory::new(config.routes.clone())),
            config,
            next_connection: AtomicU64::new(1),
        }
    }

    fn next_connection_id(&self) -> String {
        format!("conn_{}", self.next_connection.fetch_add(1, Ordering::Relaxed))
    }
}

/// Build the HTTP/WebSocket application.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/routes", get(routes_handler))
        .route("/api/routes/:route_id", get(route_handler))
        .route("/api/routes/:route_id/sessions", get(route_sessions_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until interrupted.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        let _sampler = metrics::spawn_relay_sampler(Arc::clone(&state.relay), SAMPLE_INTERVAL);
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Beacon server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );
    info!(routes = state.routes.routes().len(), "Route directory loaded");

    axum::serve(listener, app(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.relay.writer().flush().await;
    info!(stats = ?state.relay.writer().stats(), "Store writer drained");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "activeSessions": state.relay.active_sessions(),
    }))
}

/// All configured routes.
async fn routes_handler(State(state): State<Arc<AppState>>) -> Json<Vec<RouteGeometry>> {
    Json(state.routes.routes())
}

/// One route's geometry.
async fn route_handler(
    State(state): State<Arc<AppState>>,
    Path(route_id): Path<String>,
) -> Result<Json<RouteGeometry>, StatusCode> {
    state.routes.route(&route_id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// Operators live on a route, as a new subscriber would see them.
async fn route_sessions_handler(
    State(state): State<Arc<AppState>>,
    Path(route_id): Path<String>,
) -> Json<Vec<SnapshotEntry>> {
    Json(state.relay.snapshot(&route_id))
}

/// Query parameters accepted on the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    encoding: Option<String>,
    version: Option<u8>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let encoding = match params.encoding.as_deref() {
        None => Encoding::default(),
        Some(name) => match Encoding::from_name(name) {
            Some(encoding) => encoding,
            None => {
                return (StatusCode::BAD_REQUEST, format!("Unknown encoding: {name}"))
                    .into_response()
            }
        },
    };

    if let Some(major) = params.version {
        if !PROTOCOL_VERSION.accepts_major(major) {
            debug!(requested = major, supported = %PROTOCOL_VERSION, "Rejected protocol version");
            return (
                StatusCode::BAD_REQUEST,
                format!("Unsupported protocol version {major}, server speaks {PROTOCOL_VERSION}"),
            )
                .into_response();
        }
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, encoding))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, encoding: Encoding) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = state.next_connection_id();
    let mut inbox = state.relay.connect(&connection_id);
    debug!(connection = %connection_id, encoding = ?encoding, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let heartbeat_ms = state.config.heartbeat.interval_ms.max(1);
    let connected = ServerEvent::connected(
        &connection_id,
        PROTOCOL_VERSION.major,
        u32::try_from(heartbeat_ms).unwrap_or(u32::MAX),
    );
    if let Err(e) = send_event(&mut sender, encoding, &connected).await {
        error!(connection = %connection_id, error = %e, "Failed to send connected event");
        state.relay.disconnect(&connection_id);
        return;
    }

    let max_message_size = state.config.limits.max_message_size;
    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_ms));
    heartbeat.tick().await;
    let mut last_seen = Instant::now();

    // Read buffer for partial MessagePack frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    'connection: loop {
        // Inbound first: a busy route must not keep pongs unread until the
        // heartbeat gives up on a live peer.
        tokio::select! {
            biased;

            msg = receiver.next() => {
                let message = match msg {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                };
                last_seen = Instant::now();

                match message {
                    Message::Text(text) => {
                        metrics::record_message(text.len(), "inbound");
                        match codec::decode_json::<ClientEvent>(&text) {
                            Ok(event) => dispatch(&state, &connection_id, event),
                            Err(e) => {
                                debug!(connection = %connection_id, error = %e, "Malformed message dropped");
                                metrics::record_error("malformed_message");
                            }
                        }
                    }
                    Message::Binary(data) => {
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);
                        loop {
                            match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                                Ok(Some(event)) => dispatch(&state, &connection_id, event),
                                Ok(None) => break,
                                Err(ProtocolError::FrameTooLarge(size)) => {
                                    warn!(connection = %connection_id, size, "Oversized frame, closing");
                                    metrics::record_error("frame_too_large");
                                    break 'connection;
                                }
                                Err(e) => {
                                    debug!(connection = %connection_id, error = %e, "Malformed frame dropped");
                                    metrics::record_error("malformed_message");
                                }
                            }
                        }
                        if read_buffer.len() > max_message_size {
                            warn!(connection = %connection_id, buffered = read_buffer.len(), "Partial frame too large, closing");
                            metrics::record_error("frame_too_large");
                            break;
                        }
                    }
                    Message::Ping(data) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                }
            }

            Some(event) = inbox.recv() => {
                if let Err(e) = send_event(&mut sender, encoding, &event).await {
                    debug!(connection = %connection_id, error = %e, "Outbound send failed");
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > timeout {
                    warn!(connection = %connection_id, "Heartbeat timeout, closing");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let transition = state.relay.disconnect(&connection_id);
    metrics::record_disconnect_transition(&transition);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

fn dispatch(state: &AppState, connection_id: &str, event: ClientEvent) {
    let start = Instant::now();
    let handled = state.relay.handle(connection_id, event);
    metrics::record_latency(start.elapsed().as_secs_f64());

    if let Handled::Rejected(e) = &handled {
        debug!(connection = %connection_id, error = %e, "Subscription rejected");
    }
    metrics::record_handled(&handled);
}

/// Send an event in the connection's encoding.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    encoding: Encoding,
    event: &ServerEvent,
) -> Result<(), ConnectionError> {
    let message = match encoding {
        Encoding::Json => Message::Text(codec::encode_json(event)?),
        Encoding::MessagePack => Message::Binary(codec::encode(event)?.to_vec()),
    };
    let size = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    sender.send(message).await?;
    metrics::record_message(size, "outbound");
    Ok(())
}
