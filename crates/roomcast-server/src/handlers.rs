//! HTTP and WebSocket handlers for the Roomcast server.
//!
//! This module handles ingress publishes and the subscriber connection
//! lifecycle.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use roomcast_core::{Cluster, RelayError};
use roomcast_protocol::{FanoutSummary, IngressPublish, PublishRequest, SessionError};
use roomcast_transport::{close_code, websocket, Connection, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The coordinator and its partitions.
    pub cluster: Cluster,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Open storage and start the cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be opened or the coordinator
    /// snapshot cannot be loaded.
    pub async fn start(config: Config) -> Result<Self> {
        let storage = config.open_storage().await?;
        let cluster = Cluster::start(storage, config.cluster()).await?;
        Ok(Self { cluster, config })
    }
}

/// A relay error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::ActorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        metrics::record_error(self.0.kind_label());
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            debug!(error = %self.0, "Request rejected");
        }
        let body = SessionError {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/publish", post(publish_handler))
        .route("/health", get(health_handler))
        .fallback(not_found)
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::start(config).await?);
    let app = router(Arc::clone(&state));

    let listener = TcpListener::bind(addr).await?;
    info!("Roomcast server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    })
    .await?;

    info!("Shutting down");
    if let Ok(state) = Arc::try_unwrap(state) {
        state.cluster.shutdown().await;
    }
    Ok(())
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let records = state.cluster.stats().await?;
    let connections: usize = records.iter().map(|r| r.live_connections).sum();
    metrics::set_active_partitions(records.len());

    Ok(Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "partitions": records.len(),
        "connections": connections,
    })))
}

/// Ingress publish handler.
///
/// The body is validated and then forwarded verbatim to every subscriber
/// of the derived room.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<FanoutSummary>, ApiError> {
    let ingress: IngressPublish = serde_json::from_slice(&body)
        .map_err(|e| RelayError::MalformedRequest(e.to_string()))?;
    let room = ingress.room().map_err(RelayError::from)?;

    let start = Instant::now();
    let bytes = body.len();
    let summary = state
        .cluster
        .publish(PublishRequest::new(room.clone(), body))
        .await?;
    metrics::record_publish(bytes, summary, start.elapsed().as_secs_f64());

    debug!(room = %room, delivered = summary.delivered, failed = summary.failed, "Published");
    Ok(Json(summary))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: Option<WebSocketUpgrade>,
    remote: Option<ConnectInfo<SocketAddr>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(ws) = ws else {
        return not_found().await.into_response();
    };
    let remote = remote.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| handle_websocket(socket, remote, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, remote: Option<SocketAddr>, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (connection, mut reader) =
        websocket::split(socket, remote, state.config.limits.max_message_size);
    let connection: Arc<dyn Connection> = connection;
    debug!(connection = %connection.id(), remote = ?connection.remote_addr(), "WebSocket connected");

    let partition = match state.cluster.connect(Arc::clone(&connection)).await {
        Ok(partition) => {
            metrics::record_assignment("assigned");
            partition
        }
        Err(e) => {
            metrics::record_assignment("failed");
            metrics::record_error(e.kind_label());
            warn!(connection = %connection.id(), error = %e, "Session setup failed");
            reject_session(connection.as_ref(), &e).await;
            return;
        }
    };

    loop {
        match reader.recv().await {
            Ok(Some(text)) => {
                metrics::record_message(text.len(), "inbound");
                if let Err(e) = state
                    .cluster
                    .message(&partition, connection.as_ref(), &text)
                    .await
                {
                    metrics::record_error(e.kind_label());
                    if !connection.is_open() {
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(TransportError::MessageTooLarge(len)) => {
                metrics::record_error("message_too_large");
                let reason = format!("Message of {len} bytes is too large");
                if let Err(e) = connection.close(close_code::TOO_LARGE, &reason).await {
                    debug!(connection = %connection.id(), error = %e, "Close failed");
                }
                break;
            }
            Err(e) => {
                warn!(connection = %connection.id(), error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        }
    }

    state.cluster.disconnect(&partition, connection.id()).await;
    debug!(connection = %connection.id(), partition = %partition, "WebSocket disconnected");
}

/// Tell the client why its session could not be set up, then close.
async fn reject_session(connection: &dyn Connection, cause: &RelayError) {
    let notice = SessionError {
        error: cause.to_string(),
    };
    match serde_json::to_vec(&notice) {
        Ok(body) => {
            if let Err(e) = connection.send(Bytes::from(body)).await {
                debug!(connection = %connection.id(), error = %e, "Error notice not sent");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode error notice"),
    }
    if let Err(e) = connection
        .close(close_code::INTERNAL, "Uncaught exception during session setup")
        .await
    {
        debug!(connection = %connection.id(), error = %e, "Close failed");
    }
}
