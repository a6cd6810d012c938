#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod protocol;

use crate::config::ServerConfig;
use crate::media::MediaError;
use crate::metrics::ServerMetrics;
use crate::room::RoomManager;
use crate::turn::IceServerConfig;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

pub use connection::PeerSession;
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Maximum size of one incoming WebSocket message
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Errors reported back to a peer as an `error` message
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("roomId required")]
    MissingRoomId,

    #[error("join first")]
    NotJoined,

    #[error("only host can produce")]
    NotHost,

    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    room_manager: Arc<RoomManager>,
    ice_servers: Arc<IceServerConfig>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    ws_path: String,
    idle_timeout: Duration,
    metrics_token: Option<Arc<str>>,
    control_token: Option<Arc<str>>,
}

impl SignalingServer {
    pub fn new(room_manager: Arc<RoomManager>, config: &ServerConfig, metrics: ServerMetrics) -> Self {
        info!("Max connections: {}", config.max_connections);
        if config.control_token.is_none() {
            warn!("CONTROL_TOKEN not set, room close endpoint is unauthenticated");
        }

        Self {
            room_manager,
            ice_servers: Arc::new(config.ice_servers.clone()),
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            ws_path: config.ws_path.clone(),
            idle_timeout: config.idle_timeout,
            metrics_token: config.metrics_token.as_deref().map(Arc::from),
            control_token: config.control_token.as_deref().map(Arc::from),
        }
    }

    /// Creates the Axum router. Paths outside the signaling prefix and the
    /// operational endpoints get a 404.
    pub fn router(self) -> Router {
        let ws_path = self.ws_path.clone();

        Router::new()
            .route(&ws_path, get(ws_handler))
            .route(&format!("{ws_path}/{{*rest}}"), get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/rooms/{room_id}/close", post(close_room_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Serves until `shutdown` resolves
    ///
    /// # Errors
    /// Returns an error if the server fails while accepting connections
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Signaling server listening on {} at {}", listener.local_addr()?, self.ws_path);
        let app = self.router();

        axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

        Ok(())
    }
}

/// Checks `Authorization: Bearer <token>` when a token is configured
fn authorized(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": server.room_manager.room_count(),
        "members": server.room_manager.member_count(),
    }))
}

/// Metrics handler, Prometheus text exposition format
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if !authorized(&headers, server.metrics_token.as_deref()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let body = server
        .metrics
        .render_prometheus(server.room_manager.room_count(), server.room_manager.member_count());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Out-of-band room close for the session controller
async fn close_room_handler(
    State(server): State<SignalingServer>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers, server.control_token.as_deref()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    if server.room_manager.close_room(&room_id) {
        Json(serde_json::json!({ "roomId": room_id, "closed": true })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "roomId": room_id, "closed": false })),
        )
            .into_response()
    }
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(
                socket,
                server.room_manager,
                server.ice_servers,
                server.metrics,
                server.idle_timeout,
                permit,
            )
        })
}
