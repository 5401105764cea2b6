//! `TetherServer`: Axum HTTP + WebSocket server.
//!
//! Authentication (and resume) happens before the upgrade, so a rejected
//! handshake gets a plain HTTP error with a JSON `{code, message}` body.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tether_core::{SessionId, TetherError};
use tether_protocol::CloseReason;
use tether_settings::ServerSettings;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::health::{self, HealthCounts, HealthResponse};
use crate::manager::ConnectionManager;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::run_ws_session;

/// Header carrying the resume token.
pub const RESUME_TOKEN_HEADER: &str = "x-resume-token";
/// Header naming the session to resume.
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Shared state for Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection registry.
    pub manager: Arc<ConnectionManager>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus recorder handle, when installed.
    pub prometheus: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// The WebSocket server.
pub struct TetherServer {
    settings: ServerSettings,
    manager: Arc<ConnectionManager>,
    shutdown: Arc<ShutdownCoordinator>,
    prometheus: Option<PrometheusHandle>,
    start_time: Instant,
}

impl TetherServer {
    /// Create a new server.
    pub fn new(
        settings: ServerSettings,
        manager: Arc<ConnectionManager>,
        shutdown: Arc<ShutdownCoordinator>,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            settings,
            manager,
            shutdown,
            prometheus,
            start_time: Instant::now(),
        }
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        let state = AppState {
            manager: Arc::clone(&self.manager),
            shutdown: Arc::clone(&self.shutdown),
            prometheus: self.prometheus.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind and serve until the shutdown token fires.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        info!(%local_addr, "tether server listening");
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server error");
            }
        });
        Ok((local_addr, handle))
    }

    /// Connection registry.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let manager = &state.manager;
    let counts = HealthCounts {
        connections: manager.len(),
        sessions: manager.session_count(),
        pending: manager.reconnect().pending_count(),
    };
    Json(health::health_check(
        &manager.config().instance_id,
        state.start_time,
        counts,
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = match &state.prometheus {
        Some(handle) => handle.render(),
        None => state.manager.metrics().render_text(),
    };
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

/// Handshake parameters accepted on the query string.
#[derive(Debug, Default, Deserialize)]
struct WsParams {
    token: Option<String>,
    resume_token: Option<String>,
    session_id: Option<String>,
}

/// GET /ws
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "code": CloseReason::ServerShutdown.as_str(),
                "message": "server is shutting down",
            })),
        )
            .into_response();
    }

    let token = bearer_token(&headers).or(params.token).unwrap_or_default();
    let resume_token = header_value(&headers, RESUME_TOKEN_HEADER).or(params.resume_token);
    let session_id = header_value(&headers, SESSION_ID_HEADER)
        .or(params.session_id)
        .map(SessionId::from);

    let manager = Arc::clone(&state.manager);
    let upgrade = match upgrade {
        Ok(u) => u,
        Err(e) => {
            // bad credentials still answer 401, but nothing is registered
            if let Err(err) = manager.authenticate(&token).await {
                return rejection(&err);
            }
            return e.into_response();
        }
    };

    let result = match resume_token.as_deref().filter(|t| !t.is_empty()) {
        Some(resume) => manager.resume(&token, session_id.as_ref(), resume).await,
        None => manager.register(&token).await,
    };
    let registration = match result {
        Ok(r) => r,
        Err(e) => {
            warn!(code = e.code(), error = %e, "handshake rejected");
            return rejection(&e);
        }
    };

    let id = registration.connection_id().clone();
    let max_message = manager.config().max_frame_bytes.saturating_mul(4);
    let on_fail = Arc::clone(&manager);
    upgrade
        .max_message_size(max_message)
        .on_failed_upgrade(move |e| {
            warn!(connection_id = %id, error = %e, "websocket upgrade failed");
            drop(tokio::spawn(async move {
                let _ = on_fail.disconnect(&id, CloseReason::InternalError).await;
            }));
        })
        .on_upgrade(move |socket| run_ws_session(socket, registration, manager))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = header_value(headers, header::AUTHORIZATION.as_str())?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(|t| t.trim().to_owned())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// HTTP rejection for a failed handshake.
pub fn rejection(err: &TetherError) -> Response {
    let status = match err {
        TetherError::Auth(_) => StatusCode::UNAUTHORIZED,
        TetherError::CapacityExceeded(_) | TetherError::SessionStoreUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        TetherError::ReconnectionWindowExpired(_) => StatusCode::GONE,
        TetherError::SessionOwnershipConflict { .. } => StatusCode::CONFLICT,
        TetherError::Protocol { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "code": err.code(), "message": err.to_string() })),
    )
        .into_response()
}
