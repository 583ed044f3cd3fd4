//! HTTP route definitions

use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::app::{AppState, RenderState};
use crate::net::replication::SnapshotStats;
use crate::net::session::{PeerSummary, SessionSummary};
use crate::util::time::{unix_secs_f64, uptime_secs};

/// Build the status router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/session", get(session_handler))
        .route("/session/peers/:peer_id", get(peer_handler))
        .route("/entities", get(entities_handler))
        .layer(TimeoutLayer::new(Duration::from_secs(5)))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    tick: u64,
    entities: usize,
    connected_peers: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.session.is_closed() { "closing" } else { "ok" };

    Json(HealthResponse {
        status,
        uptime_secs: uptime_secs(),
        tick: state.tick(),
        entities: state.store.entity_count(),
        connected_peers: state.session.connected_count(),
    })
}

// ============================================================================
// Session endpoints
// ============================================================================

#[derive(Serialize)]
struct SessionResponse {
    #[serde(flatten)]
    session: SessionSummary,
    snapshots: SnapshotStats,
}

async fn session_handler(State(state): State<AppState>) -> Json<SessionResponse> {
    Json(SessionResponse {
        session: state.session.summary(),
        snapshots: state.snapshot_stats(),
    })
}

async fn peer_handler(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
) -> Result<Json<PeerSummary>, AppError> {
    let peer_id: Uuid = peer_id
        .parse()
        .map_err(|_| AppError::BadRequest(format!("invalid peer id: {peer_id}")))?;

    state
        .session
        .peers()
        .into_iter()
        .find(|p| p.info.peer_id == peer_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("peer {peer_id}")))
}

// ============================================================================
// Render view
// ============================================================================

async fn entities_handler(State(state): State<AppState>) -> Json<Vec<RenderState>> {
    Json(state.render_view(unix_secs_f64()))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
