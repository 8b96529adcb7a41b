//! API Routes
//!
//! HTTP endpoints for the PEX protocol plus status and metrics.

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::registration::{ApiError, RegistrationService};
use super::Metrics;
use crate::peer::RawPeer;
use crate::protocol::{HEALTH_CHECK_PATH, PEER_LIST_PATH, REGISTER_PATH};

/// Shared API state
pub struct ApiState {
    pub service: Arc<RegistrationService>,
    pub metrics: Arc<Metrics>,
}

/// Build the router; callers must serve it with connect info
pub fn router(service: Arc<RegistrationService>, metrics: Arc<Metrics>) -> Router {
    let state = Arc::new(ApiState { service, metrics });

    Router::new()
        // Protocol
        .route(REGISTER_PATH, post(register))
        .route(PEER_LIST_PATH, get(peer_list))
        .route(HEALTH_CHECK_PATH, get(health_check))

        // Status & Metrics
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics_prometheus))
        .route("/metrics/json", get(get_metrics_json))

        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_api_server(
    bind: SocketAddr,
    service: Arc<RegistrationService>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    let app = router(service, metrics);

    info!("📡 PEX API server listening on {}", bind);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// POST /register - Announce a peer, receive a registry sample
async fn register(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: Result<Json<RawPeer>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(raw) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let response = state.service.handle_register(raw, Some(remote.ip())).await?;
    Ok(Json(response))
}

/// GET /peer_list - Registry sample
async fn peer_list(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.peer_list(Some(remote.ip())).await?))
}

/// GET /health_check - Liveness with this node's record
async fn health_check(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.health().await?))
}

/// GET /status - Detailed status
async fn get_status(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.service.stats().await?;
    state
        .metrics
        .set_peer_counts(stats.total as u64, stats.active as u64);

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.metrics.uptime_secs(),
        "peer": state.service.me(),
        "registry": stats,
        "banned_callers": state.service.banned_callers().await,
    })))
}

/// GET /metrics - Prometheus format metrics
async fn get_metrics_prometheus(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    refresh_gauges(&state).await;

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.to_prometheus(),
    )
}

/// GET /metrics/json - JSON format metrics
async fn get_metrics_json(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    refresh_gauges(&state).await;
    Json(state.metrics.to_json())
}

async fn refresh_gauges(state: &ApiState) {
    if let Ok(stats) = state.service.stats().await {
        state
            .metrics
            .set_peer_counts(stats.total as u64, stats.active as u64);
    }
}
