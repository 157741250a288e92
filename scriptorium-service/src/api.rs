//! HTTP API for the scriptorium service.
//!
//! Operator-facing surface: document registration and inspection, manual
//! pipeline triggers, embedding statistics, health, and Prometheus metrics.

use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::processor::BreakerStatus;
use crate::service::ScriptoriumService;

pub mod documents;
use documents::{
    get_document_chunks_handler, get_document_handler, list_documents_handler,
    process_all_handler, process_document_handler, register_document_handler,
    restart_document_handler,
};

/// Application state
pub struct AppState {
    pub service: Arc<ScriptoriumService>,
    pub start_time: Instant,
    pub metrics_handle: PrometheusHandle,
}

/// Build the API router
pub fn router(service: Arc<ScriptoriumService>, metrics_handle: PrometheusHandle) -> Router {
    let state = Arc::new(AppState {
        service,
        start_time: Instant::now(),
        metrics_handle,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .route(
            "/api/documents",
            get(list_documents_handler).post(register_document_handler),
        )
        .route("/api/documents/{id}", get(get_document_handler))
        .route("/api/documents/{id}/chunks", get(get_document_chunks_handler))
        .route("/api/documents/{id}/process", post(process_document_handler))
        .route("/api/documents/{id}/restart", post(restart_document_handler))
        .route("/api/process", post(process_all_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    embedding_provider_available: bool,
    circuit_breaker: BreakerStatus,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let provider_available = state.service.provider_healthy().await;
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        embedding_provider_available: provider_available,
        circuit_breaker: state.service.breaker_status(),
    })
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, crate::error::ServiceError> {
    Ok(Json(state.service.stats()?))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics_handle.render()
}
