//! Ingest API service library for LLM Watchtower.
//!
//! Exposes the telemetry intake, the incident query surface with its SSE
//! push channels, a liveness endpoint, and Prometheus exposition when a
//! recorder is installed. The binary in `main.rs` wires configuration,
//! adapters, and the pipeline, then serves this router.

pub mod models;
pub mod routes;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use models::AppState;

/// Build the service router over shared state.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::telemetry::routes())
        .merge(routes::incidents::routes())
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "queue_depth": state.pipeline.queue_depth(),
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<String, StatusCode> {
    match &state.metrics {
        Some(handle) => Ok(handle.render()),
        None => Err(StatusCode::NOT_FOUND),
    }
}
