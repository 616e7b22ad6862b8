//! Incident query surface and server-originated push channels.
//!
//! - `GET /incidents` with optional `status`, `severity`, `since`, `limit`
//! - `GET /incidents/:id`
//! - `POST /incidents/:id/transition` driving the open -> acknowledged ->
//!   resolved state machine (idempotent; illegal transitions return 409)
//! - `GET /incidents/stream` and `GET /incidents/transitions`: SSE streams
//!   of new incidents and of status transitions, each event tagged with a
//!   monotonic sequence number

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use llm_watchtower_core::{Incident, IncidentStatus, Severity};
use llm_watchtower_pipeline::{IncidentFilter, StoreError};
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::models::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/incidents", get(list_incidents))
        .route("/incidents/stream", get(stream_incidents))
        .route("/incidents/transitions", get(stream_transitions))
        .route("/incidents/:id", get(get_incident))
        .route("/incidents/:id/transition", post(transition_incident))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<IncidentStatus>,
    severity: Option<Severity>,
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

type ApiError = (StatusCode, Json<Value>);

fn error_body(code: StatusCode, message: String) -> ApiError {
    (code, Json(serde_json::json!({ "error": message })))
}

fn map_store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::NotFound(id) => {
            error_body(StatusCode::NOT_FOUND, format!("incident {id} not found"))
        }
        StoreError::IllegalTransition(e) => error_body(StatusCode::CONFLICT, e.to_string()),
        StoreError::WriteFailed(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn list_incidents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Incident>>, ApiError> {
    let filter = IncidentFilter {
        status: query.status,
        severity: query.severity,
        since: query.since,
    };
    let incidents = state
        .pipeline
        .query_incidents(&filter, query.limit.unwrap_or(100))
        .await
        .map_err(map_store_error)?;
    Ok(Json(incidents))
}

async fn get_incident(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Incident>, ApiError> {
    let incident = state
        .pipeline
        .get_incident(id)
        .await
        .map_err(map_store_error)?
        .ok_or_else(|| error_body(StatusCode::NOT_FOUND, format!("incident {id} not found")))?;
    Ok(Json(incident))
}

#[derive(Debug, Deserialize)]
struct TransitionRequest {
    status: IncidentStatus,
}

async fn transition_incident(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<TransitionRequest>,
) -> Result<Json<Incident>, ApiError> {
    let incident = state
        .pipeline
        .transition_incident(id, request.status)
        .await
        .map_err(map_store_error)?;
    Ok(Json(incident))
}

async fn stream_incidents(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.pipeline.subscribe_incidents();
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        let sequenced = item.ok()?;
        Event::default()
            .id(sequenced.sequence.to_string())
            .json_data(&sequenced)
            .ok()
            .map(Ok)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn stream_transitions(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.pipeline.subscribe_transitions();
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        let sequenced = item.ok()?;
        Event::default()
            .id(sequenced.sequence.to_string())
            .json_data(&sequenced)
            .ok()
            .map(Ok)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
