//! Telemetry intake: `POST /telemetry`.
//!
//! Accepts a single JSON record or a JSON array of records. The response is
//! always `{accepted, rejected}`: 202 on any partial success, 400 only when
//! the request body itself is unparseable, 429 when the pipeline is
//! saturated and the caller should retry with backoff.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use llm_watchtower_pipeline::{SubmitError, SubmitReceipt};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::models::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/telemetry", post(submit_telemetry))
}

async fn submit_telemetry(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<SubmitReceipt>), (StatusCode, Json<Value>)> {
    let payloads = match body {
        Value::Array(items) => items,
        single => vec![single],
    };
    let batch_len = payloads.len();

    match state.pipeline.submit(payloads).await {
        Ok(receipt) => {
            debug!(
                batch = batch_len,
                accepted = receipt.accepted,
                rejected = receipt.rejected.len(),
                "telemetry batch processed"
            );
            Ok((StatusCode::ACCEPTED, Json(receipt)))
        }
        Err(SubmitError::Overloaded) => Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "overloaded",
                "message": "intake queue saturated, retry with backoff"
            })),
        )),
    }
}
