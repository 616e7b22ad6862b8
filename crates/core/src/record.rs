// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! The telemetry record: the unit of work flowing through the pipeline.
//!
//! [`TelemetryPayload`] is the wire format accepted at ingress;
//! [`TelemetryRecord`] is the canonical, validated form produced by the
//! normalizer. Records are immutable after construction and shared into the
//! analyzer fan-out behind an `Arc`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Validation failures for an incoming payload.
///
/// These are per-record input errors: they are reported back to the caller
/// and never escalated past the ingress boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    /// A required string field was present but empty.
    #[error("field '{0}' must be non-empty")]
    EmptyField(&'static str),

    /// A counter or measurement was negative.
    #[error("field '{field}' must be non-negative, got {value}")]
    NegativeValue {
        /// Offending field name.
        field: &'static str,
        /// The rejected value.
        value: f64,
    },
}

/// Wire-format telemetry payload, field-for-field the ingestion contract.
///
/// `metadata` and `demo_mode` are optional extras the core carries opaquely
/// into the record's tags. Missing required fields and type mismatches are
/// rejected by deserialization; sign and emptiness invariants are checked by
/// [`TelemetryPayload::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPayload {
    /// Opaque request identifier, unique per request.
    pub trace_id: String,
    /// When the client captured the exchange (ISO-8601 UTC).
    pub ingested_at: DateTime<Utc>,
    /// Model that served the request.
    pub model_id: String,
    /// The prompt sent to the model.
    pub prompt: String,
    /// The model response; may be empty when the request errored.
    pub response: String,
    /// Prompt token count.
    pub input_tokens: i64,
    /// Completion token count.
    pub output_tokens: i64,
    /// End-to-end latency in milliseconds.
    pub latency_ms: f64,
    /// Request cost in USD.
    pub cost_usd: f64,
    /// Whether the observed request failed.
    #[serde(default)]
    pub error_occurred: bool,
    /// End-user identifier, if the client supplied one.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Session identifier, if the client supplied one.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Free-form string tags.
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Opaque metadata, folded into tags under `meta.` keys.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Demo-mode marker, folded into tags.
    #[serde(default)]
    pub demo_mode: Option<bool>,
}

impl TelemetryPayload {
    /// Check the invariants deserialization cannot express.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.trace_id.is_empty() {
            return Err(RecordError::EmptyField("trace_id"));
        }
        if self.model_id.is_empty() {
            return Err(RecordError::EmptyField("model_id"));
        }
        if self.input_tokens < 0 {
            return Err(RecordError::NegativeValue {
                field: "input_tokens",
                value: self.input_tokens as f64,
            });
        }
        if self.output_tokens < 0 {
            return Err(RecordError::NegativeValue {
                field: "output_tokens",
                value: self.output_tokens as f64,
            });
        }
        if self.latency_ms < 0.0 {
            return Err(RecordError::NegativeValue {
                field: "latency_ms",
                value: self.latency_ms,
            });
        }
        if self.cost_usd < 0.0 {
            return Err(RecordError::NegativeValue {
                field: "cost_usd",
                value: self.cost_usd,
            });
        }
        Ok(())
    }
}

/// Canonical telemetry record, immutable after the normalizer constructs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Opaque request identifier, unique per request.
    pub trace_id: String,
    /// When the client captured the exchange.
    pub ingested_at: DateTime<Utc>,
    /// Model that served the request.
    pub model_id: String,
    /// The prompt, truncated to the configured byte budget.
    pub prompt: String,
    /// The response, truncated to the configured byte budget.
    pub response: String,
    /// Prompt token count.
    pub input_tokens: u64,
    /// Completion token count.
    pub output_tokens: u64,
    /// End-to-end latency in milliseconds.
    pub latency_ms: f64,
    /// Request cost in USD.
    pub cost_usd: f64,
    /// Whether the observed request failed.
    pub error_occurred: bool,
    /// End-user identifier; "anonymous" when the client omitted it.
    pub user_id: String,
    /// Session identifier, if supplied.
    pub session_id: Option<String>,
    /// String tags, including folded-in metadata.
    pub tags: HashMap<String, String>,
}

impl TelemetryRecord {
    /// Total tokens across prompt and completion.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Whether the response body is empty (errored or streaming-aborted
    /// requests commonly are).
    pub fn has_empty_response(&self) -> bool {
        self.response.is_empty()
    }
}
