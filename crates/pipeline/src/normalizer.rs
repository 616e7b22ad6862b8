// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! Payload validation, canonicalization, and duplicate suppression.
//!
//! The normalizer turns a validated wire payload into the canonical
//! [`TelemetryRecord`]: defaults filled, text truncated to the configured
//! byte budget on a UTF-8 boundary, metadata folded into tags. Duplicate
//! trace ids inside the sliding dedup window short-circuit before any
//! analysis; the window is a bounded concurrent LRU keyed by a SHA-256
//! fingerprint of the trace id.

use llm_watchtower_core::{PipelineConfig, RecordError, TelemetryPayload, TelemetryRecord};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Result of normalizing one payload.
#[derive(Debug, Clone)]
pub enum NormalizeOutcome {
    /// A canonical record ready for analysis.
    Fresh(TelemetryRecord),
    /// The trace id was already seen inside the dedup window.
    Duplicate,
}

/// Stable dedup fingerprint of a trace id.
pub fn fingerprint(trace_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(trace_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Truncate to at most `max` bytes without splitting a UTF-8 sequence.
fn truncate_utf8(mut text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text
}

/// Produces canonical records and suppresses duplicates.
pub struct Normalizer {
    config: Arc<PipelineConfig>,
    dedup: Mutex<LruCache<String, ()>>,
}

impl Normalizer {
    /// Create a normalizer with an empty dedup window.
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        let capacity = NonZeroUsize::new(config.dedup_capacity.max(1))
            .expect("dedup capacity is at least 1");
        Self {
            config,
            dedup: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Validate and canonicalize one payload.
    ///
    /// Invariant: every payload ends exactly one way — a fresh record, a
    /// duplicate, or a validation error. No silent drops.
    pub fn normalize(&self, payload: TelemetryPayload) -> Result<NormalizeOutcome, RecordError> {
        payload.validate()?;

        let key = fingerprint(&payload.trace_id);
        {
            let mut dedup = self.dedup.lock().expect("dedup window lock poisoned");
            if dedup.put(key, ()).is_some() {
                return Ok(NormalizeOutcome::Duplicate);
            }
        }

        let max_bytes = self.config.max_text_bytes;
        let mut tags = payload.tags;
        for (key, value) in payload.metadata {
            tags.insert(format!("meta.{key}"), value);
        }
        if let Some(demo) = payload.demo_mode {
            tags.insert("demo_mode".to_string(), demo.to_string());
        }

        Ok(NormalizeOutcome::Fresh(TelemetryRecord {
            trace_id: payload.trace_id,
            ingested_at: payload.ingested_at,
            model_id: payload.model_id,
            prompt: truncate_utf8(payload.prompt, max_bytes),
            response: truncate_utf8(payload.response, max_bytes),
            input_tokens: payload.input_tokens as u64,
            output_tokens: payload.output_tokens as u64,
            latency_ms: payload.latency_ms,
            cost_usd: payload.cost_usd,
            error_occurred: payload.error_occurred,
            user_id: payload
                .user_id
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| "anonymous".to_string()),
            session_id: payload.session_id,
            tags,
        }))
    }
}
