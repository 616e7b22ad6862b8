// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! AI-assisted quality classification.
//!
//! The classifier asks the judge model for a strict JSON object scoring
//! coherence, relevance, and completeness, then computes the weighted
//! overall score. Records with analysis disabled or an empty response get
//! the skip sentinel without an AI call. Terminal failures degrade to a
//! score with `overall = None` so the record is never failed by its judge.

use crate::client::{AiClient, AiClientError, CompletionOptions};
use crate::retry::{retry_with_backoff, RetryPolicy};
use llm_watchtower_core::{PipelineConfig, QualityScore, TelemetryRecord};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct RawQualityJudgment {
    coherence: f64,
    relevance: f64,
    completeness: f64,
    #[serde(default)]
    explanation: String,
}

/// Extract the first JSON object from judge output, tolerating code fences
/// and prose around it.
pub(crate) fn extract_json_object(text: &str) -> Result<&str, AiClientError> {
    let start = text
        .find('{')
        .ok_or_else(|| AiClientError::InvalidResponse("no JSON object in reply".to_string()))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| AiClientError::InvalidResponse("unterminated JSON object".to_string()))?;
    if end < start {
        return Err(AiClientError::InvalidResponse(
            "malformed JSON object".to_string(),
        ));
    }
    Ok(&text[start..=end])
}

/// Judges response quality through the injected AI client.
pub struct QualityAnalyzer {
    client: Arc<dyn AiClient>,
    config: Arc<PipelineConfig>,
    policy: RetryPolicy,
}

impl QualityAnalyzer {
    /// Wire the analyzer to a client and the shared configuration.
    pub fn new(client: Arc<dyn AiClient>, config: Arc<PipelineConfig>) -> Self {
        let policy = RetryPolicy::from_config(&config);
        Self {
            client,
            config,
            policy,
        }
    }

    /// Build the judge prompt for a record.
    ///
    /// The short-response completeness instruction is part of the scoring
    /// contract and must appear verbatim so judgments stay reproducible.
    fn build_prompt(&self, record: &TelemetryRecord) -> String {
        format!(
            concat!(
                "You are a strict evaluator of LLM response quality.\n\n",
                "PROMPT:\n{prompt}\n\n",
                "RESPONSE:\n{response}\n\n",
                "Score the response on three dimensions, each a number in [0, 1]:\n",
                "- coherence: is the response internally consistent and well-formed?\n",
                "- relevance: does it address the prompt?\n",
                "- completeness: does it fully answer what was asked?\n\n",
                "Responses under a minimum length (default {min_bytes} bytes) score ",
                "completeness <= 0.5.\n\n",
                "Reply with strictly a JSON object with keys \"coherence\", ",
                "\"relevance\", \"completeness\", \"explanation\" and nothing else."
            ),
            prompt = record.prompt,
            response = record.response,
            min_bytes = self.config.min_response_bytes,
        )
    }

    /// Produce a quality score for the record.
    ///
    /// Never returns an error: skip and failure cases are encoded in the
    /// score itself.
    pub async fn analyze(
        &self,
        record: &TelemetryRecord,
        cancel: &CancellationToken,
    ) -> QualityScore {
        if !self.config.enable_quality_analysis || record.has_empty_response() {
            return QualityScore::skipped();
        }

        let prompt = self.build_prompt(record);
        let options = CompletionOptions::from_config(&self.config);

        let outcome = retry_with_backoff(&self.policy, cancel, "quality", || {
            let prompt = prompt.clone();
            let options = options.clone();
            async move {
                let reply = self.client.complete(&prompt, &options).await?;
                let json = extract_json_object(&reply)?;
                serde_json::from_str::<RawQualityJudgment>(json)
                    .map_err(|e| AiClientError::InvalidResponse(e.to_string()))
            }
        })
        .await;

        match outcome {
            Ok(judgment) => QualityScore::scored(
                judgment.coherence,
                judgment.relevance,
                judgment.completeness,
                &self.config.quality_weights,
                judgment.explanation,
            ),
            Err(err) => {
                warn!(
                    trace_id = %record.trace_id,
                    error = %err,
                    "quality classification failed terminally"
                );
                QualityScore::unavailable(format!("quality judge unavailable: {err}"))
            }
        }
    }
}
