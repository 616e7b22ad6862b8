// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! AI-assisted threat classification with a regex pre-filter.
//!
//! Each record is classified at most twice, once per scope (prompt,
//! response). The pre-filter runs first and its findings are merged with
//! the AI verdict: the AI's kind stands when its confidence clears
//! `threat_min_confidence`, otherwise a suspected pre-filter falls back to
//! its most specific category at confidence 0.70. AI outages degrade to
//! the pre-filter verdict instead of failing the record.

pub mod prefilter;

use crate::client::{AiClient, AiClientError, CompletionOptions};
use crate::quality::extract_json_object;
use crate::retry::{retry_with_backoff, RetryPolicy};
use llm_watchtower_core::{
    PipelineConfig, Severity, TelemetryRecord, ThreatKind, ThreatScope, ThreatVerdict,
};
use prefilter::PrefilterResult;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Confidence assigned to verdicts that stand on the pre-filter alone.
const PREFILTER_CONFIDENCE: f64 = 0.70;

#[derive(Debug, Deserialize)]
struct RawThreatJudgment {
    kind: ThreatKind,
    confidence: f64,
    #[allow(dead_code)]
    #[serde(default)]
    severity: Option<Severity>,
    #[serde(default)]
    indicators: Vec<String>,
}

/// Outcome of threat classification for one record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ThreatAnalysis {
    /// Verdicts with `kind != none`, at most one per scope.
    pub verdicts: Vec<ThreatVerdict>,
    /// True when the AI classifier failed terminally for any scope and the
    /// result rests on the pre-filter alone.
    pub ai_degraded: bool,
}

/// Classifies prompt and response text through the injected AI client.
pub struct ThreatAnalyzer {
    client: Arc<dyn AiClient>,
    config: Arc<PipelineConfig>,
    policy: RetryPolicy,
}

impl ThreatAnalyzer {
    /// Wire the analyzer to a client and the shared configuration.
    pub fn new(client: Arc<dyn AiClient>, config: Arc<PipelineConfig>) -> Self {
        let policy = RetryPolicy::from_config(&config);
        Self {
            client,
            config,
            policy,
        }
    }

    /// Severity tie-breaks for AI-confirmed verdicts.
    ///
    /// Critical is reserved for high-confidence injection or jailbreak;
    /// PII is high only when it appears in a response (leak), low when it
    /// merely occurs in a prompt; toxic content escalates past medium once
    /// its confidence clears `toxicity_min`.
    fn severity_for(&self, kind: ThreatKind, confidence: f64, scope: ThreatScope) -> Severity {
        match kind {
            ThreatKind::PromptInjection | ThreatKind::Jailbreak => {
                if confidence >= 0.90 {
                    Severity::Critical
                } else {
                    Severity::High
                }
            }
            ThreatKind::PiiLeak => {
                if scope == ThreatScope::Response {
                    Severity::High
                } else {
                    Severity::Low
                }
            }
            ThreatKind::ToxicContent => {
                if confidence >= self.config.toxicity_min {
                    Severity::High
                } else {
                    Severity::Medium
                }
            }
            ThreatKind::None => Severity::Low,
        }
    }

    fn build_prompt(&self, scope: ThreatScope, text: &str) -> String {
        format!(
            concat!(
                "You are a security analyst for LLM applications.\n",
                "Classify the following {scope} text against these threat ",
                "categories: prompt_injection, jailbreak, pii_leak, toxic_content.\n\n",
                "TEXT:\n{text}\n\n",
                "Reply with strictly a JSON object with keys \"kind\" (one of ",
                "\"none\", \"prompt_injection\", \"jailbreak\", \"pii_leak\", ",
                "\"toxic_content\"), \"confidence\" (number in [0, 1]), ",
                "\"severity\" (one of \"low\", \"medium\", \"high\", \"critical\"), ",
                "and \"indicators\" (array of short strings). Never quote personal ",
                "data verbatim in indicators; use redacted labels such as \"SSN\". ",
                "No other text."
            ),
            scope = scope,
            text = text,
        )
    }

    /// Fallback verdict when the AI cannot confirm: the pre-filter's most
    /// specific category at fixed confidence, or nothing.
    fn fallback(&self, prefilter: &PrefilterResult, scope: ThreatScope) -> Option<ThreatVerdict> {
        let kind = prefilter.kind?;
        let severity = if kind == ThreatKind::PiiLeak && scope == ThreatScope::Prompt {
            Severity::Low
        } else {
            Severity::Medium
        };
        Some(ThreatVerdict {
            kind,
            confidence: PREFILTER_CONFIDENCE,
            severity,
            indicators: prefilter.indicators.clone(),
            scope,
        })
    }

    async fn classify_scope(
        &self,
        record: &TelemetryRecord,
        scope: ThreatScope,
        text: &str,
        cancel: &CancellationToken,
    ) -> (Option<ThreatVerdict>, bool) {
        let prefiltered = prefilter::scan(text);
        let prompt = self.build_prompt(scope, text);
        let options = CompletionOptions::from_config(&self.config);

        let outcome = retry_with_backoff(&self.policy, cancel, "threat", || {
            let prompt = prompt.clone();
            let options = options.clone();
            async move {
                let reply = self.client.complete(&prompt, &options).await?;
                let json = extract_json_object(&reply)?;
                serde_json::from_str::<RawThreatJudgment>(json)
                    .map_err(|e| AiClientError::InvalidResponse(e.to_string()))
            }
        })
        .await;

        match outcome {
            Ok(judgment) if judgment.confidence >= self.config.threat_min_confidence => {
                if judgment.kind == ThreatKind::None {
                    return (None, false);
                }
                let confidence = judgment.confidence.clamp(0.0, 1.0);
                let mut indicators = prefiltered.indicators.clone();
                for indicator in judgment.indicators {
                    if !indicators.contains(&indicator) {
                        indicators.push(indicator);
                    }
                }
                (
                    Some(ThreatVerdict {
                        kind: judgment.kind,
                        confidence,
                        severity: self.severity_for(judgment.kind, confidence, scope),
                        indicators,
                        scope,
                    }),
                    false,
                )
            }
            Ok(_) => (self.fallback(&prefiltered, scope), false),
            Err(err) => {
                warn!(
                    trace_id = %record.trace_id,
                    scope = %scope,
                    error = %err,
                    "threat classification failed terminally, falling back to pre-filter"
                );
                (self.fallback(&prefiltered, scope), true)
            }
        }
    }

    /// Classify the record's prompt and (when non-empty) response.
    pub async fn analyze(
        &self,
        record: &TelemetryRecord,
        cancel: &CancellationToken,
    ) -> ThreatAnalysis {
        if !self.config.enable_threat_detection {
            return ThreatAnalysis::default();
        }

        let mut analysis = ThreatAnalysis::default();

        let (verdict, degraded) = self
            .classify_scope(record, ThreatScope::Prompt, &record.prompt, cancel)
            .await;
        analysis.ai_degraded |= degraded;
        if let Some(verdict) = verdict.filter(ThreatVerdict::is_threat) {
            analysis.verdicts.push(verdict);
        }

        if !record.has_empty_response() {
            let (verdict, degraded) = self
                .classify_scope(record, ThreatScope::Response, &record.response, cancel)
                .await;
            analysis.ai_degraded |= degraded;
            if let Some(verdict) = verdict.filter(ThreatVerdict::is_threat) {
                analysis.verdicts.push(verdict);
            }
        }

        analysis
    }
}
