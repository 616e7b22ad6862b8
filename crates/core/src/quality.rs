// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! Quality scores produced by the AI-assisted quality classifier.

use crate::config::QualityWeights;
use serde::{Deserialize, Serialize};

/// Response quality assessment for a single record.
///
/// `overall` is `None` when the classifier failed terminally; downstream
/// treats that as "not contributing". The skip sentinel (analysis disabled
/// or empty response) carries `overall = Some(1.0)` so it never trips the
/// quality threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    /// Logical coherence of the response, in [0, 1].
    pub coherence: Option<f64>,
    /// Relevance to the prompt, in [0, 1].
    pub relevance: Option<f64>,
    /// Completeness of the answer, in [0, 1].
    pub completeness: Option<f64>,
    /// Weighted mean of the sub-scores, in [0, 1]; `None` on failure.
    pub overall: Option<f64>,
    /// Free-form judge explanation.
    pub explanation: String,
}

impl QualityScore {
    /// Build a score from raw judge output, clamping each sub-score to
    /// [0, 1] and computing the weighted overall.
    pub fn scored(
        coherence: f64,
        relevance: f64,
        completeness: f64,
        weights: &QualityWeights,
        explanation: impl Into<String>,
    ) -> Self {
        let coherence = coherence.clamp(0.0, 1.0);
        let relevance = relevance.clamp(0.0, 1.0);
        let completeness = completeness.clamp(0.0, 1.0);
        let overall = weights.coherence * coherence
            + weights.relevance * relevance
            + weights.completeness * completeness;
        Self {
            coherence: Some(coherence),
            relevance: Some(relevance),
            completeness: Some(completeness),
            overall: Some(overall),
            explanation: explanation.into(),
        }
    }

    /// Sentinel for records that skip quality analysis entirely.
    pub fn skipped() -> Self {
        Self {
            coherence: None,
            relevance: None,
            completeness: None,
            overall: Some(1.0),
            explanation: "skipped".to_string(),
        }
    }

    /// Sentinel for terminal classifier failure; does not contribute to
    /// incident synthesis.
    pub fn unavailable(explanation: impl Into<String>) -> Self {
        Self {
            coherence: None,
            relevance: None,
            completeness: None,
            overall: None,
            explanation: explanation.into(),
        }
    }

    /// Whether this score counts as a below-threshold quality contributor.
    pub fn below_threshold(&self, min_overall: f64) -> bool {
        matches!(self.overall, Some(overall) if overall < min_overall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_is_weighted_mean() {
        let score = QualityScore::scored(0.9, 0.8, 0.7, &QualityWeights::default(), "good");
        let expected = 0.4 * 0.9 + 0.4 * 0.8 + 0.2 * 0.7;
        assert!((score.overall.unwrap() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_sub_scores_clamped() {
        let score = QualityScore::scored(1.7, -0.3, 0.5, &QualityWeights::default(), "");
        assert_eq!(score.coherence, Some(1.0));
        assert_eq!(score.relevance, Some(0.0));
        let expected = 0.4 * 1.0 + 0.4 * 0.0 + 0.2 * 0.5;
        assert!((score.overall.unwrap() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_skipped_never_contributes() {
        let score = QualityScore::skipped();
        assert_eq!(score.overall, Some(1.0));
        assert!(!score.below_threshold(0.7));
    }

    #[test]
    fn test_unavailable_never_contributes() {
        let score = QualityScore::unavailable("parse failure after retries");
        assert_eq!(score.overall, None);
        assert!(!score.below_threshold(0.7));
    }

    #[test]
    fn test_below_threshold() {
        let score = QualityScore::scored(0.4, 0.4, 0.4, &QualityWeights::default(), "weak");
        assert!(score.below_threshold(0.7));
        assert!(!score.below_threshold(0.3));
    }
}
