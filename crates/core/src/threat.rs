// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! Threat verdicts produced by the threat classifier.

use crate::types::{Severity, ThreatKind, ThreatScope};
use serde::{Deserialize, Serialize};

/// Outcome of classifying one scope (prompt or response) of a record.
///
/// A record produces at most two verdicts, one per scope. Verdicts with
/// `kind == ThreatKind::None` are dropped before incident synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatVerdict {
    /// What was detected.
    pub kind: ThreatKind,
    /// Classifier confidence in [0, 1].
    pub confidence: f64,
    /// Severity assigned by the tie-break policy.
    pub severity: Severity,
    /// Ordered human-readable indicators (e.g. "SSN", matched phrases).
    pub indicators: Vec<String>,
    /// Which side of the exchange this verdict covers.
    pub scope: ThreatScope,
}

impl ThreatVerdict {
    /// The all-clear verdict for a scope.
    pub fn none(scope: ThreatScope) -> Self {
        Self {
            kind: ThreatKind::None,
            confidence: 1.0,
            severity: Severity::Low,
            indicators: Vec::new(),
            scope,
        }
    }

    /// Whether this verdict reports an actual threat.
    pub fn is_threat(&self) -> bool {
        self.kind != ThreatKind::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_verdict_is_not_a_threat() {
        let verdict = ThreatVerdict::none(ThreatScope::Prompt);
        assert!(!verdict.is_threat());
        assert_eq!(verdict.kind, ThreatKind::None);
    }

    #[test]
    fn test_verdict_serialization() {
        let verdict = ThreatVerdict {
            kind: ThreatKind::PiiLeak,
            confidence: 0.92,
            severity: Severity::High,
            indicators: vec!["SSN".to_string()],
            scope: ThreatScope::Response,
        };
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["kind"], "pii_leak");
        assert_eq!(json["scope"], "response");
        assert_eq!(json["severity"], "high");
    }
}
