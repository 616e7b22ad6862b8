// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sealed enumerations shared across the pipeline.
//!
//! These are part of the wire contract: every value is a closed set and
//! unknown strings are rejected at deserialization time rather than carried
//! through as free-form text.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity level for threats, anomalies, and incidents.
///
/// Ordered: `Low < Medium < High < Critical`. Incident severity is computed
/// as a maximum over contributors, so the ordering is load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational; surfaced but rarely actionable on its own.
    Low,
    /// Worth attention within normal operations.
    Medium,
    /// Requires prompt attention.
    High,
    /// Requires immediate attention.
    Critical,
}

impl Severity {
    /// Map a statistical z-score to a severity level.
    ///
    /// `|z| >= 5` is critical, `>= 4` high, `>= 3.5` medium, anything that
    /// crossed the detection threshold at all is low.
    pub fn from_z_score(z: f64) -> Self {
        let abs_z = z.abs();
        if abs_z >= 5.0 {
            Self::Critical
        } else if abs_z >= 4.0 {
            Self::High
        } else if abs_z >= 3.5 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of threat a [`crate::ThreatVerdict`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    /// No threat detected.
    None,
    /// Attempt to override or exfiltrate system instructions.
    PromptInjection,
    /// Attempt to bypass model safety policies.
    Jailbreak,
    /// Personally identifiable information present in the text.
    PiiLeak,
    /// Toxic or abusive content.
    ToxicContent,
}

impl ThreatKind {
    /// Stable snake_case name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::PromptInjection => "prompt_injection",
            Self::Jailbreak => "jailbreak",
            Self::PiiLeak => "pii_leak",
            Self::ToxicContent => "toxic_content",
        }
    }
}

impl fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the exchange a threat verdict applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatScope {
    /// The user-supplied prompt.
    Prompt,
    /// The model response.
    Response,
}

impl ThreatScope {
    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::Response => "response",
        }
    }
}

impl fmt::Display for ThreatScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The metric dimension an [`crate::Anomaly`] was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyMetric {
    /// Per-request cost in USD.
    Cost,
    /// Response latency in milliseconds.
    Latency,
    /// Overall quality score.
    Quality,
    /// Error rate over the rolling counter bucket.
    ErrorRate,
    /// Total tokens per request.
    TokenRate,
    /// Requests per time window.
    RequestRate,
}

impl AnomalyMetric {
    /// Stable snake_case name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cost => "cost",
            Self::Latency => "latency",
            Self::Quality => "quality",
            Self::ErrorRate => "error_rate",
            Self::TokenRate => "token_rate",
            Self::RequestRate => "request_rate",
        }
    }
}

impl fmt::Display for AnomalyMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an anomaly was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyTrigger {
    /// A fixed threshold was crossed, independent of history.
    Absolute,
    /// The z-score against the rolling baseline exceeded the threshold.
    Statistical,
}

impl AnomalyTrigger {
    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absolute => "absolute",
            Self::Statistical => "statistical",
        }
    }
}

impl fmt::Display for AnomalyTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an [`crate::Incident`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    /// Newly created, unhandled.
    Open,
    /// A human has taken ownership.
    Acknowledged,
    /// Handling is complete.
    Resolved,
}

impl IncidentStatus {
    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
