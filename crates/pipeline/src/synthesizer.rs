// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! Incident synthesis: deciding whether analyzer outputs warrant an
//! incident and assembling one.
//!
//! Synthesis is a pure function of its inputs. Given the same record and
//! the same analyzer outputs it produces the same incident, summary
//! included; only the id tail is random (the prefix is seeded from
//! `ingested_at`).

use llm_watchtower_core::{
    Anomaly, AnomalyMetric, AnomalyTrigger, Incident, IncidentStatus, PipelineConfig,
    QualityScore, Severity, TelemetryRecord, ThreatKind, ThreatVerdict,
};

/// Everything the analyzers produced for one record.
#[derive(Debug, Clone, Default)]
pub struct AnalysisOutputs {
    /// Quality score as produced; `None` only when the analyzer never ran
    /// (deadline expiry before completion).
    pub quality: Option<QualityScore>,
    /// Threat verdicts with `kind != none`.
    pub threats: Vec<ThreatVerdict>,
    /// Deduplicated anomalies.
    pub anomalies: Vec<Anomaly>,
    /// Names of analyzers that failed terminally for this record.
    pub failed_analyzers: Vec<&'static str>,
}

impl AnalysisOutputs {
    /// Whether any analyzer failed terminally.
    pub fn is_partial(&self) -> bool {
        !self.failed_analyzers.is_empty()
    }
}

/// Severity credited to a below-threshold quality contributor.
///
/// Matches the absolute quality anomaly trigger so the two detection paths
/// agree on urgency.
const QUALITY_CONTRIBUTOR_SEVERITY: Severity = Severity::High;

/// How many contributors feed the summary.
const SUMMARY_TOP_CONTRIBUTORS: usize = 3;

fn quality_contributes(config: &PipelineConfig, quality: Option<&QualityScore>) -> bool {
    quality.map_or(false, |q| q.below_threshold(config.quality_min_overall))
}

/// Compute the incident severity: maximum over contributors, then the
/// promotion rules.
fn decide_severity(outputs: &AnalysisOutputs, quality_contributed: bool) -> Severity {
    let mut severities: Vec<Severity> = outputs
        .threats
        .iter()
        .map(|t| t.severity)
        .chain(outputs.anomalies.iter().map(|a| a.severity))
        .collect();
    // A quality anomaly and the below-threshold score are the same root
    // cause; only count the score when no quality anomaly is present.
    let has_quality_anomaly = outputs
        .anomalies
        .iter()
        .any(|a| a.metric == AnomalyMetric::Quality);
    if quality_contributed && !has_quality_anomaly {
        severities.push(QUALITY_CONTRIBUTOR_SEVERITY);
    }

    let mut severity = severities.iter().copied().max().unwrap_or(Severity::Low);

    // Two or more distinct high-severity contributors escalate.
    let high_count = severities.iter().filter(|s| **s == Severity::High).count();
    if high_count >= 2 {
        severity = severity.max(Severity::Critical);
    }

    // An absolute cost anomaly paired with prompt injection reads as
    // active abuse of a paid model.
    let cost_absolute = outputs.anomalies.iter().any(|a| {
        a.metric == AnomalyMetric::Cost && a.trigger == AnomalyTrigger::Absolute
    });
    let injection = outputs
        .threats
        .iter()
        .any(|t| t.kind == ThreatKind::PromptInjection);
    if cost_absolute && injection {
        severity = Severity::Critical;
    }

    severity
}

fn threat_indicator(verdict: &ThreatVerdict) -> String {
    if verdict.indicators.is_empty() {
        verdict.kind.to_string()
    } else {
        format!("{}: {}", verdict.kind, verdict.indicators.join(", "))
    }
}

/// Build the deterministic summary: the top contributors' indicator
/// strings, threats ordered by kind (then scope), then anomalies by
/// metric, then the quality shortfall; partial incidents note which
/// analyzers contributed nothing.
fn build_summary(
    outputs: &AnalysisOutputs,
    quality_contributed: bool,
) -> String {
    let mut threats = outputs.threats.clone();
    threats.sort_by(|a, b| {
        a.kind
            .as_str()
            .cmp(b.kind.as_str())
            .then(a.scope.as_str().cmp(b.scope.as_str()))
    });

    let mut anomalies = outputs.anomalies.clone();
    anomalies.sort_by(|a, b| a.metric.as_str().cmp(b.metric.as_str()));

    let mut contributors: Vec<String> = threats.iter().map(threat_indicator).collect();
    contributors.extend(anomalies.iter().map(Anomaly::indicator));
    if quality_contributed {
        if let Some(overall) = outputs.quality.as_ref().and_then(|q| q.overall) {
            contributors.push(format!("quality below threshold: overall {overall:.2}"));
        }
    }
    contributors.truncate(SUMMARY_TOP_CONTRIBUTORS);

    let mut summary = contributors.join("; ");
    if outputs.is_partial() {
        summary.push_str(&format!(
            " [partial: {} contributed nothing]",
            outputs.failed_analyzers.join(", ")
        ));
    }
    summary
}

/// Assemble an incident if the outputs warrant one.
///
/// An incident is created iff at least one threat verdict, at least one
/// anomaly, or a below-threshold quality score is present. Incidents never
/// exist without cause.
pub fn synthesize(
    config: &PipelineConfig,
    record: &TelemetryRecord,
    outputs: &AnalysisOutputs,
) -> Option<Incident> {
    let quality_contributed = quality_contributes(config, outputs.quality.as_ref());
    let has_cause =
        !outputs.threats.is_empty() || !outputs.anomalies.is_empty() || quality_contributed;
    if !has_cause {
        return None;
    }

    let severity = decide_severity(outputs, quality_contributed);
    let summary = build_summary(outputs, quality_contributed);

    Some(Incident {
        id: Incident::id_for(record.ingested_at),
        trace_id: record.trace_id.clone(),
        created_at: record.ingested_at,
        severity,
        status: IncidentStatus::Open,
        threats: outputs.threats.clone(),
        anomalies: outputs.anomalies.clone(),
        quality: if quality_contributed {
            outputs.quality.clone()
        } else {
            None
        },
        summary,
        partial: outputs.is_partial(),
    })
}
