// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! The incident artifact and its status state machine.
//!
//! An incident never exists without cause: synthesis only creates one when
//! at least one threat, anomaly, or below-threshold quality score is
//! present. The status machine allows exactly two transitions,
//! `open -> acknowledged` and `acknowledged -> resolved`; re-applying the
//! current status is an idempotent no-op.

use crate::anomaly::Anomaly;
use crate::quality::QualityScore;
use crate::threat::ThreatVerdict;
use crate::types::{IncidentStatus, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::{NoContext, Timestamp, Uuid};

/// Rejected incident status change.
///
/// This is a policy error: it is surfaced to the caller and expected during
/// normal operation, so it is never logged at error level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal incident transition: {from} -> {to}")]
pub struct TransitionError {
    /// Status the incident was in.
    pub from: IncidentStatus,
    /// Status the caller asked for.
    pub to: IncidentStatus,
}

/// A synthesized incident: one or more enrichment findings judged worth
/// surfacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    /// Lexicographically sortable identifier seeded from the record's
    /// `ingested_at` timestamp (UUIDv7: timestamp prefix, random tail).
    pub id: Uuid,
    /// Trace the incident was synthesized from. Incidents reference records
    /// by id only; records hold no back-references.
    pub trace_id: String,
    /// When synthesis created the incident.
    pub created_at: DateTime<Utc>,
    /// Maximum contributor severity, after promotion rules.
    pub severity: Severity,
    /// Lifecycle status.
    pub status: IncidentStatus,
    /// Contributing threat verdicts (kind != none only).
    pub threats: Vec<ThreatVerdict>,
    /// Contributing anomalies, deduplicated per metric.
    pub anomalies: Vec<Anomaly>,
    /// Quality score, present iff it contributed.
    pub quality: Option<QualityScore>,
    /// Deterministic digest of the top contributors.
    pub summary: String,
    /// True when at least one analyzer failed terminally for this record.
    pub partial: bool,
}

impl Incident {
    /// Generate a time-ordered incident id from the record timestamp.
    ///
    /// The UUIDv7 layout puts the millisecond timestamp in the most
    /// significant bits, so ids sort lexicographically by `ingested_at`;
    /// the tail is random.
    pub fn id_for(ingested_at: DateTime<Utc>) -> Uuid {
        let seconds = ingested_at.timestamp().max(0) as u64;
        let nanos = ingested_at.timestamp_subsec_nanos();
        Uuid::new_v7(Timestamp::from_unix(NoContext, seconds, nanos))
    }

    /// Apply a status change.
    ///
    /// Returns `Ok(true)` when the status changed, `Ok(false)` for an
    /// idempotent re-application of the current status, and
    /// [`TransitionError`] for anything else.
    pub fn transition(&mut self, to: IncidentStatus) -> Result<bool, TransitionError> {
        if self.status == to {
            return Ok(false);
        }
        let legal = matches!(
            (self.status, to),
            (IncidentStatus::Open, IncidentStatus::Acknowledged)
                | (IncidentStatus::Acknowledged, IncidentStatus::Resolved)
        );
        if !legal {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(true)
    }

    /// Number of contributors backing this incident.
    pub fn contributor_count(&self) -> usize {
        self.threats.len() + self.anomalies.len() + usize::from(self.quality.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ThreatKind, ThreatScope};
    use chrono::TimeZone;

    fn sample_incident() -> Incident {
        let ingested_at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        Incident {
            id: Incident::id_for(ingested_at),
            trace_id: "t1".to_string(),
            created_at: ingested_at,
            severity: Severity::High,
            status: IncidentStatus::Open,
            threats: vec![ThreatVerdict {
                kind: ThreatKind::PromptInjection,
                confidence: 0.9,
                severity: Severity::High,
                indicators: vec!["ignore all previous instructions".to_string()],
                scope: ThreatScope::Prompt,
            }],
            anomalies: Vec::new(),
            quality: None,
            summary: "prompt_injection: ignore all previous instructions".to_string(),
            partial: false,
        }
    }

    #[test]
    fn test_id_sorts_by_ingested_at() {
        let early = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 1).unwrap();
        let a = Incident::id_for(early).to_string();
        let b = Incident::id_for(late).to_string();
        assert!(a < b);
    }

    #[test]
    fn test_legal_transitions() {
        let mut incident = sample_incident();
        assert_eq!(incident.transition(IncidentStatus::Acknowledged), Ok(true));
        assert_eq!(incident.status, IncidentStatus::Acknowledged);
        assert_eq!(incident.transition(IncidentStatus::Resolved), Ok(true));
        assert_eq!(incident.status, IncidentStatus::Resolved);
    }

    #[test]
    fn test_reapplying_current_status_is_noop() {
        let mut incident = sample_incident();
        assert_eq!(incident.transition(IncidentStatus::Open), Ok(false));
        assert_eq!(incident.status, IncidentStatus::Open);

        incident.transition(IncidentStatus::Acknowledged).unwrap();
        assert_eq!(incident.transition(IncidentStatus::Acknowledged), Ok(false));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut incident = sample_incident();
        let err = incident.transition(IncidentStatus::Resolved).unwrap_err();
        assert_eq!(err.from, IncidentStatus::Open);
        assert_eq!(err.to, IncidentStatus::Resolved);
        // status unchanged after rejection
        assert_eq!(incident.status, IncidentStatus::Open);

        incident.transition(IncidentStatus::Acknowledged).unwrap();
        assert!(incident.transition(IncidentStatus::Open).is_err());

        incident.transition(IncidentStatus::Resolved).unwrap();
        assert!(incident.transition(IncidentStatus::Open).is_err());
        assert!(incident.transition(IncidentStatus::Acknowledged).is_err());
    }

    #[test]
    fn test_contributor_count() {
        let incident = sample_incident();
        assert_eq!(incident.contributor_count(), 1);
    }
}
