// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! The injected record-store adapter.
//!
//! The core specifies at-most-once write semantics and, within a single
//! process, read-your-writes for status updates. Write failures are retried
//! with exponential backoff; exhaustion is counted and logged, never
//! re-raised out of the pipeline. The backing store is left to the adapter:
//! [`InMemoryStore`] ships for tests and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use llm_watchtower_core::{
    Anomaly, Incident, IncidentStatus, QualityScore, Severity, TelemetryRecord, ThreatVerdict,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Persistence failure.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The referenced incident does not exist.
    #[error("incident {0} not found")]
    NotFound(Uuid),

    /// A write could not be applied.
    #[error("store write failed: {0}")]
    WriteFailed(String),

    /// The requested status change violates the incident state machine.
    /// A policy error: surfaced to the caller, never logged at error level.
    #[error(transparent)]
    IllegalTransition(#[from] llm_watchtower_core::TransitionError),
}

/// Analyzer outputs persisted alongside a record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordEnrichment {
    /// Quality score, including null-overall failure sentinels.
    pub quality: Option<QualityScore>,
    /// Threat verdicts with `kind != none`.
    pub threats: Vec<ThreatVerdict>,
    /// Deduplicated anomalies.
    pub anomalies: Vec<Anomaly>,
    /// True when at least one analyzer failed terminally.
    pub partial: bool,
}

/// Query filter for [`RecordStore::query_incidents`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentFilter {
    /// Match a specific lifecycle status.
    pub status: Option<IncidentStatus>,
    /// Match a specific severity.
    pub severity: Option<Severity>,
    /// Only incidents created at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

impl IncidentFilter {
    fn matches(&self, incident: &Incident) -> bool {
        self.status.map_or(true, |s| incident.status == s)
            && self.severity.map_or(true, |s| incident.severity == s)
            && self.since.map_or(true, |t| incident.created_at >= t)
    }
}

/// The injected persistence interface.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist an enriched record.
    async fn put_record(
        &self,
        record: &TelemetryRecord,
        enrichment: &RecordEnrichment,
    ) -> Result<(), StoreError>;

    /// Persist a new incident.
    async fn put_incident(&self, incident: &Incident) -> Result<(), StoreError>;

    /// Fetch an incident by id.
    async fn get_incident(&self, id: Uuid) -> Result<Option<Incident>, StoreError>;

    /// Apply a status change and return the updated incident.
    ///
    /// Idempotent: re-applying the current status returns the incident
    /// unchanged. Illegal transitions fail with
    /// [`StoreError::IllegalTransition`].
    async fn update_incident_status(
        &self,
        id: Uuid,
        new_status: IncidentStatus,
    ) -> Result<Incident, StoreError>;

    /// Query incidents matching a filter, newest first, at most `limit`.
    async fn query_incidents(
        &self,
        filter: &IncidentFilter,
        limit: usize,
    ) -> Result<Vec<Incident>, StoreError>;
}

/// Retry a store write: three retries after the initial attempt, doubling
/// backoff from 100 ms. Returns the last error on exhaustion; the caller
/// counts and logs it.
pub async fn with_write_retries<F, Fut>(label: &str, mut op: F) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    const RETRIES: u32 = 3;
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < RETRIES => {
                let delay = Duration::from_millis(100) * (1 << attempt);
                debug!(op = label, attempt, error = %err, "retrying store write");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Concurrent in-memory store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: DashMap<String, (TelemetryRecord, RecordEnrichment)>,
    incidents: DashMap<Uuid, Incident>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a stored record and its enrichment by trace id.
    pub fn get_record(&self, trace_id: &str) -> Option<(TelemetryRecord, RecordEnrichment)> {
        self.records.get(trace_id).map(|entry| entry.value().clone())
    }

    /// Number of stored records.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Number of stored incidents.
    pub fn incident_count(&self) -> usize {
        self.incidents.len()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn put_record(
        &self,
        record: &TelemetryRecord,
        enrichment: &RecordEnrichment,
    ) -> Result<(), StoreError> {
        self.records
            .insert(record.trace_id.clone(), (record.clone(), enrichment.clone()));
        Ok(())
    }

    async fn put_incident(&self, incident: &Incident) -> Result<(), StoreError> {
        self.incidents.insert(incident.id, incident.clone());
        Ok(())
    }

    async fn get_incident(&self, id: Uuid) -> Result<Option<Incident>, StoreError> {
        Ok(self.incidents.get(&id).map(|entry| entry.value().clone()))
    }

    async fn update_incident_status(
        &self,
        id: Uuid,
        new_status: IncidentStatus,
    ) -> Result<Incident, StoreError> {
        let mut entry = self.incidents.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        entry.transition(new_status)?;
        Ok(entry.value().clone())
    }

    async fn query_incidents(
        &self,
        filter: &IncidentFilter,
        limit: usize,
    ) -> Result<Vec<Incident>, StoreError> {
        let mut matched: Vec<Incident> = self
            .incidents
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        // UUIDv7 ids sort by creation time; newest first
        matched.sort_by(|a, b| b.id.cmp(&a.id));
        matched.truncate(limit);
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn incident_at(seconds: i64, severity: Severity) -> Incident {
        let at = Utc.timestamp_opt(1_750_000_000 + seconds, 0).unwrap();
        Incident {
            id: Incident::id_for(at),
            trace_id: format!("t{seconds}"),
            created_at: at,
            severity,
            status: IncidentStatus::Open,
            threats: Vec::new(),
            anomalies: vec![Anomaly::absolute(
                llm_watchtower_core::AnomalyMetric::Latency,
                9000.0,
                100.0,
                10.0,
                severity,
            )],
            quality: None,
            summary: "latency absolute".to_string(),
            partial: false,
        }
    }

    fn record() -> TelemetryRecord {
        TelemetryRecord {
            trace_id: "t1".to_string(),
            ingested_at: Utc::now(),
            model_id: "gpt-4o-mini".to_string(),
            prompt: "p".to_string(),
            response: "r".to_string(),
            input_tokens: 1,
            output_tokens: 1,
            latency_ms: 10.0,
            cost_usd: 0.0001,
            error_occurred: false,
            user_id: "anonymous".to_string(),
            session_id: None,
            tags: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_put_and_get_record() {
        let store = InMemoryStore::new();
        store
            .put_record(&record(), &RecordEnrichment::default())
            .await
            .unwrap();
        assert_eq!(store.record_count(), 1);
        assert!(store.get_record("t1").is_some());
        assert!(store.get_record("missing").is_none());
    }

    #[tokio::test]
    async fn test_status_update_read_your_writes() {
        let store = InMemoryStore::new();
        let incident = incident_at(0, Severity::High);
        let id = incident.id;
        store.put_incident(&incident).await.unwrap();

        let updated = store
            .update_incident_status(id, IncidentStatus::Acknowledged)
            .await
            .unwrap();
        assert_eq!(updated.status, IncidentStatus::Acknowledged);

        let fetched = store.get_incident(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, IncidentStatus::Acknowledged);
    }

    #[tokio::test]
    async fn test_status_update_idempotent() {
        let store = InMemoryStore::new();
        let incident = incident_at(0, Severity::High);
        let id = incident.id;
        store.put_incident(&incident).await.unwrap();

        store
            .update_incident_status(id, IncidentStatus::Open)
            .await
            .unwrap();
        let fetched = store.get_incident(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, IncidentStatus::Open);
    }

    #[tokio::test]
    async fn test_illegal_transition_surfaces() {
        let store = InMemoryStore::new();
        let incident = incident_at(0, Severity::High);
        let id = incident.id;
        store.put_incident(&incident).await.unwrap();

        let err = store
            .update_incident_status(id, IncidentStatus::Resolved)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition(_)));
    }

    #[tokio::test]
    async fn test_update_missing_incident() {
        let store = InMemoryStore::new();
        let err = store
            .update_incident_status(Uuid::new_v4(), IncidentStatus::Acknowledged)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_query_filters_and_orders_newest_first() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store
                .put_incident(&incident_at(
                    i,
                    if i % 2 == 0 {
                        Severity::High
                    } else {
                        Severity::Low
                    },
                ))
                .await
                .unwrap();
        }

        let all = store
            .query_incidents(&IncidentFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].id > w[1].id));

        let high = store
            .query_incidents(
                &IncidentFilter {
                    severity: Some(Severity::High),
                    ..IncidentFilter::default()
                },
                10,
            )
            .await
            .unwrap();
        assert_eq!(high.len(), 3);

        let limited = store
            .query_incidents(&IncidentFilter::default(), 2)
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);

        let since = store
            .query_incidents(
                &IncidentFilter {
                    since: Some(Utc.timestamp_opt(1_750_000_003, 0).unwrap()),
                    ..IncidentFilter::default()
                },
                10,
            )
            .await
            .unwrap();
        assert_eq!(since.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_write_retries("put_record", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::WriteFailed("transient".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_retries_exhaust() {
        let calls = AtomicU32::new(0);
        let result = with_write_retries("put_incident", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::WriteFailed("down".to_string())) }
        })
        .await;
        assert!(result.is_err());
        // initial attempt + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_mock_store_substitutes_without_patching() {
        let mut mock = MockRecordStore::new();
        mock.expect_put_incident().returning(|_| Ok(()));
        mock.expect_get_incident().returning(|id| {
            let _ = id;
            Ok(None)
        });
        mock.put_incident(&incident_at(0, Severity::Low)).await.unwrap();
        assert!(mock.get_incident(Uuid::new_v4()).await.unwrap().is_none());
    }
}
