// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! The pipeline: intake, backpressure, worker pool, per-record fan-out.
//!
//! A bounded pool of workers pulls records from a FIFO queue fed by
//! [`Pipeline::submit`]. Each worker processes one record to completion:
//! the three analyzers run concurrently under the whole-record deadline,
//! the synthesizer merges whatever finished, metrics are emitted, and the
//! record (plus any incident) is persisted. Workers share only the
//! configuration, the anomaly baselines (behind per-window locks), the
//! dedup window, and the sinks.
//!
//! No failure in one record's analysis can fail another record; a panic is
//! caught, logged with its payload, and the worker moves on.

use crate::emitter::{names, Emitter, MetricsSink};
use crate::normalizer::{NormalizeOutcome, Normalizer};
use crate::store::{
    with_write_retries, IncidentFilter, RecordEnrichment, RecordStore, StoreError,
};
use crate::synthesizer::{synthesize, AnalysisOutputs};
use futures::FutureExt;
use llm_watchtower_analyzers::anomaly::dedupe_by_metric;
use llm_watchtower_analyzers::{AiClient, AnomalyDetector, QualityAnalyzer, ThreatAnalyzer};
use llm_watchtower_core::{
    Incident, IncidentStatus, PipelineConfig, QualityScore, TelemetryPayload, TelemetryRecord,
};
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Hard ceiling on incident query page size.
pub const MAX_QUERY_LIMIT: usize = 500;

/// Capacity of the incident/transition push channels.
const STREAM_CAPACITY: usize = 256;

/// Outcome of one submission call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubmitReceipt {
    /// Payloads accepted into the queue.
    pub accepted: usize,
    /// Per-payload rejections: original index plus reason.
    pub rejected: Vec<(usize, String)>,
}

/// Call-level submission failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmitError {
    /// The intake queue is saturated past `batch_size x 2`. Callers are
    /// expected to retry with backoff.
    #[error("pipeline overloaded, retry with backoff")]
    Overloaded,
}

/// A new incident on the push channel, tagged with a monotonic sequence.
#[derive(Debug, Clone, Serialize)]
pub struct SequencedIncident {
    /// Monotonic sequence number over the channel's lifetime.
    pub sequence: u64,
    /// The incident as created.
    pub incident: Incident,
}

/// A status transition on the push channel, tagged with a monotonic
/// sequence.
#[derive(Debug, Clone, Serialize)]
pub struct SequencedTransition {
    /// Monotonic sequence number over the channel's lifetime.
    pub sequence: u64,
    /// The incident that changed.
    pub incident_id: Uuid,
    /// Status before the change.
    pub from: IncidentStatus,
    /// Status after the change.
    pub to: IncidentStatus,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// The assembled analysis pipeline.
///
/// Construction wires the injected adapters (AI client, metrics sink,
/// record store) through every component and spawns the worker pool.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    normalizer: Normalizer,
    quality: QualityAnalyzer,
    threat: ThreatAnalyzer,
    anomaly: AnomalyDetector,
    emitter: Emitter,
    store: Arc<dyn RecordStore>,
    queue_tx: mpsc::Sender<TelemetryRecord>,
    pending: AtomicUsize,
    incident_seq: AtomicU64,
    transition_seq: AtomicU64,
    incidents_tx: broadcast::Sender<SequencedIncident>,
    transitions_tx: broadcast::Sender<SequencedTransition>,
    shutdown_token: CancellationToken,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Build the pipeline and spawn `max_concurrent_analyses` workers.
    pub fn new(
        config: Arc<PipelineConfig>,
        ai_client: Arc<dyn AiClient>,
        sink: Arc<dyn MetricsSink>,
        store: Arc<dyn RecordStore>,
    ) -> Arc<Self> {
        let queue_capacity = config.overload_watermark().max(1);
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity);
        let (incidents_tx, _) = broadcast::channel(STREAM_CAPACITY);
        let (transitions_tx, _) = broadcast::channel(STREAM_CAPACITY);

        let pipeline = Arc::new(Self {
            normalizer: Normalizer::new(Arc::clone(&config)),
            quality: QualityAnalyzer::new(Arc::clone(&ai_client), Arc::clone(&config)),
            threat: ThreatAnalyzer::new(ai_client, Arc::clone(&config)),
            anomaly: AnomalyDetector::new(Arc::clone(&config)),
            emitter: Emitter::new(sink, config.metrics_prefix.clone()),
            store,
            queue_tx,
            pending: AtomicUsize::new(0),
            incident_seq: AtomicU64::new(0),
            transition_seq: AtomicU64::new(0),
            incidents_tx,
            transitions_tx,
            shutdown_token: CancellationToken::new(),
            workers: std::sync::Mutex::new(Vec::new()),
            config,
        });

        let shared_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let mut handles = Vec::with_capacity(pipeline.config.max_concurrent_analyses);
        for worker_id in 0..pipeline.config.max_concurrent_analyses {
            handles.push(tokio::spawn(Self::worker_loop(
                Arc::clone(&pipeline),
                Arc::clone(&shared_rx),
                worker_id,
            )));
        }
        *pipeline.workers.lock().expect("worker registry poisoned") = handles;

        pipeline
    }

    /// Submit a batch of raw payload values.
    ///
    /// Every element ends exactly one way: accepted into the queue,
    /// rejected with an indexed reason, or flagged duplicate. A single bad
    /// record never rejects the batch; saturation past the watermark fails
    /// the whole call with [`SubmitError::Overloaded`].
    pub async fn submit(
        &self,
        payloads: Vec<serde_json::Value>,
    ) -> Result<SubmitReceipt, SubmitError> {
        if self.pending.load(Ordering::SeqCst) > self.config.overload_watermark() {
            return Err(SubmitError::Overloaded);
        }

        let mut receipt = SubmitReceipt::default();
        for (index, value) in payloads.into_iter().enumerate() {
            let payload = match serde_json::from_value::<TelemetryPayload>(value) {
                Ok(payload) => payload,
                Err(e) => {
                    self.emitter.counter(names::INGRESS_REJECTED, 1, Vec::new());
                    receipt.rejected.push((index, format!("malformed record: {e}")));
                    continue;
                }
            };

            match self.normalizer.normalize(payload) {
                Err(e) => {
                    self.emitter.counter(names::INGRESS_REJECTED, 1, Vec::new());
                    receipt.rejected.push((index, e.to_string()));
                }
                Ok(NormalizeOutcome::Duplicate) => {
                    self.emitter.counter(names::INGRESS_DUPLICATE, 1, Vec::new());
                    receipt.rejected.push((index, "duplicate".to_string()));
                }
                Ok(NormalizeOutcome::Fresh(record)) => match self.queue_tx.try_send(record) {
                    Ok(()) => {
                        self.pending.fetch_add(1, Ordering::SeqCst);
                        self.emitter.counter(names::INGRESS_ACCEPTED, 1, Vec::new());
                        receipt.accepted += 1;
                    }
                    Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                        return Err(SubmitError::Overloaded);
                    }
                },
            }
        }
        Ok(receipt)
    }

    /// Current intake queue depth.
    pub fn queue_depth(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Subscribe to newly created incidents.
    pub fn subscribe_incidents(&self) -> broadcast::Receiver<SequencedIncident> {
        self.incidents_tx.subscribe()
    }

    /// Subscribe to incident status transitions.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<SequencedTransition> {
        self.transitions_tx.subscribe()
    }

    /// Fetch an incident by id.
    pub async fn get_incident(&self, id: Uuid) -> Result<Option<Incident>, StoreError> {
        self.store.get_incident(id).await
    }

    /// Query incidents; `limit` is clamped to [`MAX_QUERY_LIMIT`].
    pub async fn query_incidents(
        &self,
        filter: &IncidentFilter,
        limit: usize,
    ) -> Result<Vec<Incident>, StoreError> {
        self.store
            .query_incidents(filter, limit.min(MAX_QUERY_LIMIT))
            .await
    }

    /// Drive the incident state machine.
    ///
    /// Idempotent re-applications return the incident unchanged without an
    /// event on the transition channel. Illegal transitions surface as
    /// [`StoreError::IllegalTransition`]; they are expected and not logged
    /// as errors.
    pub async fn transition_incident(
        &self,
        id: Uuid,
        to: IncidentStatus,
    ) -> Result<Incident, StoreError> {
        let current = self
            .store
            .get_incident(id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let from = current.status;
        let updated = self.store.update_incident_status(id, to).await?;
        if from != updated.status {
            let sequence = self.transition_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self.transitions_tx.send(SequencedTransition {
                sequence,
                incident_id: id,
                from,
                to: updated.status,
            });
            debug!(incident_id = %id, from = %from, to = %updated.status, "incident transition");
        }
        Ok(updated)
    }

    /// Stop accepting work and wait for the workers to finish their
    /// in-flight records.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("worker registry poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn worker_loop(
        pipeline: Arc<Pipeline>,
        queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TelemetryRecord>>>,
        worker_id: usize,
    ) {
        loop {
            let record = {
                let mut rx = queue_rx.lock().await;
                tokio::select! {
                    _ = pipeline.shutdown_token.cancelled() => None,
                    received = rx.recv() => received,
                }
            };
            let Some(record) = record else {
                debug!(worker = worker_id, "worker stopping");
                break;
            };
            pipeline.pending.fetch_sub(1, Ordering::SeqCst);

            let trace_id = record.trace_id.clone();
            if let Err(payload) = AssertUnwindSafe(pipeline.process(record))
                .catch_unwind()
                .await
            {
                // Programmer error: abort this record, keep the worker.
                error!(
                    worker = worker_id,
                    trace_id = %trace_id,
                    panic = %panic_message(payload),
                    "record processing panicked; continuing with next record"
                );
            }
        }
    }

    /// Process one record to completion: concurrent analyzer fan-out under
    /// the whole-record deadline, synthesis, emission, persistence.
    async fn process(&self, record: TelemetryRecord) {
        let record = Arc::new(record);
        let deadline = self.config.record_deadline();
        let cancel = CancellationToken::new();
        let deadline_timer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                cancel.cancel();
            })
        };

        let (quality_outcome, threat_outcome, mut anomalies) = tokio::join!(
            tokio::time::timeout(deadline, self.quality.analyze(&record, &cancel)),
            tokio::time::timeout(deadline, self.threat.analyze(&record, &cancel)),
            async { self.anomaly.observe(&record) },
        );
        deadline_timer.abort();
        cancel.cancel();

        let mut failed_analyzers: Vec<&'static str> = Vec::new();

        let quality = match quality_outcome {
            Ok(score) => score,
            Err(_) => {
                warn!(trace_id = %record.trace_id, "quality analyzer cancelled at record deadline");
                QualityScore::unavailable("record deadline exceeded")
            }
        };
        if quality.overall.is_none() {
            failed_analyzers.push("quality");
            self.emitter
                .counter(names::QUALITY_PARSE_FAILURES, 1, Vec::new());
        }

        let threats = match threat_outcome {
            Ok(analysis) => {
                if analysis.ai_degraded {
                    failed_analyzers.push("threat");
                }
                analysis.verdicts
            }
            Err(_) => {
                warn!(trace_id = %record.trace_id, "threat analyzer cancelled at record deadline");
                failed_analyzers.push("threat");
                Vec::new()
            }
        };

        // The quality baseline only learns from real judgments, never from
        // skip or failure sentinels.
        if quality.coherence.is_some() {
            if let Some(overall) = quality.overall {
                anomalies.extend(self.anomaly.observe_quality(record.ingested_at, overall));
                anomalies = dedupe_by_metric(anomalies);
            }
        }

        self.emitter.emit_record(&record, quality.overall);
        for verdict in &threats {
            self.emitter.emit_threat(verdict);
        }
        for anomaly in &anomalies {
            self.emitter.emit_anomaly(anomaly);
        }

        let outputs = AnalysisOutputs {
            quality: Some(quality),
            threats,
            anomalies,
            failed_analyzers,
        };

        let incident = if self.config.enable_incident_emission {
            synthesize(&self.config, &record, &outputs)
        } else {
            None
        };

        let enrichment = RecordEnrichment {
            quality: outputs.quality.clone(),
            threats: outputs.threats.clone(),
            anomalies: outputs.anomalies.clone(),
            partial: outputs.is_partial(),
        };

        let store = Arc::clone(&self.store);
        if let Err(err) = with_write_retries("put_record", || {
            let store = Arc::clone(&store);
            let record = Arc::clone(&record);
            let enrichment = enrichment.clone();
            async move { store.put_record(&record, &enrichment).await }
        })
        .await
        {
            self.emitter
                .counter(names::STORE_WRITE_FAILURES, 1, Vec::new());
            error!(trace_id = %record.trace_id, error = %err, "record write failed after retries");
        }

        if let Some(incident) = incident {
            if let Err(err) = with_write_retries("put_incident", || {
                let store = Arc::clone(&store);
                let incident = incident.clone();
                async move { store.put_incident(&incident).await }
            })
            .await
            {
                self.emitter
                    .counter(names::STORE_WRITE_FAILURES, 1, Vec::new());
                error!(incident_id = %incident.id, error = %err, "incident write failed after retries");
            }

            self.emitter.emit_incident(&incident);
            let sequence = self.incident_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self.incidents_tx.send(SequencedIncident {
                sequence,
                incident: incident.clone(),
            });
            info!(
                incident_id = %incident.id,
                trace_id = %record.trace_id,
                severity = %incident.severity,
                partial = incident.partial,
                "incident created"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::RecordingSink;
    use crate::store::InMemoryStore;
    use llm_watchtower_analyzers::StubAiClient;
    use std::time::Duration;

    fn benign_stub() -> Arc<StubAiClient> {
        Arc::new(StubAiClient::new(|prompt| {
            if prompt.contains("security analyst") {
                Ok(r#"{"kind": "none", "confidence": 0.99, "severity": "low", "indicators": []}"#
                    .to_string())
            } else {
                Ok(r#"{"coherence": 0.9, "relevance": 0.9, "completeness": 0.9, "explanation": "fine"}"#
                    .to_string())
            }
        }))
    }

    fn payload_value(trace_id: &str) -> serde_json::Value {
        serde_json::json!({
            "trace_id": trace_id,
            "ingested_at": "2025-06-01T12:00:00Z",
            "model_id": "gpt-4o-mini",
            "prompt": "Capital of France?",
            "response": "Paris.",
            "input_tokens": 5,
            "output_tokens": 1,
            "latency_ms": 400.0,
            "cost_usd": 0.0005
        })
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_submit_accepts_and_processes() {
        let store = Arc::new(InMemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::new(
            Arc::new(PipelineConfig::default()),
            benign_stub(),
            Arc::clone(&sink) as Arc<dyn MetricsSink>,
            Arc::clone(&store) as Arc<dyn RecordStore>,
        );

        let receipt = pipeline.submit(vec![payload_value("t1")]).await.unwrap();
        assert_eq!(receipt.accepted, 1);
        assert!(receipt.rejected.is_empty());

        wait_until(|| store.record_count() == 1).await;
        assert_eq!(sink.counter_total("watchtower.ingress.accepted"), 1);
        assert_eq!(sink.counter_total("watchtower.requests.total"), 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_record_does_not_reject_batch() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = Pipeline::new(
            Arc::new(PipelineConfig::default()),
            benign_stub(),
            Arc::new(RecordingSink::default()),
            Arc::clone(&store) as Arc<dyn RecordStore>,
        );

        let receipt = pipeline
            .submit(vec![
                payload_value("t1"),
                serde_json::json!({"trace_id": "t2"}),
                payload_value("t3"),
            ])
            .await
            .unwrap();
        assert_eq!(receipt.accepted, 2);
        assert_eq!(receipt.rejected.len(), 1);
        assert_eq!(receipt.rejected[0].0, 1);
        assert!(receipt.rejected[0].1.contains("malformed"));

        wait_until(|| store.record_count() == 2).await;
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_transition_stream_sequences() {
        let store = Arc::new(InMemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::new(
            Arc::new(PipelineConfig::default()),
            Arc::new(StubAiClient::new(|prompt| {
                if prompt.contains("security analyst") {
                    Ok(r#"{"kind": "prompt_injection", "confidence": 0.95, "severity": "high", "indicators": ["override"]}"#.to_string())
                } else {
                    Ok(r#"{"coherence": 0.9, "relevance": 0.9, "completeness": 0.9, "explanation": "fine"}"#.to_string())
                }
            })),
            Arc::clone(&sink) as Arc<dyn MetricsSink>,
            Arc::clone(&store) as Arc<dyn RecordStore>,
        );
        let mut incidents = pipeline.subscribe_incidents();
        let mut transitions = pipeline.subscribe_transitions();

        pipeline.submit(vec![payload_value("t1")]).await.unwrap();
        let created = tokio::time::timeout(Duration::from_secs(5), incidents.recv())
            .await
            .expect("incident stream timed out")
            .unwrap();
        assert_eq!(created.sequence, 1);

        let id = created.incident.id;
        pipeline
            .transition_incident(id, IncidentStatus::Acknowledged)
            .await
            .unwrap();
        // idempotent re-application emits no transition event
        pipeline
            .transition_incident(id, IncidentStatus::Acknowledged)
            .await
            .unwrap();
        pipeline
            .transition_incident(id, IncidentStatus::Resolved)
            .await
            .unwrap();

        let first = transitions.recv().await.unwrap();
        let second = transitions.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.to, IncidentStatus::Acknowledged);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.to, IncidentStatus::Resolved);
        assert!(transitions.try_recv().is_err());

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_limit_clamped() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = Pipeline::new(
            Arc::new(PipelineConfig::default()),
            benign_stub(),
            Arc::new(RecordingSink::default()),
            Arc::clone(&store) as Arc<dyn RecordStore>,
        );
        // no incidents stored; the call exercises the clamp path
        let results = pipeline
            .query_incidents(&IncidentFilter::default(), 10_000)
            .await
            .unwrap();
        assert!(results.is_empty());
        pipeline.shutdown().await;
    }
}
