// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! Best-effort metric and event emission.
//!
//! The sink interface is narrow: counters, gauges, histograms, and events.
//! Emission never blocks or fails record processing — every sink failure is
//! swallowed after a warn-level log. Metric names form a stable wire
//! contract under a per-deployment namespace prefix.

use llm_watchtower_core::{Anomaly, Incident, Severity, TelemetryRecord, ThreatVerdict};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::warn;

/// Metric name suffixes forming the stable wire contract.
pub mod names {
    /// Records entering analysis.
    pub const REQUESTS_TOTAL: &str = "requests.total";
    /// Records whose observed request failed.
    pub const REQUESTS_ERRORS: &str = "requests.errors";
    /// Response latency distribution (ms).
    pub const LATENCY_RESPONSE_TIME: &str = "latency.response_time";
    /// Per-request cost distribution (USD).
    pub const COST_TOTAL: &str = "cost.total";
    /// Overall quality score distribution.
    pub const QUALITY_OVERALL_SCORE: &str = "quality.overall_score";
    /// Threat verdicts, tagged kind/severity/scope.
    pub const THREATS_DETECTED: &str = "threats.detected";
    /// Anomalies, tagged metric/trigger/severity.
    pub const ANOMALIES_DETECTED: &str = "anomalies.detected";
    /// Incidents created, tagged severity.
    pub const INCIDENTS_CREATED: &str = "incidents.created";
    /// Payloads accepted at ingress.
    pub const INGRESS_ACCEPTED: &str = "ingress.accepted";
    /// Payloads rejected at ingress.
    pub const INGRESS_REJECTED: &str = "ingress.rejected";
    /// Duplicate submissions short-circuited by the dedup window.
    pub const INGRESS_DUPLICATE: &str = "ingress.duplicate";
    /// Quality judgments lost to terminal parse/service failure.
    pub const QUALITY_PARSE_FAILURES: &str = "quality.parse_failures";
    /// Store writes lost after retry exhaustion.
    pub const STORE_WRITE_FAILURES: &str = "store.write_failures";
}

/// Failure inside a sink implementation.
#[derive(Debug, Clone, Error)]
#[error("sink failure: {0}")]
pub struct SinkError(pub String);

/// Label set attached to an emission.
pub type Tags = Vec<(String, String)>;

/// The injected outbound telemetry interface.
///
/// Implementations must be safe for concurrent use; the pipeline calls the
/// sink from every worker.
pub trait MetricsSink: Send + Sync {
    /// Increment a monotonic counter.
    fn counter(&self, name: &str, value: u64, tags: &Tags) -> Result<(), SinkError>;
    /// Set a point-in-time gauge.
    fn gauge(&self, name: &str, value: f64, tags: &Tags) -> Result<(), SinkError>;
    /// Record a distribution sample.
    fn histogram(&self, name: &str, value: f64, tags: &Tags) -> Result<(), SinkError>;
    /// Publish a discrete event.
    fn event(
        &self,
        title: &str,
        body: &str,
        severity: Severity,
        tags: &Tags,
    ) -> Result<(), SinkError>;
}

/// Bridge to the `metrics` crate facade; the service installs a Prometheus
/// exporter behind it.
#[derive(Debug, Default)]
pub struct MetricsRsSink;

fn to_labels(tags: &Tags) -> Vec<metrics::Label> {
    tags.iter()
        .map(|(k, v)| metrics::Label::new(k.clone(), v.clone()))
        .collect()
}

impl MetricsSink for MetricsRsSink {
    fn counter(&self, name: &str, value: u64, tags: &Tags) -> Result<(), SinkError> {
        metrics::counter!(name.to_string(), to_labels(tags)).increment(value);
        Ok(())
    }

    fn gauge(&self, name: &str, value: f64, tags: &Tags) -> Result<(), SinkError> {
        metrics::gauge!(name.to_string(), to_labels(tags)).set(value);
        Ok(())
    }

    fn histogram(&self, name: &str, value: f64, tags: &Tags) -> Result<(), SinkError> {
        metrics::histogram!(name.to_string(), to_labels(tags)).record(value);
        Ok(())
    }

    fn event(
        &self,
        title: &str,
        _body: &str,
        severity: Severity,
        tags: &Tags,
    ) -> Result<(), SinkError> {
        // The metrics facade has no event primitive; events surface as a
        // tagged counter.
        let mut tags = tags.clone();
        tags.push(("title".to_string(), title.to_string()));
        tags.push(("severity".to_string(), severity.to_string()));
        metrics::counter!("events".to_string(), to_labels(&tags)).increment(1);
        Ok(())
    }
}

/// Sink that drops everything. Useful when no exporter is configured.
#[derive(Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn counter(&self, _: &str, _: u64, _: &Tags) -> Result<(), SinkError> {
        Ok(())
    }
    fn gauge(&self, _: &str, _: f64, _: &Tags) -> Result<(), SinkError> {
        Ok(())
    }
    fn histogram(&self, _: &str, _: f64, _: &Tags) -> Result<(), SinkError> {
        Ok(())
    }
    fn event(&self, _: &str, _: &str, _: Severity, _: &Tags) -> Result<(), SinkError> {
        Ok(())
    }
}

/// One captured emission, as recorded by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    /// A counter increment.
    Counter(String, u64, Tags),
    /// A gauge set.
    Gauge(String, f64, Tags),
    /// A histogram sample.
    Histogram(String, f64, Tags),
    /// An event publication.
    Event(String, Severity, Tags),
}

/// In-memory sink capturing every emission, for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    emissions: Mutex<Vec<Emission>>,
}

impl RecordingSink {
    /// Snapshot of everything emitted so far.
    pub fn emissions(&self) -> Vec<Emission> {
        self.emissions.lock().expect("recording sink poisoned").clone()
    }

    /// Sum of counter increments for a metric name.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.emissions()
            .iter()
            .filter_map(|e| match e {
                Emission::Counter(n, v, _) if n == name => Some(*v),
                _ => None,
            })
            .sum()
    }

    /// Counter increments for a name carrying a specific tag.
    pub fn counter_with_tag(&self, name: &str, key: &str, value: &str) -> u64 {
        self.emissions()
            .iter()
            .filter_map(|e| match e {
                Emission::Counter(n, v, tags)
                    if n == name && tags.iter().any(|(k, val)| k == key && val == value) =>
                {
                    Some(*v)
                }
                _ => None,
            })
            .sum()
    }

    /// Histogram samples recorded for a name.
    pub fn histogram_values(&self, name: &str) -> Vec<f64> {
        self.emissions()
            .iter()
            .filter_map(|e| match e {
                Emission::Histogram(n, v, _) if n == name => Some(*v),
                _ => None,
            })
            .collect()
    }
}

impl MetricsSink for RecordingSink {
    fn counter(&self, name: &str, value: u64, tags: &Tags) -> Result<(), SinkError> {
        self.emissions
            .lock()
            .expect("recording sink poisoned")
            .push(Emission::Counter(name.to_string(), value, tags.clone()));
        Ok(())
    }

    fn gauge(&self, name: &str, value: f64, tags: &Tags) -> Result<(), SinkError> {
        self.emissions
            .lock()
            .expect("recording sink poisoned")
            .push(Emission::Gauge(name.to_string(), value, tags.clone()));
        Ok(())
    }

    fn histogram(&self, name: &str, value: f64, tags: &Tags) -> Result<(), SinkError> {
        self.emissions
            .lock()
            .expect("recording sink poisoned")
            .push(Emission::Histogram(name.to_string(), value, tags.clone()));
        Ok(())
    }

    fn event(
        &self,
        title: &str,
        _body: &str,
        severity: Severity,
        tags: &Tags,
    ) -> Result<(), SinkError> {
        self.emissions
            .lock()
            .expect("recording sink poisoned")
            .push(Emission::Event(title.to_string(), severity, tags.clone()));
        Ok(())
    }
}

/// Prefixing, failure-swallowing wrapper around the injected sink.
#[derive(Clone)]
pub struct Emitter {
    sink: Arc<dyn MetricsSink>,
    prefix: String,
}

impl Emitter {
    /// Wrap a sink under the deployment's namespace prefix.
    pub fn new(sink: Arc<dyn MetricsSink>, prefix: impl Into<String>) -> Self {
        Self {
            sink,
            prefix: prefix.into(),
        }
    }

    fn name(&self, suffix: &str) -> String {
        format!("{}.{}", self.prefix, suffix)
    }

    /// Increment a counter; failures are logged and swallowed.
    pub fn counter(&self, suffix: &str, value: u64, tags: Tags) {
        let name = self.name(suffix);
        if let Err(e) = self.sink.counter(&name, value, &tags) {
            warn!(metric = %name, error = %e, "metric emission failed");
        }
    }

    /// Record a histogram sample; failures are logged and swallowed.
    pub fn histogram(&self, suffix: &str, value: f64, tags: Tags) {
        let name = self.name(suffix);
        if let Err(e) = self.sink.histogram(&name, value, &tags) {
            warn!(metric = %name, error = %e, "metric emission failed");
        }
    }

    /// Set a gauge; failures are logged and swallowed.
    pub fn gauge(&self, suffix: &str, value: f64, tags: Tags) {
        let name = self.name(suffix);
        if let Err(e) = self.sink.gauge(&name, value, &tags) {
            warn!(metric = %name, error = %e, "metric emission failed");
        }
    }

    /// Publish an event; failures are logged and swallowed.
    pub fn event(&self, title: &str, body: &str, severity: Severity, tags: Tags) {
        if let Err(e) = self.sink.event(title, body, severity, &tags) {
            warn!(event = title, error = %e, "event emission failed");
        }
    }

    /// Per-record metrics: request, error, latency, cost, quality.
    pub fn emit_record(&self, record: &TelemetryRecord, quality_overall: Option<f64>) {
        let model_tag = vec![("model".to_string(), record.model_id.clone())];
        self.counter(names::REQUESTS_TOTAL, 1, model_tag.clone());
        if record.error_occurred {
            self.counter(names::REQUESTS_ERRORS, 1, model_tag.clone());
        }
        self.histogram(names::LATENCY_RESPONSE_TIME, record.latency_ms, model_tag.clone());
        self.histogram(names::COST_TOTAL, record.cost_usd, model_tag.clone());
        if let Some(overall) = quality_overall {
            self.histogram(names::QUALITY_OVERALL_SCORE, overall, model_tag);
        }
    }

    /// Per-verdict threat metric, tagged kind/severity/scope.
    pub fn emit_threat(&self, verdict: &ThreatVerdict) {
        self.counter(
            names::THREATS_DETECTED,
            1,
            vec![
                ("kind".to_string(), verdict.kind.to_string()),
                ("severity".to_string(), verdict.severity.to_string()),
                ("scope".to_string(), verdict.scope.to_string()),
            ],
        );
    }

    /// Per-anomaly metric, tagged metric/trigger/severity.
    pub fn emit_anomaly(&self, anomaly: &Anomaly) {
        self.counter(
            names::ANOMALIES_DETECTED,
            1,
            vec![
                ("metric".to_string(), anomaly.metric.to_string()),
                ("trigger".to_string(), anomaly.trigger.to_string()),
                ("severity".to_string(), anomaly.severity.to_string()),
            ],
        );
    }

    /// Incident counter plus a descriptive event.
    pub fn emit_incident(&self, incident: &Incident) {
        let tags = vec![("severity".to_string(), incident.severity.to_string())];
        self.counter(names::INCIDENTS_CREATED, 1, tags.clone());
        self.event(
            "incident created",
            &incident.summary,
            incident.severity,
            vec![
                ("incident_id".to_string(), incident.id.to_string()),
                ("trace_id".to_string(), incident.trace_id.clone()),
            ],
        );
    }
}
