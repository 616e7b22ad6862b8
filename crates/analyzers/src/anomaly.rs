// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! Statistical anomaly detection over rolling per-metric baselines.
//!
//! The detector owns one [`RollingWindow`] per metric in {cost, latency,
//! quality, tokens}, each behind its own lock, plus a rolling five-minute
//! request/error counter pair for the error rate. Absolute thresholds are
//! checked on every record; statistical (z-score) triggers require
//! `min_samples_for_stat` samples in the window at decision time.
//!
//! Quality flows in through a separate entry point
//! ([`AnomalyDetector::observe_quality`]) because the overall score only
//! exists once the quality classifier has finished; the per-record fan-out
//! keeps the analyzers from observing each other.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use llm_watchtower_core::{Anomaly, AnomalyMetric, PipelineConfig, Severity, TelemetryRecord};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Floor applied to the baseline standard deviation in z-score math.
const SIGMA_FLOOR: f64 = 1e-9;

/// Width of the request/error counter bucket.
const RATE_BUCKET: Duration = Duration::from_secs(5 * 60);

/// Trailing span used to project the current cost rate over 24 hours.
const COST_PROJECTION_SPAN: Duration = Duration::from_secs(60 * 60);

/// Fixed-capacity, time-ordered sample window with incrementally
/// maintained mean and variance (Welford update on append and evict).
#[derive(Debug)]
pub struct RollingWindow {
    capacity: usize,
    samples: VecDeque<(DateTime<Utc>, f64)>,
    mean: f64,
    m2: f64,
}

impl RollingWindow {
    /// Create an empty window retaining at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
            mean: 0.0,
            m2: 0.0,
        }
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Current baseline mean.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Current sample standard deviation; zero below two samples.
    pub fn stddev(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        (self.m2 / (n as f64 - 1.0)).sqrt()
    }

    fn welford_add(&mut self, value: f64) {
        let n = self.samples.len() as f64 + 1.0;
        let delta = value - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (value - self.mean);
    }

    fn welford_remove(&mut self, value: f64) {
        let n = self.samples.len() as f64;
        if n == 0.0 {
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        let mean_new = (self.mean * (n + 1.0) - value) / n;
        self.m2 -= (value - self.mean) * (value - mean_new);
        if self.m2 < 0.0 {
            // numeric drift guard
            self.m2 = 0.0;
        }
        self.mean = mean_new;
    }

    /// Append a sample, evicting samples older than `horizon` and any
    /// overflow beyond capacity.
    pub fn push(&mut self, at: DateTime<Utc>, value: f64, horizon: Duration) {
        let cutoff = at - ChronoDuration::from_std(horizon).unwrap_or(ChronoDuration::zero());
        while let Some(&(ts, old)) = self.samples.front() {
            if ts < cutoff {
                self.samples.pop_front();
                self.welford_remove(old);
            } else {
                break;
            }
        }
        if self.samples.len() == self.capacity {
            if let Some((_, old)) = self.samples.pop_front() {
                self.welford_remove(old);
            }
        }
        self.welford_add(value);
        self.samples.push_back((at, value));
    }

    /// Sum of samples at or after `cutoff`.
    pub fn sum_since(&self, cutoff: DateTime<Utc>) -> f64 {
        self.samples
            .iter()
            .rev()
            .take_while(|(ts, _)| *ts >= cutoff)
            .map(|(_, v)| v)
            .sum()
    }
}

#[derive(Debug)]
struct RateBucket {
    started_at: DateTime<Utc>,
    requests: u64,
    errors: u64,
}

impl RateBucket {
    fn observe(&mut self, at: DateTime<Utc>, error: bool) -> (u64, f64) {
        let width = ChronoDuration::from_std(RATE_BUCKET).unwrap_or(ChronoDuration::zero());
        if at - self.started_at >= width {
            self.started_at = at;
            self.requests = 0;
            self.errors = 0;
        }
        self.requests += 1;
        if error {
            self.errors += 1;
        }
        (self.requests, self.errors as f64 / self.requests as f64)
    }
}

/// Maintains rolling statistics and emits anomalies per record.
pub struct AnomalyDetector {
    config: Arc<PipelineConfig>,
    cost: Mutex<RollingWindow>,
    latency: Mutex<RollingWindow>,
    quality: Mutex<RollingWindow>,
    tokens: Mutex<RollingWindow>,
    rate: Mutex<RateBucket>,
}

impl AnomalyDetector {
    /// Create a detector with empty baselines.
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        let capacity = config.window_capacity;
        Self {
            config,
            cost: Mutex::new(RollingWindow::new(capacity)),
            latency: Mutex::new(RollingWindow::new(capacity)),
            quality: Mutex::new(RollingWindow::new(capacity)),
            tokens: Mutex::new(RollingWindow::new(capacity)),
            rate: Mutex::new(RateBucket {
                started_at: DateTime::<Utc>::MIN_UTC,
                requests: 0,
                errors: 0,
            }),
        }
    }

    fn statistical_check(
        &self,
        metric: AnomalyMetric,
        window: &RollingWindow,
        value: f64,
    ) -> Option<Anomaly> {
        if window.len() < self.config.min_samples_for_stat {
            return None;
        }
        let mean = window.mean();
        let sigma = window.stddev().max(SIGMA_FLOOR);
        let z = (value - mean) / sigma;
        if z.abs() >= self.config.cost_z_threshold {
            Some(Anomaly::statistical(metric, value, mean, window.stddev(), z))
        } else {
            None
        }
    }

    /// Observe a normalized record: update the cost, latency, and token
    /// baselines plus the error counters, and return any anomalies.
    ///
    /// Quality is observed separately through
    /// [`AnomalyDetector::observe_quality`] once the classifier finishes.
    pub fn observe(&self, record: &TelemetryRecord) -> Vec<Anomaly> {
        if !self.config.enable_anomaly_detection {
            return Vec::new();
        }

        let horizon = self.config.sample_horizon;
        let at = record.ingested_at;
        let mut found = Vec::new();

        {
            let mut cost = self.cost.lock().expect("cost window lock poisoned");
            cost.push(at, record.cost_usd, horizon);

            // Projection needs a rate history; a lone sample stands for
            // itself.
            let projected = if cost.len() >= self.config.min_samples_for_stat {
                let span =
                    ChronoDuration::from_std(COST_PROJECTION_SPAN).unwrap_or(ChronoDuration::zero());
                cost.sum_since(at - span) * 24.0
            } else {
                record.cost_usd
            };
            if projected > self.config.cost_anomaly_usd_per_day {
                found.push(Anomaly::absolute(
                    AnomalyMetric::Cost,
                    record.cost_usd,
                    cost.mean(),
                    cost.stddev(),
                    Severity::Critical,
                ));
            }
            if let Some(anomaly) =
                self.statistical_check(AnomalyMetric::Cost, &cost, record.cost_usd)
            {
                found.push(anomaly);
            }
        }

        {
            let mut latency = self.latency.lock().expect("latency window lock poisoned");
            latency.push(at, record.latency_ms, horizon);
            if record.latency_ms > self.config.latency_abs_ms {
                found.push(Anomaly::absolute(
                    AnomalyMetric::Latency,
                    record.latency_ms,
                    latency.mean(),
                    latency.stddev(),
                    Severity::High,
                ));
            }
            if let Some(anomaly) =
                self.statistical_check(AnomalyMetric::Latency, &latency, record.latency_ms)
            {
                found.push(anomaly);
            }
        }

        {
            let total_tokens = record.total_tokens() as f64;
            let mut tokens = self.tokens.lock().expect("token window lock poisoned");
            tokens.push(at, total_tokens, horizon);
            if let Some(anomaly) =
                self.statistical_check(AnomalyMetric::TokenRate, &tokens, total_tokens)
            {
                found.push(anomaly);
            }
        }

        {
            let mut rate = self.rate.lock().expect("rate bucket lock poisoned");
            let (requests, error_rate) = rate.observe(at, record.error_occurred);
            if requests >= self.config.min_samples_for_stat as u64
                && error_rate > self.config.error_rate_max
            {
                found.push(Anomaly::absolute(
                    AnomalyMetric::ErrorRate,
                    error_rate,
                    self.config.error_rate_max,
                    0.0,
                    Severity::Critical,
                ));
            }
        }

        dedupe_by_metric(found)
    }

    /// Observe the quality classifier's overall score for a record.
    pub fn observe_quality(&self, at: DateTime<Utc>, overall: f64) -> Vec<Anomaly> {
        if !self.config.enable_anomaly_detection {
            return Vec::new();
        }

        let mut found = Vec::new();
        let mut quality = self.quality.lock().expect("quality window lock poisoned");
        quality.push(at, overall, self.config.sample_horizon);
        if overall < self.config.quality_min_overall {
            found.push(Anomaly::absolute(
                AnomalyMetric::Quality,
                overall,
                quality.mean(),
                quality.stddev(),
                Severity::High,
            ));
        }
        if let Some(anomaly) = self.statistical_check(AnomalyMetric::Quality, &quality, overall) {
            found.push(anomaly);
        }
        dedupe_by_metric(found)
    }
}

/// Collapse anomalies to at most one per metric, keeping the higher
/// severity, and return them in canonical metric order.
pub fn dedupe_by_metric(anomalies: Vec<Anomaly>) -> Vec<Anomaly> {
    const ORDER: [AnomalyMetric; 6] = [
        AnomalyMetric::Cost,
        AnomalyMetric::Latency,
        AnomalyMetric::Quality,
        AnomalyMetric::ErrorRate,
        AnomalyMetric::TokenRate,
        AnomalyMetric::RequestRate,
    ];

    let mut best: Vec<Option<Anomaly>> = vec![None; ORDER.len()];
    for anomaly in anomalies {
        let slot = ORDER
            .iter()
            .position(|m| *m == anomaly.metric)
            .expect("metric missing from canonical order");
        match &best[slot] {
            Some(existing) if existing.severity >= anomaly.severity => {}
            _ => best[slot] = Some(anomaly),
        }
    }
    best.into_iter().flatten().collect()
}
