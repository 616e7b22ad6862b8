// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! Anomaly artifacts emitted by the statistical anomaly detector.

use crate::types::{AnomalyMetric, AnomalyTrigger, Severity};
use serde::{Deserialize, Serialize};

/// One detected anomaly on a single metric dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    /// The metric dimension the anomaly was observed on.
    pub metric: AnomalyMetric,
    /// The observed value that triggered detection.
    pub observed: f64,
    /// Rolling-baseline mean at decision time.
    pub baseline_mean: f64,
    /// Rolling-baseline standard deviation at decision time.
    pub baseline_stddev: f64,
    /// Z-score against the baseline; `None` for absolute-threshold triggers.
    pub z_score: Option<f64>,
    /// Whether a fixed threshold or the statistical baseline fired.
    pub trigger: AnomalyTrigger,
    /// Severity assigned by the trigger policy.
    pub severity: Severity,
}

impl Anomaly {
    /// Build an absolute-threshold anomaly. `z_score` is always `None`.
    pub fn absolute(
        metric: AnomalyMetric,
        observed: f64,
        baseline_mean: f64,
        baseline_stddev: f64,
        severity: Severity,
    ) -> Self {
        Self {
            metric,
            observed,
            baseline_mean,
            baseline_stddev,
            z_score: None,
            trigger: AnomalyTrigger::Absolute,
            severity,
        }
    }

    /// Build a statistical anomaly; severity derives from `|z|`.
    pub fn statistical(
        metric: AnomalyMetric,
        observed: f64,
        baseline_mean: f64,
        baseline_stddev: f64,
        z_score: f64,
    ) -> Self {
        Self {
            metric,
            observed,
            baseline_mean,
            baseline_stddev,
            z_score: Some(z_score),
            trigger: AnomalyTrigger::Statistical,
            severity: Severity::from_z_score(z_score),
        }
    }

    /// One-line indicator string used in incident summaries.
    ///
    /// A pure function of the anomaly's fields, so summaries stay
    /// reproducible across runs.
    pub fn indicator(&self) -> String {
        match self.z_score {
            Some(z) => format!(
                "{} {}: observed {:.4}, baseline {:.4}, z={:.2}",
                self.metric, self.trigger, self.observed, self.baseline_mean, z
            ),
            None => format!(
                "{} {}: observed {:.4}, baseline {:.4}",
                self.metric, self.trigger, self.observed, self.baseline_mean
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_has_no_z_score() {
        let anomaly = Anomaly::absolute(AnomalyMetric::Latency, 9000.0, 120.0, 15.0, Severity::High);
        assert_eq!(anomaly.z_score, None);
        assert_eq!(anomaly.trigger, AnomalyTrigger::Absolute);
    }

    #[test]
    fn test_statistical_severity_from_z() {
        let anomaly = Anomaly::statistical(AnomalyMetric::Cost, 500.0, 0.01, 0.002, 42.0);
        assert_eq!(anomaly.severity, Severity::Critical);
        let mild = Anomaly::statistical(AnomalyMetric::Cost, 0.02, 0.01, 0.003, 3.2);
        assert_eq!(mild.severity, Severity::Low);
    }

    #[test]
    fn test_indicator_is_deterministic() {
        let a = Anomaly::statistical(AnomalyMetric::Cost, 500.0, 0.01, 0.002, 42.0);
        let b = Anomaly::statistical(AnomalyMetric::Cost, 500.0, 0.01, 0.002, 42.0);
        assert_eq!(a.indicator(), b.indicator());
        assert!(a.indicator().contains("cost statistical"));
    }
}
