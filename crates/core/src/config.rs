// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-wide pipeline configuration.
//!
//! Loaded once at startup from environment variables, immutable for the
//! lifetime of the process, and shared read-only with every component.
//! Every threshold has a `WATCHTOWER_*` override; missing variables fall
//! back to the documented defaults. Any invalid value fails startup with a
//! descriptive error — the pipeline never runs on a partially-valid
//! configuration.

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration load failure. Fatal at startup (exit code 1).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// The variable was set but could not be parsed as the expected type.
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        /// Environment variable name.
        key: String,
        /// The raw value found.
        value: String,
        /// Parse failure detail.
        reason: String,
    },

    /// The parsed value fell outside its documented range.
    #[error("{key} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        /// Environment variable name.
        key: String,
        /// The rejected value.
        value: f64,
        /// Inclusive lower bound.
        min: f64,
        /// Inclusive upper bound.
        max: f64,
    },

    /// A cross-field constraint was violated.
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Weights for the quality sub-scores.
///
/// Defaults are the normative 0.4 / 0.4 / 0.2 split; overrides must still
/// sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    /// Weight of the coherence sub-score.
    pub coherence: f64,
    /// Weight of the relevance sub-score.
    pub relevance: f64,
    /// Weight of the completeness sub-score.
    pub completeness: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            coherence: 0.4,
            relevance: 0.4,
            completeness: 0.2,
        }
    }
}

impl QualityWeights {
    /// Check that the weights form a convex combination.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("WATCHTOWER_QUALITY_WEIGHT_COHERENCE", self.coherence),
            ("WATCHTOWER_QUALITY_WEIGHT_RELEVANCE", self.relevance),
            ("WATCHTOWER_QUALITY_WEIGHT_COMPLETENESS", self.completeness),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange {
                    key: key.to_string(),
                    value,
                    min: 0.0,
                    max: 1.0,
                });
            }
        }
        let sum = self.coherence + self.relevance + self.completeness;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Inconsistent(format!(
                "quality weights must sum to 1.0, got {sum}"
            )));
        }
        Ok(())
    }
}

/// Process-wide pipeline configuration. See module docs for loading rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    // Feature toggles
    /// Run the AI-assisted threat classifier.
    pub enable_threat_detection: bool,
    /// Run the statistical anomaly detector.
    pub enable_anomaly_detection: bool,
    /// Run the AI-assisted quality classifier.
    pub enable_quality_analysis: bool,
    /// Emit synthesized incidents to the store and the event stream.
    pub enable_incident_emission: bool,

    // Thresholds
    /// Projected 24h spend above which cost is critically anomalous (USD).
    pub cost_anomaly_usd_per_day: f64,
    /// Z-score magnitude that fires a statistical anomaly.
    pub cost_z_threshold: f64,
    /// Absolute per-request latency threshold (ms).
    pub latency_abs_ms: f64,
    /// Deployment p95 latency target (ms), exposed for dashboards.
    pub latency_p95_ms: f64,
    /// Overall quality below this contributes to an incident.
    pub quality_min_overall: f64,
    /// Coherence floor, surfaced in the judge rubric.
    pub quality_min_coherence: f64,
    /// Relevance floor, surfaced in the judge rubric.
    pub quality_min_relevance: f64,
    /// Completeness floor, surfaced in the judge rubric.
    pub quality_min_completeness: f64,
    /// Error-rate ceiling over the rolling counter bucket.
    pub error_rate_max: f64,
    /// Minimum AI confidence for a threat verdict to stand on its own.
    pub threat_min_confidence: f64,
    /// Toxicity confidence at which toxic content escalates to high.
    pub toxicity_min: f64,

    // Concurrency
    /// Size of the analysis worker pool.
    pub max_concurrent_analyses: usize,
    /// Batch intake sizing; also bounds the ingress queue (x2).
    pub batch_size: usize,
    /// Maximum time a partial batch waits before dispatch.
    pub batch_timeout: Duration,

    // AI client
    /// Judge model identifier.
    pub model_name: String,
    /// Sampling temperature; kept low for reproducible judgments.
    pub temperature: f64,
    /// Nucleus sampling parameter.
    pub top_p: f64,
    /// Top-k sampling parameter.
    pub top_k: u32,
    /// Output token budget per judge call.
    pub max_output_tokens: u32,
    /// Retry attempts after the initial call.
    pub max_retries: u32,
    /// Per-call timeout for AI and store calls.
    pub per_call_timeout: Duration,

    // Rolling windows
    /// Samples retained per metric window.
    pub window_capacity: usize,
    /// Samples required before statistical triggers fire.
    pub min_samples_for_stat: usize,
    /// Samples older than this are evicted on append.
    pub sample_horizon: Duration,

    // Normalizer
    /// Prompt/response truncation budget in bytes.
    pub max_text_bytes: usize,
    /// Trace ids remembered by the dedup window.
    pub dedup_capacity: usize,
    /// Responses shorter than this are capped at completeness 0.5 by rubric.
    pub min_response_bytes: usize,

    // Quality weighting
    /// Sub-score weights for the overall quality mean.
    pub quality_weights: QualityWeights,

    // Emission
    /// Namespace prefix for every emitted metric name.
    pub metrics_prefix: String,

    // Service / adapters
    /// Completion endpoint for the HTTP AI client adapter.
    pub ai_endpoint: String,
    /// Bearer token for the AI endpoint, if it requires one.
    pub ai_api_key: Option<String>,
    /// Probe the AI endpoint at startup and abort (exit 2) if unreachable.
    pub require_on_startup: bool,
    /// Listen address for the ingest service.
    pub listen_addr: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_threat_detection: true,
            enable_anomaly_detection: true,
            enable_quality_analysis: true,
            enable_incident_emission: true,
            cost_anomaly_usd_per_day: 100.0,
            cost_z_threshold: 3.0,
            latency_abs_ms: 5000.0,
            latency_p95_ms: 2000.0,
            quality_min_overall: 0.7,
            quality_min_coherence: 0.5,
            quality_min_relevance: 0.5,
            quality_min_completeness: 0.5,
            error_rate_max: 0.1,
            threat_min_confidence: 0.75,
            toxicity_min: 0.8,
            max_concurrent_analyses: 8,
            batch_size: 32,
            batch_timeout: Duration::from_millis(1000),
            model_name: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            top_p: 0.9,
            top_k: 40,
            max_output_tokens: 512,
            max_retries: 3,
            per_call_timeout: Duration::from_secs(10),
            window_capacity: 1000,
            min_samples_for_stat: 30,
            sample_horizon: Duration::from_secs(24 * 60 * 60),
            max_text_bytes: 64 * 1024,
            dedup_capacity: 10_000,
            min_response_bytes: 20,
            quality_weights: QualityWeights::default(),
            metrics_prefix: "watchtower".to_string(),
            ai_endpoint: "http://localhost:8085/v1/complete".to_string(),
            ai_api_key: None,
            require_on_startup: false,
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

fn parse_var<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
            reason: e.to_string(),
        }),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: String::new(),
            reason: e.to_string(),
        }),
    }
}

fn parse_duration_ms(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parse_var(
        key,
        default.as_millis() as u64,
    )?))
}

fn check_unit(key: &'static str, value: f64) -> Result<f64, ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            key: key.to_string(),
            value,
            min: 0.0,
            max: 1.0,
        })
    }
}

fn check_min(key: &'static str, value: f64, min: f64) -> Result<f64, ConfigError> {
    if value >= min {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            key: key.to_string(),
            value,
            min,
            max: f64::INFINITY,
        })
    }
}

impl PipelineConfig {
    /// Load the configuration from the environment.
    ///
    /// Every field has a `WATCHTOWER_*` override; the defaults of
    /// [`PipelineConfig::default`] apply otherwise.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            enable_threat_detection: parse_var(
                "WATCHTOWER_ENABLE_THREAT_DETECTION",
                defaults.enable_threat_detection,
            )?,
            enable_anomaly_detection: parse_var(
                "WATCHTOWER_ENABLE_ANOMALY_DETECTION",
                defaults.enable_anomaly_detection,
            )?,
            enable_quality_analysis: parse_var(
                "WATCHTOWER_ENABLE_QUALITY_ANALYSIS",
                defaults.enable_quality_analysis,
            )?,
            enable_incident_emission: parse_var(
                "WATCHTOWER_ENABLE_INCIDENT_EMISSION",
                defaults.enable_incident_emission,
            )?,
            cost_anomaly_usd_per_day: check_min(
                "WATCHTOWER_COST_ANOMALY_USD_PER_DAY",
                parse_var(
                    "WATCHTOWER_COST_ANOMALY_USD_PER_DAY",
                    defaults.cost_anomaly_usd_per_day,
                )?,
                0.0,
            )?,
            cost_z_threshold: check_min(
                "WATCHTOWER_COST_Z_THRESHOLD",
                parse_var("WATCHTOWER_COST_Z_THRESHOLD", defaults.cost_z_threshold)?,
                0.0,
            )?,
            latency_abs_ms: check_min(
                "WATCHTOWER_LATENCY_ABS_MS",
                parse_var("WATCHTOWER_LATENCY_ABS_MS", defaults.latency_abs_ms)?,
                0.0,
            )?,
            latency_p95_ms: check_min(
                "WATCHTOWER_LATENCY_P95_MS",
                parse_var("WATCHTOWER_LATENCY_P95_MS", defaults.latency_p95_ms)?,
                0.0,
            )?,
            quality_min_overall: check_unit(
                "WATCHTOWER_QUALITY_MIN_OVERALL",
                parse_var("WATCHTOWER_QUALITY_MIN_OVERALL", defaults.quality_min_overall)?,
            )?,
            quality_min_coherence: check_unit(
                "WATCHTOWER_QUALITY_MIN_COHERENCE",
                parse_var(
                    "WATCHTOWER_QUALITY_MIN_COHERENCE",
                    defaults.quality_min_coherence,
                )?,
            )?,
            quality_min_relevance: check_unit(
                "WATCHTOWER_QUALITY_MIN_RELEVANCE",
                parse_var(
                    "WATCHTOWER_QUALITY_MIN_RELEVANCE",
                    defaults.quality_min_relevance,
                )?,
            )?,
            quality_min_completeness: check_unit(
                "WATCHTOWER_QUALITY_MIN_COMPLETENESS",
                parse_var(
                    "WATCHTOWER_QUALITY_MIN_COMPLETENESS",
                    defaults.quality_min_completeness,
                )?,
            )?,
            error_rate_max: check_unit(
                "WATCHTOWER_ERROR_RATE_MAX",
                parse_var("WATCHTOWER_ERROR_RATE_MAX", defaults.error_rate_max)?,
            )?,
            threat_min_confidence: check_unit(
                "WATCHTOWER_THREAT_MIN_CONFIDENCE",
                parse_var(
                    "WATCHTOWER_THREAT_MIN_CONFIDENCE",
                    defaults.threat_min_confidence,
                )?,
            )?,
            toxicity_min: check_unit(
                "WATCHTOWER_TOXICITY_MIN",
                parse_var("WATCHTOWER_TOXICITY_MIN", defaults.toxicity_min)?,
            )?,
            max_concurrent_analyses: parse_var(
                "WATCHTOWER_MAX_CONCURRENT_ANALYSES",
                defaults.max_concurrent_analyses,
            )?,
            batch_size: parse_var("WATCHTOWER_BATCH_SIZE", defaults.batch_size)?,
            batch_timeout: parse_duration_ms("WATCHTOWER_BATCH_TIMEOUT_MS", defaults.batch_timeout)?,
            model_name: parse_var("WATCHTOWER_MODEL_NAME", defaults.model_name)?,
            temperature: check_unit(
                "WATCHTOWER_TEMPERATURE",
                parse_var("WATCHTOWER_TEMPERATURE", defaults.temperature)?,
            )?,
            top_p: check_unit(
                "WATCHTOWER_TOP_P",
                parse_var("WATCHTOWER_TOP_P", defaults.top_p)?,
            )?,
            top_k: parse_var("WATCHTOWER_TOP_K", defaults.top_k)?,
            max_output_tokens: parse_var(
                "WATCHTOWER_MAX_OUTPUT_TOKENS",
                defaults.max_output_tokens,
            )?,
            max_retries: parse_var("WATCHTOWER_MAX_RETRIES", defaults.max_retries)?,
            per_call_timeout: parse_duration_ms(
                "WATCHTOWER_PER_CALL_TIMEOUT_MS",
                defaults.per_call_timeout,
            )?,
            window_capacity: parse_var("WATCHTOWER_WINDOW_CAPACITY", defaults.window_capacity)?,
            min_samples_for_stat: parse_var(
                "WATCHTOWER_MIN_SAMPLES_FOR_STAT",
                defaults.min_samples_for_stat,
            )?,
            sample_horizon: Duration::from_secs(parse_var(
                "WATCHTOWER_SAMPLE_HORIZON_SECS",
                defaults.sample_horizon.as_secs(),
            )?),
            max_text_bytes: parse_var("WATCHTOWER_MAX_TEXT_BYTES", defaults.max_text_bytes)?,
            dedup_capacity: parse_var("WATCHTOWER_DEDUP_CAPACITY", defaults.dedup_capacity)?,
            min_response_bytes: parse_var(
                "WATCHTOWER_MIN_RESPONSE_BYTES",
                defaults.min_response_bytes,
            )?,
            quality_weights: QualityWeights {
                coherence: parse_var(
                    "WATCHTOWER_QUALITY_WEIGHT_COHERENCE",
                    defaults.quality_weights.coherence,
                )?,
                relevance: parse_var(
                    "WATCHTOWER_QUALITY_WEIGHT_RELEVANCE",
                    defaults.quality_weights.relevance,
                )?,
                completeness: parse_var(
                    "WATCHTOWER_QUALITY_WEIGHT_COMPLETENESS",
                    defaults.quality_weights.completeness,
                )?,
            },
            metrics_prefix: parse_var("WATCHTOWER_METRICS_PREFIX", defaults.metrics_prefix)?,
            ai_endpoint: parse_var("WATCHTOWER_AI_ENDPOINT", defaults.ai_endpoint)?,
            ai_api_key: env::var("WATCHTOWER_AI_API_KEY").ok(),
            require_on_startup: parse_var(
                "WATCHTOWER_REQUIRE_ON_STARTUP",
                defaults.require_on_startup,
            )?,
            listen_addr: parse_var("WATCHTOWER_LISTEN_ADDR", defaults.listen_addr)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation, applied after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quality_weights.validate()?;
        if self.max_concurrent_analyses == 0 {
            return Err(ConfigError::Inconsistent(
                "WATCHTOWER_MAX_CONCURRENT_ANALYSES must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Inconsistent(
                "WATCHTOWER_BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        if self.window_capacity == 0 {
            return Err(ConfigError::Inconsistent(
                "WATCHTOWER_WINDOW_CAPACITY must be at least 1".to_string(),
            ));
        }
        if self.min_samples_for_stat < 2 {
            return Err(ConfigError::Inconsistent(
                "WATCHTOWER_MIN_SAMPLES_FOR_STAT must be at least 2".to_string(),
            ));
        }
        if self.dedup_capacity == 0 {
            return Err(ConfigError::Inconsistent(
                "WATCHTOWER_DEDUP_CAPACITY must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Whole-record processing deadline.
    ///
    /// Per-call timeout times the worst-case attempts per analyzer, times
    /// the three analyzers, plus a fixed overhead for synthesis and
    /// persistence.
    pub fn record_deadline(&self) -> Duration {
        self.per_call_timeout * (self.max_retries + 1) * 3 + Duration::from_secs(2)
    }

    /// Ingress queue depth past which submission reports `Overloaded`.
    pub fn overload_watermark(&self) -> usize {
        self.batch_size * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global; tests touching them serialize here.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dedup_capacity, 10_000);
        assert_eq!(config.min_samples_for_stat, 30);
        assert_eq!(config.max_text_bytes, 64 * 1024);
    }

    #[test]
    fn test_record_deadline() {
        let config = PipelineConfig::default();
        // 10s * 4 attempts * 3 analyzers + 2s
        assert_eq!(config.record_deadline(), Duration::from_secs(122));
    }

    #[test]
    fn test_overload_watermark() {
        let config = PipelineConfig::default();
        assert_eq!(config.overload_watermark(), 64);
    }

    #[test]
    fn test_invalid_numeric_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("WATCHTOWER_COST_Z_THRESHOLD", "not-a-number");
        let err = PipelineConfig::from_env().unwrap_err();
        env::remove_var("WATCHTOWER_COST_Z_THRESHOLD");
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "WATCHTOWER_COST_Z_THRESHOLD"));
    }

    #[test]
    fn test_out_of_range_probability_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("WATCHTOWER_THREAT_MIN_CONFIDENCE", "1.5");
        let err = PipelineConfig::from_env().unwrap_err();
        env::remove_var("WATCHTOWER_THREAT_MIN_CONFIDENCE");
        assert!(matches!(err, ConfigError::OutOfRange { ref key, .. } if key == "WATCHTOWER_THREAT_MIN_CONFIDENCE"));
    }

    #[test]
    fn test_env_override_applies() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("WATCHTOWER_DEDUP_CAPACITY", "500");
        let config = PipelineConfig::from_env().unwrap();
        env::remove_var("WATCHTOWER_DEDUP_CAPACITY");
        assert_eq!(config.dedup_capacity, 500);
    }

    #[test]
    fn test_bad_weights_rejected() {
        let weights = QualityWeights {
            coherence: 0.5,
            relevance: 0.5,
            completeness: 0.5,
        };
        assert!(weights.validate().is_err());
    }
}
