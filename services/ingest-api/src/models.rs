//! Shared application state for the ingest API.

use llm_watchtower_core::PipelineConfig;
use llm_watchtower_pipeline::Pipeline;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// State shared across every route handler.
pub struct AppState {
    /// The assembled analysis pipeline.
    pub pipeline: Arc<Pipeline>,
    /// Process-wide configuration.
    pub config: Arc<PipelineConfig>,
    /// Prometheus exposition handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}
