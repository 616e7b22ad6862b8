//! Process host for the ingest API.
//!
//! Exit codes: 0 normal exit, 1 configuration error, 2 fatal startup
//! (listener bind failure, or the AI endpoint unreachable while
//! `WATCHTOWER_REQUIRE_ON_STARTUP=true`), 3 unrecoverable server error.

use ingest_api::models::AppState;
use llm_watchtower_analyzers::HttpAiClient;
use llm_watchtower_core::PipelineConfig;
use llm_watchtower_pipeline::{InMemoryStore, MetricsRsSink, MetricsSink, Pipeline, RecordStore};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match PipelineConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "configuration error");
            exit(1);
        }
    };

    let metrics_handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            // emission is best-effort; the pipeline runs without exposition
            warn!(error = %e, "failed to install Prometheus recorder");
            None
        }
    };

    let ai_client = Arc::new(HttpAiClient::from_config(&config));
    if config.require_on_startup {
        if let Err(e) = ai_client.probe(config.per_call_timeout).await {
            error!(endpoint = %config.ai_endpoint, error = %e, "AI endpoint unreachable at startup");
            exit(2);
        }
        info!(endpoint = %config.ai_endpoint, "AI endpoint reachable");
    }

    let store = Arc::new(InMemoryStore::new());
    let pipeline = Pipeline::new(
        Arc::clone(&config),
        ai_client,
        Arc::new(MetricsRsSink) as Arc<dyn MetricsSink>,
        Arc::clone(&store) as Arc<dyn RecordStore>,
    );

    let state = Arc::new(AppState {
        pipeline: Arc::clone(&pipeline),
        config: Arc::clone(&config),
        metrics: metrics_handle,
    });
    let app = ingest_api::app(state);

    let listener = match tokio::net::TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.listen_addr, error = %e, "failed to bind listener");
            exit(2);
        }
    };
    info!(addr = %config.listen_addr, workers = config.max_concurrent_analyses, "ingest API listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("draining pipeline workers");
    pipeline.shutdown().await;

    if let Err(e) = served {
        error!(error = %e, "server terminated abnormally");
        exit(3);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
}
