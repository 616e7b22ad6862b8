// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! Core data model for the LLM Watchtower analysis pipeline.
//!
//! This crate defines the entities that flow through the pipeline and the
//! contracts shared by every component:
//!
//! - [`TelemetryRecord`]: one captured LLM request/response, immutable after
//!   construction
//! - [`QualityScore`], [`ThreatVerdict`], [`Anomaly`]: enrichment artifacts
//!   produced by the analyzers
//! - [`Incident`]: the synthesis artifact, with its status state machine
//! - [`PipelineConfig`]: process-wide configuration, loaded once from the
//!   environment and shared read-only
//!
//! No async runtime, no I/O — downstream crates (`llm-watchtower-analyzers`,
//! `llm-watchtower-pipeline`) build the moving parts on top of these types.

#![warn(missing_docs, rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod anomaly;
pub mod config;
pub mod incident;
pub mod quality;
pub mod record;
pub mod threat;
pub mod types;

pub use anomaly::Anomaly;
pub use config::{ConfigError, PipelineConfig, QualityWeights};
pub use incident::{Incident, TransitionError};
pub use quality::QualityScore;
pub use record::{RecordError, TelemetryPayload, TelemetryRecord};
pub use threat::ThreatVerdict;
pub use types::{AnomalyMetric, AnomalyTrigger, IncidentStatus, Severity, ThreatKind, ThreatScope};
