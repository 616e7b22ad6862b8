// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! Analyzers for the LLM Watchtower pipeline.
//!
//! Three per-record analyzers run concurrently over each normalized
//! [`llm_watchtower_core::TelemetryRecord`]:
//!
//! - [`quality::QualityAnalyzer`]: AI-judged response quality
//! - [`threat::ThreatAnalyzer`]: regex pre-filter plus AI threat verdicts
//! - [`anomaly::AnomalyDetector`]: rolling-window statistical detection
//!
//! The AI-assisted analyzers speak to an injected [`client::AiClient`];
//! production wires the [`client::HttpAiClient`] adapter, tests wire the
//! scripted [`client::StubAiClient`]. Analyzers never observe each other
//! and never fail the record they analyze: terminal failures degrade to
//! null contributions.

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod anomaly;
pub mod client;
pub mod quality;
pub mod retry;
pub mod threat;

pub use anomaly::AnomalyDetector;
pub use client::{AiClient, AiClientError, CompletionOptions, HttpAiClient, StubAiClient};
pub use quality::QualityAnalyzer;
pub use threat::ThreatAnalyzer;
