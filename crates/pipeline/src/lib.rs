// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! The streaming analysis pipeline for LLM Watchtower.
//!
//! This crate wires the analyzers from `llm-watchtower-analyzers` into a
//! bounded worker pool behind a FIFO intake queue:
//!
//! - [`normalizer::Normalizer`]: validation, canonicalization, dedup
//! - [`synthesizer`]: incident creation policy and deterministic summaries
//! - [`emitter::Emitter`]: best-effort metric and event emission through an
//!   injected sink
//! - [`store::RecordStore`]: the injected persistence adapter
//! - [`worker::Pipeline`]: intake, backpressure, per-record fan-out,
//!   deadlines, and the incident push channels
//!
//! Failure policy: nothing that happens while analyzing one record can fail
//! another record, and neither emission nor persistence failures propagate
//! out of the pipeline.

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod emitter;
pub mod normalizer;
pub mod store;
pub mod synthesizer;
pub mod worker;

pub use emitter::{Emitter, MetricsRsSink, MetricsSink, NullSink, RecordingSink, SinkError};
pub use normalizer::{NormalizeOutcome, Normalizer};
pub use store::{InMemoryStore, IncidentFilter, RecordEnrichment, RecordStore, StoreError};
pub use worker::{
    Pipeline, SequencedIncident, SequencedTransition, SubmitError, SubmitReceipt,
};
