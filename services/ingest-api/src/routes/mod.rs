//! HTTP route modules for the ingest API.

pub mod incidents;
pub mod telemetry;
