// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! Result-typed retry loop for AI calls.
//!
//! Retryable-vs-terminal is decided by attempt budget, not by exception
//! control flow: every [`AiClientError`] is retryable until the budget is
//! exhausted, at which point the last error is returned and the caller
//! downgrades to a null contribution. Backoff is exponential with jitter,
//! honors a server `retry_after` hint, and observes cancellation between
//! attempts.

use crate::client::AiClientError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backoff schedule for retried AI calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// First backoff delay.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Build the policy from the pipeline configuration.
    pub fn from_config(config: &llm_watchtower_core::PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            ..Self::default()
        }
    }

    /// Delay before the attempt following failure number `attempt`
    /// (0-based), with +/-20% jitter applied. A `retry_after` hint
    /// overrides the computed delay when it is longer.
    fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        let jittered = exp.mul_f64(jitter);
        match hint {
            Some(hint) if hint > jittered => hint,
            _ => jittered,
        }
    }
}

/// Run `op` until it succeeds, the attempt budget is exhausted, or the
/// cancellation token fires between attempts.
///
/// On cancellation the last observed error is returned; the operation
/// itself is never interrupted mid-flight here (per-call timeouts bound
/// each attempt).
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<T, AiClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AiClientError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt, err.retry_after());
                debug!(
                    analyzer = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(err),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
