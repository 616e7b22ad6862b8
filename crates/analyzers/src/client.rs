// Copyright 2025 LLM Watchtower Contributors
// SPDX-License-Identifier: Apache-2.0

//! The injected AI client interface and its adapters.
//!
//! The pipeline consumes a single narrow method,
//! [`AiClient::complete`], and classifies failures into the four
//! categories the retry machinery understands. Production uses
//! [`HttpAiClient`] against a completion endpoint; tests substitute
//! [`StubAiClient`] without any monkey-patching.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Classified AI-call failure.
#[derive(Debug, Clone, Error)]
pub enum AiClientError {
    /// The call exceeded its per-call timeout.
    #[error("AI call timed out after {0:?}")]
    Timeout(Duration),

    /// The endpoint rejected the call for rate reasons. `retry_after` is a
    /// server-provided hint, honored by the backoff when present.
    #[error("AI endpoint rate limited the call")]
    RateLimited {
        /// Server-provided wait hint, if surfaced.
        retry_after: Option<Duration>,
    },

    /// The endpoint answered, but not with the strict JSON the caller
    /// demanded. Retried like a transient error; terminal exhaustion
    /// downgrades the analyzer to a null contribution.
    #[error("invalid AI response: {0}")]
    InvalidResponse(String),

    /// The endpoint failed outright (5xx, connect failure).
    #[error("AI service error: {0}")]
    ServiceError(String),
}

impl AiClientError {
    /// Backoff hint for rate-limited calls.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Sampling and budget options for one completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    /// Sampling temperature.
    pub temperature: f64,
    /// Nucleus sampling parameter.
    pub top_p: f64,
    /// Top-k sampling parameter.
    pub top_k: u32,
    /// Output token budget.
    pub max_output_tokens: u32,
    /// Per-call timeout.
    pub timeout: Duration,
}

impl CompletionOptions {
    /// Build options from the pipeline configuration.
    pub fn from_config(config: &llm_watchtower_core::PipelineConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            max_output_tokens: config.max_output_tokens,
            timeout: config.per_call_timeout,
        }
    }
}

/// The single method the pipeline consumes from an AI backend.
#[async_trait]
pub trait AiClient: Send + Sync {
    /// Run one completion and return the raw model text.
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, AiClientError>;
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    temperature: f64,
    top_p: f64,
    top_k: u32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    completion: String,
}

/// HTTP adapter for a JSON completion endpoint.
///
/// Maps transport outcomes onto the error taxonomy: request timeout ->
/// [`AiClientError::Timeout`], HTTP 429 (+ `Retry-After` seconds) ->
/// [`AiClientError::RateLimited`], other non-success statuses and connect
/// failures -> [`AiClientError::ServiceError`], body decode failures ->
/// [`AiClientError::InvalidResponse`].
pub struct HttpAiClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpAiClient {
    /// Create an adapter for the given endpoint and model.
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }

    /// Build the adapter straight from the pipeline configuration.
    pub fn from_config(config: &llm_watchtower_core::PipelineConfig) -> Self {
        Self::new(
            config.ai_endpoint.clone(),
            config.model_name.clone(),
            config.ai_api_key.clone(),
        )
    }

    /// Cheap reachability probe used by `require_on_startup`.
    pub async fn probe(&self, timeout: Duration) -> Result<(), AiClientError> {
        self.http
            .head(&self.endpoint)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AiClientError::Timeout(timeout)
                } else {
                    AiClientError::ServiceError(e.to_string())
                }
            })?;
        Ok(())
    }
}

#[async_trait]
impl AiClient for HttpAiClient {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, AiClientError> {
        let body = CompletionRequest {
            model: &self.model,
            prompt,
            temperature: options.temperature,
            top_p: options.top_p,
            top_k: options.top_k,
            max_tokens: options.max_output_tokens,
        };

        let mut request = self
            .http
            .post(&self.endpoint)
            .timeout(options.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AiClientError::Timeout(options.timeout)
            } else {
                AiClientError::ServiceError(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AiClientError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(AiClientError::ServiceError(format!(
                "endpoint returned {status}"
            )));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| AiClientError::InvalidResponse(e.to_string()))?;
        Ok(parsed.completion)
    }
}

type StubResponder = dyn Fn(&str) -> Result<String, AiClientError> + Send + Sync;

/// Deterministic scripted client for tests and demos.
///
/// The responder sees the full prompt and decides the reply, so one stub
/// can serve the quality and threat classifiers in the same run.
pub struct StubAiClient {
    responder: Box<StubResponder>,
}

impl StubAiClient {
    /// Script the stub with a responder closure.
    pub fn new(
        responder: impl Fn(&str) -> Result<String, AiClientError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
        }
    }

    /// A stub that answers every call with the same fixed string.
    pub fn fixed(reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self::new(move |_| Ok(reply.clone()))
    }

    /// A stub that fails every call with a service error.
    pub fn always_failing() -> Self {
        Self::new(|_| Err(AiClientError::ServiceError("stub outage".to_string())))
    }
}

#[async_trait]
impl AiClient for StubAiClient {
    async fn complete(
        &self,
        prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, AiClientError> {
        (self.responder)(prompt)
    }
}
