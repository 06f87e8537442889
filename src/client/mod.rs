//! Model client: typed, retrying, rate-limited calls to the remote
//! vision/text endpoint.
//!
//! The engine talks to [`ModelApi`], a seam narrow enough to script in
//! tests. [`HttpModelClient`] is the production implementation: it paces
//! every request through the shared [`RateLimiter`], applies the per-request
//! timeout, and retries transient failures with a linear backoff
//! (`retry_delay_s × attempt`). A `Retry-After` header on a 429 stretches
//! the next delay when the server asks for more.
//!
//! ## Retry classification
//!
//! Retryable: transport errors, timeouts, HTTP 429, HTTP 5xx, and a body
//! that fails to parse (the gateway may have truncated a response that
//! would succeed on a second try). Non-retryable: 401/403 and other 4xx —
//! repeating an unauthorized or malformed request cannot change the answer.
//!
//! The client is stateless between calls; concurrent callers share only
//! the rate limiter.

pub mod protocol;

use crate::config::ConfigHandle;
use crate::error::{ErrorKind, PageFailure};
use crate::limiter::RateLimiter;
use crate::prompts;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use protocol::{ChatMessage, ChatRequest, ChatResponse};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sampling temperature for all calls; recognition and transformation both
/// want the model faithful, not creative.
const TEMPERATURE: f32 = 0.1;

/// Assistant text plus token usage from one model call.
#[derive(Debug, Clone, Default)]
pub struct ModelOutput {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl ModelOutput {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Adjacent pages' source text for context-mode transformations.
#[derive(Debug, Clone, Default)]
pub struct AdjacentContext {
    pub previous: Option<String>,
    pub next: Option<String>,
}

/// Classified failure of a model call.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited (HTTP 429)")]
    RateLimited { retry_after_s: Option<u64> },
    #[error("service unavailable (HTTP {status})")]
    ServiceUnavailable { status: u16 },
    #[error("request timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("unauthorized (HTTP {status}); check ai.api_key")]
    Unauthorized { status: u16 },
    #[error("bad request (HTTP {status}): {detail}")]
    BadRequest { status: u16, detail: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("cancelled")]
    Cancelled,
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModelError::Network(_)
                | ModelError::RateLimited { .. }
                | ModelError::ServiceUnavailable { .. }
                | ModelError::Timeout { .. }
                | ModelError::MalformedResponse(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ModelError::Network(_) => ErrorKind::Network,
            ModelError::RateLimited { .. } => ErrorKind::RateLimited,
            ModelError::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            ModelError::Timeout { .. } => ErrorKind::Timeout,
            ModelError::Unauthorized { .. } => ErrorKind::Unauthorized,
            ModelError::BadRequest { .. } => ErrorKind::BadRequest,
            ModelError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            ModelError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ModelError::RateLimited { .. } => Some(429),
            ModelError::ServiceUnavailable { status }
            | ModelError::Unauthorized { status }
            | ModelError::BadRequest { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Convert into the page-scoped failure carried on error events.
    pub fn into_failure(self, page: u32) -> PageFailure {
        let mut failure = PageFailure::new(page, self.kind(), self.to_string());
        if let Some(code) = self.status() {
            failure = failure.with_code(code);
        }
        failure
    }
}

/// The seam between the engine and the remote model.
#[async_trait]
pub trait ModelApi: Send + Sync {
    /// Recognize the text on a page image.
    async fn ocr(
        &self,
        image_jpeg: &[u8],
        model: &str,
        instructions: &str,
        cancel: &CancellationToken,
    ) -> Result<ModelOutput, ModelError>;

    /// Apply a user-directed transformation to page text.
    async fn transform(
        &self,
        source_text: &str,
        model: &str,
        user_prompt: &str,
        context: Option<&AdjacentContext>,
        cancel: &CancellationToken,
    ) -> Result<ModelOutput, ModelError>;
}

/// Production client against an OpenAI-compatible HTTP endpoint.
pub struct HttpModelClient {
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    config: ConfigHandle,
}

impl HttpModelClient {
    pub fn new(config: ConfigHandle, limiter: Arc<RateLimiter>) -> Self {
        // Timeouts are applied per request so a config change takes effect
        // without rebuilding the client.
        let http = reqwest::Client::builder()
            .build()
            .expect("reqwest client construction cannot fail with default TLS");
        Self {
            http,
            limiter,
            config,
        }
    }

    async fn call_with_retry(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelOutput, ModelError> {
        let config = self.config.current();
        let mut last_error: Option<ModelError> = None;

        for attempt in 0..=config.ai.max_retries {
            if attempt > 0 {
                let mut delay = Duration::from_secs_f64(config.ai.retry_delay_s * attempt as f64);
                if let Some(ModelError::RateLimited {
                    retry_after_s: Some(secs),
                }) = last_error
                {
                    delay = delay.max(Duration::from_secs(secs));
                }
                warn!(
                    attempt,
                    max = config.ai.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "retrying model call"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ModelError::Cancelled),
                    _ = sleep(delay) => {}
                }
            }

            self.limiter
                .wait(cancel)
                .await
                .map_err(|_| ModelError::Cancelled)?;

            match self.send_once(&request, &config, cancel).await {
                Ok(output) => {
                    debug!(
                        attempt,
                        prompt_tokens = output.prompt_tokens,
                        completion_tokens = output.completion_tokens,
                        "model call succeeded"
                    );
                    return Ok(output);
                }
                Err(ModelError::Cancelled) => return Err(ModelError::Cancelled),
                Err(e) if e.is_retryable() && attempt < config.ai.max_retries => {
                    warn!(attempt, error = %e, "model call failed; will retry");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ModelError::Network("retries exhausted".into())))
    }

    async fn send_once(
        &self,
        request: &ChatRequest,
        config: &crate::config::AppConfig,
        cancel: &CancellationToken,
    ) -> Result<ModelOutput, ModelError> {
        let url = format!(
            "{}/chat/completions",
            config.ai.base_url.trim_end_matches('/')
        );
        let send = self
            .http
            .post(&url)
            .bearer_auth(&config.ai.api_key)
            .timeout(config.request_timeout())
            .json(request)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            result = send => result.map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout { secs: config.ai.timeout_s }
                } else {
                    ModelError::Network(e.to_string())
                }
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), retry_after, &body));
        }

        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            result = response.text() => result.map_err(|e| ModelError::Network(e.to_string()))?,
        };
        extract_output(&body)
    }
}

/// Map an unsuccessful HTTP status onto a [`ModelError`].
fn classify_status(status: u16, retry_after_s: Option<u64>, body: &str) -> ModelError {
    match status {
        429 => ModelError::RateLimited { retry_after_s },
        401 | 403 => ModelError::Unauthorized { status },
        500..=599 => ModelError::ServiceUnavailable { status },
        _ => ModelError::BadRequest {
            status,
            detail: body.chars().take(300).collect(),
        },
    }
}

/// Pull the assistant text and usage out of a response body.
fn extract_output(body: &str) -> Result<ModelOutput, ModelError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ModelError::MalformedResponse(format!("json parse: {e}")))?;
    let text = response
        .choices
        .first()
        .and_then(|choice| choice.message.content.clone())
        .ok_or_else(|| ModelError::MalformedResponse("no assistant content in response".into()))?;
    let usage = response.usage.unwrap_or_default();
    Ok(ModelOutput {
        text,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
    })
}

#[async_trait]
impl ModelApi for HttpModelClient {
    async fn ocr(
        &self,
        image_jpeg: &[u8],
        model: &str,
        instructions: &str,
        cancel: &CancellationToken,
    ) -> Result<ModelOutput, ModelError> {
        let data_url = format!("data:image/jpeg;base64,{}", BASE64.encode(image_jpeg));
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage::system(instructions),
                ChatMessage::user_with_image("Transcribe this page.", data_url),
            ],
            temperature: Some(TEMPERATURE),
            max_tokens: None,
        };
        self.call_with_retry(request, cancel).await
    }

    async fn transform(
        &self,
        source_text: &str,
        model: &str,
        user_prompt: &str,
        context: Option<&AdjacentContext>,
        cancel: &CancellationToken,
    ) -> Result<ModelOutput, ModelError> {
        let mut messages = vec![ChatMessage::system(prompts::TRANSFORM_SYSTEM_PROMPT)];
        if let Some(ctx) = context {
            messages.push(ChatMessage::system(prompts::adjacent_context_block(
                ctx.previous.as_deref(),
                ctx.next.as_deref(),
            )));
        }
        messages.push(ChatMessage::user(format!(
            "{user_prompt}\n\n\"\"\"\n{source_text}\n\"\"\""
        )));

        let request = ChatRequest {
            model: model.to_string(),
            messages,
            temperature: Some(TEMPERATURE),
            max_tokens: None,
        };
        self.call_with_retry(request, cancel).await
    }
}
