//! The LLM dispatcher: one entry point for every vision-model call.
//!
//! Responsibilities, in order per attempt: clamp request parameters,
//! resolve the provider's adapter, acquire a rate-limiter token, execute
//! over HTTP with a per-attempt timeout, retry transient failures with
//! exponential backoff, and normalize the terminal outcome.
//!
//! The HTTP hop is behind the [`Transport`] trait so tests can count
//! attempts and script failures without a network. Retried LLM calls are
//! safe because responses only feed downstream state transitions — the
//! calls themselves have no server-side effects we rely on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::cancel::Cancellation;

use super::provider::{AdapterConfig, ProviderFamily};
use super::rate_limit::RateLimiter;
use super::{
    anthropic, gemini, openai, sanitize_error_body, LlmResponse, PreparedRequest, ProviderError,
    VisionRequest,
};

/// Smallest accepted completion budget.
pub const MIN_COMPLETION_TOKENS: u32 = 64;
/// Largest accepted completion budget.
pub const MAX_COMPLETION_TOKENS: u32 = 16_384;

/// Per-call dispatch tuning.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Requests-per-minute applied to the shared limiter before each
    /// acquisition, so settings changes take effect immediately.
    pub rpm: u32,
    /// Per-attempt timeout; a fired timeout aborts the HTTP call and is
    /// surfaced immediately, never retried.
    pub attempt_timeout: Duration,
    /// Maximum HTTP attempts (first try included).
    pub max_attempts: u32,
    /// Backoff base; attempt `n` failing transiently sleeps
    /// `base * 2^(n-1)` before the next try.
    pub backoff_base: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            rpm: 15,
            attempt_timeout: Duration::from_secs(90),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Terminal outcomes of a dispatched LLM call.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The per-attempt timeout fired.
    #[error("LLM attempt timed out after {0:?}")]
    Timeout(Duration),
    /// The caller cancelled the work.
    #[error("LLM call cancelled")]
    Cancelled,
    /// Terminal non-2xx response (4xx directly, 429/5xx after retries).
    /// The body is redacted and truncated before it gets here.
    #[error("provider returned status {status}: {body}")]
    HttpStatus {
        /// Upstream HTTP status code.
        status: u16,
        /// Sanitized response body excerpt.
        body: String,
    },
    /// Transport-level failures exhausted the retry budget.
    #[error("transport error after {attempts} attempts: {message}")]
    Transport {
        /// Attempts made.
        attempts: u32,
        /// Last transport error.
        message: String,
    },
    /// Request building or response parsing failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl DispatchError {
    /// Whether this outcome came from exhausted transient failures (as
    /// opposed to a terminal bad request).
    pub fn is_transient_exhaustion(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => is_transient_status(*status),
            Self::Transport { .. } => true,
            _ => false,
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A raw HTTP response, body read to completion.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body text.
    pub body: String,
}

/// Transport-level failures (everything below HTTP semantics).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The per-attempt timeout elapsed; the in-flight call was aborted.
    #[error("attempt timed out")]
    Timeout,
    /// Cancellation fired; the in-flight call was aborted.
    #[error("attempt cancelled")]
    Cancelled,
    /// Connection/IO failure.
    #[error("transport failure: {0}")]
    Io(String),
}

/// Executes one prepared request. Implementations must abort the
/// underlying call when the timeout or cancellation fires.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute the request, resolving with the full response body.
    async fn execute(
        &self,
        request: &PreparedRequest,
        timeout: Duration,
        cancel: &Cancellation,
    ) -> Result<TransportResponse, TransportError>;
}

/// Production transport over a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Wrap a shared client (one per process; the pool is tuned there).
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        request: &PreparedRequest,
        timeout: Duration,
        cancel: &Cancellation,
    ) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let send = async {
            let response = builder
                .json(&request.body)
                .send()
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            Ok(TransportResponse { status, body })
        };

        // Dropping the send future tears down the outbound connection, so
        // both arms below abort the in-flight call.
        tokio::select! {
            result = send => result,
            () = tokio::time::sleep(timeout) => Err(TransportError::Timeout),
            () = cancel.cancelled() => Err(TransportError::Cancelled),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Provider-agnostic LLM dispatcher. One instance per process, sharing
/// the HTTP client and rate limiter across all stage handlers.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
}

impl Dispatcher {
    /// Production dispatcher over a shared `reqwest::Client`.
    pub fn new(client: reqwest::Client, limiter: Arc<RateLimiter>) -> Self {
        Self {
            transport: Arc::new(ReqwestTransport::new(client)),
            limiter,
        }
    }

    /// Dispatcher over a custom transport (tests).
    pub fn with_transport(transport: Arc<dyn Transport>, limiter: Arc<RateLimiter>) -> Self {
        Self { transport, limiter }
    }

    /// Call a vision model and return the normalized response.
    ///
    /// The request is clamped in place (including any `max_tokens` /
    /// `temperature` keys inside `model_params`).
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] per the taxonomy: `Timeout` immediately
    /// on a fired attempt timeout, `Cancelled` on caller cancellation,
    /// `HttpStatus` for terminal responses, `Transport` for exhausted
    /// connection failures, `Provider` for build/parse failures.
    pub async fn call_vision_model(
        &self,
        config: &AdapterConfig,
        request: &mut VisionRequest,
        options: &DispatchOptions,
        cancel: &Cancellation,
    ) -> Result<LlmResponse, DispatchError> {
        clamp_request(request);
        let prepared = build_request(config, request)?;

        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            // Re-apply the configured limit so a settings change applies
            // to this acquisition, then take one token.
            self.limiter.set_limit(options.rpm).await;
            self.limiter.acquire().await;
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            debug!(
                provider = %config.provider,
                model = %config.model,
                attempt,
                "dispatching vision request"
            );

            match self
                .transport
                .execute(&prepared, options.attempt_timeout, cancel)
                .await
            {
                Ok(response) if (200..300).contains(&response.status) => {
                    return parse_response(config, &response.body).map_err(DispatchError::from);
                }
                Ok(response) if is_transient_status(response.status) => {
                    warn!(
                        provider = %config.provider,
                        status = response.status,
                        attempt,
                        "transient provider error"
                    );
                    if attempt >= options.max_attempts {
                        return Err(DispatchError::HttpStatus {
                            status: response.status,
                            body: sanitize_error_body(&response.body),
                        });
                    }
                    self.backoff(options, attempt, cancel).await?;
                }
                Ok(response) => {
                    return Err(DispatchError::HttpStatus {
                        status: response.status,
                        body: sanitize_error_body(&response.body),
                    });
                }
                Err(TransportError::Timeout) => {
                    return Err(DispatchError::Timeout(options.attempt_timeout));
                }
                Err(TransportError::Cancelled) => return Err(DispatchError::Cancelled),
                Err(TransportError::Io(message)) => {
                    warn!(
                        provider = %config.provider,
                        attempt,
                        error = %message,
                        "transport failure"
                    );
                    if attempt >= options.max_attempts {
                        return Err(DispatchError::Transport {
                            attempts: attempt,
                            message,
                        });
                    }
                    self.backoff(options, attempt, cancel).await?;
                }
            }
        }
    }

    /// Sleep `base * 2^(attempt-1)`, aborting early on cancellation.
    async fn backoff(
        &self,
        options: &DispatchOptions,
        attempt: u32,
        cancel: &Cancellation,
    ) -> Result<(), DispatchError> {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = options.backoff_base.saturating_mul(factor);
        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(()),
            () = cancel.cancelled() => Err(DispatchError::Cancelled),
        }
    }
}

/// Build the provider request via the matching adapter family.
fn build_request(
    config: &AdapterConfig,
    request: &VisionRequest,
) -> Result<PreparedRequest, ProviderError> {
    match config.provider.family() {
        ProviderFamily::OpenAiCompat => openai::build_request(config, request),
        ProviderFamily::Anthropic => anthropic::build_request(config, request),
        ProviderFamily::Gemini => gemini::build_request(config, request),
    }
}

/// Parse the provider response via the matching adapter family.
fn parse_response(config: &AdapterConfig, body: &str) -> Result<LlmResponse, ProviderError> {
    match config.provider.family() {
        ProviderFamily::OpenAiCompat => openai::parse_response(body),
        ProviderFamily::Anthropic => anthropic::parse_response(body),
        ProviderFamily::Gemini => gemini::parse_response(body),
    }
}

/// Clamp tunable parameters to the accepted ranges, writing the clamped
/// values back into `model_params` when those keys are present so an
/// adapter merge cannot undo the clamping.
pub fn clamp_request(request: &mut VisionRequest) {
    request.max_tokens = request
        .max_tokens
        .clamp(MIN_COMPLETION_TOKENS, MAX_COMPLETION_TOKENS);
    if !request.temperature.is_finite() {
        request.temperature = 0.0;
    }
    request.temperature = request.temperature.clamp(0.0, 2.0);

    if request.model_params.contains_key("max_tokens") {
        request
            .model_params
            .insert("max_tokens".to_owned(), json!(request.max_tokens));
    }
    if request.model_params.contains_key("temperature") {
        request
            .model_params
            .insert("temperature".to_owned(), json!(request.temperature));
    }
}
