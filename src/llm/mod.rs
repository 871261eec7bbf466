//! LLM provider abstraction layer.
//!
//! Defines the shared request/response types used by all provider adapters,
//! plus the HTTP error-body hygiene helpers.
//!
//! Three adapter families are implemented:
//! - [`openai`] — OpenAI-compatible `/chat/completions` (OpenAI, OpenRouter,
//!   Ollama, Ollama Cloud, Mistral, Groq, custom endpoints)
//! - [`anthropic`] — Anthropic `/v1/messages` API
//! - [`gemini`] — Gemini `:generateContent` API
//!
//! Adapters expose two pure operations, `build_request` and
//! `parse_response`; all I/O lives in [`dispatcher`]. The
//! [`provider::AdapterConfig`] passed to an adapter carries only the
//! selected provider's secret, so an adapter cannot read another
//! provider's key even by accident.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod anthropic;
pub mod dispatcher;
pub mod gemini;
pub mod json_extract;
pub mod openai;
pub mod provider;
pub mod rate_limit;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// An inline image sent to a vision model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInput {
    /// MIME type (e.g. `image/png`).
    pub mime_type: String,
    /// Base64-encoded image bytes.
    pub data_base64: String,
}

/// An image with an inline text label preceding it, so the model can
/// cross-reference ("[Part 2 of 5]" followed by that part's first page).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledInput {
    /// Label emitted as `[<label>]` immediately before the image.
    pub label: String,
    /// The labeled image.
    pub image: ImageInput,
}

/// A native PDF document for providers that accept one directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInput {
    /// Original file name, forwarded where the provider wants one.
    pub file_name: String,
    /// Base64-encoded PDF bytes.
    pub data_base64: String,
}

/// Requested response shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Free text.
    Text,
    /// A single JSON object, signalled in the provider's native way.
    JsonObject,
}

/// A vision-model request, provider-agnostic.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    /// User prompt text, emitted after all visual inputs.
    pub prompt: String,
    /// System prompt, when the caller has one.
    pub system: Option<String>,
    /// Page images. Ignored when `documents` is non-empty and the provider
    /// accepts native PDFs.
    pub images: Vec<ImageInput>,
    /// Labeled reference images (e.g. sampled split parts), order preserved.
    pub labeled_inputs: Vec<LabeledInput>,
    /// Native PDF documents; take precedence over `images` where supported.
    pub documents: Vec<DocumentInput>,
    /// Requested response shape.
    pub response_format: ResponseFormat,
    /// Completion token budget. Clamped by the dispatcher.
    pub max_tokens: u32,
    /// Sampling temperature. Clamped by the dispatcher.
    pub temperature: f64,
    /// Extra provider parameters merged into the request body. Structural
    /// keys are refused by the adapters.
    pub model_params: serde_json::Map<String, Value>,
}

impl VisionRequest {
    /// A text-plus-images request with library defaults.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            images: Vec::new(),
            labeled_inputs: Vec::new(),
            documents: Vec::new(),
            response_format: ResponseFormat::JsonObject,
            max_tokens: 4096,
            temperature: 0.1,
            model_params: serde_json::Map::new(),
        }
    }
}

/// A fully built provider request, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    /// Absolute endpoint URL.
    pub url: String,
    /// Request headers (`content-type` included).
    pub headers: Vec<(String, String)>,
    /// JSON request body.
    pub body: Value,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Token usage when the provider reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt/input.
    pub prompt_tokens: u64,
    /// Tokens generated in the completion.
    pub completion_tokens: u64,
}

/// A normalized provider response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmResponse {
    /// Concatenated text content.
    pub content: String,
    /// Usage statistics, absent when the provider does not report them.
    pub usage: Option<TokenUsage>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the pure adapter operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No endpoint configured and the provider has no default.
    #[error("no endpoint configured for provider {0}")]
    MissingEndpoint(&'static str),
    /// The provider requires an API key and none is configured.
    #[error("no API key configured for provider {0}")]
    MissingKey(&'static str),
    /// Response did not match the provider's documented schema.
    #[error("provider response parse error: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Shared adapter helpers
// ---------------------------------------------------------------------------

/// Strip one trailing `/` from a base URL so path concatenation never
/// emits `//`.
pub fn normalize_base_url(base: &str) -> &str {
    base.strip_suffix('/').unwrap_or(base)
}

/// Merge caller-supplied model parameters into a JSON request body,
/// refusing to overwrite structural fields. Disallowed keys are silently
/// dropped.
pub fn merge_model_params(
    body: &mut Value,
    params: &serde_json::Map<String, Value>,
    protected: &[&str],
) {
    let Some(map) = body.as_object_mut() else {
        return;
    };
    for (key, value) in params {
        if protected.contains(&key.as_str()) {
            continue;
        }
        map.insert(key.clone(), value.clone());
    }
}

/// Maximum characters of an upstream error body surfaced to callers.
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Collapse whitespace, redact obvious secrets, and truncate an upstream
/// HTTP error body before it is surfaced in errors or logs.
pub fn sanitize_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"sk-ant-[A-Za-z0-9_\-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"sk-or-[A-Za-z0-9_\-]{10,}",
        r"AIza[A-Za-z0-9_\-]{20,}",
        r"gsk_[A-Za-z0-9]{20,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_base_url_strips_one_slash() {
        assert_eq!(normalize_base_url("http://x/"), "http://x");
        assert_eq!(normalize_base_url("http://x"), "http://x");
        // Only one trailing slash is stripped; a double slash is the
        // caller's configuration bug, surfaced as-is.
        assert_eq!(normalize_base_url("http://x//"), "http://x/");
    }

    #[test]
    fn test_merge_model_params_skips_protected() {
        let mut body = json!({"model": "m", "messages": [], "temperature": 0.1});
        let mut params = serde_json::Map::new();
        params.insert("model".to_owned(), json!("evil"));
        params.insert("top_p".to_owned(), json!(0.5));
        merge_model_params(&mut body, &params, &["model", "messages"]);
        assert_eq!(body["model"], "m");
        assert_eq!(body["top_p"], 0.5);
    }

    #[test]
    fn test_sanitize_error_body_redacts_and_truncates() {
        let key = format!("sk-{}", "a".repeat(40));
        let sanitized = sanitize_error_body(&format!("bad key {key} rejected"));
        assert!(!sanitized.contains(&key));
        assert!(sanitized.contains("[REDACTED]"));

        let long = "x".repeat(500);
        let truncated = sanitize_error_body(&long);
        assert!(truncated.chars().count() < 320);
        assert!(truncated.ends_with("...[truncated]"));
    }

    #[test]
    fn test_sanitize_error_body_collapses_whitespace() {
        assert_eq!(sanitize_error_body("a\n\n  b\tc"), "a b c");
    }
}
