//! Anthropic Messages API adapter.
//!
//! Images and PDFs travel as base64 content blocks; the system prompt is a
//! top-level field. Anthropic has no structured JSON mode, so
//! [`ResponseFormat::JsonObject`] is signalled with a prompt-level
//! instruction instead.

use serde_json::{json, Value};

use super::provider::AdapterConfig;
use super::{
    merge_model_params, normalize_base_url, LlmResponse, PreparedRequest, ProviderError,
    ResponseFormat, TokenUsage, VisionRequest,
};

/// Anthropic API version header value.
const ANTHROPIC_API_VERSION: &str = "2023-06-01";

/// Appended to the prompt when the caller wants a JSON object back.
const JSON_ONLY_INSTRUCTION: &str =
    "Respond with a single valid JSON object only, with no surrounding text or code fences.";

/// Body keys callers may never override via model params.
const PROTECTED_KEYS: &[&str] = &["model", "messages", "system"];

/// Build a `/v1/messages` request.
///
/// # Errors
///
/// Returns [`ProviderError::MissingEndpoint`] when no endpoint is
/// configured and [`ProviderError::MissingKey`] when the API key is absent.
pub fn build_request(
    config: &AdapterConfig,
    request: &VisionRequest,
) -> Result<PreparedRequest, ProviderError> {
    if config.endpoint.is_empty() {
        return Err(ProviderError::MissingEndpoint(config.provider.as_str()));
    }
    let key = config.require_key()?;

    let url = format!("{}/v1/messages", normalize_base_url(&config.endpoint));
    let headers = vec![
        ("content-type".to_owned(), "application/json".to_owned()),
        ("x-api-key".to_owned(), key.to_owned()),
        (
            "anthropic-version".to_owned(),
            ANTHROPIC_API_VERSION.to_owned(),
        ),
    ];

    let mut content = Vec::new();
    if !request.documents.is_empty() {
        for doc in &request.documents {
            content.push(json!({
                "type": "document",
                "source": {
                    "type": "base64",
                    "media_type": "application/pdf",
                    "data": doc.data_base64,
                }
            }));
        }
    } else {
        for image in &request.images {
            content.push(image_block(&image.mime_type, &image.data_base64));
        }
    }
    for labeled in &request.labeled_inputs {
        content.push(json!({"type": "text", "text": format!("[{}]", labeled.label)}));
        content.push(image_block(
            &labeled.image.mime_type,
            &labeled.image.data_base64,
        ));
    }

    let mut prompt = request.prompt.clone();
    if request.response_format == ResponseFormat::JsonObject {
        prompt.push_str("\n\n");
        prompt.push_str(JSON_ONLY_INSTRUCTION);
    }
    content.push(json!({"type": "text", "text": prompt}));

    let mut body = json!({
        "model": config.model,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
        "messages": [{"role": "user", "content": content}],
    });
    if let Some(system) = &request.system {
        body["system"] = json!(system);
    }
    merge_model_params(&mut body, &request.model_params, PROTECTED_KEYS);

    Ok(PreparedRequest { url, headers, body })
}

fn image_block(mime_type: &str, data_base64: &str) -> Value {
    json!({
        "type": "image",
        "source": {
            "type": "base64",
            "media_type": mime_type,
            "data": data_base64,
        }
    })
}

/// Parse a Messages API response body.
///
/// # Errors
///
/// Returns [`ProviderError::Parse`] when the body is not JSON or carries
/// no text content blocks.
pub fn parse_response(raw: &str) -> Result<LlmResponse, ProviderError> {
    let parsed: Value =
        serde_json::from_str(raw).map_err(|e| ProviderError::Parse(e.to_string()))?;

    let blocks = parsed
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::Parse("missing content array".to_owned()))?;

    let mut content = String::new();
    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            content.push_str(block.get("text").and_then(Value::as_str).unwrap_or_default());
        }
    }
    if content.is_empty() {
        return Err(ProviderError::Parse("no text content blocks".to_owned()));
    }

    Ok(LlmResponse {
        content,
        usage: parse_usage(&parsed),
    })
}

fn parse_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage.get("input_tokens").and_then(Value::as_u64)?,
        completion_tokens: usage
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}
