//! Gemini `generateContent` adapter.
//!
//! The API key travels as a URL query parameter; visual inputs are
//! `inline_data` parts; JSON mode is `generationConfig.response_mime_type`.

use serde_json::{json, Value};

use super::provider::AdapterConfig;
use super::{
    merge_model_params, normalize_base_url, LlmResponse, PreparedRequest, ProviderError,
    ResponseFormat, TokenUsage, VisionRequest,
};

/// Body keys callers may never override via model params.
const PROTECTED_KEYS: &[&str] = &["contents", "systemInstruction", "model"];

/// Build a `models/{model}:generateContent` request.
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
    let encoded_key: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();

    let url = format!(
        "{}/models/{}:generateContent?key={encoded_key}",
        normalize_base_url(&config.endpoint),
        config.model,
    );
    let headers = vec![("content-type".to_owned(), "application/json".to_owned())];

    let mut parts = Vec::new();
    if !request.documents.is_empty() {
        for doc in &request.documents {
            parts.push(json!({
                "inline_data": {"mime_type": "application/pdf", "data": doc.data_base64}
            }));
        }
    } else {
        for image in &request.images {
            parts.push(inline_part(&image.mime_type, &image.data_base64));
        }
    }
    for labeled in &request.labeled_inputs {
        parts.push(json!({"text": format!("[{}]", labeled.label)}));
        parts.push(inline_part(
            &labeled.image.mime_type,
            &labeled.image.data_base64,
        ));
    }
    parts.push(json!({"text": request.prompt}));

    let mut generation_config = json!({
        "maxOutputTokens": request.max_tokens,
        "temperature": request.temperature,
    });
    if request.response_format == ResponseFormat::JsonObject {
        generation_config["response_mime_type"] = json!("application/json");
    }

    let mut body = json!({
        "contents": [{"role": "user", "parts": parts}],
        "generationConfig": generation_config,
    });
    if let Some(system) = &request.system {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
    }
    merge_model_params(&mut body, &request.model_params, PROTECTED_KEYS);

    Ok(PreparedRequest { url, headers, body })
}

fn inline_part(mime_type: &str, data_base64: &str) -> Value {
    json!({"inline_data": {"mime_type": mime_type, "data": data_base64}})
}

/// Parse a `generateContent` response body.
///
/// # Errors
///
/// Returns [`ProviderError::Parse`] when the body is not JSON or the first
/// candidate carries no text parts.
pub fn parse_response(raw: &str) -> Result<LlmResponse, ProviderError> {
    let parsed: Value =
        serde_json::from_str(raw).map_err(|e| ProviderError::Parse(e.to_string()))?;

    let parts = parsed
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.pointer("/content/parts"))
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::Parse("missing candidates[0].content.parts".to_owned()))?;

    let content: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if content.is_empty() {
        return Err(ProviderError::Parse("no text parts in candidate".to_owned()));
    }

    Ok(LlmResponse {
        content,
        usage: parse_usage(&parsed),
    })
}

fn parse_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usageMetadata")?;
    Some(TokenUsage {
        prompt_tokens: usage.get("promptTokenCount").and_then(Value::as_u64)?,
        completion_tokens: usage
            .get("candidatesTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}
