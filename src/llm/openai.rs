//! OpenAI-compatible chat-completions adapter.
//!
//! Serves OpenAI, OpenRouter, local Ollama, Ollama Cloud, Mistral, Groq,
//! and custom OpenAI-compatible endpoints. Differences between them are
//! limited to auth (bearer token optional for local Ollama and custom
//! servers), OpenRouter's attribution headers, and Ollama Cloud's `/v1`
//! path normalization.

use serde_json::{json, Value};

use super::provider::{AdapterConfig, Provider};
use super::{
    merge_model_params, normalize_base_url, LlmResponse, PreparedRequest, ProviderError,
    ResponseFormat, TokenUsage, VisionRequest,
};

/// Attribution headers OpenRouter uses for ranking and abuse reports.
const OPENROUTER_REFERER: &str = "https://github.com/eccb/partsmith";
const OPENROUTER_TITLE: &str = "partsmith";

/// Body keys callers may never override via model params.
const PROTECTED_KEYS: &[&str] = &["model", "messages"];

/// Build a chat-completions request.
///
/// # Errors
///
/// Returns [`ProviderError::MissingEndpoint`] when no endpoint is
/// configured, and [`ProviderError::MissingKey`] when the provider
/// requires an API key and none is present.
pub fn build_request(
    config: &AdapterConfig,
    request: &VisionRequest,
) -> Result<PreparedRequest, ProviderError> {
    if config.endpoint.is_empty() {
        return Err(ProviderError::MissingEndpoint(config.provider.as_str()));
    }

    let mut base = normalize_base_url(&config.endpoint).to_owned();
    // Ollama Cloud publishes its OpenAI-compatible surface under /v1 but
    // is usually configured with the bare host.
    if config.provider == Provider::OllamaCloud && !base.ends_with("/v1") {
        base.push_str("/v1");
    }
    let url = format!("{base}/chat/completions");

    let mut headers = vec![("content-type".to_owned(), "application/json".to_owned())];
    if config.provider.requires_api_key() {
        let key = config.require_key()?;
        headers.push(("authorization".to_owned(), format!("Bearer {key}")));
    } else if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
        headers.push(("authorization".to_owned(), format!("Bearer {key}")));
    }
    if config.provider == Provider::OpenRouter {
        headers.push(("HTTP-Referer".to_owned(), OPENROUTER_REFERER.to_owned()));
        headers.push(("X-Title".to_owned(), OPENROUTER_TITLE.to_owned()));
    }

    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.push(json!({"role": "user", "content": user_content(config, request)}));

    let mut body = json!({
        "model": config.model,
        "messages": messages,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    });
    if request.response_format == ResponseFormat::JsonObject {
        body["response_format"] = json!({"type": "json_object"});
    }
    merge_model_params(&mut body, &request.model_params, PROTECTED_KEYS);

    Ok(PreparedRequest { url, headers, body })
}

/// Assemble the user-message content array: primary inputs (native PDF
/// when the provider accepts one, page images otherwise), then labeled
/// reference images, then the prompt text.
fn user_content(config: &AdapterConfig, request: &VisionRequest) -> Vec<Value> {
    let mut parts = Vec::new();

    if !request.documents.is_empty() && config.provider.supports_pdf_input() {
        for doc in &request.documents {
            parts.push(json!({
                "type": "file",
                "file": {
                    "filename": doc.file_name,
                    "file_data": format!("data:application/pdf;base64,{}", doc.data_base64),
                }
            }));
        }
    } else {
        for image in &request.images {
            parts.push(image_part(&image.mime_type, &image.data_base64));
        }
    }

    for labeled in &request.labeled_inputs {
        parts.push(json!({"type": "text", "text": format!("[{}]", labeled.label)}));
        parts.push(image_part(&labeled.image.mime_type, &labeled.image.data_base64));
    }

    parts.push(json!({"type": "text", "text": request.prompt}));
    parts
}

fn image_part(mime_type: &str, data_base64: &str) -> Value {
    json!({
        "type": "image_url",
        "image_url": {"url": format!("data:{mime_type};base64,{data_base64}")}
    })
}

/// Parse a chat-completions response body.
///
/// # Errors
///
/// Returns [`ProviderError::Parse`] when the body is not JSON or carries
/// no assistant message content.
pub fn parse_response(raw: &str) -> Result<LlmResponse, ProviderError> {
    let parsed: Value =
        serde_json::from_str(raw).map_err(|e| ProviderError::Parse(e.to_string()))?;

    let message = parsed
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| ProviderError::Parse("missing choices[0].message".to_owned()))?;

    let content = match message.get("content") {
        Some(Value::String(text)) => text.clone(),
        // Some compatible servers return content as an array of parts.
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => {
            return Err(ProviderError::Parse(
                "message content is neither string nor parts".to_owned(),
            ))
        }
    };

    Ok(LlmResponse {
        content,
        usage: parse_usage(&parsed),
    })
}

fn parse_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_u64)?,
        completion_tokens: usage
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ImageInput;

    fn config(provider: Provider) -> AdapterConfig {
        AdapterConfig {
            provider,
            endpoint: provider.default_endpoint().to_owned(),
            model: "test-model".to_owned(),
            api_key: Some("test-key".to_owned()),
        }
    }

    #[test]
    fn test_build_request_shapes_body() {
        let mut request = VisionRequest::new("Extract metadata.");
        request.system = Some("You are a librarian.".to_owned());
        request.images.push(ImageInput {
            mime_type: "image/png".to_owned(),
            data_base64: "QUJD".to_owned(),
        });

        let prepared = build_request(&config(Provider::OpenAi), &request).expect("build");
        assert_eq!(prepared.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(prepared.body["model"], "test-model");
        assert_eq!(prepared.body["response_format"]["type"], "json_object");

        let messages = prepared.body["messages"].as_array().expect("messages");
        assert_eq!(messages[0]["role"], "system");
        let content = messages[1]["content"].as_array().expect("content parts");
        assert_eq!(content[0]["type"], "image_url");
        assert!(content[0]["image_url"]["url"]
            .as_str()
            .expect("url")
            .starts_with("data:image/png;base64,"));
        assert_eq!(content[1]["type"], "text");
    }

    #[test]
    fn test_ollama_cloud_gets_v1_suffix() {
        let mut cfg = config(Provider::OllamaCloud);
        cfg.endpoint = "https://ollama.com".to_owned();
        let prepared = build_request(&cfg, &VisionRequest::new("p")).expect("build");
        assert_eq!(prepared.url, "https://ollama.com/v1/chat/completions");

        cfg.endpoint = "https://ollama.com/v1/".to_owned();
        let prepared = build_request(&cfg, &VisionRequest::new("p")).expect("build");
        assert_eq!(prepared.url, "https://ollama.com/v1/chat/completions");
    }

    #[test]
    fn test_local_ollama_omits_authorization() {
        let mut cfg = config(Provider::Ollama);
        cfg.api_key = None;
        let prepared = build_request(&cfg, &VisionRequest::new("p")).expect("build");
        assert!(prepared
            .headers
            .iter()
            .all(|(name, _)| name != "authorization"));
    }

    #[test]
    fn test_missing_key_fails_fast() {
        let mut cfg = config(Provider::Groq);
        cfg.api_key = None;
        let result = build_request(&cfg, &VisionRequest::new("p"));
        assert!(matches!(result, Err(ProviderError::MissingKey("groq"))));
    }

    #[test]
    fn test_openrouter_attribution_headers() {
        let prepared =
            build_request(&config(Provider::OpenRouter), &VisionRequest::new("p")).expect("build");
        assert!(prepared.headers.iter().any(|(name, _)| name == "HTTP-Referer"));
        assert!(prepared.headers.iter().any(|(name, _)| name == "X-Title"));
    }

    #[test]
    fn test_parse_response_text_and_usage() {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"title\":\"x\"}"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        });
        let response = parse_response(&body.to_string()).expect("parse");
        assert_eq!(response.content, "{\"title\":\"x\"}");
        let usage = response.usage.expect("usage");
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 3);
    }

    #[test]
    fn test_parse_response_empty_choices_is_error() {
        assert!(parse_response(r#"{"choices": []}"#).is_err());
        assert!(parse_response("not json").is_err());
    }
}
