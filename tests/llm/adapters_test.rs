//! Cross-provider adapter contract tests: key isolation, trailing-slash
//! normalization, and wire-shape expectations.

use std::collections::HashMap;

use partsmith::config::RuntimeConfig;
use partsmith::llm::provider::{AdapterConfig, ModelRole, Provider, ProviderFamily};
use partsmith::llm::{anthropic, gemini, openai, PreparedRequest, VisionRequest};

fn build_for(config: &AdapterConfig, request: &VisionRequest) -> PreparedRequest {
    match config.provider.family() {
        ProviderFamily::OpenAiCompat => openai::build_request(config, request),
        ProviderFamily::Anthropic => anthropic::build_request(config, request),
        ProviderFamily::Gemini => gemini::build_request(config, request),
    }
    .expect("build request")
}

/// The secret for provider X never appears in a request built for
/// provider Y, because the adapter config structurally cannot carry it.
#[test]
fn adapter_requests_never_leak_other_providers_keys() {
    let mut settings = HashMap::new();
    for provider in Provider::ALL {
        settings.insert(
            provider.api_key_setting().to_owned(),
            format!("secret-for-{}", provider.as_str()),
        );
    }

    for selected in Provider::ALL {
        if selected == Provider::Custom {
            // Custom has no default endpoint; give it one.
            settings.insert(
                "llm_endpoint_url".to_owned(),
                "http://llm.internal/v1".to_owned(),
            );
        } else {
            settings.remove("llm_endpoint_url");
        }
        settings.insert("llm_provider".to_owned(), selected.as_str().to_owned());

        let config = RuntimeConfig::from_sources(&settings, |_| None);
        let prepared = build_for(
            &config.adapter_config(ModelRole::Vision),
            &VisionRequest::new("prompt"),
        );

        let rendered = format!(
            "{} {:?} {}",
            prepared.url, prepared.headers, prepared.body
        );
        for other in Provider::ALL {
            if other == selected {
                continue;
            }
            let foreign_secret = format!("secret-for-{}", other.as_str());
            assert!(
                !rendered.contains(&foreign_secret),
                "request for {selected} leaked the {other} secret"
            );
        }
    }
}

/// `adapter(url + "/")` builds the same request as `adapter(url)`.
#[test]
fn trailing_slash_endpoints_are_equivalent() {
    for provider in [Provider::OpenAi, Provider::Anthropic, Provider::Gemini, Provider::Groq] {
        let mut plain = AdapterConfig::with_defaults(provider, Some("k".to_owned()));
        plain.endpoint = plain.endpoint.trim_end_matches('/').to_owned();
        let mut slashed = plain.clone();
        slashed.endpoint.push('/');

        let request = VisionRequest::new("p");
        let a = build_for(&plain, &request);
        let b = build_for(&slashed, &request);
        assert_eq!(a, b, "provider {provider} not slash-normalized");

        let after_scheme = a.url.splitn(2, "://").nth(1).unwrap_or(&a.url);
        assert!(
            !after_scheme.contains("//"),
            "double slash in path of {}",
            a.url
        );
    }
}

/// Each family signals JSON mode its own way.
#[test]
fn json_mode_signals_per_family() {
    let request = VisionRequest::new("p");

    let openai_req = build_for(
        &AdapterConfig::with_defaults(Provider::OpenAi, Some("k".to_owned())),
        &request,
    );
    assert_eq!(openai_req.body["response_format"]["type"], "json_object");

    let gemini_req = build_for(
        &AdapterConfig::with_defaults(Provider::Gemini, Some("k".to_owned())),
        &request,
    );
    assert_eq!(
        gemini_req.body["generationConfig"]["response_mime_type"],
        "application/json"
    );

    let anthropic_req = build_for(
        &AdapterConfig::with_defaults(Provider::Anthropic, Some("k".to_owned())),
        &request,
    );
    assert!(anthropic_req.body.get("response_format").is_none());
    let text = anthropic_req.body["messages"][0]["content"]
        .as_array()
        .and_then(|content| content.last())
        .and_then(|block| block["text"].as_str())
        .expect("prompt block");
    assert!(text.contains("JSON object only"));
}
