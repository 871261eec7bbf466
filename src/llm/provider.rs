//! The closed provider enumeration and per-provider metadata.
//!
//! Adding a provider means adding a variant here plus (at most) an adapter
//! module; the dispatcher never changes. The [`AdapterConfig`] handed to an
//! adapter carries exactly one secret — the selected provider's — so key
//! isolation is a property of the type, not a runtime check.

use serde::{Deserialize, Serialize};

/// The adapter family a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    /// OpenAI-compatible `/chat/completions`.
    OpenAiCompat,
    /// Anthropic `/v1/messages`.
    Anthropic,
    /// Gemini `:generateContent`.
    Gemini,
}

/// Supported LLM providers. Closed set: unknown names fail at parse time,
/// long before a request is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// api.openai.com.
    OpenAi,
    /// openrouter.ai (OpenAI-compatible plus attribution headers).
    OpenRouter,
    /// Local Ollama server (no API key).
    Ollama,
    /// ollama.com hosted service.
    OllamaCloud,
    /// api.mistral.ai.
    Mistral,
    /// api.groq.com.
    Groq,
    /// Any other OpenAI-compatible endpoint.
    Custom,
    /// api.anthropic.com.
    Anthropic,
    /// generativelanguage.googleapis.com.
    Gemini,
}

impl Provider {
    /// All providers, for settings-key enumeration.
    pub const ALL: [Provider; 9] = [
        Self::OpenAi,
        Self::OpenRouter,
        Self::Ollama,
        Self::OllamaCloud,
        Self::Mistral,
        Self::Groq,
        Self::Custom,
        Self::Anthropic,
        Self::Gemini,
    ];

    /// Canonical lowercase name, as stored in settings.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::OpenRouter => "openrouter",
            Self::Ollama => "ollama",
            Self::OllamaCloud => "ollama_cloud",
            Self::Mistral => "mistral",
            Self::Groq => "groq",
            Self::Custom => "custom",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }

    /// Which adapter family serves this provider.
    pub fn family(self) -> ProviderFamily {
        match self {
            Self::Anthropic => ProviderFamily::Anthropic,
            Self::Gemini => ProviderFamily::Gemini,
            _ => ProviderFamily::OpenAiCompat,
        }
    }

    /// Default endpoint base URL.
    pub fn default_endpoint(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::OpenRouter => "https://openrouter.ai/api/v1",
            Self::Ollama => "http://localhost:11434/v1",
            Self::OllamaCloud => "https://ollama.com",
            Self::Mistral => "https://api.mistral.ai/v1",
            Self::Groq => "https://api.groq.com/openai/v1",
            // A custom provider has no sensible default; the loader
            // requires an explicit endpoint for it.
            Self::Custom => "",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
        }
    }

    /// Default vision-capable model.
    pub fn default_vision_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o",
            Self::OpenRouter => "google/gemini-2.0-flash-001",
            Self::Ollama => "llama3.2-vision",
            Self::OllamaCloud => "qwen3-vl:235b-cloud",
            Self::Mistral => "pixtral-large-latest",
            Self::Groq => "llama-3.2-90b-vision-preview",
            Self::Custom => "",
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::Gemini => "gemini-2.0-flash",
        }
    }

    /// Whether requests must carry this provider's API key.
    ///
    /// Local Ollama and custom endpoints may run without authentication;
    /// everyone else fails fast without a key.
    pub fn requires_api_key(self) -> bool {
        !matches!(self, Self::Ollama | Self::Custom)
    }

    /// Whether the provider accepts a native PDF document input.
    pub fn supports_pdf_input(self) -> bool {
        matches!(self, Self::Anthropic | Self::Gemini | Self::OpenAi)
    }

    /// The settings-store key holding this provider's API secret.
    pub fn api_key_setting(self) -> &'static str {
        match self {
            Self::OpenAi => "llm_openai_api_key",
            Self::OpenRouter => "llm_openrouter_api_key",
            Self::Ollama => "llm_ollama_api_key",
            Self::OllamaCloud => "llm_ollama_cloud_api_key",
            Self::Mistral => "llm_mistral_api_key",
            Self::Groq => "llm_groq_api_key",
            Self::Custom => "llm_custom_api_key",
            Self::Anthropic => "llm_anthropic_api_key",
            Self::Gemini => "llm_gemini_api_key",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = anyhow::Error;

    /// Parse a provider name as stored in settings. Accepts both `_` and
    /// `-` separators.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "openai" => Ok(Self::OpenAi),
            "openrouter" => Ok(Self::OpenRouter),
            "ollama" => Ok(Self::Ollama),
            "ollama_cloud" => Ok(Self::OllamaCloud),
            "mistral" => Ok(Self::Mistral),
            "groq" => Ok(Self::Groq),
            "custom" => Ok(Self::Custom),
            "anthropic" => Ok(Self::Anthropic),
            "gemini" => Ok(Self::Gemini),
            other => Err(anyhow::anyhow!("unknown LLM provider: {other:?}")),
        }
    }
}

/// The model an adapter call is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    /// First-pass vision extraction.
    Vision,
    /// Second-pass verification.
    Verification,
    /// Disagreement adjudication.
    Adjudicator,
}

/// Configuration handed to an adapter: one provider, one endpoint, one
/// model, and at most that provider's secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// The selected provider.
    pub provider: Provider,
    /// Endpoint base URL.
    pub endpoint: String,
    /// Model identifier.
    pub model: String,
    /// The selected provider's API secret, when configured.
    pub api_key: Option<String>,
}

impl AdapterConfig {
    /// Config with the provider's default endpoint and model.
    pub fn with_defaults(provider: Provider, api_key: Option<String>) -> Self {
        Self {
            provider,
            endpoint: provider.default_endpoint().to_owned(),
            model: provider.default_vision_model().to_owned(),
            api_key,
        }
    }

    /// The API key, or the adapter-level missing-key error.
    pub fn require_key(&self) -> Result<&str, super::ProviderError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(super::ProviderError::MissingKey(self.provider.as_str()))
    }
}

impl std::fmt::Debug for AdapterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterConfig")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "__REDACTED__"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse_accepts_separator_variants() {
        assert_eq!("ollama-cloud".parse::<Provider>().ok(), Some(Provider::OllamaCloud));
        assert_eq!("OLLAMA_CLOUD".parse::<Provider>().ok(), Some(Provider::OllamaCloud));
        assert_eq!("anthropic".parse::<Provider>().ok(), Some(Provider::Anthropic));
        assert!("chatgpt".parse::<Provider>().is_err());
    }

    #[test]
    fn test_provider_round_trip() {
        for provider in Provider::ALL {
            let parsed: Provider = provider.as_str().parse().expect("round trip");
            assert_eq!(parsed, provider);
        }
    }

    #[test]
    fn test_key_requirements() {
        assert!(!Provider::Ollama.requires_api_key());
        assert!(!Provider::Custom.requires_api_key());
        assert!(Provider::OpenAi.requires_api_key());
        assert!(Provider::Gemini.requires_api_key());
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let config = AdapterConfig::with_defaults(Provider::OpenAi, Some("sk-secret".to_owned()));
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("__REDACTED__"));
    }
}
