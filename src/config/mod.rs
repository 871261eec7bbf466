//! Runtime configuration for the Smart Upload pipeline.
//!
//! Materialized from the settings store (a key-value table the admin UI
//! writes), with environment-variable fallbacks (`PARTSMITH_*`) and
//! provider defaults underneath.
//!
//! Precedence: settings store > env vars > defaults.
//!
//! The loaded [`RuntimeConfig`] holds every provider's secret, but the
//! [`AdapterConfig`](crate::llm::provider::AdapterConfig) it hands to the
//! LLM layer carries only the selected provider's key — adapters cannot
//! read another provider's secret.

use std::collections::HashMap;
use std::time::Duration;

use tracing::warn;

use crate::llm::dispatcher::DispatchOptions;
use crate::llm::provider::{AdapterConfig, ModelRole, Provider};

// ── Defaults ────────────────────────────────────────────────────

/// Default overall confidence threshold below which an item always needs
/// human review.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 70.0;
/// Default threshold for approving a split plan without a human.
pub const DEFAULT_AUTO_APPROVE_THRESHOLD: f64 = 90.0;
/// Default threshold for committing to the catalog without a human.
pub const DEFAULT_AUTONOMOUS_APPROVAL_THRESHOLD: f64 = 95.0;
/// Default threshold below which split planning is skipped entirely.
pub const DEFAULT_SKIP_PARSE_THRESHOLD: f64 = 60.0;
/// Default per-process requests-per-minute limit.
pub const DEFAULT_RATE_LIMIT_RPM: u32 = 15;
/// Default per-attempt LLM timeout in seconds.
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 90;
/// Default cap on pages per emitted part.
pub const DEFAULT_MAX_PAGES_PER_PART: i64 = 12;

/// Part labels that indicate the model labelled noise, not an instrument.
pub const DEFAULT_FORBIDDEN_LABELS: &[&str] = &[
    "unknown", "n/a", "na", "none", "untitled", "score", "music", "page", "pages", "blank",
    "cover", "title", "index", "notes", "part", "",
];

// ── Config ──────────────────────────────────────────────────────

/// Typed runtime configuration for the pipeline and LLM layer.
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Selected LLM provider.
    pub provider: Provider,
    /// Endpoint override; `None` uses the provider default.
    pub endpoint_url: Option<String>,
    /// First-pass vision model.
    pub vision_model: String,
    /// Second-pass verification model.
    pub verification_model: String,
    /// Adjudicator model; falls back to the verification model.
    pub adjudicator_model: Option<String>,
    /// Overall confidence floor (0-100): below it an item is never
    /// auto-approved and always routes to human review, regardless of
    /// the approval thresholds.
    pub confidence_threshold: f64,
    /// Split-plan auto-approval threshold (0-100).
    pub auto_approve_threshold: f64,
    /// Autonomous catalog-commit threshold (0-100).
    pub autonomous_approval_threshold: f64,
    /// Below this first-pass confidence, planning is skipped (0-100).
    pub skip_parse_threshold: f64,
    /// Whether the second verification pass runs at all.
    pub two_pass_enabled: bool,
    /// Whether high-confidence items may be committed without a human.
    pub autonomous_mode: bool,
    /// Per-process requests-per-minute share.
    pub rate_limit_rpm: u32,
    /// Per-attempt LLM timeout.
    pub llm_timeout: Duration,
    /// Extra model parameters for the vision pass.
    pub vision_model_params: serde_json::Map<String, serde_json::Value>,
    /// Extra model parameters for the verification pass.
    pub verification_model_params: serde_json::Map<String, serde_json::Value>,
    /// Extra model parameters for the adjudication pass.
    pub adjudicator_model_params: serde_json::Map<String, serde_json::Value>,
    /// Override for the vision system prompt.
    pub vision_prompt: Option<String>,
    /// Override for the verification system prompt.
    pub verification_prompt: Option<String>,
    /// Override for the adjudicator system prompt.
    pub adjudicator_prompt: Option<String>,
    /// Forbidden part labels (lowercased).
    pub forbidden_labels: Vec<String>,
    /// Cap on pages per emitted part.
    pub max_pages_per_part: i64,
    api_keys: HashMap<Provider, String>,
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("provider", &self.provider)
            .field("endpoint_url", &self.endpoint_url)
            .field("vision_model", &self.vision_model)
            .field("verification_model", &self.verification_model)
            .field("adjudicator_model", &self.adjudicator_model)
            .field("two_pass_enabled", &self.two_pass_enabled)
            .field("autonomous_mode", &self.autonomous_mode)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("api_keys", &format!("<{} configured>", self.api_keys.len()))
            .finish_non_exhaustive()
    }
}

impl RuntimeConfig {
    /// Load from a settings snapshot, falling back to process env vars.
    pub fn from_settings(settings: &HashMap<String, String>) -> Self {
        Self::from_sources(settings, |key| std::env::var(key).ok())
    }

    /// Load from a settings snapshot and a custom env resolver (testable).
    pub fn from_sources(
        settings: &HashMap<String, String>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let lookup = |setting_key: &str, env_key: &str| -> Option<String> {
            settings
                .get(setting_key)
                .map(String::as_str)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(ToOwned::to_owned)
                .or_else(|| env(env_key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty()))
        };

        let provider = lookup("llm_provider", "PARTSMITH_LLM_PROVIDER")
            .and_then(|raw| match raw.parse::<Provider>() {
                Ok(provider) => Some(provider),
                Err(e) => {
                    warn!(value = %raw, error = %e, "ignoring invalid llm_provider");
                    None
                }
            })
            .unwrap_or(Provider::OpenAi);

        let mut api_keys = HashMap::new();
        for candidate in Provider::ALL {
            let env_key = format!(
                "PARTSMITH_{}_API_KEY",
                candidate.as_str().to_uppercase()
            );
            if let Some(key) = lookup(candidate.api_key_setting(), &env_key) {
                api_keys.insert(candidate, key);
            }
        }

        let vision_model = lookup("llm_vision_model", "PARTSMITH_VISION_MODEL")
            .unwrap_or_else(|| provider.default_vision_model().to_owned());
        let verification_model = lookup("llm_verification_model", "PARTSMITH_VERIFICATION_MODEL")
            .unwrap_or_else(|| vision_model.clone());

        let forbidden_labels = lookup(
            "smart_upload_forbidden_labels",
            "PARTSMITH_FORBIDDEN_LABELS",
        )
        .and_then(|raw| parse_label_list(&raw))
        .unwrap_or_else(|| {
            DEFAULT_FORBIDDEN_LABELS
                .iter()
                .map(|s| (*s).to_owned())
                .collect()
        });

        Self {
            provider,
            endpoint_url: lookup("llm_endpoint_url", "PARTSMITH_LLM_ENDPOINT_URL"),
            vision_model,
            verification_model,
            adjudicator_model: lookup("llm_adjudicator_model", "PARTSMITH_ADJUDICATOR_MODEL"),
            confidence_threshold: parse_threshold(
                lookup("llm_confidence_threshold", "PARTSMITH_CONFIDENCE_THRESHOLD"),
                DEFAULT_CONFIDENCE_THRESHOLD,
            ),
            auto_approve_threshold: parse_threshold(
                lookup(
                    "llm_auto_approve_threshold",
                    "PARTSMITH_AUTO_APPROVE_THRESHOLD",
                ),
                DEFAULT_AUTO_APPROVE_THRESHOLD,
            ),
            autonomous_approval_threshold: parse_threshold(
                lookup(
                    "llm_autonomous_approval_threshold",
                    "PARTSMITH_AUTONOMOUS_APPROVAL_THRESHOLD",
                ),
                DEFAULT_AUTONOMOUS_APPROVAL_THRESHOLD,
            ),
            skip_parse_threshold: parse_threshold(
                lookup("llm_skip_parse_threshold", "PARTSMITH_SKIP_PARSE_THRESHOLD"),
                DEFAULT_SKIP_PARSE_THRESHOLD,
            ),
            two_pass_enabled: parse_bool(
                lookup("llm_two_pass_enabled", "PARTSMITH_TWO_PASS_ENABLED"),
                true,
            ),
            autonomous_mode: parse_bool(
                lookup("llm_autonomous_mode", "PARTSMITH_AUTONOMOUS_MODE"),
                false,
            ),
            rate_limit_rpm: parse_u32(
                lookup("llm_rate_limit_rpm", "PARTSMITH_RATE_LIMIT_RPM"),
                DEFAULT_RATE_LIMIT_RPM,
            ),
            llm_timeout: Duration::from_secs(parse_u64(
                lookup("llm_timeout_secs", "PARTSMITH_LLM_TIMEOUT_SECS"),
                DEFAULT_LLM_TIMEOUT_SECS,
            )),
            vision_model_params: parse_model_params(
                lookup("vision_model_params", "PARTSMITH_VISION_MODEL_PARAMS").as_deref(),
            ),
            verification_model_params: parse_model_params(
                lookup(
                    "verification_model_params",
                    "PARTSMITH_VERIFICATION_MODEL_PARAMS",
                )
                .as_deref(),
            ),
            adjudicator_model_params: parse_model_params(
                lookup(
                    "adjudicator_model_params",
                    "PARTSMITH_ADJUDICATOR_MODEL_PARAMS",
                )
                .as_deref(),
            ),
            vision_prompt: lookup("llm_vision_prompt", "PARTSMITH_VISION_PROMPT"),
            verification_prompt: lookup(
                "llm_verification_prompt",
                "PARTSMITH_VERIFICATION_PROMPT",
            ),
            adjudicator_prompt: lookup("llm_adjudicator_prompt", "PARTSMITH_ADJUDICATOR_PROMPT"),
            forbidden_labels,
            max_pages_per_part: parse_i64(
                lookup(
                    "smart_upload_max_pages_per_part",
                    "PARTSMITH_MAX_PAGES_PER_PART",
                ),
                DEFAULT_MAX_PAGES_PER_PART,
            ),
            api_keys,
        }
    }

    /// Adapter config for the given role, carrying only the selected
    /// provider's secret.
    pub fn adapter_config(&self, role: ModelRole) -> AdapterConfig {
        let endpoint = self
            .endpoint_url
            .clone()
            .unwrap_or_else(|| self.provider.default_endpoint().to_owned());
        let model = match role {
            ModelRole::Vision => self.vision_model.clone(),
            ModelRole::Verification => self.verification_model.clone(),
            ModelRole::Adjudicator => self
                .adjudicator_model
                .clone()
                .unwrap_or_else(|| self.verification_model.clone()),
        };
        AdapterConfig {
            provider: self.provider,
            endpoint,
            model,
            api_key: self.api_keys.get(&self.provider).cloned(),
        }
    }

    /// Model parameters for the given role.
    pub fn model_params(&self, role: ModelRole) -> serde_json::Map<String, serde_json::Value> {
        match role {
            ModelRole::Vision => self.vision_model_params.clone(),
            ModelRole::Verification => self.verification_model_params.clone(),
            ModelRole::Adjudicator => self.adjudicator_model_params.clone(),
        }
    }

    /// Dispatch options derived from this config.
    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            rpm: self.rate_limit_rpm,
            attempt_timeout: self.llm_timeout,
            ..DispatchOptions::default()
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_sources(&HashMap::new(), |_| None)
    }
}

// ── Parsing helpers ─────────────────────────────────────────────

/// Parse model params leniently: empty or malformed input yields an empty
/// map rather than an error.
pub fn parse_model_params(raw: Option<&str>) -> serde_json::Map<String, serde_json::Value> {
    let Some(raw) = raw else {
        return serde_json::Map::new();
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return serde_json::Map::new();
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(_) => {
            warn!("model params is not a JSON object, ignoring");
            serde_json::Map::new()
        }
        Err(e) => {
            warn!(error = %e, "model params is not valid JSON, ignoring");
            serde_json::Map::new()
        }
    }
}

fn parse_label_list(raw: &str) -> Option<Vec<String>> {
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(labels) => Some(labels.into_iter().map(|l| l.to_lowercase()).collect()),
        Err(e) => {
            warn!(error = %e, "forbidden labels is not a JSON string array, using defaults");
            None
        }
    }
}

fn parse_threshold(raw: Option<String>, default: f64) -> f64 {
    raw.and_then(|v| v.parse::<f64>().ok())
        .map(|v| v.clamp(0.0, 100.0))
        .unwrap_or(default)
}

fn parse_bool(raw: Option<String>, default: bool) -> bool {
    match raw.as_deref().map(str::to_lowercase).as_deref() {
        Some("true" | "1" | "yes" | "on") => true,
        Some("false" | "0" | "no" | "off") => false,
        Some(other) => {
            warn!(value = other, "ignoring invalid boolean setting");
            default
        }
        None => default,
    }
}

fn parse_u32(raw: Option<String>, default: u32) -> u32 {
    raw.and_then(|v| v.parse::<u32>().ok()).unwrap_or(default)
}

fn parse_u64(raw: Option<String>, default: u64) -> u64 {
    raw.and_then(|v| v.parse::<u64>().ok()).unwrap_or(default)
}

fn parse_i64(raw: Option<String>, default: i64) -> i64 {
    raw.and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_when_everything_is_absent() {
        let config = RuntimeConfig::from_sources(&HashMap::new(), no_env);
        assert_eq!(config.provider, Provider::OpenAi);
        assert_eq!(config.vision_model, "gpt-4o");
        assert_eq!(config.verification_model, "gpt-4o");
        assert!(config.adjudicator_model.is_none());
        assert!((config.confidence_threshold - 70.0).abs() < f64::EPSILON);
        assert!((config.auto_approve_threshold - 90.0).abs() < f64::EPSILON);
        assert!((config.autonomous_approval_threshold - 95.0).abs() < f64::EPSILON);
        assert!((config.skip_parse_threshold - 60.0).abs() < f64::EPSILON);
        assert!(config.two_pass_enabled);
        assert!(!config.autonomous_mode);
        assert_eq!(config.rate_limit_rpm, 15);
        assert_eq!(config.llm_timeout, Duration::from_secs(90));
        assert_eq!(config.max_pages_per_part, 12);
        assert!(config.forbidden_labels.contains(&"unknown".to_owned()));
    }

    #[test]
    fn test_settings_override_env() {
        let mut settings = HashMap::new();
        settings.insert("llm_provider".to_owned(), "anthropic".to_owned());
        settings.insert("llm_vision_model".to_owned(), "claude-x".to_owned());

        let config = RuntimeConfig::from_sources(&settings, |key| match key {
            "PARTSMITH_LLM_PROVIDER" => Some("gemini".to_owned()),
            _ => None,
        });
        assert_eq!(config.provider, Provider::Anthropic);
        assert_eq!(config.vision_model, "claude-x");
    }

    #[test]
    fn test_env_fallback_when_setting_absent() {
        let config = RuntimeConfig::from_sources(&HashMap::new(), |key| match key {
            "PARTSMITH_LLM_PROVIDER" => Some("groq".to_owned()),
            "PARTSMITH_GROQ_API_KEY" => Some("gsk-env".to_owned()),
            _ => None,
        });
        assert_eq!(config.provider, Provider::Groq);
        let adapter = config.adapter_config(ModelRole::Vision);
        assert_eq!(adapter.api_key.as_deref(), Some("gsk-env"));
    }

    #[test]
    fn test_adapter_config_carries_only_selected_provider_key() {
        let mut settings = HashMap::new();
        settings.insert("llm_provider".to_owned(), "anthropic".to_owned());
        settings.insert("llm_anthropic_api_key".to_owned(), "sk-ant-x".to_owned());
        settings.insert("llm_openai_api_key".to_owned(), "sk-oai-y".to_owned());
        settings.insert("llm_gemini_api_key".to_owned(), "g-z".to_owned());

        let config = RuntimeConfig::from_sources(&settings, no_env);
        let adapter = config.adapter_config(ModelRole::Vision);
        assert_eq!(adapter.provider, Provider::Anthropic);
        assert_eq!(adapter.api_key.as_deref(), Some("sk-ant-x"));
        // The adapter config has exactly one key slot; other providers'
        // secrets are structurally unreachable from it.
        let serialized = format!("{adapter:?}");
        assert!(!serialized.contains("sk-oai-y"));
        assert!(!serialized.contains("g-z"));
    }

    #[test]
    fn test_adjudicator_model_falls_back_to_verification() {
        let mut settings = HashMap::new();
        settings.insert("llm_verification_model".to_owned(), "verify-1".to_owned());
        let config = RuntimeConfig::from_sources(&settings, no_env);
        let adapter = config.adapter_config(ModelRole::Adjudicator);
        assert_eq!(adapter.model, "verify-1");
    }

    #[test]
    fn test_model_params_lenient_parsing() {
        assert!(parse_model_params(None).is_empty());
        assert!(parse_model_params(Some("")).is_empty());
        assert!(parse_model_params(Some("   ")).is_empty());
        assert!(parse_model_params(Some("{not json")).is_empty());
        assert!(parse_model_params(Some("[1,2]")).is_empty());

        let map = parse_model_params(Some(r#"{"top_p": 0.9}"#));
        assert_eq!(map["top_p"], 0.9);
    }

    #[test]
    fn test_invalid_provider_falls_back_to_default() {
        let mut settings = HashMap::new();
        settings.insert("llm_provider".to_owned(), "skynet".to_owned());
        let config = RuntimeConfig::from_sources(&settings, no_env);
        assert_eq!(config.provider, Provider::OpenAi);
    }

    #[test]
    fn test_threshold_clamped_to_percent_range() {
        let mut settings = HashMap::new();
        settings.insert("llm_confidence_threshold".to_owned(), "250".to_owned());
        let config = RuntimeConfig::from_sources(&settings, no_env);
        assert!((config.confidence_threshold - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_forbidden_labels_override() {
        let mut settings = HashMap::new();
        settings.insert(
            "smart_upload_forbidden_labels".to_owned(),
            r#"["Junk", "Filler"]"#.to_owned(),
        );
        let config = RuntimeConfig::from_sources(&settings, no_env);
        assert_eq!(config.forbidden_labels, vec!["junk", "filler"]);
    }

    #[test]
    fn test_debug_does_not_leak_keys() {
        let mut settings = HashMap::new();
        settings.insert("llm_openai_api_key".to_owned(), "sk-secret-123".to_owned());
        let config = RuntimeConfig::from_sources(&settings, no_env);
        assert!(!format!("{config:?}").contains("sk-secret-123"));
    }
}
