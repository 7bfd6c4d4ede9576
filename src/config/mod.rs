pub mod validation;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::protocol::canonical::WireApi;

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Translation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationConfig {
    /// Log and strip parameters the target cannot honour instead of
    /// rejecting the request.
    #[serde(default)]
    pub propagate_unsupported_params: bool,
    /// `max_tokens` sent to targets that require one when neither the
    /// client nor the model-info source supplies it.
    #[serde(default = "default_max_output_tokens_fallback")]
    pub max_output_tokens_fallback: u64,
    /// Collapse history to the last user turn for Responses targets.
    #[serde(default)]
    pub responses_single_turn: bool,
}

fn default_max_output_tokens_fallback() -> u64 {
    4096
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            propagate_unsupported_params: false,
            max_output_tokens_fallback: default_max_output_tokens_fallback(),
            responses_single_turn: false,
        }
    }
}

/// Per-target allowlists and the alias table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub anthropic: Vec<String>,
    #[serde(default)]
    pub openai_chat: Vec<String>,
    #[serde(default)]
    pub openai_responses: Vec<String>,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub enable_dynamic_model_info: bool,
    /// Minimum seconds between allowlist refreshes; 0 refreshes on every
    /// lookup.
    #[serde(default = "default_model_refresh_ttl_secs")]
    pub model_refresh_ttl_secs: u64,
}

fn default_model_refresh_ttl_secs() -> u64 {
    300
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            anthropic: Vec::new(),
            openai_chat: Vec::new(),
            openai_responses: Vec::new(),
            aliases: BTreeMap::new(),
            enable_dynamic_model_info: false,
            model_refresh_ttl_secs: default_model_refresh_ttl_secs(),
        }
    }
}

impl ModelsConfig {
    /// Static allowlist for one target protocol. Empty means any model.
    #[must_use]
    pub fn allowlist(&self, api: WireApi) -> &[String] {
        match api {
            WireApi::Anthropic => &self.anthropic,
            WireApi::OpenAiChat => &self.openai_chat,
            WireApi::OpenAiResponses => &self.openai_responses,
        }
    }
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] when parsing fails, or
/// [`ConfigError::Validation`] when semantic validation fails.
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_example_config() {
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.unwrap();
        assert!(!config.translation.propagate_unsupported_params);
        assert_eq!(config.translation.max_output_tokens_fallback, 4096);
        assert!(!config.models.anthropic.is_empty());
        assert_eq!(
            config.models.aliases.get("sonnet").map(String::as_str),
            Some("claude-sonnet-4-5")
        );
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.features.log_level, "INFO");
        assert_eq!(config.models.model_refresh_ttl_secs, 300);
        assert!(config.models.allowlist(WireApi::OpenAiChat).is_empty());
    }

    #[test]
    fn test_log_format_parses_and_rejects_unknown() {
        let config = parse_config("features:\n  log_format: json\n").unwrap();
        assert_eq!(config.features.log_format, LogFormat::Json);
        assert_eq!(AppConfig::default().features.log_format, LogFormat::Text);
        assert!(parse_config("features:\n  log_format: xml\n").is_err());
    }

    #[test]
    fn test_unknown_log_level_is_rejected() {
        let err = parse_config("features:\n  log_level: LOUD\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
