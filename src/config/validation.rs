use std::collections::HashSet;

use super::{AppConfig, ConfigError};
use crate::protocol::canonical::WireApi;

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_translation(config)?;
    validate_allowlists(config)?;
    validate_aliases(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_translation(config: &AppConfig) -> Result<(), ConfigError> {
    if config.translation.max_output_tokens_fallback == 0 {
        return Err(validation_err(
            "translation.max_output_tokens_fallback must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_allowlists(config: &AppConfig) -> Result<(), ConfigError> {
    for api in WireApi::ALL {
        let mut seen = HashSet::new();
        for model in config.models.allowlist(api) {
            let name = model.trim();
            if name.is_empty() {
                return Err(validation_err(format!(
                    "models.{api} contains an empty model name"
                )));
            }
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(validation_err(format!(
                    "models.{api} lists '{name}' more than once"
                )));
            }
        }
    }
    Ok(())
}

fn validate_aliases(config: &AppConfig) -> Result<(), ConfigError> {
    for (alias, target) in &config.models.aliases {
        if alias.trim().is_empty() || target.trim().is_empty() {
            return Err(validation_err("models.aliases entries must be non-empty"));
        }
        let shadowed = WireApi::ALL.iter().any(|api| {
            config
                .models
                .allowlist(*api)
                .iter()
                .any(|model| model.trim().eq_ignore_ascii_case(alias.trim()))
        });
        if shadowed {
            return Err(validation_err(format!(
                "alias '{alias}' conflicts with an allowlisted model name"
            )));
        }
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;

    fn make_valid_config() -> AppConfig {
        AppConfig {
            translation: TranslationConfig::default(),
            models: ModelsConfig {
                anthropic: vec!["claude-sonnet-4-5-20250929".to_string()],
                openai_chat: vec!["gpt-4o".to_string()],
                aliases: BTreeMap::from([(
                    "sonnet".to_string(),
                    "claude-sonnet-4-5".to_string(),
                )]),
                ..ModelsConfig::default()
            },
            features: FeaturesConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&make_valid_config()).is_ok());
    }

    #[test]
    fn test_zero_max_output_fallback() {
        let mut config = make_valid_config();
        config.translation.max_output_tokens_fallback = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_duplicate_model_within_same_list() {
        let mut config = make_valid_config();
        config.models.openai_chat.push("GPT-4o".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_same_model_in_two_targets_is_fine() {
        let mut config = make_valid_config();
        config.models.openai_responses.push("gpt-4o".to_string());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_alias_conflicts_with_model() {
        let mut config = make_valid_config();
        config
            .models
            .aliases
            .insert("gpt-4o".to_string(), "gpt-4.1".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_empty_model_name() {
        let mut config = make_valid_config();
        config.models.anthropic.push("  ".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = make_valid_config();
        config.features.log_level = "VERBOSE".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_log_level_is_case_insensitive() {
        let mut config = make_valid_config();
        config.features.log_level = "warning".to_string();
        assert!(validate_config(&config).is_ok());
    }
}
