use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::error::ConfigError;
use crate::upload::ThroughputTier;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

/// `~/.shelfsync/config.json`, or a relative path when no home exists.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".shelfsync"))
        .unwrap_or_else(|| PathBuf::from(".shelfsync"))
        .join("config.json")
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if let Err(reason) = config.remote.tier.parse::<ThroughputTier>() {
        return Err(ConfigError::Validation {
            message: format!("Invalid remote.tier '{}': {}", config.remote.tier, reason),
        });
    }

    for pattern in &config.library.exclude {
        if let Err(e) = glob::Pattern::new(pattern) {
            return Err(ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            });
        }
    }

    let breaker = &config.circuit_breaker;
    if breaker.min_samples > breaker.window_size {
        return Err(ConfigError::Validation {
            message: format!(
                "circuit_breaker.min_samples ({}) exceeds window_size ({})",
                breaker.min_samples, breaker.window_size
            ),
        });
    }

    if config.recovery.poll_timeout_secs > config.recovery.timeout_secs {
        return Err(ConfigError::Validation {
            message: "recovery.poll_timeout_secs exceeds recovery.timeout_secs".to_string(),
        });
    }

    Ok(())
}
