use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

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

/// Checks the cross-field constraints the schema cannot express.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be at least 1".to_string(),
        });
    }

    let alignment = &config.alignment;
    if !(0.0..0.5).contains(&alignment.border_margin) {
        return Err(ConfigError::Validation {
            message: format!(
                "alignment.border_margin must be in [0, 0.5), got {}",
                alignment.border_margin
            ),
        });
    }
    if alignment.ratio_test <= 0.0 || alignment.ratio_test > 1.0 {
        return Err(ConfigError::Validation {
            message: format!(
                "alignment.ratio_test must be in (0, 1], got {}",
                alignment.ratio_test
            ),
        });
    }
    if alignment.min_matches < 2 {
        return Err(ConfigError::Validation {
            message: "alignment.min_matches must be at least 2".to_string(),
        });
    }

    // Every retry is a redelivery of the same message, so the queue must allow
    // at least one delivery more than the stage allows retries.
    if config.retry.max_delivery_attempts <= config.retry.max_retries {
        return Err(ConfigError::Validation {
            message: format!(
                "retry.max_delivery_attempts ({}) must exceed retry.max_retries ({})",
                config.retry.max_delivery_attempts, config.retry.max_retries
            ),
        });
    }

    if config.worker.stage_kinds.is_empty() {
        return Err(ConfigError::Validation {
            message: "worker.stage_kinds must not be empty".to_string(),
        });
    }

    Ok(())
}
