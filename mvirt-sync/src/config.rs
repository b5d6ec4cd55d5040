//! Sync engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How local and remote resources are joined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// By cloud-side id. Local resources without one are left alone.
    #[default]
    ExternalId,
    /// By content of the comparable fields, for the first sync of a scope.
    Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// How long a pass waits for the scope lock.
    pub lock_timeout_secs: u64,
    /// Audit events buffered before new ones are dropped.
    pub audit_queue_capacity: usize,
    pub key_strategy: KeyStrategy,
    /// Between a base name and its numeric suffix.
    pub name_separator: String,
    /// Suffixes tried before giving up on a unique name.
    pub max_name_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 30,
            audit_queue_capacity: 1024,
            key_strategy: KeyStrategy::ExternalId,
            name_separator: "-".to_string(),
            max_name_attempts: 1000,
        }
    }
}

impl SyncConfig {
    /// Load and validate a JSON config file. Missing fields take defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SyncConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "lock_timeout_secs must be positive".into(),
            ));
        }
        if self.audit_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "audit_queue_capacity must be positive".into(),
            ));
        }
        if self.name_separator.is_empty() || self.name_separator.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid(format!(
                "name_separator {:?} must be non-empty without whitespace",
                self.name_separator
            )));
        }
        if self.max_name_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_name_attempts must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(SyncConfig::default().validate().is_ok());
        assert_eq!(SyncConfig::default().lock_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_json() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"key_strategy": "signature", "name_separator": "_"}"#)
                .unwrap();
        assert_eq!(config.key_strategy, KeyStrategy::Signature);
        assert_eq!(config.name_separator, "_");
        assert_eq!(config.audit_queue_capacity, 1024);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(serde_json::from_str::<SyncConfig>(r#"{"lock_timeout": 5}"#).is_err());
    }

    #[test]
    fn test_invalid_values() {
        let config = SyncConfig {
            name_separator: " ".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = SyncConfig {
            lock_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
