//! Executor configuration (TOML).

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Executor loop tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Number of partitions (one evaluator task each).
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// Inbound queue capacity per partition.
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,

    /// In-place retries of a message whose activation failed transiently.
    /// The partition waits `redelivery_delay_ms` between them.
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,

    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,

    /// Delay before re-emitting WorkerTasks after a failed dispatch.
    #[serde(default = "default_resend_delay_ms")]
    pub resend_delay_ms: u64,

    /// How long KILLING task runs wait for workers before being forced KILLED.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Upper bound of resolution passes per activation.
    #[serde(default = "default_max_resolution_passes")]
    pub max_resolution_passes: usize,
}

fn default_partitions() -> usize {
    4
}

fn default_inbound_capacity() -> usize {
    1024
}

fn default_max_redeliveries() -> u32 {
    5
}

fn default_redelivery_delay_ms() -> u64 {
    200
}

fn default_resend_delay_ms() -> u64 {
    1000
}

fn default_kill_grace_ms() -> u64 {
    30_000
}

fn default_max_resolution_passes() -> usize {
    256
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            inbound_capacity: default_inbound_capacity(),
            max_redeliveries: default_max_redeliveries(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
            resend_delay_ms: default_resend_delay_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            max_resolution_passes: default_max_resolution_passes(),
        }
    }
}

impl ExecutorConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from a string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ExecutorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("partitions", self.partitions),
            ("inbound_capacity", self.inbound_capacity),
            ("max_resolution_passes", self.max_resolution_passes),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }

    pub fn resend_delay(&self) -> Duration {
        Duration::from_millis(self.resend_delay_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_config_uses_defaults() {
        let config = ExecutorConfig::from_toml_str("").unwrap();
        assert_eq!(config, ExecutorConfig::default());
        assert_eq!(config.partitions, 4);
        assert_eq!(config.kill_grace(), Duration::from_secs(30));
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let config = ExecutorConfig::from_toml_str("partitions = 8\nresend_delay_ms = 50\n").unwrap();
        assert_eq!(config.partitions, 8);
        assert_eq!(config.resend_delay(), Duration::from_millis(50));
        assert_eq!(config.inbound_capacity, 1024);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ExecutorConfig::from_toml_str("partitons = 8").unwrap_err();
        assert!(matches!(err, ConfigError::TomlParse(_)));
    }

    #[rstest]
    #[case::partitions("partitions = 0", "partitions")]
    #[case::capacity("inbound_capacity = 0", "inbound_capacity")]
    #[case::passes("max_resolution_passes = 0", "max_resolution_passes")]
    fn zero_values_are_invalid(#[case] toml: &str, #[case] expected: &str) {
        match ExecutorConfig::from_toml_str(toml) {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, expected),
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "max_redeliveries = 2").unwrap();

        let config = ExecutorConfig::load(file.path()).unwrap();
        assert_eq!(config.max_redeliveries, 2);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = ExecutorConfig::load(Path::new("/nonexistent/heddle.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
