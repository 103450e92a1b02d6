//! Engine configuration types for keel.
//!
//! `EngineConfig` represents `keel.toml`. Retry parameters have no canonical
//! default and must always be supplied.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Bounded exponential-backoff retry contract.
///
/// Deliberately has no `Default` impl: every field is required configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempt ceiling per retry window (at least 1).
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on every further attempt.
    pub base_delay_ms: u64,
    /// Cap on any single backoff delay.
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Returns a description of the first invalid field, if any.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(format!(
                "retry.max_delay_ms ({}) must not be below retry.base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            ));
        }
        Ok(())
    }
}

/// Top-level engine configuration, loaded from `keel.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database file. Relative paths resolve against the config file's directory.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Engine-wide retry policy; steps may override it.
    pub retry: RetryPolicy,

    /// Default limit on concurrently running fan-out sub-steps.
    #[serde(default = "default_fan_out_concurrency")]
    pub fan_out_concurrency: usize,

    /// Default handler timeout. No timeout when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("keel.db")
}

fn default_fan_out_concurrency() -> usize {
    8
}

impl EngineConfig {
    /// A config with defaults for everything except the required retry policy.
    pub fn new(database_path: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            database_path: database_path.into(),
            retry,
            fan_out_concurrency: default_fan_out_concurrency(),
            step_timeout_secs: None,
        }
    }

    /// Returns a description of the first invalid setting, if any.
    pub fn validate(&self) -> Result<(), String> {
        self.retry.validate()?;
        if self.fan_out_concurrency == 0 {
            return Err("fan_out_concurrency must be at least 1".to_string());
        }
        if self.step_timeout_secs == Some(0) {
            return Err("step_timeout_secs must be > 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_from_toml() {
        let toml_str = r#"
database_path = "/var/lib/keel/keel.db"
fan_out_concurrency = 4
step_timeout_secs = 300

[retry]
max_attempts = 3
base_delay_ms = 200
max_delay_ms = 10000
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/var/lib/keel/keel.db"));
        assert_eq!(config.fan_out_concurrency, 4);
        assert_eq!(config.step_timeout_secs, Some(300));
        assert_eq!(config.retry, RetryPolicy::new(3, 200, 10_000));
    }

    #[test]
    fn test_engine_config_optional_fields_default() {
        let toml_str = r#"
[retry]
max_attempts = 1
base_delay_ms = 0
max_delay_ms = 0
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database_path, PathBuf::from("keel.db"));
        assert_eq!(config.fan_out_concurrency, 8);
        assert!(config.step_timeout_secs.is_none());
    }

    #[test]
    fn test_engine_config_requires_retry() {
        let result = toml::from_str::<EngineConfig>(r#"database_path = "keel.db""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_retry_policy_requires_every_field() {
        let result = toml::from_str::<RetryPolicy>("max_attempts = 3");
        assert!(result.is_err());
    }

    #[test]
    fn test_retry_policy_validate() {
        assert!(RetryPolicy::new(3, 100, 1000).validate().is_ok());
        assert!(RetryPolicy::new(0, 100, 1000).validate().is_err());
        assert!(RetryPolicy::new(3, 1000, 100).validate().is_err());
    }

    #[test]
    fn test_engine_config_validate() {
        let valid = EngineConfig::new("keel.db", RetryPolicy::new(2, 10, 100));
        assert!(valid.validate().is_ok());

        let no_attempts = EngineConfig::new("keel.db", RetryPolicy::new(0, 10, 100));
        assert!(no_attempts.validate().unwrap_err().contains("max_attempts"));

        let serial = EngineConfig {
            fan_out_concurrency: 0,
            ..valid.clone()
        };
        assert!(serial.validate().unwrap_err().contains("fan_out_concurrency"));

        let instant = EngineConfig {
            step_timeout_secs: Some(0),
            ..valid
        };
        assert!(instant.validate().is_err());
    }
}
