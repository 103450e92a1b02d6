//! Engine configuration loader for keel.
//!
//! Reads `keel.toml` and deserializes it into [`EngineConfig`]. Unlike
//! optional settings, the retry policy has no default: a file without a valid
//! `[retry]` table is rejected rather than silently filled in.

use std::path::{Path, PathBuf};

use keel_types::config::EngineConfig;
use thiserror::Error;

/// Config file name looked up inside the data directory.
pub const CONFIG_FILE_NAME: &str = "keel.toml";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "KEEL_DATA_DIR";

/// Errors from loading engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration in {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

/// Load engine configuration from `path`.
///
/// - A missing or unreadable file is an error.
/// - A missing `[retry]` table, or any missing retry field, is a parse error.
/// - A relative `database_path` resolves against the config file's directory.
pub async fn load_engine_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let mut config = parse_engine_config(&content).map_err(|message| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    })?;

    config.validate().map_err(|message| ConfigError::Invalid {
        path: path.to_path_buf(),
        message,
    })?;

    if config.database_path.is_relative() {
        if let Some(dir) = path.parent() {
            config.database_path = dir.join(&config.database_path);
        }
    }

    tracing::debug!(
        path = %path.display(),
        database = %config.database_path.display(),
        max_attempts = config.retry.max_attempts,
        "loaded engine config"
    );
    Ok(config)
}

fn parse_engine_config(content: &str) -> Result<EngineConfig, String> {
    toml::from_str::<EngineConfig>(content).map_err(|e| e.to_string())
}

/// Resolve the keel data directory.
///
/// Priority:
/// 1. `KEEL_DATA_DIR` environment variable
/// 2. `~/.keel`
/// 3. `.keel` relative to the working directory when no home directory exists
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".keel"))
        .unwrap_or_else(|| PathBuf::from(".keel"))
}

/// Default config file location: `{data_dir}/keel.toml`.
pub fn default_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::config::RetryPolicy;
    use tempfile::TempDir;

    async fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    #[tokio::test]
    async fn load_full_config() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            r#"
database_path = "/var/lib/keel/keel.db"
fan_out_concurrency = 4
step_timeout_secs = 300

[retry]
max_attempts = 3
base_delay_ms = 200
max_delay_ms = 10000
"#,
        )
        .await;

        let config = load_engine_config(&path).await.unwrap();
        assert_eq!(config.database_path, PathBuf::from("/var/lib/keel/keel.db"));
        assert_eq!(config.fan_out_concurrency, 4);
        assert_eq!(config.step_timeout_secs, Some(300));
        assert_eq!(config.retry, RetryPolicy::new(3, 200, 10_000));
    }

    #[tokio::test]
    async fn relative_database_path_resolves_against_config_dir() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            "[retry]\nmax_attempts = 2\nbase_delay_ms = 10\nmax_delay_ms = 100\n",
        )
        .await;

        let config = load_engine_config(&path).await.unwrap();
        assert_eq!(config.database_path, tmp.path().join("keel.db"));
        assert_eq!(config.fan_out_concurrency, 8);
        assert!(config.step_timeout_secs.is_none());
    }

    #[tokio::test]
    async fn missing_retry_section_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(&tmp, "database_path = \"keel.db\"\n").await;

        let err = load_engine_config(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("retry"));
    }

    #[tokio::test]
    async fn missing_retry_field_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(&tmp, "[retry]\nmax_attempts = 3\nbase_delay_ms = 100\n").await;

        let err = load_engine_config(&path).await.unwrap_err();
        assert!(err.to_string().contains("max_delay_ms"));
    }

    #[tokio::test]
    async fn zero_attempts_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            "[retry]\nmax_attempts = 0\nbase_delay_ms = 10\nmax_delay_ms = 10\n",
        )
        .await;

        let err = load_engine_config(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[tokio::test]
    async fn zero_fan_out_concurrency_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            "fan_out_concurrency = 0\n[retry]\nmax_attempts = 1\nbase_delay_ms = 10\nmax_delay_ms = 10\n",
        )
        .await;

        let err = load_engine_config(&path).await.unwrap_err();
        assert!(err.to_string().contains("fan_out_concurrency"));
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let err = load_engine_config(&tmp.path().join("absent.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[tokio::test]
    async fn malformed_toml_is_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(&tmp, "this is not { valid toml !!!").await;
        let err = load_engine_config(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn default_config_path_joins_file_name() {
        let path = default_config_path(Path::new("/data"));
        assert_eq!(path, PathBuf::from("/data/keel.toml"));
    }
}
