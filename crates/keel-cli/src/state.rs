//! Resolves configuration and opens the store for a CLI invocation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use keel_infra::config::{default_config_path, load_engine_config, resolve_data_dir};
use keel_infra::sqlite::pool::DatabasePool;
use keel_infra::sqlite::workflow::SqliteWorkflowStore;
use keel_types::config::EngineConfig;

/// Paths chosen by flags, environment and defaults.
pub struct AppState {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub database_override: Option<PathBuf>,
}

impl AppState {
    pub fn new(
        data_dir: Option<PathBuf>,
        config: Option<PathBuf>,
        database: Option<PathBuf>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(resolve_data_dir);
        let config_path = config.unwrap_or_else(|| default_config_path(&data_dir));
        Self {
            data_dir,
            config_path,
            database_override: database,
        }
    }

    /// Load `keel.toml`, applying the `--database` override.
    pub async fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = load_engine_config(&self.config_path).await.with_context(|| {
            format!(
                "cannot load engine config from {} (a [retry] section is required)",
                self.config_path.display()
            )
        })?;
        if let Some(path) = &self.database_override {
            config.database_path = path.clone();
        }
        Ok(config)
    }

    /// Open the store at `path`, creating the file and schema if needed.
    pub async fn open_store(&self, path: &Path) -> Result<SqliteWorkflowStore> {
        let pool = DatabasePool::open(path)
            .await
            .with_context(|| format!("cannot open database {}", path.display()))?;
        tracing::debug!(path = %path.display(), data_dir = %self.data_dir.display(), "store opened");
        Ok(SqliteWorkflowStore::new(pool))
    }

    /// Store for read-only commands: `--database` when given, else the configured path.
    pub async fn inspect_store(&self) -> Result<SqliteWorkflowStore> {
        match &self.database_override {
            Some(path) => self.open_store(path).await,
            None => {
                let config = self.engine_config().await?;
                self.open_store(&config.database_path).await
            }
        }
    }
}
