//! Engine configuration and data directory bootstrap.
//!
//! Reads `engine.toml` from the data directory (`~/.authflow/` unless
//! `AUTHFLOW_DATA_DIR` says otherwise) into [`EngineConfig`]. Falls back to
//! defaults when the file is missing, malformed, or fails validation.

use std::path::{Path, PathBuf};

use anyhow::Context;
use authflow_types::config::EngineConfig;

use crate::sqlite::SqliteEngineStore;
use crate::sqlite::pool::DatabasePool;

/// Name of the config file inside the data directory.
pub const CONFIG_FILE: &str = "engine.toml";

/// Data directory: `AUTHFLOW_DATA_DIR`, else `$HOME/.authflow`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var_os("AUTHFLOW_DATA_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
            home.join(".authflow")
        }
    }
}

/// Load `{data_dir}/engine.toml`.
///
/// - Missing file: defaults.
/// - Unreadable, unparsable, or invalid file: logs a warning, defaults.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no engine config found, using defaults");
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read engine config, using defaults");
            return EngineConfig::default();
        }
    };

    let config = match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse engine config, using defaults");
            return EngineConfig::default();
        }
    };

    if let Err(reason) = config.validate() {
        tracing::warn!(path = %config_path.display(), reason = reason.as_str(), "invalid engine config, using defaults");
        return EngineConfig::default();
    }
    config
}

/// Create the data directory if needed, open the database and load the config.
pub async fn bootstrap(data_dir: &Path) -> anyhow::Result<(SqliteEngineStore, EngineConfig)> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let pool = DatabasePool::open_in(data_dir)
        .await
        .with_context(|| format!("opening engine database in {}", data_dir.display()))?;
    let config = load_engine_config(data_dir).await;

    tracing::info!(data_dir = %data_dir.display(), "engine storage ready");
    Ok((SqliteEngineStore::new(pool), config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.watch.max_attempts, 5);
    }

    #[tokio::test]
    async fn load_engine_config_partial_file_keeps_other_defaults() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"
[watch]
backoff_base_secs = 5
status_tool = "payer_status"

[decision]
default_threshold = 0.8
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.watch.backoff_base_secs, 5);
        assert_eq!(config.watch.status_tool, "payer_status");
        assert_eq!(config.watch.max_interval_secs, 300);
        assert!((config.decision.default_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.executor.default_step_limit, 50);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE), "this is not { valid toml !!!")
            .await
            .unwrap();
        assert_eq!(load_engine_config(tmp.path()).await, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_out_of_range_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE), "[decision]\ndefault_threshold = 1.5\n")
            .await
            .unwrap();
        assert_eq!(load_engine_config(tmp.path()).await, EngineConfig::default());
    }

    #[tokio::test]
    async fn bootstrap_creates_directory_and_database() {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("nested").join("authflow");
        let (store, config) = bootstrap(&data_dir).await.unwrap();
        assert!(data_dir.join("engine.db").exists());
        assert_eq!(config, EngineConfig::default());
        store.pool().close().await;
    }
}
