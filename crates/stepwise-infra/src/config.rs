//! Engine configuration loader.
//!
//! Reads a `config.toml` into [`EngineConfig`]. Every section and field is
//! optional, so a partial file only overrides what it names. A missing,
//! unreadable or malformed file yields the defaults.

use std::path::{Path, PathBuf};

use stepwise_types::config::EngineConfig;

/// File name looked up by [`load_engine_config_from_dir`].
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Parse configuration text.
pub fn parse_engine_config(content: &str) -> Result<EngineConfig, toml::de::Error> {
    toml::from_str(content)
}

/// Load the engine configuration at `path`.
///
/// - A missing file returns [`EngineConfig::default()`] with a debug log.
/// - A file that can not be read or parsed returns the default with a warning.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no engine config found, using defaults");
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read engine config, using defaults");
            return EngineConfig::default();
        }
    };

    match parse_engine_config(&content) {
        Ok(config) => {
            tracing::debug!(
                path = %path.display(),
                guardrails_enabled = config.guardrails.enabled,
                checkpoints_enabled = config.checkpoint.enabled,
                "engine config loaded"
            );
            config
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to parse engine config, using defaults");
            EngineConfig::default()
        }
    }
}

/// Load `{dir}/config.toml`.
pub async fn load_engine_config_from_dir(dir: &Path) -> EngineConfig {
    load_engine_config(&config_path(dir)).await
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE_NAME)
}
