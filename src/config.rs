//! Endpoint configuration
//!
//! Loaded from `<config dir>/voicebridge/config.json`; a missing file
//! falls back to defaults and the `VOICEBRIDGE_ENDPOINT` environment
//! variable overrides whatever the file says.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "config.json";
const ENDPOINT_ENV_VAR: &str = "VOICEBRIDGE_ENDPOINT";
const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8000/voice_chat";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    /// Full URL of the voice chat endpoint.
    pub endpoint: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }
}

fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("voicebridge").join(CONFIG_FILE_NAME))
}

/// Load the configuration, falling back to defaults on any problem and
/// applying the environment override last.
pub fn load_config() -> AppConfig {
    let mut config = match config_path() {
        Some(path) => load_from(&path),
        None => {
            log::warn!("Config: could not determine config directory, using defaults");
            AppConfig::default()
        }
    };

    if let Ok(endpoint) = std::env::var(ENDPOINT_ENV_VAR) {
        if !endpoint.is_empty() {
            log::info!("Config: endpoint overridden by {}", ENDPOINT_ENV_VAR);
            config.endpoint = endpoint;
        }
    }

    config
}

fn load_from(path: &Path) -> AppConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppConfig>(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Config: failed to parse {:?}: {}", path, e);
                AppConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => {
            log::warn!("Config: failed to read {:?}: {}", path, e);
            AppConfig::default()
        }
    }
}

/// Persist the configuration.
pub fn save_config(config: &AppConfig) -> Result<(), String> {
    let path = config_path().ok_or_else(|| "Could not determine config directory".to_string())?;
    save_to(&path, config)
}

fn save_to(path: &Path, config: &AppConfig) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(config).map_err(|e| format!("Serialize config: {}", e))?;

    // Write atomically: write to a temp file in the same directory, then
    // rename. This prevents a partial config.json if the app crashes mid-write.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp config {:?}: {}", tmp_path, e))?;

    // On Unix, rename atomically replaces the destination. On Windows,
    // rename fails if the destination exists, so remove it first.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing config file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp config {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_endpoint_targets_local_voice_chat() {
        let config = AppConfig::default();
        assert_eq!(config.endpoint, "http://127.0.0.1:8000/voice_chat");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does_not_exist.json");
        assert_eq!(load_from(&path), AppConfig::default());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_from(&path), AppConfig::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = AppConfig {
            endpoint: "https://voice.example.com/voice_chat".to_string(),
        };
        save_to(&path, &config).unwrap();
        assert_eq!(load_from(&path), config);
        // The temp file must not linger after the rename
        assert!(!path.with_extension("json.tmp").exists());
    }
}
