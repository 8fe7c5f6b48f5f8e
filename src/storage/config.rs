//! Link configuration.
//!
//! Loaded from `config.toml` in the platform data directory. Every section and field falls back
//! to its default, so a file only needs the values it changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::networking::{InterpolationConfig, NetworkConfig};

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Application version that last wrote the file
    pub version: String,
    /// Directory the file was loaded from
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Transport, heartbeat and reconnection settings
    pub network: NetworkConfig,
    /// Remote state smoothing
    pub interpolation: InterpolationConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: PathBuf::new(),
            network: NetworkConfig::default(),
            interpolation: InterpolationConfig::default(),
        }
    }
}

/// Longest accepted timer setting: one day.
pub const MAX_TIMER_MS: u64 = 86_400_000;

impl SyncConfig {
    /// Reject settings the link cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let network = &self.network;
        let timers = [
            ("network.fallback_timeout_ms", network.fallback_timeout_ms),
            ("network.heartbeat_interval_ms", network.heartbeat_interval_ms),
            ("network.heartbeat_timeout_ms", network.heartbeat_timeout_ms),
            ("network.reconnect_base_delay_ms", network.reconnect_base_delay_ms),
            ("network.tick_interval_ms", network.tick_interval_ms),
        ];
        for (name, value) in timers {
            if value == 0 || value > MAX_TIMER_MS {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must be between 1 and {}, got {}",
                    name, MAX_TIMER_MS, value
                )));
            }
        }

        if network.max_room_code_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "network.max_room_code_attempts must be at least 1".to_string(),
            ));
        }

        let window = &self.interpolation;
        if window.min_window_ms > window.max_window_ms {
            return Err(ConfigError::InvalidValue(format!(
                "interpolation.min_window_ms ({}) exceeds max_window_ms ({})",
                window.min_window_ms, window.max_window_ms
            )));
        }

        Ok(())
    }
}

/// Get the application data directory.
pub fn get_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "tandemsync", "TandemSync")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the configuration file path.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("config.toml")
}

/// Load configuration from the default location.
pub fn load_config() -> Result<SyncConfig, ConfigError> {
    load_config_from(&get_config_path())
}

/// Load configuration from `path`. A missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<SyncConfig, ConfigError> {
    let data_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    if !path.exists() {
        tracing::debug!("No config at {}, using defaults", path.display());
        return Ok(SyncConfig {
            data_dir,
            ..Default::default()
        });
    }

    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

    let mut config: SyncConfig =
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.data_dir = data_dir;
    config.validate()?;

    Ok(config)
}

/// Save configuration to the default location.
pub fn save_config(config: &SyncConfig) -> Result<(), ConfigError> {
    save_config_to(config, &get_config_path())
}

/// Save configuration to `path`, creating parent directories.
pub fn save_config_to(config: &SyncConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
    }

    let content =
        toml::to_string_pretty(config).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

    Ok(())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}
