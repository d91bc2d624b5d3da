//! Configuration management.

use crate::error::{Result, StrataError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persistent configuration for strata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of stages executing at once.
    pub max_concurrent_stages: usize,
    /// Keep per-stage working roots after a build (debugging aid).
    pub keep_work_dirs: bool,
    /// Log level used when no `RUST_LOG` is set.
    pub log_level: String,
    /// Data directory override; empty means the default resolution order.
    pub data_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_stages: 4,
            keep_work_dirs: false,
            log_level: "info".to_string(),
            data_dir: String::new(),
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_path()
    }

    /// Load configuration from disk.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| StrataError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        serde_json::from_str(&content).map_err(|e| StrataError::InvalidConfig {
            reason: format!("Failed to parse config: {}", e),
        })
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StrataError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| StrataError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(&path, content).map_err(|e| StrataError::IoError { path, source: e })
    }

    /// Effective data directory: the configured override or the default.
    pub fn effective_data_dir(&self) -> PathBuf {
        if self.data_dir.is_empty() {
            paths::data_dir()
        } else {
            PathBuf::from(&self.data_dir)
        }
    }
}
