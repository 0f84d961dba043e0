//! Configuration file storage
//!
//! Launch configurations are plain JSON files. The default location is
//! `<config_dir>/nodelaunch/launch.json`.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use super::types::{LaunchConfig, CONFIG_VERSION};

/// Configuration storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported config version: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Get the nodelaunch configuration directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::config_dir()
        .map(|dir| dir.join("nodelaunch"))
        .ok_or(StorageError::NoConfigDir)
}

/// Default launch configuration file
pub fn launch_config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("launch.json"))
}

impl LaunchConfig {
    /// Load and validate a configuration file.
    pub async fn load(path: &Path) -> Result<Self, StorageError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let config = Self::from_json(&raw)?;
        debug!("Loaded launch config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate configuration JSON.
    pub fn from_json(raw: &str) -> Result<Self, StorageError> {
        let config: LaunchConfig = serde_json::from_str(raw)?;
        if config.version != CONFIG_VERSION {
            return Err(StorageError::VersionMismatch {
                found: config.version,
                expected: CONFIG_VERSION,
            });
        }
        config.validate().map_err(StorageError::Invalid)?;
        Ok(config)
    }

    /// Write the configuration, creating parent directories as needed.
    pub async fn save(&self, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;

        // Write via a temp file so a crash never leaves a truncated config
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        info!("Saved launch config to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("launch.json");

        let mut config = LaunchConfig::new("10.1.2.3", "/keys/admin.pem");
        config.jvm_opts = "-Xmx512m".to_string();
        config.save(&path).await.unwrap();

        let loaded = LaunchConfig::load(&path).await.unwrap();
        assert_eq!(loaded.target.host, "10.1.2.3");
        assert_eq!(loaded.jvm_opts, "-Xmx512m");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_version_mismatch() {
        let err = LaunchConfig::from_json(
            r#"{"version": 9, "target": {"host": "h"}, "credentials": {"type": "file", "path": "/k"}}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StorageError::VersionMismatch { found: 9, expected: 1 }
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = LaunchConfig::from_json(
            r#"{"version": 1, "target": {"host": " "}, "credentials": {"type": "file", "path": "/k"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
    }
}
