// Configuration management for the ChatVault CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/chatvault/config.json
// - Linux: ~/.config/chatvault/config.json
// - Windows: %APPDATA%\chatvault\config.json

use anyhow::{Context, Result};
use chatvault_core::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage directory; platform data dir when unset
    pub storage_path: Option<String>,

    /// Default page size for `list`
    pub page_size: usize,

    /// Write a daily rotating log file next to the database
    pub file_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: None,
            page_size: 20,
            file_logging: false,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("chatvault");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Storage settings for the core, honouring `storage_path`.
    pub fn storage(&self) -> StorageConfig {
        match &self.storage_path {
            Some(path) => StorageConfig::in_dir(path),
            None => StorageConfig::default(),
        }
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = self.storage().data_dir;
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        Ok(data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.page_size, 20);
        assert!(!config.file_logging);
        assert!(config.storage().data_dir.ends_with("chatvault"));
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.page_size, 20);
    }

    #[test]
    fn test_storage_path_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let vault = dir.path().join("vault");
        let json = serde_json::json!({ "storage_path": vault.to_string_lossy() });
        std::fs::write(&path, json.to_string()).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.storage().data_dir, vault);
        assert_eq!(config.page_size, 20);
    }
}
