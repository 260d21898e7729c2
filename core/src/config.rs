// Storage configuration
//
// Default data directory:
// - macOS: ~/Library/Application Support/chatvault
// - Linux: ~/.local/share/chatvault
// - Windows: %LOCALAPPDATA%\chatvault

use crate::store::settings::{Settings, DEFAULT_MAX_STORAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the sled database
    pub data_dir: PathBuf,

    /// Quota seeded into Settings on first run
    pub default_max_storage_size: u64,

    /// Encryption flag seeded into Settings on first run
    pub default_encryption_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("chatvault");
        Self {
            data_dir,
            default_max_storage_size: DEFAULT_MAX_STORAGE_SIZE,
            default_encryption_enabled: true,
        }
    }
}

impl StorageConfig {
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Path of the sled database inside `data_dir`.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("vault")
    }

    /// Settings used until the first settings record is written.
    pub fn default_settings(&self) -> Settings {
        Settings {
            encryption_enabled: self.default_encryption_enabled,
            max_storage_size: self.default_max_storage_size,
            ..Settings::default()
        }
    }
}
