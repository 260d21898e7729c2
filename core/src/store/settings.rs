// Global settings record

use crate::store::backend::{StorageBackend, WriteOp};
use crate::store::layout::SETTINGS_KEY;
use crate::store::commit;
use crate::VaultError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default cap on the estimated size of the store (100 MiB).
pub const DEFAULT_MAX_STORAGE_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub encryption_enabled: bool,
    pub backup_enabled: bool,
    /// Hex SHA-256 of the active data key, used only to detect a swapped key.
    pub key_hash: Option<String>,
    /// Unix milliseconds of the last export
    pub last_backup: Option<u64>,
    pub max_storage_size: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            encryption_enabled: true,
            backup_enabled: false,
            key_hash: None,
            last_backup: None,
            max_storage_size: DEFAULT_MAX_STORAGE_SIZE,
        }
    }
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsPatch {
    pub encryption_enabled: Option<bool>,
    pub backup_enabled: Option<bool>,
    pub last_backup: Option<u64>,
    pub max_storage_size: Option<u64>,
}

impl SettingsPatch {
    fn apply(&self, settings: &mut Settings) {
        if let Some(enabled) = self.encryption_enabled {
            settings.encryption_enabled = enabled;
        }
        if let Some(enabled) = self.backup_enabled {
            settings.backup_enabled = enabled;
        }
        if let Some(at) = self.last_backup {
            settings.last_backup = Some(at);
        }
        if let Some(max) = self.max_storage_size {
            settings.max_storage_size = max;
        }
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    backend: Arc<dyn StorageBackend>,
    defaults: Settings,
}

impl SettingsStore {
    pub fn new(backend: Arc<dyn StorageBackend>, defaults: Settings) -> Self {
        Self { backend, defaults }
    }

    pub fn defaults(&self) -> &Settings {
        &self.defaults
    }

    /// Stored settings, or the defaults when none were written yet.
    pub fn get(&self) -> Result<Settings, VaultError> {
        match self
            .backend
            .get(SETTINGS_KEY)
            .map_err(VaultError::Storage)?
        {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(self.defaults.clone()),
        }
    }

    pub fn update(&self, patch: &SettingsPatch) -> Result<Settings, VaultError> {
        let mut settings = self.get()?;
        patch.apply(&mut settings);
        commit(self.backend.as_ref(), vec![self.write_op(&settings)?])?;
        Ok(settings)
    }

    pub(crate) fn write_op(&self, settings: &Settings) -> Result<WriteOp, VaultError> {
        Ok(WriteOp::put(SETTINGS_KEY, serde_json::to_vec(settings)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::MemoryStorage;

    fn store() -> SettingsStore {
        SettingsStore::new(Arc::new(MemoryStorage::new()), Settings::default())
    }

    #[test]
    fn test_defaults_when_absent() {
        let settings = store().get().unwrap();
        assert!(settings.encryption_enabled);
        assert!(!settings.backup_enabled);
        assert_eq!(settings.max_storage_size, DEFAULT_MAX_STORAGE_SIZE);
        assert_eq!(settings.key_hash, None);
    }

    #[test]
    fn test_partial_update_keeps_other_fields() {
        let store = store();
        store
            .update(&SettingsPatch {
                backup_enabled: Some(true),
                ..Default::default()
            })
            .unwrap();
        let updated = store
            .update(&SettingsPatch {
                max_storage_size: Some(4096),
                ..Default::default()
            })
            .unwrap();

        assert!(updated.backup_enabled);
        assert!(updated.encryption_enabled);
        assert_eq!(updated.max_storage_size, 4096);
        assert_eq!(store.get().unwrap(), updated);
    }

    #[test]
    fn test_older_records_fill_missing_fields() {
        let backend = Arc::new(MemoryStorage::new());
        backend
            .apply_batch(vec![WriteOp::put(SETTINGS_KEY, r#"{"backupEnabled":true}"#)])
            .unwrap();
        let store = SettingsStore::new(backend, Settings::default());
        let settings = store.get().unwrap();
        assert!(settings.backup_enabled);
        assert_eq!(settings.max_storage_size, DEFAULT_MAX_STORAGE_SIZE);
    }
}
