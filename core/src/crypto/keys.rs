// Data key lifecycle: generate, persist, verify, rotate on mismatch
//
// The key is kept at rest under `meta/key` in the same store it protects.
// Its SHA-256 is recorded in Settings so a swapped or lost key is detected
// at startup instead of surfacing later as a wall of integrity failures.

use crate::store::backend::{StorageBackend, WriteOp};
use crate::store::commit;
use crate::store::layout::DATA_KEY;
use crate::store::settings::SettingsStore;
use crate::VaultError;
use parking_lot::RwLock;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;

/// 256-bit symmetric data key. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey([u8; KEY_LEN]);

impl DataKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let key = Self(bytes);
        bytes.zeroize();
        key
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Hex SHA-256 of the key material.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.0))
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DataKey").field(&"<redacted>").finish()
    }
}

pub struct KeyManager {
    backend: Arc<dyn StorageBackend>,
    settings: SettingsStore,
    cached: RwLock<Option<Arc<DataKey>>>,
}

impl KeyManager {
    pub fn new(backend: Arc<dyn StorageBackend>, settings: SettingsStore) -> Self {
        Self {
            backend,
            settings,
            cached: RwLock::new(None),
        }
    }

    /// Load the persisted key, or create one on first run.
    ///
    /// When the persisted key no longer matches the recorded hash a fresh key
    /// replaces it. Records sealed under the old key stay undecryptable.
    pub fn get_or_create_key(&self) -> Result<Arc<DataKey>, VaultError> {
        if let Some(key) = self.cached.read().as_ref() {
            return Ok(key.clone());
        }

        let persisted = self
            .backend
            .get(DATA_KEY)
            .map_err(VaultError::Storage)?;
        let settings = self.settings.get()?;

        let key = match (persisted, settings.key_hash.clone()) {
            (None, None) => {
                tracing::info!("🔑 Generating new data key");
                self.rotate()?
            }
            (None, Some(_)) => {
                tracing::error!(
                    "Data key missing but a key hash is recorded; generating a new key. \
                     Previously encrypted records are no longer decryptable"
                );
                self.rotate()?
            }
            (Some(bytes), recorded) => match DataKey::from_slice(&bytes) {
                Some(key) => match recorded {
                    Some(hash) if hash == key.fingerprint() => {
                        tracing::debug!("🔑 Loaded existing data key");
                        key
                    }
                    Some(_) => {
                        tracing::error!(
                            "Data key does not match recorded hash; generating a new key. \
                             Previously encrypted records are no longer decryptable"
                        );
                        self.rotate()?
                    }
                    None => {
                        tracing::info!("🔑 Recording hash for existing data key");
                        let mut settings = settings;
                        settings.key_hash = Some(key.fingerprint());
                        commit(self.backend.as_ref(), vec![self.settings.write_op(&settings)?])?;
                        key
                    }
                },
                None => {
                    tracing::error!(
                        len = bytes.len(),
                        "Persisted data key is malformed; generating a new key. \
                         Previously encrypted records are no longer decryptable"
                    );
                    self.rotate()?
                }
            },
        };

        let key = Arc::new(key);
        *self.cached.write() = Some(key.clone());
        Ok(key)
    }

    /// Whether `candidate` is the key whose hash is recorded in Settings.
    pub fn verify_key(&self, candidate: &DataKey) -> Result<bool, VaultError> {
        let settings = self.settings.get()?;
        Ok(settings.key_hash.as_deref() == Some(candidate.fingerprint().as_str()))
    }

    /// Persist a new key and its hash in one batch.
    fn rotate(&self) -> Result<DataKey, VaultError> {
        let key = DataKey::generate();
        let mut settings = self.settings.get()?;
        settings.key_hash = Some(key.fingerprint());
        commit(
            self.backend.as_ref(),
            vec![
                WriteOp::put(DATA_KEY, key.as_bytes().to_vec()),
                self.settings.write_op(&settings)?,
            ],
        )?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::MemoryStorage;
    use crate::store::settings::Settings;

    fn manager(backend: &Arc<MemoryStorage>) -> KeyManager {
        let backend: Arc<dyn StorageBackend> = backend.clone();
        let settings = SettingsStore::new(backend.clone(), Settings::default());
        KeyManager::new(backend, settings)
    }

    #[test]
    fn test_key_generation() {
        let key = DataKey::generate();
        assert_eq!(key.fingerprint().len(), 64);
        assert_ne!(key.as_bytes(), DataKey::generate().as_bytes());
        assert_eq!(format!("{:?}", key), "DataKey(\"<redacted>\")");
    }

    #[test]
    fn test_first_run_records_hash() {
        let backend = Arc::new(MemoryStorage::new());
        let keys = manager(&backend);
        let key = keys.get_or_create_key().unwrap();

        assert!(keys.verify_key(&key).unwrap());
        assert!(!keys.verify_key(&DataKey::generate()).unwrap());
        assert_eq!(
            backend.get(DATA_KEY).unwrap().unwrap(),
            key.as_bytes().to_vec()
        );
    }

    #[test]
    fn test_key_survives_restart() {
        let backend = Arc::new(MemoryStorage::new());
        let first = manager(&backend).get_or_create_key().unwrap();
        let second = manager(&backend).get_or_create_key().unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn test_mismatched_hash_rotates_key() {
        let backend = Arc::new(MemoryStorage::new());
        let original = manager(&backend).get_or_create_key().unwrap();

        // Swap the persisted key behind the recorded hash
        backend
            .apply_batch(vec![WriteOp::put(DATA_KEY, DataKey::generate().as_bytes().to_vec())])
            .unwrap();

        let keys = manager(&backend);
        let rotated = keys.get_or_create_key().unwrap();
        assert_ne!(original.as_bytes(), rotated.as_bytes());
        assert!(keys.verify_key(&rotated).unwrap());
        assert!(!keys.verify_key(&original).unwrap());
    }

    #[test]
    fn test_missing_key_with_recorded_hash_rotates() {
        let backend = Arc::new(MemoryStorage::new());
        let original = manager(&backend).get_or_create_key().unwrap();
        backend.apply_batch(vec![WriteOp::delete(DATA_KEY)]).unwrap();

        let keys = manager(&backend);
        let replacement = keys.get_or_create_key().unwrap();
        assert_ne!(original.as_bytes(), replacement.as_bytes());
        assert!(keys.verify_key(&replacement).unwrap());
    }

    #[test]
    fn test_key_is_cached() {
        let backend = Arc::new(MemoryStorage::new());
        let keys = manager(&backend);
        let first = keys.get_or_create_key().unwrap();
        backend.apply_batch(vec![WriteOp::delete(DATA_KEY)]).unwrap();
        let second = keys.get_or_create_key().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
