// ChatVault Core: local, encrypted conversation storage
//
// Conversations and messages never leave the device. Sensitive fields are
// sealed per record; everything else stays queryable through ordered
// secondary indexes in a single keyspace.

pub mod backup;
pub mod config;
pub mod crypto;
pub mod facade;
pub mod model;
pub mod store;

use thiserror::Error;

pub use backup::{BackupExchange, ExportReport, ImportReport, Snapshot};
pub use config::StorageConfig;
pub use crypto::{CodecError, DataKey, EncryptedBlob, KeyManager, RecordCodec};
pub use facade::{StorageFacade, StorageState};
pub use model::{
    Conversation, ListQuery, Listing, Message, Page, ReencryptReport, SortField, SortOrder,
    StorageStats, SyncStatus,
};
pub use store::{
    ConversationStore, MemoryStorage, MessageStore, Settings, SettingsPatch, SettingsStore,
    SledStorage, StorageBackend,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("Storage initialization failed: {0}")]
    Initialization(String),
    #[error("Integrity check failed for record {id}")]
    Integrity { id: String },
    #[error("Storage quota exceeded: {required} bytes required, limit is {limit}")]
    QuotaExceeded { required: u64, limit: u64 },
    #[error("Transaction aborted: {0}")]
    Transaction(String),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl VaultError {
    /// Codec failures on record `id`. Anything past serialization means the
    /// stored bytes cannot be trusted.
    pub fn from_codec(id: &str, err: CodecError) -> Self {
        match err {
            CodecError::Serialize(msg) => VaultError::Serialization(msg),
            other => {
                tracing::debug!(record_id = id, error = %other, "Codec rejected record");
                VaultError::Integrity { id: id.to_string() }
            }
        }
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_errors_map_to_integrity() {
        assert_eq!(
            VaultError::from_codec("m1", CodecError::ChecksumMismatch),
            VaultError::Integrity {
                id: "m1".to_string()
            }
        );
        assert_eq!(
            VaultError::from_codec("m1", CodecError::Decrypt),
            VaultError::Integrity {
                id: "m1".to_string()
            }
        );
        assert!(matches!(
            VaultError::from_codec("m1", CodecError::Serialize("x".into())),
            VaultError::Serialization(_)
        ));
    }

    #[test]
    fn test_error_messages() {
        let err = VaultError::QuotaExceeded {
            required: 10,
            limit: 5,
        };
        assert_eq!(
            err.to_string(),
            "Storage quota exceeded: 10 bytes required, limit is 5"
        );
    }
}
