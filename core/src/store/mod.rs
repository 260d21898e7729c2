// Store module: record persistence, secondary indexes and cascading deletes

pub mod backend;
pub mod conversations;
pub mod layout;
pub mod messages;
pub mod settings;

pub use backend::{MemoryStorage, SledStorage, StorageBackend, WriteOp};
pub use conversations::ConversationStore;
pub use messages::MessageStore;
pub use settings::{Settings, SettingsPatch, SettingsStore};

use crate::VaultError;

/// Current on-disk layout version.
pub const STORAGE_SCHEMA_VERSION: u32 = 1;

/// Apply `ops` atomically, retrying once if the engine aborts the batch.
pub(crate) fn commit(backend: &dyn StorageBackend, ops: Vec<WriteOp>) -> Result<(), VaultError> {
    if ops.is_empty() {
        return Ok(());
    }
    match backend.apply_batch(ops.clone()) {
        Ok(()) => Ok(()),
        Err(first) => {
            tracing::warn!(error = %first, "Storage batch aborted, retrying once");
            backend.apply_batch(ops).map_err(|e| {
                tracing::error!(error = %e, "Storage batch aborted twice");
                VaultError::Transaction(e)
            })
        }
    }
}

/// Reject `ops` up front when they would push the store past `limit`.
///
/// Batches that do not grow the store are always allowed, so a store that is
/// already over its limit can still shrink.
pub(crate) fn ensure_quota(
    backend: &dyn StorageBackend,
    ops: &[WriteOp],
    limit: u64,
) -> Result<(), VaultError> {
    let current = backend.used_bytes();
    let projected = backend::projected_usage(backend, ops).map_err(VaultError::Storage)?;
    if projected > limit && projected > current {
        tracing::warn!(projected, limit, "Write rejected by storage quota");
        return Err(VaultError::QuotaExceeded {
            required: projected,
            limit,
        });
    }
    Ok(())
}

/// Delete ops for every index entry under `prefix` whose trailing id is `id`.
///
/// Used when a record no longer decodes and its own index keys cannot be
/// recomputed.
pub(crate) fn orphaned_index_ops(
    backend: &dyn StorageBackend,
    prefix: &[u8],
    id: &str,
) -> Result<Vec<WriteOp>, VaultError> {
    Ok(backend
        .scan_prefix(prefix)
        .map_err(VaultError::Storage)?
        .into_iter()
        .map(|(key, _)| key)
        .filter(|key| layout::id_from_index_key(key).as_deref() == Some(id))
        .map(WriteOp::delete)
        .collect())
}

/// Decode a JSON record read from the backend.
pub(crate) fn decode_record<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, VaultError> {
    serde_json::from_slice(bytes).map_err(|e| VaultError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::MockStorageBackend;

    #[test]
    fn test_commit_retries_once() {
        let mut backend = MockStorageBackend::new();
        let mut seq = mockall::Sequence::new();
        backend
            .expect_apply_batch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err("io".to_string()));
        backend
            .expect_apply_batch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        commit(&backend, vec![WriteOp::put("k", "v")]).unwrap();
    }

    #[test]
    fn test_commit_surfaces_second_failure() {
        let mut backend = MockStorageBackend::new();
        backend
            .expect_apply_batch()
            .times(2)
            .returning(|_| Err("disk full".to_string()));

        let err = commit(&backend, vec![WriteOp::put("k", "v")]).unwrap_err();
        assert_eq!(err, VaultError::Transaction("disk full".to_string()));
    }

    #[test]
    fn test_quota_allows_shrinking_writes() {
        let backend = MemoryStorage::new();
        backend
            .apply_batch(vec![WriteOp::put("a", "0123456789")])
            .unwrap();

        assert!(ensure_quota(&backend, &[WriteOp::put("b", "x")], 5).is_err());
        assert!(ensure_quota(&backend, &[WriteOp::delete("a")], 5).is_ok());
        assert!(ensure_quota(&backend, &[WriteOp::put("b", "x")], 100).is_ok());
    }

    #[test]
    fn test_orphaned_index_ops_match_trailing_id_only() {
        let backend = MemoryStorage::new();
        backend
            .apply_batch(vec![
                WriteOp::put("idx/msg/conv/m1/00000000000000000001/m2", ""),
                WriteOp::put("idx/msg/created/00000000000000000001/m1", ""),
                WriteOp::put("idx/msg/parent/m0/m1", ""),
                WriteOp::put("idx/msg/author/user/m10", ""),
            ])
            .unwrap();

        let ops = orphaned_index_ops(&backend, layout::MESSAGE_INDEX_PREFIX, "m1").unwrap();
        assert_eq!(
            ops,
            vec![
                WriteOp::delete("idx/msg/created/00000000000000000001/m1"),
                WriteOp::delete("idx/msg/parent/m0/m1"),
            ]
        );
    }
}
