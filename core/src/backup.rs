// Full-dataset export and import
//
// The snapshot is plain JSON handed to an external relay as an opaque blob.
// Records are exported decrypted; whoever stores the snapshot owns its
// protection.

use crate::model::{now_millis, Conversation, Message};
use crate::store::settings::{Settings, SettingsPatch, SettingsStore};
use crate::store::{ConversationStore, MessageStore};
use crate::VaultError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub conversations: Vec<Conversation>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub settings: Settings,
    pub export_date: DateTime<Utc>,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String, VaultError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, VaultError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Result of an export. `skipped` names records that failed to decrypt.
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub snapshot: Snapshot,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl ImportReport {
    fn record<T>(&mut self, kind: &str, id: &str, result: Result<T, VaultError>) {
        match result {
            Ok(_) => self.imported += 1,
            Err(e) => {
                tracing::warn!(kind, record_id = id, error = %e, "Import of record failed");
                self.failed += 1;
            }
        }
    }
}

#[derive(Clone)]
pub struct BackupExchange {
    conversations: ConversationStore,
    messages: MessageStore,
    settings: SettingsStore,
}

impl BackupExchange {
    pub fn new(conversations: ConversationStore, messages: MessageStore, settings: SettingsStore) -> Self {
        Self {
            conversations,
            messages,
            settings,
        }
    }

    /// Decrypt everything into a snapshot and stamp `last_backup`.
    pub fn export_all(&self) -> Result<ExportReport, VaultError> {
        let conversations = self.conversations.all()?;
        let messages = self.messages.all()?;

        let mut settings = self.settings.update(&SettingsPatch {
            last_backup: Some(now_millis()),
            ..Default::default()
        })?;
        // Tied to this device's key, meaningless elsewhere
        settings.key_hash = None;

        let mut skipped = conversations.skipped;
        skipped.extend(messages.skipped);
        if !skipped.is_empty() {
            tracing::warn!(count = skipped.len(), "Export skipped undecryptable records");
        }

        tracing::info!(
            conversations = conversations.items.len(),
            messages = messages.items.len(),
            "💾 Exported snapshot"
        );
        Ok(ExportReport {
            snapshot: Snapshot {
                conversations: conversations.items,
                messages: messages.items,
                settings,
                export_date: Utc::now(),
            },
            skipped,
        })
    }

    /// Merge a snapshot into the store.
    ///
    /// Settings first, so records are written under the imported encryption
    /// flag; then conversations; then messages. Records identical to the
    /// stored copy are left alone.
    pub fn import_all(&self, snapshot: &Snapshot) -> Result<ImportReport, VaultError> {
        self.settings.update(&SettingsPatch {
            encryption_enabled: Some(snapshot.settings.encryption_enabled),
            backup_enabled: Some(snapshot.settings.backup_enabled),
            max_storage_size: Some(snapshot.settings.max_storage_size),
            ..Default::default()
        })?;

        let mut report = ImportReport::default();
        for conversation in &snapshot.conversations {
            if let Ok(Some(existing)) = self.conversations.load(&conversation.id) {
                if &existing == conversation {
                    report.unchanged += 1;
                    continue;
                }
            }
            let result = self.conversations.restore(conversation);
            report.record("conversation", &conversation.id, result);
        }

        for message in &snapshot.messages {
            if let Ok(Some(existing)) = self.messages.get(&message.id) {
                if &existing == message {
                    report.unchanged += 1;
                    continue;
                }
            }
            let result = self.messages.restore(message);
            report.record("message", &message.id, result);
        }

        tracing::info!(
            imported = report.imported,
            unchanged = report.unchanged,
            failed = report.failed,
            "📥 Imported snapshot"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DataKey, RecordCodec};
    use crate::store::backend::{MemoryStorage, StorageBackend};
    use std::sync::Arc;

    fn exchange() -> BackupExchange {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        let settings = SettingsStore::new(backend.clone(), Settings::default());
        let codec = Arc::new(RecordCodec::new(Arc::new(DataKey::generate())));
        BackupExchange::new(
            ConversationStore::new(backend.clone(), codec.clone(), settings.clone()),
            MessageStore::new(backend, codec, settings.clone()),
            settings,
        )
    }

    fn seeded() -> BackupExchange {
        let exchange = exchange();
        exchange
            .conversations
            .put(Conversation::new("Trip", "openAI", "gpt-4o").with_id("c1"))
            .unwrap();
        exchange
            .messages
            .put(Message::new_user("c1", "hi").with_id("m1").with_created_at(1))
            .unwrap();
        exchange
            .messages
            .put(Message::new_assistant("c1", "hello").with_id("m2").with_parent("m1").with_created_at(2))
            .unwrap();
        exchange
    }

    #[test]
    fn test_export_shape() {
        let exchange = seeded();
        let report = exchange.export_all().unwrap();
        assert!(report.skipped.is_empty());

        let json: serde_json::Value =
            serde_json::from_str(&report.snapshot.to_json().unwrap()).unwrap();
        assert_eq!(json["conversations"][0]["title"], "Trip");
        assert_eq!(json["messages"].as_array().unwrap().len(), 2);
        assert!(json["exportDate"].as_str().unwrap().contains('T'));
        assert!(json["settings"]["keyHash"].is_null());

        assert!(exchange.settings.get().unwrap().last_backup.is_some());
    }

    #[test]
    fn test_import_into_empty_store() {
        let snapshot = seeded().export_all().unwrap().snapshot;
        let target = exchange();

        let report = target.import_all(&snapshot).unwrap();
        assert_eq!(
            report,
            ImportReport {
                imported: 3,
                unchanged: 0,
                failed: 0
            }
        );
        assert_eq!(
            target.conversations.load("c1").unwrap().unwrap(),
            snapshot.conversations[0]
        );
        assert_eq!(target.messages.list_by_conversation("c1").unwrap().items, snapshot.messages);
    }

    #[test]
    fn test_import_is_idempotent() {
        let snapshot = seeded().export_all().unwrap().snapshot;
        let target = exchange();
        target.import_all(&snapshot).unwrap();

        let again = target.import_all(&snapshot).unwrap();
        assert_eq!(
            again,
            ImportReport {
                imported: 0,
                unchanged: 3,
                failed: 0
            }
        );
        assert_eq!(target.conversations.count().unwrap(), 1);
        assert_eq!(target.messages.count().unwrap(), 2);
    }

    #[test]
    fn test_orphan_message_counts_as_failed() {
        let mut snapshot = seeded().export_all().unwrap().snapshot;
        snapshot
            .messages
            .push(Message::new_user("ghost", "lost").with_id("m9"));
        let target = exchange();

        let report = target.import_all(&snapshot).unwrap();
        assert_eq!(report.imported, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(target.messages.get("m9").unwrap(), None);
    }

    #[test]
    fn test_import_applies_settings_but_not_key_hash() {
        let mut snapshot = seeded().export_all().unwrap().snapshot;
        snapshot.settings.encryption_enabled = false;
        snapshot.settings.max_storage_size = 42_000_000;
        snapshot.settings.key_hash = Some("ff".repeat(32));
        let target = exchange();

        target.import_all(&snapshot).unwrap();
        let settings = target.settings.get().unwrap();
        assert!(!settings.encryption_enabled);
        assert_eq!(settings.max_storage_size, 42_000_000);
        assert_eq!(settings.key_hash, None);
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let snapshot = seeded().export_all().unwrap().snapshot;
        let parsed = Snapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(parsed, snapshot);
        assert!(Snapshot::from_json("{\"conversations\":").is_err());
    }
}
