// Message persistence, ordered per conversation
//
// Messages reference their conversation through the `idx/msg/conv` index;
// the reference is enforced here rather than by the engine.

use crate::crypto::{record_aad, RecordCodec, Stored};
use crate::model::{now_millis, Listing, Message, SyncStatus};
use crate::store::backend::{StorageBackend, WriteOp};
use crate::store::conversations::{self, touch_ops};
use crate::store::layout::{
    id_from_index_key, message_author_index, message_conversation_index,
    message_conversation_prefix, message_created_index, message_key, message_parent_index,
    message_parent_prefix, validate_id, MESSAGE_INDEX_PREFIX, MESSAGE_PREFIX,
};
use crate::store::settings::SettingsStore;
use crate::store::{commit, decode_record, ensure_quota, orphaned_index_ops};
use crate::VaultError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub(crate) const MESSAGE_KIND: &str = "message";

/// Fields of a message that are encrypted together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSecrets {
    pub text: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    pub is_created_by_user: bool,
    pub created_at: u64,
    #[serde(default)]
    pub sync_status: SyncStatus,
    pub sealed: Stored<MessageSecrets>,
}

impl StoredMessage {
    pub(crate) fn index_keys(&self) -> Vec<Vec<u8>> {
        let mut keys = vec![
            message_conversation_index(&self.conversation_id, self.created_at, &self.id),
            message_created_index(self.created_at, &self.id),
            message_author_index(self.is_created_by_user, &self.id),
        ];
        if let Some(parent) = &self.parent_message_id {
            keys.push(message_parent_index(parent, &self.id));
        }
        keys
    }

    fn into_message(self, secrets: MessageSecrets) -> Message {
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            parent_message_id: self.parent_message_id,
            is_created_by_user: self.is_created_by_user,
            text: secrets.text,
            content: secrets.content,
            created_at: self.created_at,
            sync_status: self.sync_status,
        }
    }
}

fn load_stored(backend: &dyn StorageBackend, id: &str) -> Result<Option<StoredMessage>, VaultError> {
    match backend.get(&message_key(id)).map_err(VaultError::Storage)? {
        Some(bytes) => Ok(Some(decode_record(&bytes)?)),
        None => Ok(None),
    }
}

/// Delete ops for every message of a conversation, indexes included.
pub(crate) struct Cascade {
    pub ops: Vec<WriteOp>,
    pub removed: usize,
}

pub(crate) fn cascade_ops(
    backend: &dyn StorageBackend,
    conversation_id: &str,
) -> Result<Cascade, VaultError> {
    let mut cascade = Cascade {
        ops: Vec::new(),
        removed: 0,
    };
    let entries = backend
        .scan_prefix(&message_conversation_prefix(conversation_id))
        .map_err(VaultError::Storage)?;

    for (key, _) in entries {
        cascade.ops.push(WriteOp::delete(key.clone()));
        let Some(id) = id_from_index_key(&key) else {
            continue;
        };
        match load_stored(backend, &id) {
            Ok(Some(stored)) if stored.conversation_id == conversation_id => {
                cascade
                    .ops
                    .extend(stored.index_keys().into_iter().map(WriteOp::delete));
                cascade.ops.push(WriteOp::delete(message_key(&id)));
                cascade.removed += 1;
            }
            Ok(_) => {}
            Err(e @ VaultError::Serialization(_)) => {
                tracing::warn!(message_id = %id, error = %e, "Deleting undecodable message");
                cascade
                    .ops
                    .extend(orphaned_index_ops(backend, MESSAGE_INDEX_PREFIX, &id)?);
                cascade.ops.push(WriteOp::delete(message_key(&id)));
                cascade.removed += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(cascade)
}

#[derive(Clone)]
pub struct MessageStore {
    backend: Arc<dyn StorageBackend>,
    codec: Arc<RecordCodec>,
    settings: SettingsStore,
}

impl MessageStore {
    pub fn new(backend: Arc<dyn StorageBackend>, codec: Arc<RecordCodec>, settings: SettingsStore) -> Self {
        Self {
            backend,
            codec,
            settings,
        }
    }

    fn validate(message: &Message) -> Result<(), VaultError> {
        validate_id("message", &message.id)?;
        validate_id("conversation", &message.conversation_id)?;
        if let Some(parent) = &message.parent_message_id {
            validate_id("parent message", parent)?;
        }
        Ok(())
    }

    /// Upsert a message and bump its conversation's `updated_at` in the same
    /// batch. The conversation must already exist.
    pub fn put(&self, message: Message) -> Result<Message, VaultError> {
        Self::validate(&message)?;
        let now = now_millis();
        let mut message = message;
        if message.created_at == 0 {
            message.created_at = now;
        }

        let touch = touch_ops(self.backend.as_ref(), &message.conversation_id, Some(now), None)?
            .ok_or_else(|| VaultError::ConversationNotFound(message.conversation_id.clone()))?;
        self.write(&message, touch)?;
        Ok(message)
    }

    /// Write `message` verbatim without touching its conversation.
    pub fn restore(&self, message: &Message) -> Result<(), VaultError> {
        Self::validate(message)?;
        if conversations::load_stored(self.backend.as_ref(), &message.conversation_id)?.is_none() {
            return Err(VaultError::ConversationNotFound(
                message.conversation_id.clone(),
            ));
        }
        self.write(message, Vec::new())
    }

    fn write(&self, message: &Message, mut ops: Vec<WriteOp>) -> Result<(), VaultError> {
        let settings = self.settings.get()?;
        let previous = load_stored(self.backend.as_ref(), &message.id)?;
        let stored = self.seal(message, settings.encryption_enabled)?;

        if let Some(previous) = &previous {
            ops.extend(previous.index_keys().into_iter().map(WriteOp::delete));
        }
        ops.extend(stored.index_keys().into_iter().map(|key| WriteOp::put(key, Vec::new())));
        ops.push(WriteOp::put(message_key(&message.id), serde_json::to_vec(&stored)?));

        ensure_quota(self.backend.as_ref(), &ops, settings.max_storage_size)?;
        commit(self.backend.as_ref(), ops)
    }

    fn seal(&self, message: &Message, encrypt: bool) -> Result<StoredMessage, VaultError> {
        let secrets = MessageSecrets {
            text: message.text.clone(),
            content: message.content.clone(),
        };
        let aad = record_aad(MESSAGE_KIND, &message.id);
        let secrets = self
            .codec
            .seal(encrypt, &aad, secrets)
            .map_err(|e| VaultError::from_codec(&message.id, e))?;

        Ok(StoredMessage {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            parent_message_id: message.parent_message_id.clone(),
            is_created_by_user: message.is_created_by_user,
            created_at: message.created_at,
            sync_status: message.sync_status,
            sealed: secrets,
        })
    }

    fn open(&self, stored: StoredMessage) -> Result<Message, VaultError> {
        let aad = record_aad(MESSAGE_KIND, &stored.id);
        let secrets = self
            .codec
            .open(&aad, &stored.sealed)
            .map_err(|e| VaultError::from_codec(&stored.id, e))?;
        Ok(stored.into_message(secrets))
    }

    pub fn get(&self, id: &str) -> Result<Option<Message>, VaultError> {
        match load_stored(self.backend.as_ref(), id)? {
            Some(stored) => Ok(Some(self.open(stored)?)),
            None => Ok(None),
        }
    }

    /// Messages of a conversation, oldest first (ties broken by id).
    /// Undecryptable messages are left out and named in `skipped`.
    pub fn list_by_conversation(&self, conversation_id: &str) -> Result<Listing<Message>, VaultError> {
        self.collect_from_index(&message_conversation_prefix(conversation_id))
    }

    /// Direct replies to `parent_id`, oldest first.
    pub fn list_children(&self, parent_id: &str) -> Result<Listing<Message>, VaultError> {
        let mut listing = self.collect_from_index(&message_parent_prefix(parent_id))?;
        listing
            .items
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(listing)
    }

    fn collect_from_index(&self, prefix: &[u8]) -> Result<Listing<Message>, VaultError> {
        let mut listing = Listing::default();
        for (key, _) in self.backend.scan_prefix(prefix).map_err(VaultError::Storage)? {
            let Some(id) = id_from_index_key(&key) else {
                continue;
            };
            match self.get(&id) {
                Ok(Some(message)) => listing.items.push(message),
                Ok(None) => {
                    tracing::warn!(message_id = %id, "Index entry without record");
                    listing.skipped.push(id);
                }
                Err(e) => {
                    tracing::warn!(message_id = %id, error = %e, "Skipping unreadable message");
                    listing.skipped.push(id);
                }
            }
        }
        Ok(listing)
    }

    /// Every message in id order.
    pub fn all(&self) -> Result<Listing<Message>, VaultError> {
        let mut listing = Listing::default();
        for (key, value) in self
            .backend
            .scan_prefix(MESSAGE_PREFIX)
            .map_err(VaultError::Storage)?
        {
            let id = String::from_utf8_lossy(&key[MESSAGE_PREFIX.len()..]).to_string();
            match decode_record::<StoredMessage>(&value).and_then(|s| self.open(s)) {
                Ok(message) => listing.items.push(message),
                Err(e) => {
                    tracing::warn!(message_id = %id, error = %e, "Skipping unreadable message");
                    listing.skipped.push(id);
                }
            }
        }
        Ok(listing)
    }

    /// Remove every message of a conversation in one batch.
    pub fn delete_by_conversation(&self, conversation_id: &str) -> Result<usize, VaultError> {
        let cascade = cascade_ops(self.backend.as_ref(), conversation_id)?;
        commit(self.backend.as_ref(), cascade.ops)?;
        Ok(cascade.removed)
    }

    pub fn count(&self) -> Result<usize, VaultError> {
        self.backend
            .count_prefix(MESSAGE_PREFIX)
            .map_err(VaultError::Storage)
    }

    pub(crate) fn rebuild_index_ops(&self) -> Result<Vec<WriteOp>, VaultError> {
        let mut ops = Vec::new();
        for (key, value) in self
            .backend
            .scan_prefix(MESSAGE_PREFIX)
            .map_err(VaultError::Storage)?
        {
            match decode_record::<StoredMessage>(&value) {
                Ok(stored) => ops.extend(
                    stored
                        .index_keys()
                        .into_iter()
                        .map(|key| WriteOp::put(key, Vec::new())),
                ),
                Err(e) => {
                    let id = String::from_utf8_lossy(&key[MESSAGE_PREFIX.len()..]);
                    tracing::warn!(message_id = %id, error = %e, "Not indexing undecodable message");
                }
            }
        }
        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DataKey;
    use crate::model::Conversation;
    use crate::store::backend::MemoryStorage;
    use crate::store::conversations::ConversationStore;
    use crate::store::settings::{Settings, SettingsPatch};

    struct Fixture {
        backend: Arc<MemoryStorage>,
        settings: SettingsStore,
        conversations: ConversationStore,
        messages: MessageStore,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryStorage::new());
        let shared: Arc<dyn StorageBackend> = backend.clone();
        let settings = SettingsStore::new(shared.clone(), Settings::default());
        let codec = Arc::new(RecordCodec::new(Arc::new(DataKey::generate())));
        let fx = Fixture {
            backend,
            settings: settings.clone(),
            conversations: ConversationStore::new(shared.clone(), codec.clone(), settings.clone()),
            messages: MessageStore::new(shared, codec, settings),
        };
        fx.conversations
            .put(Conversation::new("Hello", "openAI", "gpt-4o").with_id("c1"))
            .unwrap();
        fx
    }

    fn corrupt(backend: &MemoryStorage, id: &str) {
        let key = message_key(id);
        let mut record: serde_json::Value =
            serde_json::from_slice(&backend.get(&key).unwrap().unwrap()).unwrap();
        let ciphertext = record["sealed"]["data"]["ciphertext"].as_str().unwrap().to_string();
        let mut bytes = hex::decode(ciphertext).unwrap();
        bytes[0] ^= 0x01;
        record["sealed"]["data"]["ciphertext"] = serde_json::Value::String(hex::encode(bytes));
        backend
            .apply_batch(vec![WriteOp::put(key, serde_json::to_vec(&record).unwrap())])
            .unwrap();
    }

    #[test]
    fn test_messages_listed_in_creation_order() {
        let fx = fixture();
        // Inserted out of order on purpose
        fx.messages
            .put(Message::new_assistant("c1", "there").with_id("m2").with_created_at(2_000))
            .unwrap();
        fx.messages
            .put(Message::new_user("c1", "hi").with_id("m1").with_created_at(1_000))
            .unwrap();

        let listing = fx.messages.list_by_conversation("c1").unwrap();
        let ids: Vec<&str> = listing.items.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(listing.items[0].text, "hi");
        assert!(listing.skipped.is_empty());
    }

    #[test]
    fn test_corrupted_message_is_skipped() {
        let fx = fixture();
        fx.messages
            .put(Message::new_user("c1", "hi").with_id("m1").with_created_at(1))
            .unwrap();
        fx.messages
            .put(Message::new_assistant("c1", "there").with_id("m2").with_created_at(2))
            .unwrap();
        corrupt(&fx.backend, "m1");

        let listing = fx.messages.list_by_conversation("c1").unwrap();
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.items[0].id, "m2");
        assert_eq!(listing.skipped, vec!["m1".to_string()]);
        assert_eq!(
            fx.messages.get("m1").unwrap_err(),
            VaultError::Integrity {
                id: "m1".to_string()
            }
        );
    }

    #[test]
    fn test_message_requires_conversation() {
        let fx = fixture();
        let err = fx
            .messages
            .put(Message::new_user("missing", "hi").with_id("m1"))
            .unwrap_err();
        assert_eq!(err, VaultError::ConversationNotFound("missing".to_string()));
        assert_eq!(fx.messages.count().unwrap(), 0);
    }

    #[test]
    fn test_message_bumps_conversation_updated_at() {
        let fx = fixture();
        let mut stale = fx.conversations.load("c1").unwrap().unwrap();
        stale.updated_at = 1;
        fx.conversations.restore(&stale).unwrap();

        fx.messages.put(Message::new_user("c1", "hi").with_id("m1")).unwrap();
        let bumped = fx.conversations.load("c1").unwrap().unwrap();
        assert!(bumped.updated_at > 1);
    }

    #[test]
    fn test_content_edit_in_place() {
        let fx = fixture();
        let mut message = fx
            .messages
            .put(Message::new_assistant("c1", "Hel").with_id("m1"))
            .unwrap();
        message.text = "Hello, world".to_string();
        message.content = Some("[{\"type\":\"text\"}]".to_string());
        fx.messages.put(message.clone()).unwrap();

        assert_eq!(fx.messages.get("m1").unwrap().unwrap(), message);
        assert_eq!(fx.messages.list_by_conversation("c1").unwrap().items.len(), 1);
    }

    #[test]
    fn test_children_by_parent() {
        let fx = fixture();
        fx.messages.put(Message::new_user("c1", "q").with_id("root").with_created_at(1)).unwrap();
        fx.messages
            .put(Message::new_assistant("c1", "b").with_id("r2").with_parent("root").with_created_at(3))
            .unwrap();
        fx.messages
            .put(Message::new_assistant("c1", "a").with_id("r1").with_parent("root").with_created_at(2))
            .unwrap();

        let children = fx.messages.list_children("root").unwrap();
        let ids: Vec<&str> = children.items.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
    }

    #[test]
    fn test_delete_by_conversation() {
        let fx = fixture();
        fx.messages.put(Message::new_user("c1", "a").with_id("m1")).unwrap();
        fx.messages.put(Message::new_user("c1", "b").with_id("m2")).unwrap();

        assert_eq!(fx.messages.delete_by_conversation("c1").unwrap(), 2);
        assert_eq!(fx.messages.count().unwrap(), 0);
        assert_eq!(fx.backend.count_prefix(b"idx/msg/").unwrap(), 0);
    }

    #[test]
    fn test_delete_by_conversation_removes_undecodable_message() {
        let fx = fixture();
        fx.messages.put(Message::new_user("c1", "a").with_id("m1")).unwrap();
        fx.messages
            .put(Message::new_assistant("c1", "b").with_id("m2").with_parent("m1"))
            .unwrap();
        fx.messages
            .put(Message::new_user("c1", "c").with_id("m3").with_parent("m2"))
            .unwrap();
        fx.backend
            .apply_batch(vec![WriteOp::put(message_key("m2"), "{broken")])
            .unwrap();

        assert_eq!(fx.messages.delete_by_conversation("c1").unwrap(), 3);
        assert_eq!(fx.messages.count().unwrap(), 0);
        assert_eq!(fx.backend.count_prefix(b"idx/msg/").unwrap(), 0);
    }

    #[test]
    fn test_rebuild_skips_undecodable_message() {
        let fx = fixture();
        fx.messages.put(Message::new_user("c1", "a").with_id("m1")).unwrap();
        fx.messages.put(Message::new_user("c1", "b").with_id("m2")).unwrap();
        fx.backend
            .apply_batch(vec![WriteOp::put(message_key("m2"), "{broken")])
            .unwrap();

        let ops = fx.messages.rebuild_index_ops().unwrap();
        assert_eq!(ops.len(), 3);
        assert!(ops
            .iter()
            .all(|op| id_from_index_key(op.key()).as_deref() == Some("m1")));
    }

    #[test]
    fn test_quota_blocks_message_write() {
        let fx = fixture();
        fx.messages.put(Message::new_user("c1", "first").with_id("m1")).unwrap();
        let usage = fx.backend.used_bytes();
        fx.settings
            .update(&SettingsPatch {
                max_storage_size: Some(usage / 2),
                ..Default::default()
            })
            .unwrap();
        let before = fx.backend.scan_prefix(b"").unwrap();

        let err = fx
            .messages
            .put(Message::new_user("c1", "second").with_id("m2"))
            .unwrap_err();
        assert!(matches!(err, VaultError::QuotaExceeded { .. }));
        assert_eq!(fx.backend.scan_prefix(b"").unwrap(), before);
    }
}
