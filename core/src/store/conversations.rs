// Conversation persistence with sort, endpoint and title indexes
//
// A conversation record and all of its index entries are always written in
// one batch. Deleting a conversation folds every message it owns into the
// same batch, so no message outlives its conversation.

use crate::crypto::{record_aad, RecordCodec, Stored};
use crate::model::{Conversation, ListQuery, Listing, Page, SortField, SortOrder, SyncStatus};
use crate::store::backend::{StorageBackend, WriteOp};
use crate::store::layout::{
    conversation_key, conversation_sort_index, conversation_sort_prefix, endpoint_index,
    endpoint_prefix, id_from_index_key, title_index, title_prefix, validate_id,
    CONVERSATION_INDEX_PREFIX, CONVERSATION_PREFIX,
};
use crate::store::settings::SettingsStore;
use crate::store::{commit, decode_record, ensure_quota, messages, orphaned_index_ops};
use crate::VaultError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub(crate) const CONVERSATION_KIND: &str = "conversation";

/// Fields of a conversation that are encrypted together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSecrets {
    pub title: String,
    #[serde(default)]
    pub prompt_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredConversation {
    pub id: String,
    pub endpoint: String,
    pub model: String,
    pub created_at: u64,
    pub updated_at: u64,
    pub last_accessed: u64,
    #[serde(default)]
    pub sync_status: SyncStatus,
    pub sealed: Stored<ConversationSecrets>,
}

impl StoredConversation {
    fn sort_value(&self, field: SortField) -> u64 {
        match field {
            SortField::CreatedAt => self.created_at,
            SortField::UpdatedAt => self.updated_at,
            SortField::LastAccessed => self.last_accessed,
        }
    }

    /// Every index entry this record owns. Titles are only indexed for
    /// plaintext records so sealed titles never reach index keys.
    pub(crate) fn index_keys(&self) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = SortField::ALL
            .iter()
            .map(|field| conversation_sort_index(*field, self.sort_value(*field), &self.id))
            .collect();
        keys.push(endpoint_index(&self.endpoint, &self.id));
        if let Some(secrets) = self.sealed.as_plain() {
            keys.push(title_index(&secrets.title, &self.id));
        }
        keys
    }

    fn into_conversation(self, secrets: ConversationSecrets) -> Conversation {
        Conversation {
            id: self.id,
            title: secrets.title,
            endpoint: self.endpoint,
            model: self.model,
            prompt_prefix: secrets.prompt_prefix,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_accessed: self.last_accessed,
            sync_status: self.sync_status,
        }
    }
}

pub(crate) fn load_stored(
    backend: &dyn StorageBackend,
    id: &str,
) -> Result<Option<StoredConversation>, VaultError> {
    match backend
        .get(&conversation_key(id))
        .map_err(VaultError::Storage)?
    {
        Some(bytes) => Ok(Some(decode_record(&bytes)?)),
        None => Ok(None),
    }
}

/// Ops swapping `previous` (if any) for `next`, record and indexes together.
fn replace_ops(
    previous: Option<&StoredConversation>,
    next: &StoredConversation,
) -> Result<Vec<WriteOp>, VaultError> {
    let mut ops = Vec::new();
    if let Some(previous) = previous {
        ops.extend(previous.index_keys().into_iter().map(WriteOp::delete));
    }
    ops.extend(next.index_keys().into_iter().map(|key| WriteOp::put(key, Vec::new())));
    ops.push(WriteOp::put(conversation_key(&next.id), serde_json::to_vec(next)?));
    Ok(ops)
}

/// Ops moving a conversation's timestamps without touching its sealed fields.
/// Returns `None` when the conversation does not exist.
pub(crate) fn touch_ops(
    backend: &dyn StorageBackend,
    id: &str,
    updated_at: Option<u64>,
    last_accessed: Option<u64>,
) -> Result<Option<Vec<WriteOp>>, VaultError> {
    let Some(previous) = load_stored(backend, id)? else {
        return Ok(None);
    };
    let mut next = previous.clone();
    if let Some(at) = updated_at {
        next.updated_at = at;
    }
    if let Some(at) = last_accessed {
        next.last_accessed = at;
    }
    Ok(Some(replace_ops(Some(&previous), &next)?))
}

#[derive(Clone)]
pub struct ConversationStore {
    backend: Arc<dyn StorageBackend>,
    codec: Arc<RecordCodec>,
    settings: SettingsStore,
}

impl ConversationStore {
    pub fn new(backend: Arc<dyn StorageBackend>, codec: Arc<RecordCodec>, settings: SettingsStore) -> Self {
        Self {
            backend,
            codec,
            settings,
        }
    }

    /// Upsert. `created_at` of an existing record is kept; `updated_at` and
    /// `last_accessed` are set to now.
    pub fn put(&self, conversation: Conversation) -> Result<Conversation, VaultError> {
        validate_id("conversation", &conversation.id)?;
        let now = crate::model::now_millis();
        let previous = load_stored(self.backend.as_ref(), &conversation.id)?;

        let mut conversation = conversation;
        match &previous {
            Some(previous) => conversation.created_at = previous.created_at,
            None if conversation.created_at == 0 => conversation.created_at = now,
            None => {}
        }
        conversation.updated_at = now;
        conversation.last_accessed = now;

        self.write(&conversation, previous)?;
        Ok(conversation)
    }

    /// Write `conversation` verbatim, timestamps included.
    pub fn restore(&self, conversation: &Conversation) -> Result<(), VaultError> {
        validate_id("conversation", &conversation.id)?;
        let previous = load_stored(self.backend.as_ref(), &conversation.id)?;
        self.write(conversation, previous)
    }

    fn write(
        &self,
        conversation: &Conversation,
        previous: Option<StoredConversation>,
    ) -> Result<(), VaultError> {
        let settings = self.settings.get()?;
        let stored = self.seal(conversation, settings.encryption_enabled)?;
        let ops = replace_ops(previous.as_ref(), &stored)?;
        ensure_quota(self.backend.as_ref(), &ops, settings.max_storage_size)?;
        commit(self.backend.as_ref(), ops)
    }

    fn seal(&self, conversation: &Conversation, encrypt: bool) -> Result<StoredConversation, VaultError> {
        let secrets = ConversationSecrets {
            title: conversation.title.clone(),
            prompt_prefix: conversation.prompt_prefix.clone(),
        };
        let aad = record_aad(CONVERSATION_KIND, &conversation.id);
        let secrets = self
            .codec
            .seal(encrypt, &aad, secrets)
            .map_err(|e| VaultError::from_codec(&conversation.id, e))?;

        Ok(StoredConversation {
            id: conversation.id.clone(),
            endpoint: conversation.endpoint.clone(),
            model: conversation.model.clone(),
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
            last_accessed: conversation.last_accessed,
            sync_status: conversation.sync_status,
            sealed: secrets,
        })
    }

    fn open(&self, stored: StoredConversation) -> Result<Conversation, VaultError> {
        let aad = record_aad(CONVERSATION_KIND, &stored.id);
        let secrets = self
            .codec
            .open(&aad, &stored.sealed)
            .map_err(|e| VaultError::from_codec(&stored.id, e))?;
        Ok(stored.into_conversation(secrets))
    }

    /// Read and decrypt without touching `last_accessed`.
    pub fn load(&self, id: &str) -> Result<Option<Conversation>, VaultError> {
        match load_stored(self.backend.as_ref(), id)? {
            Some(stored) => Ok(Some(self.open(stored)?)),
            None => Ok(None),
        }
    }

    /// Read, decrypt and touch `last_accessed`.
    pub fn get(&self, id: &str) -> Result<Option<Conversation>, VaultError> {
        let Some(mut conversation) = self.load(id)? else {
            return Ok(None);
        };

        let now = crate::model::now_millis();
        match touch_ops(self.backend.as_ref(), id, None, Some(now)) {
            Ok(Some(ops)) => match commit(self.backend.as_ref(), ops) {
                Ok(()) => conversation.last_accessed = now,
                Err(e) => tracing::warn!(conversation_id = id, error = %e, "Failed to touch conversation"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(conversation_id = id, error = %e, "Failed to touch conversation"),
        }
        Ok(Some(conversation))
    }

    /// One page of conversations in index order.
    ///
    /// The cursor is the id of the last entry consumed by the previous page;
    /// the scan resumes right after that id's current index position.
    /// Undecryptable records are omitted and reported in `skipped`.
    pub fn list(&self, query: &ListQuery) -> Result<Page<Conversation>, VaultError> {
        if query.limit == 0 {
            return Err(VaultError::InvalidInput("page limit must be at least 1".to_string()));
        }

        let after = match &query.cursor {
            Some(cursor) => Some(self.cursor_anchor(query.sort_by, cursor)?),
            None => None,
        };

        let entries = self
            .backend
            .scan_after(
                &conversation_sort_prefix(query.sort_by),
                after,
                query.sort_order == SortOrder::Desc,
                query.limit + 1,
            )
            .map_err(VaultError::Storage)?;
        let has_more = entries.len() > query.limit;

        let mut page = Page::empty();
        let mut last_id = None;
        for (key, _) in entries.into_iter().take(query.limit) {
            let Some(id) = id_from_index_key(&key) else {
                continue;
            };
            match self.load(&id) {
                Ok(Some(conversation)) => page.items.push(conversation),
                Ok(None) => {
                    tracing::warn!(conversation_id = %id, "Index entry without record");
                    page.skipped.push(id.clone());
                }
                Err(e) => {
                    tracing::warn!(conversation_id = %id, error = %e, "Skipping unreadable conversation");
                    page.skipped.push(id.clone());
                }
            }
            last_id = Some(id);
        }

        if has_more {
            page.next_cursor = last_id;
        }
        Ok(page)
    }

    /// Index key the cursor id currently occupies under `sort_by`.
    ///
    /// A cursor naming a record that is missing or no longer decodes is
    /// located by its index entry instead, so a bad record cannot stall
    /// pagination.
    fn cursor_anchor(&self, sort_by: SortField, cursor: &str) -> Result<Vec<u8>, VaultError> {
        match load_stored(self.backend.as_ref(), cursor) {
            Ok(Some(anchor)) => {
                return Ok(conversation_sort_index(sort_by, anchor.sort_value(sort_by), cursor))
            }
            Ok(None) | Err(VaultError::Serialization(_)) => {}
            Err(e) => return Err(e),
        }
        self.backend
            .scan_prefix(&conversation_sort_prefix(sort_by))
            .map_err(VaultError::Storage)?
            .into_iter()
            .map(|(key, _)| key)
            .find(|key| id_from_index_key(key).as_deref() == Some(cursor))
            .ok_or_else(|| VaultError::InvalidCursor(cursor.to_string()))
    }

    pub fn list_by_endpoint(&self, endpoint: &str) -> Result<Listing<Conversation>, VaultError> {
        self.collect_from_index(&endpoint_prefix(endpoint))
    }

    /// Exact, case-insensitive title match over plaintext records.
    pub fn find_by_title(&self, title: &str) -> Result<Listing<Conversation>, VaultError> {
        self.collect_from_index(&title_prefix(title))
    }

    fn collect_from_index(&self, prefix: &[u8]) -> Result<Listing<Conversation>, VaultError> {
        let mut listing = Listing::default();
        for (key, _) in self.backend.scan_prefix(prefix).map_err(VaultError::Storage)? {
            let Some(id) = id_from_index_key(&key) else {
                continue;
            };
            match self.load(&id) {
                Ok(Some(conversation)) => listing.items.push(conversation),
                Ok(None) => listing.skipped.push(id),
                Err(e) => {
                    tracing::warn!(conversation_id = %id, error = %e, "Skipping unreadable conversation");
                    listing.skipped.push(id);
                }
            }
        }
        Ok(listing)
    }

    /// Every conversation in id order.
    pub fn all(&self) -> Result<Listing<Conversation>, VaultError> {
        let mut listing = Listing::default();
        for (key, value) in self
            .backend
            .scan_prefix(CONVERSATION_PREFIX)
            .map_err(VaultError::Storage)?
        {
            let id = String::from_utf8_lossy(&key[CONVERSATION_PREFIX.len()..]).to_string();
            let opened = decode_record::<StoredConversation>(&value).and_then(|s| self.open(s));
            match opened {
                Ok(conversation) => listing.items.push(conversation),
                Err(e) => {
                    tracing::warn!(conversation_id = %id, error = %e, "Skipping unreadable conversation");
                    listing.skipped.push(id);
                }
            }
        }
        Ok(listing)
    }

    /// Remove the conversation and every message it owns in one batch.
    /// Returns whether the conversation existed.
    pub fn delete(&self, id: &str) -> Result<bool, VaultError> {
        let backend = self.backend.as_ref();
        let mut ops = Vec::new();
        let existed = match load_stored(backend, id) {
            Ok(Some(previous)) => {
                ops.extend(previous.index_keys().into_iter().map(WriteOp::delete));
                true
            }
            Ok(None) => false,
            Err(e @ VaultError::Serialization(_)) => {
                tracing::warn!(conversation_id = id, error = %e, "Deleting undecodable conversation");
                ops.extend(orphaned_index_ops(backend, CONVERSATION_INDEX_PREFIX, id)?);
                true
            }
            Err(e) => return Err(e),
        };
        if existed {
            ops.push(WriteOp::delete(conversation_key(id)));
        }
        let cascade = messages::cascade_ops(backend, id)?;
        let removed_messages = cascade.removed;
        ops.extend(cascade.ops);

        commit(backend, ops)?;
        if existed {
            tracing::info!(conversation_id = id, removed_messages, "Conversation deleted");
        }
        Ok(existed)
    }

    pub fn count(&self) -> Result<usize, VaultError> {
        self.backend
            .count_prefix(CONVERSATION_PREFIX)
            .map_err(VaultError::Storage)
    }

    /// Index entries recomputed from the records themselves.
    pub(crate) fn rebuild_index_ops(&self) -> Result<Vec<WriteOp>, VaultError> {
        let mut ops = Vec::new();
        for (key, value) in self
            .backend
            .scan_prefix(CONVERSATION_PREFIX)
            .map_err(VaultError::Storage)?
        {
            match decode_record::<StoredConversation>(&value) {
                Ok(stored) => ops.extend(
                    stored
                        .index_keys()
                        .into_iter()
                        .map(|key| WriteOp::put(key, Vec::new())),
                ),
                Err(e) => {
                    let id = String::from_utf8_lossy(&key[CONVERSATION_PREFIX.len()..]);
                    tracing::warn!(conversation_id = %id, error = %e, "Not indexing undecodable conversation");
                }
            }
        }
        Ok(ops)
    }
}
