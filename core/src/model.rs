// Conversation and message records as seen by callers

use serde::{Deserialize, Serialize};

/// Replication state of a record relative to a remote copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Local,
    Synced,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub prompt_prefix: Option<String>,
    /// Unix milliseconds
    pub created_at: u64,
    pub updated_at: u64,
    pub last_accessed: u64,
    #[serde(default)]
    pub sync_status: SyncStatus,
}

impl Conversation {
    pub fn new(title: impl Into<String>, endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            endpoint: endpoint.into(),
            model: model.into(),
            prompt_prefix: None,
            created_at: now,
            updated_at: now,
            last_accessed: now,
            sync_status: SyncStatus::Local,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_prompt_prefix(mut self, prompt_prefix: impl Into<String>) -> Self {
        self.prompt_prefix = Some(prompt_prefix.into());
        self
    }

    pub fn sort_value(&self, field: SortField) -> u64 {
        match field {
            SortField::CreatedAt => self.created_at,
            SortField::UpdatedAt => self.updated_at,
            SortField::LastAccessed => self.last_accessed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    pub is_created_by_user: bool,
    pub text: String,
    #[serde(default)]
    pub content: Option<String>,
    /// Unix milliseconds
    pub created_at: u64,
    #[serde(default)]
    pub sync_status: SyncStatus,
}

impl Message {
    pub fn new_user(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(conversation_id.into(), text.into(), true)
    }

    pub fn new_assistant(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(conversation_id.into(), text.into(), false)
    }

    fn new(conversation_id: String, text: String, is_created_by_user: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id,
            parent_message_id: None,
            is_created_by_user,
            text,
            content: None,
            created_at: now_millis(),
            sync_status: SyncStatus::Local,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_parent(mut self, parent_message_id: impl Into<String>) -> Self {
        self.parent_message_id = Some(parent_message_id.into());
        self
    }

    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Secondary index a conversation listing walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    CreatedAt,
    #[default]
    UpdatedAt,
    LastAccessed,
}

impl SortField {
    pub const ALL: [SortField; 3] = [
        SortField::CreatedAt,
        SortField::UpdatedAt,
        SortField::LastAccessed,
    ];

    pub fn as_segment(self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::LastAccessed => "last_accessed",
        }
    }
}

impl std::str::FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" | "createdAt" | "created_at" => Ok(SortField::CreatedAt),
            "updated" | "updatedAt" | "updated_at" => Ok(SortField::UpdatedAt),
            "accessed" | "lastAccessed" | "last_accessed" => Ok(SortField::LastAccessed),
            other => Err(format!("unknown sort field: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl std::str::FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order: {}", other)),
        }
    }
}

/// Parameters of one page of a conversation listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    /// Id of the last entry of the previous page
    pub cursor: Option<String>,
    pub limit: usize,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            cursor: None,
            limit: 25,
            sort_by: SortField::default(),
            sort_order: SortOrder::default(),
        }
    }
}

impl ListQuery {
    pub fn new(limit: usize, sort_by: SortField, sort_order: SortOrder) -> Self {
        Self {
            cursor: None,
            limit,
            sort_by,
            sort_order,
        }
    }

    pub fn after(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }
}

/// One page of a listing. Records that could not be decoded are left out of
/// `items` and named in `skipped`; they still count against the page limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub skipped: Vec<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
            skipped: Vec::new(),
        }
    }
}

/// An unpaginated listing with the ids of records that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub skipped: Vec<String>,
}

impl<T> Default for Listing<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub conversation_count: usize,
    pub message_count: usize,
    pub estimated_size_bytes: u64,
}

/// Outcome of rewriting every record under the current encryption flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReencryptReport {
    pub rewritten: usize,
    pub failed: usize,
}

impl ReencryptReport {
    pub(crate) fn record(&mut self, kind: &str, id: &str, result: Result<(), crate::VaultError>) {
        match result {
            Ok(()) => self.rewritten += 1,
            Err(e) => {
                tracing::warn!(kind, record_id = id, error = %e, "Rewrite of record failed");
                self.failed += 1;
            }
        }
    }
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_json_shape() {
        let conversation = Conversation::new("Hello", "openAI", "gpt-4o").with_id("c1");
        let json = serde_json::to_value(&conversation).unwrap();
        assert_eq!(json["id"], "c1");
        assert_eq!(json["syncStatus"], "local");
        assert!(json.get("lastAccessed").is_some());
    }

    #[test]
    fn test_message_defaults_tolerate_missing_fields() {
        let message: Message = serde_json::from_str(
            r#"{"id":"m1","conversationId":"c1","isCreatedByUser":true,"text":"hi","createdAt":5}"#,
        )
        .unwrap();
        assert_eq!(message.parent_message_id, None);
        assert_eq!(message.sync_status, SyncStatus::Local);
    }

    #[test]
    fn test_sort_parsing() {
        assert_eq!("lastAccessed".parse::<SortField>().unwrap(), SortField::LastAccessed);
        assert_eq!("ASC".parse::<SortOrder>().unwrap(), SortOrder::Asc);
        assert!("sideways".parse::<SortOrder>().is_err());
    }
}
