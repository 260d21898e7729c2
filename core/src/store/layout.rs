// Key layout for records, secondary indexes and metadata
//
// Index keys end in `/{id}`; timestamps are zero-padded so byte order equals
// numeric order.

use crate::model::SortField;
use crate::VaultError;

pub const CONVERSATION_PREFIX: &[u8] = b"conv/";
pub const MESSAGE_PREFIX: &[u8] = b"msg/";
pub const CONVERSATION_INDEX_PREFIX: &[u8] = b"idx/conv/";
pub const MESSAGE_INDEX_PREFIX: &[u8] = b"idx/msg/";

pub const SETTINGS_KEY: &[u8] = b"meta/settings";
pub const DATA_KEY: &[u8] = b"meta/key";
pub const SCHEMA_VERSION_KEY: &[u8] = b"meta/schema_version";

/// Ids become path segments, so they must be non-empty and slash-free.
pub fn validate_id(kind: &str, id: &str) -> Result<(), VaultError> {
    if id.is_empty() {
        return Err(VaultError::InvalidInput(format!("{} id is empty", kind)));
    }
    if id.contains('/') {
        return Err(VaultError::InvalidInput(format!(
            "{} id {:?} contains '/'",
            kind, id
        )));
    }
    Ok(())
}

pub fn conversation_key(id: &str) -> Vec<u8> {
    format!("conv/{}", id).into_bytes()
}

pub fn message_key(id: &str) -> Vec<u8> {
    format!("msg/{}", id).into_bytes()
}

pub fn conversation_sort_prefix(field: SortField) -> Vec<u8> {
    format!("idx/conv/{}/", field.as_segment()).into_bytes()
}

pub fn conversation_sort_index(field: SortField, timestamp: u64, id: &str) -> Vec<u8> {
    format!("idx/conv/{}/{:020}/{}", field.as_segment(), timestamp, id).into_bytes()
}

pub fn endpoint_prefix(endpoint: &str) -> Vec<u8> {
    format!("idx/conv/endpoint/{}/", hex::encode(endpoint)).into_bytes()
}

pub fn endpoint_index(endpoint: &str, id: &str) -> Vec<u8> {
    let mut key = endpoint_prefix(endpoint);
    key.extend_from_slice(id.as_bytes());
    key
}

pub fn title_prefix(title: &str) -> Vec<u8> {
    format!("idx/conv/title/{}/", hex::encode(title.to_lowercase())).into_bytes()
}

pub fn title_index(title: &str, id: &str) -> Vec<u8> {
    let mut key = title_prefix(title);
    key.extend_from_slice(id.as_bytes());
    key
}

pub fn message_conversation_prefix(conversation_id: &str) -> Vec<u8> {
    format!("idx/msg/conv/{}/", conversation_id).into_bytes()
}

pub fn message_conversation_index(conversation_id: &str, created_at: u64, id: &str) -> Vec<u8> {
    format!("idx/msg/conv/{}/{:020}/{}", conversation_id, created_at, id).into_bytes()
}

pub fn message_created_index(created_at: u64, id: &str) -> Vec<u8> {
    format!("idx/msg/created/{:020}/{}", created_at, id).into_bytes()
}

pub fn message_parent_prefix(parent_id: &str) -> Vec<u8> {
    format!("idx/msg/parent/{}/", parent_id).into_bytes()
}

pub fn message_parent_index(parent_id: &str, id: &str) -> Vec<u8> {
    format!("idx/msg/parent/{}/{}", parent_id, id).into_bytes()
}

pub fn message_author_index(is_created_by_user: bool, id: &str) -> Vec<u8> {
    let author = if is_created_by_user { "user" } else { "assistant" };
    format!("idx/msg/author/{}/{}", author, id).into_bytes()
}

/// Trailing id segment of an index key.
pub fn id_from_index_key(key: &[u8]) -> Option<String> {
    let slash = key.iter().rposition(|b| *b == b'/')?;
    let id = std::str::from_utf8(&key[slash + 1..]).ok()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_index_orders_numerically() {
        let early = conversation_sort_index(SortField::CreatedAt, 9, "b");
        let late = conversation_sort_index(SortField::CreatedAt, 10, "a");
        assert!(early < late);
        assert!(early.starts_with(&conversation_sort_prefix(SortField::CreatedAt)));
    }

    #[test]
    fn test_id_from_index_key() {
        let key = message_conversation_index("c1", 42, "m1");
        assert_eq!(id_from_index_key(&key).as_deref(), Some("m1"));
        assert_eq!(id_from_index_key(b"idx/msg/"), None);
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("conversation", "c1").is_ok());
        assert!(validate_id("conversation", "").is_err());
        assert!(validate_id("conversation", "a/b").is_err());
    }

    #[test]
    fn test_free_text_segments_are_hex_encoded() {
        let key = endpoint_index("azure/openAI", "c1");
        let text = String::from_utf8(key).unwrap();
        assert!(!text.contains("azure/openAI"));
        assert!(text.ends_with("/c1"));
    }
}
