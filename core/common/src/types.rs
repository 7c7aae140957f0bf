//! Common types used throughout SyncedDB.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// A stored record as the local store and the wire see it: a JSON object
/// holding the domain fields, the primary key and the sync envelope.
pub type Document = serde_json::Map<String, Value>;

/// Prefix reserved for client-generated placeholder keys.
pub const TEMPORARY_KEY_PREFIX: &str = "TMP-";

/// Envelope field carrying the pending mutation kind.
pub const SYNC_ACTION_FIELD: &str = "sync_action";

/// Envelope field carrying the acknowledgment state.
pub const SYNC_STATE_FIELD: &str = "sync_state";

/// Primary key of a record.
///
/// Keys are strings. Numeric keys coming from a server are accepted and
/// normalized to their decimal form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawKey", into = "String")]
pub struct RecordKey(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawKey {
    Text(String),
    Number(serde_json::Number),
}

impl TryFrom<RawKey> for RecordKey {
    type Error = crate::Error;

    fn try_from(raw: RawKey) -> crate::Result<Self> {
        match raw {
            RawKey::Text(text) => Self::new(text),
            RawKey::Number(number) => Self::new(number.to_string()),
        }
    }
}

impl From<RecordKey> for String {
    fn from(key: RecordKey) -> Self {
        key.0
    }
}

impl RecordKey {
    /// Create a new RecordKey from a string.
    ///
    /// # Errors
    /// - Returns error if the key is empty
    pub fn new(key: impl Into<String>) -> crate::Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(crate::Error::InvalidInput(
                "RecordKey cannot be empty".to_string(),
            ));
        }
        Ok(Self(key))
    }

    /// Generate a fresh temporary key (`TMP-<uuid>`).
    ///
    /// Temporary keys never collide with server-assigned keys as long as the
    /// server does not hand out keys starting with [`TEMPORARY_KEY_PREFIX`].
    pub fn temporary() -> Self {
        Self(format!("{}{}", TEMPORARY_KEY_PREFIX, Uuid::new_v4()))
    }

    /// Check if this is a client-generated placeholder key.
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_KEY_PREFIX)
    }

    /// Extract a key from a JSON value (string or number).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Last local mutation not yet acknowledged by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    /// Nothing pending.
    None,
    /// Created locally, unknown to the remote.
    Create,
    /// Updated locally.
    Update,
    /// Deleted locally, tombstone kept until acknowledged.
    Delete,
}

impl SyncAction {
    /// Wire name of the action, also used as index value.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::None => "none",
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        }
    }

    /// Parse a wire name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(SyncAction::None),
            "create" => Some(SyncAction::Create),
            "update" => Some(SyncAction::Update),
            "delete" => Some(SyncAction::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acknowledgment state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// A local mutation is waiting for the remote.
    Unsynced,
    /// The record matches the last known remote state.
    Synced,
}

impl SyncState {
    /// Wire name of the state, also used as index value.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Unsynced => "unsynced",
            SyncState::Synced => "synced",
        }
    }

    /// Parse a wire name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unsynced" => Some(SyncState::Unsynced),
            "synced" => Some(SyncState::Synced),
            _ => None,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read the primary key of a document.
pub fn document_key(doc: &Document, key_name: &str) -> Option<RecordKey> {
    doc.get(key_name).and_then(RecordKey::from_value)
}

/// Overwrite the primary key of a document.
pub fn set_document_key(doc: &mut Document, key_name: &str, key: &RecordKey) {
    doc.insert(key_name.to_string(), Value::String(key.as_str().to_string()));
}

/// Read the pending action of a document, if it carries one.
pub fn document_action(doc: &Document) -> Option<SyncAction> {
    doc.get(SYNC_ACTION_FIELD)
        .and_then(Value::as_str)
        .and_then(SyncAction::parse)
}

/// Read the sync state of a document, if it carries one.
pub fn document_state(doc: &Document) -> Option<SyncState> {
    doc.get(SYNC_STATE_FIELD)
        .and_then(Value::as_str)
        .and_then(SyncState::parse)
}

/// Stamp the sync envelope onto a document.
pub fn tag_document(doc: &mut Document, action: SyncAction, state: SyncState) {
    doc.insert(
        SYNC_ACTION_FIELD.to_string(),
        Value::String(action.as_str().to_string()),
    );
    doc.insert(
        SYNC_STATE_FIELD.to_string(),
        Value::String(state.as_str().to_string()),
    );
}

/// Remove the sync envelope, leaving the bare domain entity.
pub fn strip_envelope(doc: &mut Document) {
    doc.remove(SYNC_ACTION_FIELD);
    doc.remove(SYNC_STATE_FIELD);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_record_key_creation() {
        let key = RecordKey::new("42").unwrap();
        assert_eq!(key.as_str(), "42");
        assert!(!key.is_temporary());
    }

    #[test]
    fn test_record_key_empty_fails() {
        assert!(RecordKey::new("").is_err());
    }

    #[test]
    fn test_temporary_keys_are_unique() {
        let a = RecordKey::temporary();
        let b = RecordKey::temporary();
        assert!(a.is_temporary());
        assert!(a.as_str().starts_with("TMP-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_record_key_accepts_numbers() {
        let keys: Vec<RecordKey> = serde_json::from_value(json!(["3", 4, "TMP-1"])).unwrap();
        assert_eq!(keys[0].as_str(), "3");
        assert_eq!(keys[1].as_str(), "4");
        assert!(keys[2].is_temporary());
        assert!(serde_json::from_value::<RecordKey>(json!("")).is_err());
        assert!(serde_json::from_value::<RecordKey>(json!(null)).is_err());
    }

    #[test]
    fn test_envelope_wire_names() {
        assert_eq!(serde_json::to_value(SyncAction::None).unwrap(), json!("none"));
        assert_eq!(serde_json::to_value(SyncState::Unsynced).unwrap(), json!("unsynced"));
        assert_eq!(SyncAction::parse("delete"), Some(SyncAction::Delete));
        assert_eq!(SyncAction::parse("remove"), None);
    }

    #[test]
    fn test_tag_and_strip_document() {
        let mut doc = json!({"id": "1", "name": "x"}).as_object().cloned().unwrap();
        tag_document(&mut doc, SyncAction::Update, SyncState::Unsynced);
        assert_eq!(document_action(&doc), Some(SyncAction::Update));
        assert_eq!(document_state(&doc), Some(SyncState::Unsynced));
        assert_eq!(document_key(&doc, "id").unwrap().as_str(), "1");

        strip_envelope(&mut doc);
        assert_eq!(Value::Object(doc), json!({"id": "1", "name": "x"}));
    }

    proptest! {
        #[test]
        fn prop_non_prefixed_keys_are_never_temporary(key in "[a-zA-Z0-9_-]{1,32}") {
            prop_assume!(!key.starts_with(TEMPORARY_KEY_PREFIX));
            let key = RecordKey::new(key).unwrap();
            prop_assert!(!key.is_temporary());
        }

        #[test]
        fn prop_key_survives_json(key in "[a-zA-Z0-9_-]{1,32}") {
            let key = RecordKey::new(key).unwrap();
            let value = serde_json::to_value(&key).unwrap();
            let back: RecordKey = serde_json::from_value(value).unwrap();
            prop_assert_eq!(back, key);
        }
    }
}
