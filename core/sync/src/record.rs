//! Record model and wire payloads.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use synceddb_common::{
    document_action, document_key, document_state, tag_document, Document, Error, RecordKey,
    Result, SyncAction, SyncState, SYNC_ACTION_FIELD, SYNC_STATE_FIELD,
};

/// A domain entity together with its sync envelope.
///
/// Serializes flat: `{"id":"1","name":"x","sync_action":"none","sync_state":"synced"}`.
/// `T` must serialize to a JSON object. When temporary keys are in play the
/// key field of `T` has to accept strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    #[serde(flatten)]
    pub data: T,
    pub sync_action: SyncAction,
    pub sync_state: SyncState,
}

impl<T> Record<T> {
    /// Wrap an entity with the given envelope.
    pub fn new(data: T, sync_action: SyncAction, sync_state: SyncState) -> Self {
        Self {
            data,
            sync_action,
            sync_state,
        }
    }

    /// Wrap an entity acknowledged by the remote.
    pub fn synced(data: T) -> Self {
        Self::new(data, SyncAction::None, SyncState::Synced)
    }

    /// Whether the record was created locally and the remote does not know it.
    pub fn is_pending_creation(&self) -> bool {
        self.sync_action == SyncAction::Create
    }

    /// Whether the record matches the last known remote state.
    pub fn is_synced(&self) -> bool {
        self.sync_state == SyncState::Synced
    }
}

impl<T: Serialize> Record<T> {
    /// Primary key of the record.
    pub fn key(&self, key_name: &str) -> Option<RecordKey> {
        entity_to_document(&self.data)
            .ok()
            .and_then(|doc| document_key(&doc, key_name))
    }
}

impl<T: DeserializeOwned> Record<T> {
    /// Decode a stored document.
    ///
    /// Documents written without an envelope decode as `none`/`synced`.
    pub fn from_document(mut doc: Document) -> Result<Self> {
        if !doc.contains_key(SYNC_ACTION_FIELD) || !doc.contains_key(SYNC_STATE_FIELD) {
            let action = document_action(&doc).unwrap_or(SyncAction::None);
            let state = document_state(&doc).unwrap_or(SyncState::Synced);
            tag_document(&mut doc, action, state);
        }
        serde_json::from_value(Value::Object(doc)).map_err(|e| {
            Error::Serialization(format!("Failed to decode record: {}", e))
        })
    }
}

/// Serialize an entity into a document.
///
/// # Errors
/// - `InvalidInput` if `T` does not serialize to a JSON object
pub fn entity_to_document<T: Serialize>(data: &T) -> Result<Document> {
    match serde_json::to_value(data)? {
        Value::Object(doc) => Ok(doc),
        other => Err(Error::InvalidInput(format!(
            "entity must serialize to a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Body of a batched sync request. Empty buckets are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRequestBody {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub create: Vec<Document>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update: Vec<Document>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete: Vec<Document>,
}

impl SyncRequestBody {
    /// Partition unsynced documents by pending action.
    ///
    /// Documents without an action, or with `none`, are skipped.
    pub fn from_unsynced(docs: Vec<Document>) -> Self {
        let mut body = Self::default();
        for doc in docs {
            match document_action(&doc) {
                Some(SyncAction::Create) => body.create.push(doc),
                Some(SyncAction::Update) => body.update.push(doc),
                Some(SyncAction::Delete) => body.delete.push(doc),
                Some(SyncAction::None) | None => {}
            }
        }
        body
    }

    /// Whether every bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }

    /// Number of records across all buckets.
    pub fn len(&self) -> usize {
        self.create.len() + self.update.len() + self.delete.len()
    }
}

/// Body of a batched sync response. All fields are required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponseBody {
    pub changed: Vec<Document>,
    pub deleted: Vec<RecordKey>,
    pub timestamp: SyncTimestamp,
}

/// Server clock reading, in milliseconds since the Unix epoch.
///
/// Decodes from an ISO-8601 string or an epoch-millisecond number and
/// encodes as ISO-8601.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SyncTimestamp(i64);

impl SyncTimestamp {
    /// Timestamp from epoch milliseconds.
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Parse an RFC 3339 / ISO-8601 timestamp.
    pub fn parse(text: &str) -> Result<Self> {
        DateTime::parse_from_rfc3339(text)
            .map(|dt| Self(dt.timestamp_millis()))
            .map_err(|e| Error::Decode(format!("Invalid timestamp '{}': {}", text, e)))
    }

    /// Milliseconds since the Unix epoch.
    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Convert to a UTC date-time, if representable.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0).single()
    }
}

impl fmt::Display for SyncTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => f.write_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => write!(f, "{}", self.0),
        }
    }
}

impl Serialize for SyncTimestamp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SyncTimestamp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(i64),
            Float(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Millis(millis) => Ok(Self(millis)),
            Raw::Float(millis) if millis.is_finite() => Ok(Self(millis as i64)),
            Raw::Float(millis) => Err(serde::de::Error::custom(format!(
                "invalid timestamp {}",
                millis
            ))),
            Raw::Text(text) => Self::parse(&text).map_err(serde::de::Error::custom),
        }
    }
}
