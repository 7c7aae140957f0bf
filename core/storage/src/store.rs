//! Local store trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use synceddb_common::{
    Document, RecordKey, Result, SyncAction, SyncState, SYNC_ACTION_FIELD, SYNC_STATE_FIELD,
};

/// Secondary indexes every store keeps on the sync envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreIndex {
    /// Index over `sync_state`.
    SyncState,
    /// Index over `sync_action`.
    SyncAction,
}

impl StoreIndex {
    /// Index name.
    pub fn name(&self) -> &'static str {
        match self {
            StoreIndex::SyncState => "syncState",
            StoreIndex::SyncAction => "syncAction",
        }
    }

    /// Document field the index covers.
    pub fn field(&self) -> &'static str {
        match self {
            StoreIndex::SyncState => SYNC_STATE_FIELD,
            StoreIndex::SyncAction => SYNC_ACTION_FIELD,
        }
    }
}

/// Index lookup value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexValue {
    /// Match on a sync state.
    State(SyncState),
    /// Match on a sync action.
    Action(SyncAction),
}

impl IndexValue {
    /// Index this value is looked up in.
    pub fn index(&self) -> StoreIndex {
        match self {
            IndexValue::State(_) => StoreIndex::SyncState,
            IndexValue::Action(_) => StoreIndex::SyncAction,
        }
    }

    /// Stored representation of the value.
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexValue::State(state) => state.as_str(),
            IndexValue::Action(action) => action.as_str(),
        }
    }
}

impl From<SyncState> for IndexValue {
    fn from(state: SyncState) -> Self {
        IndexValue::State(state)
    }
}

impl From<SyncAction> for IndexValue {
    fn from(action: SyncAction) -> Self {
        IndexValue::Action(action)
    }
}

/// One step of an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    /// Insert or replace a document under its own key.
    Put(Document),
    /// Remove a key. Removing an absent key is not an error.
    Delete(RecordKey),
}

/// Store layout options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Name of the primary-key field inside every document.
    pub key_name: String,
    /// Whether the store assigns keys to documents added without one.
    pub auto_increment: bool,
}

impl StoreConfig {
    /// Create a configuration with the given key field.
    pub fn new(key_name: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
            auto_increment: false,
        }
    }

    /// Enable or disable store-assigned keys.
    pub fn with_auto_increment(mut self, auto_increment: bool) -> Self {
        self.auto_increment = auto_increment;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("id")
    }
}

/// Keyed document store the sync engine persists into.
///
/// Stores are keyed by the document's primary-key field and keep the
/// `sync_state`/`sync_action` indexes current on every write. Listings are
/// ordered by key.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get the store name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Name of the primary-key field.
    fn key_name(&self) -> &str;

    /// Whether [`LocalStore::add`] assigns keys to documents without one.
    fn auto_increment(&self) -> bool;

    /// Look up a document by key.
    async fn get(&self, key: &RecordKey) -> Result<Option<Document>>;

    /// Insert or replace a document.
    ///
    /// # Errors
    /// - `MissingKey` if the document has no key and the store does not
    ///   assign keys
    async fn put(&self, doc: Document) -> Result<RecordKey>;

    /// Insert a new document, returning its key.
    ///
    /// # Errors
    /// - `AlreadyExists` if the key is taken
    /// - `MissingKey` if the document has no key and the store does not
    ///   assign keys
    async fn add(&self, doc: Document) -> Result<RecordKey>;

    /// Remove a document. Removing an absent key is not an error.
    async fn delete(&self, key: &RecordKey) -> Result<()>;

    /// All documents, ordered by key.
    async fn list_all(&self) -> Result<Vec<Document>>;

    /// Documents whose indexed field equals `value`, ordered by key.
    async fn list_by_index(&self, value: IndexValue) -> Result<Vec<Document>>;

    /// Apply every operation atomically, in order.
    ///
    /// Either all operations are visible afterwards or none is.
    async fn batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    /// Insert or replace many documents atomically.
    async fn put_bulk(&self, docs: Vec<Document>) -> Result<()> {
        self.batch(docs.into_iter().map(BatchOp::Put).collect())
            .await
    }

    /// Remove many keys atomically.
    async fn delete_bulk(&self, keys: &[RecordKey]) -> Result<()> {
        self.batch(keys.iter().cloned().map(BatchOp::Delete).collect())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_fields() {
        assert_eq!(StoreIndex::SyncState.field(), "sync_state");
        assert_eq!(StoreIndex::SyncAction.field(), "sync_action");
        assert_eq!(StoreIndex::SyncState.name(), "syncState");
    }

    #[test]
    fn test_index_value() {
        let value = IndexValue::from(SyncState::Unsynced);
        assert_eq!(value.index(), StoreIndex::SyncState);
        assert_eq!(value.as_str(), "unsynced");

        let value = IndexValue::from(SyncAction::Delete);
        assert_eq!(value.index(), StoreIndex::SyncAction);
        assert_eq!(value.as_str(), "delete");
    }

    #[test]
    fn test_store_config_serialization() {
        let config = StoreConfig::new("uuid").with_auto_increment(true);
        let json = serde_json::to_string(&config).unwrap();
        let restored: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, config);
        assert_eq!(StoreConfig::default().key_name, "id");
    }
}
