//! In-memory local store for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use synceddb_common::{document_key, set_document_key, Document, Error, RecordKey, Result};

use crate::store::{BatchOp, IndexValue, LocalStore, StoreConfig};

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<RecordKey, Document>,
    next_key: u64,
}

/// In-memory local store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Keys sort as strings, the same order a browser
/// object store uses for string keys.
pub struct MemoryStore {
    config: StoreConfig,
    storage: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new empty store keyed by `id`.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create a new empty store with the given layout.
    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            config,
            storage: Arc::new(RwLock::new(Inner {
                records: BTreeMap::new(),
                next_key: 1,
            })),
        }
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.storage.read().map(|s| s.records.len()).unwrap_or(0)
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.storage
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.storage
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    /// Resolve the key of a document, assigning one if the store allows it.
    fn resolve_key(&self, inner: &mut Inner, doc: &mut Document) -> Result<RecordKey> {
        if let Some(key) = document_key(doc, &self.config.key_name) {
            return Ok(key);
        }
        if !self.config.auto_increment {
            return Err(Error::MissingKey(self.config.key_name.clone()));
        }

        // Skip keys an explicit write already took.
        loop {
            let candidate = RecordKey::new(inner.next_key.to_string())?;
            inner.next_key += 1;
            if !inner.records.contains_key(&candidate) {
                set_document_key(doc, &self.config.key_name, &candidate);
                return Ok(candidate);
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn key_name(&self) -> &str {
        &self.config.key_name
    }

    fn auto_increment(&self) -> bool {
        self.config.auto_increment
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<Document>> {
        Ok(self.read()?.records.get(key).cloned())
    }

    async fn put(&self, mut doc: Document) -> Result<RecordKey> {
        let mut storage = self.write()?;
        let key = self.resolve_key(&mut storage, &mut doc)?;
        storage.records.insert(key.clone(), doc);
        Ok(key)
    }

    async fn add(&self, mut doc: Document) -> Result<RecordKey> {
        let mut storage = self.write()?;
        let key = self.resolve_key(&mut storage, &mut doc)?;
        if storage.records.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("Key already exists: {}", key)));
        }
        storage.records.insert(key.clone(), doc);
        Ok(key)
    }

    async fn delete(&self, key: &RecordKey) -> Result<()> {
        self.write()?.records.remove(key);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Document>> {
        Ok(self.read()?.records.values().cloned().collect())
    }

    async fn list_by_index(&self, value: IndexValue) -> Result<Vec<Document>> {
        let field = value.index().field();
        let storage = self.read()?;

        Ok(storage
            .records
            .values()
            .filter(|doc| doc.get(field).and_then(Value::as_str) == Some(value.as_str()))
            .cloned()
            .collect())
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut storage = self.write()?;

        // Resolve every key before touching the map so a bad op leaves
        // the store unchanged.
        let mut resolved = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                BatchOp::Put(doc) => {
                    let key = document_key(&doc, &self.config.key_name)
                        .ok_or_else(|| Error::MissingKey(self.config.key_name.clone()))?;
                    resolved.push((key, Some(doc)));
                }
                BatchOp::Delete(key) => resolved.push((key, None)),
            }
        }

        for (key, doc) in resolved {
            match doc {
                Some(doc) => {
                    storage.records.insert(key, doc);
                }
                None => {
                    storage.records.remove(&key);
                }
            }
        }

        Ok(())
    }
}
