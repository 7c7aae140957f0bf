//! Dry-run transport: fabricated remote responses, no network.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

use synceddb_common::{
    document_action, document_key, set_document_key, strip_envelope, Document, Error, RecordKey,
    Result, SyncAction,
};
use synceddb_remote::{Method, RemoteRequest, RemoteResponse, RemoteTransport};
use synceddb_storage::LocalStore;

use crate::config::SyncPaths;
use crate::record::{SyncRequestBody, SyncTimestamp};

/// Source of keys for records the dry-run remote pretends to create.
pub trait KeyGenerator: Send + Sync {
    fn next_key(&self) -> Result<RecordKey>;
}

/// Keys of the form `<epoch-ms><counter>`, the counter padded to three
/// digits and reset whenever the millisecond changes.
#[derive(Debug, Default)]
pub struct TimestampKeyGenerator {
    last: Mutex<(i64, u32)>,
}

impl TimestampKeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_at(&self, millis: i64) -> Result<RecordKey> {
        let mut last = self
            .last
            .lock()
            .map_err(|_| Error::Storage("key generator lock poisoned".to_string()))?;

        let counter = if last.0 == millis {
            last.1 + 1
        } else {
            0
        };
        *last = (millis, counter);

        RecordKey::new(format!("{}{:03}", millis, counter))
    }
}

impl KeyGenerator for TimestampKeyGenerator {
    fn next_key(&self) -> Result<RecordKey> {
        self.key_at(Utc::now().timestamp_millis())
    }
}

/// Keys `1`, `2`, `3`, ... with an optional prefix.
#[derive(Debug)]
pub struct SequentialKeyGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialKeyGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            prefix: String::new(),
            next: AtomicU64::new(first),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

impl Default for SequentialKeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyGenerator for SequentialKeyGenerator {
    fn next_key(&self) -> Result<RecordKey> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        RecordKey::new(format!("{}{}", self.prefix, n))
    }
}

/// Transport answering every call locally.
///
/// - create: echoes the body under a generated key, 201
/// - update: echoes the body, 200
/// - delete: 204
/// - read: the local copy without envelope, or 404
/// - read_all: local records that are not pending creations
/// - sync: updates plus re-keyed creations as `changed`, delete-bucket keys
///   as `deleted`, the current time as `timestamp`
pub struct DryRunTransport {
    store: Arc<dyn LocalStore>,
    paths: SyncPaths,
    keys: Arc<dyn KeyGenerator>,
}

impl DryRunTransport {
    pub fn new(store: Arc<dyn LocalStore>, paths: SyncPaths, keys: Arc<dyn KeyGenerator>) -> Self {
        Self { store, paths, keys }
    }

    fn body_object(request: &RemoteRequest) -> Result<Document> {
        match &request.body {
            Some(Value::Object(doc)) => Ok(doc.clone()),
            _ => Err(Error::InvalidInput(format!(
                "{} expects a JSON object body",
                request
            ))),
        }
    }

    async fn fabricate_read(&self, request: &RemoteRequest) -> Result<RemoteResponse> {
        let key = request
            .query_param(self.store.key_name())
            .map(RecordKey::new)
            .transpose()?;
        let Some(key) = key else {
            return Ok(RemoteResponse::new(404));
        };

        match self.store.get(&key).await? {
            Some(mut doc) => {
                strip_envelope(&mut doc);
                Ok(RemoteResponse::ok(Value::Object(doc)))
            }
            None => Ok(RemoteResponse::new(404)),
        }
    }

    async fn fabricate_read_all(&self) -> Result<RemoteResponse> {
        let records: Vec<Value> = self
            .store
            .list_all()
            .await?
            .into_iter()
            .filter(|doc| document_action(doc) != Some(SyncAction::Create))
            .map(|mut doc| {
                strip_envelope(&mut doc);
                Value::Object(doc)
            })
            .collect();
        Ok(RemoteResponse::ok(Value::Array(records)))
    }

    fn fabricate_sync(&self, request: &RemoteRequest) -> Result<RemoteResponse> {
        let body: SyncRequestBody = match &request.body {
            Some(body) => serde_json::from_value(body.clone())?,
            None => SyncRequestBody::default(),
        };
        let key_name = self.store.key_name();

        let mut changed = Vec::with_capacity(body.update.len() + body.create.len());
        for mut doc in body.update {
            strip_envelope(&mut doc);
            changed.push(Value::Object(doc));
        }
        for mut doc in body.create {
            strip_envelope(&mut doc);
            set_document_key(&mut doc, key_name, &self.keys.next_key()?);
            changed.push(Value::Object(doc));
        }

        let deleted: Vec<RecordKey> = body
            .delete
            .iter()
            .filter_map(|doc| document_key(doc, key_name))
            .collect();

        Ok(RemoteResponse::ok(json!({
            "changed": changed,
            "deleted": deleted,
            "timestamp": SyncTimestamp::now(),
        })))
    }
}

#[async_trait]
impl RemoteTransport for DryRunTransport {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        info!("DRY RUN: {}", request);

        let path = request.path.as_str();
        match request.method {
            Method::Post if path == self.paths.create => {
                let mut doc = Self::body_object(&request)?;
                set_document_key(&mut doc, self.store.key_name(), &self.keys.next_key()?);
                Ok(RemoteResponse::new(201).with_body(Value::Object(doc)))
            }
            Method::Post if path == self.paths.sync => self.fabricate_sync(&request),
            Method::Put if path == self.paths.update => {
                let doc = Self::body_object(&request)?;
                Ok(RemoteResponse::ok(Value::Object(doc)))
            }
            Method::Delete if path == self.paths.delete => Ok(RemoteResponse::new(204)),
            Method::Get if path == self.paths.read => self.fabricate_read(&request).await,
            Method::Get if path == self.paths.read_all => self.fabricate_read_all().await,
            _ => Ok(RemoteResponse::new(404)),
        }
    }
}
