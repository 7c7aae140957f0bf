//! Core sync engine that orchestrates local writes and remote reconciliation.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use synceddb_common::{
    document_action, document_key, set_document_key, tag_document, Document, Error, RecordKey,
    Result, SyncAction, SyncState,
};
use synceddb_remote::{Method, RemoteRequest, RemoteResponse, RemoteTransport};
use synceddb_storage::{BatchOp, LocalStore};

use crate::config::SyncConfig;
use crate::dry_run::{DryRunTransport, KeyGenerator, TimestampKeyGenerator};
use crate::events::{Operation, RemoteFailure, SyncEvents, SyncReport};
use crate::monitor::{
    run_monitor, Connectivity, NetworkState, StatusSnapshot, SyncStatus, SyncStatusHandle,
    Transition,
};
use crate::record::{entity_to_document, Record, SyncRequestBody, SyncResponseBody, SyncTimestamp};

/// Result of a batched sync.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome<T> {
    /// Not attempted, the network is down.
    Offline,
    /// No unsynced records, the remote was not contacted.
    NothingToSync,
    /// The remote call failed. Local state is untouched.
    Failed(RemoteFailure),
    /// The server answer was applied.
    Synced(SyncReport<T>),
}

/// Per-key mutation counter.
///
/// Every local mutation stamps its key with the next value of a global
/// counter. A remote call takes a mark when it is issued, and its response
/// may only be applied to a key whose stamp is not newer than that mark.
///
/// Stamps are only kept while some call is in flight, and only those newer
/// than the oldest in-flight mark, so the map drains whenever the engine is
/// quiet.
#[derive(Debug, Default)]
struct Generations {
    inner: Mutex<GenerationState>,
}

#[derive(Debug, Default)]
struct GenerationState {
    counter: u64,
    stamps: HashMap<RecordKey, u64>,
    /// Marks of calls in flight, with their multiplicity.
    in_flight: BTreeMap<u64, usize>,
}

impl GenerationState {
    fn bump(&mut self, key: &RecordKey) -> u64 {
        self.counter += 1;
        if !self.in_flight.is_empty() {
            self.stamps.insert(key.clone(), self.counter);
        }
        self.counter
    }

    fn register(&mut self) -> u64 {
        *self.in_flight.entry(self.counter).or_insert(0) += 1;
        self.counter
    }

    fn release(&mut self, mark: u64) {
        if let Some(count) = self.in_flight.get_mut(&mark) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(&mark);
            }
        }
        match self.in_flight.keys().next().copied() {
            Some(oldest) => self.stamps.retain(|_, stamp| *stamp > oldest),
            None => self.stamps.clear(),
        }
    }
}

impl Generations {
    fn lock(&self) -> MutexGuard<'_, GenerationState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a local mutation of `key`.
    fn bump(&self, key: &RecordKey) {
        self.lock().bump(key);
    }

    /// Start a remote call.
    fn begin(self: &Arc<Self>) -> InFlight {
        let mark = self.lock().register();
        InFlight {
            generations: Arc::clone(self),
            mark,
        }
    }

    /// Record a local mutation of `key` and start the remote call that
    /// pushes it, with no window for another mutation in between.
    fn bump_and_begin(self: &Arc<Self>, key: &RecordKey) -> InFlight {
        let mark = {
            let mut state = self.lock();
            state.bump(key);
            state.register()
        };
        InFlight {
            generations: Arc::clone(self),
            mark,
        }
    }

    fn changed_since(&self, key: &RecordKey, mark: u64) -> bool {
        self.lock()
            .stamps
            .get(key)
            .is_some_and(|stamp| *stamp > mark)
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.lock().stamps.len()
    }
}

/// A remote call in flight. Releases its mark on drop.
struct InFlight {
    generations: Arc<Generations>,
    mark: u64,
}

impl InFlight {
    /// Whether `key` was mutated locally after this call was issued.
    fn changed(&self, key: &RecordKey) -> bool {
        self.generations.changed_since(key, self.mark)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.generations.lock().release(self.mark);
    }
}

/// Reply of a single remote call, after transport errors were reported.
enum Reply {
    Success(RemoteResponse),
    NotFound,
    Failed,
}

/// Offline-first store synchronizing records of type `T` with a remote.
///
/// Cloning is cheap and yields a handle to the same engine.
pub struct SyncedStore<T> {
    /// Local store, the source of truth for callers.
    store: Arc<dyn LocalStore>,
    /// Remote leg (HTTP, mock or dry run).
    transport: Arc<dyn RemoteTransport>,
    /// Engine configuration.
    config: Arc<SyncConfig>,
    /// Current network state.
    network: watch::Receiver<Transition>,
    /// Event channels.
    events: Arc<SyncEvents<T>>,
    /// Local mutation stamps for the stale-response guard.
    generations: Arc<Generations>,
    /// Server timestamp of the last applied sync.
    last_sync: Arc<RwLock<SyncTimestamp>>,
    /// Status of connectivity-triggered syncs.
    status: SyncStatusHandle,
}

impl<T> Clone for SyncedStore<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            network: self.network.clone(),
            events: self.events.clone(),
            generations: self.generations.clone(),
            last_sync: self.last_sync.clone(),
            status: self.status.clone(),
        }
    }
}

/// Builder for [`SyncedStore`].
pub struct SyncedStoreBuilder<T> {
    /// Local store the engine is built over.
    store: Arc<dyn LocalStore>,
    /// Remote transport, required unless in dry-run mode.
    transport: Option<Arc<dyn RemoteTransport>>,
    /// Engine configuration.
    config: SyncConfig,
    /// Connectivity source, online when absent.
    connectivity: Option<Connectivity>,
    /// Key generator for the dry-run transport.
    keys: Option<Arc<dyn KeyGenerator>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SyncedStoreBuilder<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Remote transport. Ignored in dry-run mode.
    pub fn transport(mut self, transport: Arc<dyn RemoteTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Engine configuration. Defaults to [`SyncConfig::default`].
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Connectivity source. Without one the engine considers itself online
    /// and never auto-syncs.
    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Key generator for dry-run creations. Defaults to
    /// [`TimestampKeyGenerator`].
    pub fn key_generator(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Build the engine, spawning the connectivity monitor when auto sync
    /// is enabled.
    ///
    /// # Errors
    /// - `InvalidInput` if the configuration is invalid, its key name does
    ///   not match the store, no transport was given outside dry-run mode,
    ///   or auto sync is requested outside a tokio runtime
    pub fn build(self) -> Result<SyncedStore<T>> {
        self.config.validate()?;
        if self.config.key_name != self.store.key_name() {
            return Err(Error::InvalidInput(format!(
                "config key '{}' does not match store key '{}'",
                self.config.key_name,
                self.store.key_name()
            )));
        }

        let transport: Arc<dyn RemoteTransport> = if self.config.dry_run {
            let keys: Arc<dyn KeyGenerator> = match self.keys {
                Some(keys) => keys,
                None => Arc::new(TimestampKeyGenerator::new()),
            };
            Arc::new(DryRunTransport::new(
                self.store.clone(),
                self.config.paths.clone(),
                keys,
            ))
        } else {
            self.transport.ok_or_else(|| {
                Error::InvalidInput("no remote transport configured".to_string())
            })?
        };

        let tracking = self.config.auto_sync;
        let runtime = if tracking {
            let handle = tokio::runtime::Handle::try_current().map_err(|_| {
                Error::InvalidInput("auto sync requires a tokio runtime".to_string())
            })?;
            Some(handle)
        } else {
            None
        };

        let connectivity = self.connectivity.unwrap_or_default();
        let network = connectivity.subscribe();
        let (status_tx, status_rx) = watch::channel(StatusSnapshot {
            seq: network.borrow().seq,
            status: Some(SyncStatus::Unsynced),
        });

        let engine = SyncedStore {
            store: self.store,
            transport,
            config: Arc::new(self.config),
            network: network.clone(),
            events: Arc::new(SyncEvents::new()),
            generations: Arc::new(Generations::default()),
            last_sync: Arc::new(RwLock::new(SyncTimestamp::default())),
            status: SyncStatusHandle::new(network.clone(), status_rx, tracking),
        };

        if let Some(runtime) = runtime {
            let background = engine.clone();
            runtime.spawn(run_monitor(network, status_tx, move || {
                let engine = background.clone();
                async move {
                    match engine.sync().await {
                        Ok(outcome) => debug!("Auto sync finished: {}", outcome_label(&outcome)),
                        Err(e) => error!("Auto sync failed: {}", e),
                    }
                }
            }));
        }

        Ok(engine)
    }
}

fn outcome_label<T>(outcome: &SyncOutcome<T>) -> &'static str {
    match outcome {
        SyncOutcome::Offline => "offline",
        SyncOutcome::NothingToSync => "nothing to sync",
        SyncOutcome::Failed(_) => "failed",
        SyncOutcome::Synced(_) => "synced",
    }
}

impl<T> SyncedStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Start building an engine over `store`.
    pub fn builder(store: Arc<dyn LocalStore>) -> SyncedStoreBuilder<T> {
        SyncedStoreBuilder {
            store,
            transport: None,
            config: SyncConfig::default(),
            connectivity: None,
            keys: None,
            _marker: PhantomData,
        }
    }

    /// Event channels.
    pub fn events(&self) -> &SyncEvents<T> {
        &self.events
    }

    /// Status of connectivity-triggered syncs.
    pub fn status(&self) -> SyncStatusHandle {
        self.status.clone()
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Underlying local store.
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Name of the transport in use.
    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Whether the network is currently reported online.
    pub fn is_online(&self) -> bool {
        self.network.borrow().state == NetworkState::Online
    }

    /// Server timestamp of the last applied sync, epoch zero before the first.
    pub async fn last_sync(&self) -> SyncTimestamp {
        *self.last_sync.read().await
    }

    /// Records with a mutation the remote has not acknowledged.
    pub async fn pending(&self) -> Result<Vec<Record<T>>> {
        self.store
            .list_by_index(SyncState::Unsynced.into())
            .await?
            .into_iter()
            .map(Record::from_document)
            .collect()
    }

    /// Create a record.
    ///
    /// The record is stored under a temporary key (or a store-assigned one)
    /// tagged `create`/`unsynced`. When online it is posted to the remote and
    /// replaced by the acknowledged record under its server key.
    ///
    /// Returns `None` when the remote answers 404: the placeholder is
    /// removed as a tombstone.
    ///
    /// # Errors
    /// - `InvalidInput` if `data` is not a JSON object
    /// - store errors
    pub async fn create(&self, data: T) -> Result<Option<Record<T>>> {
        let entity = entity_to_document(&data)?;
        let key_name = self.config.key_name.as_str();

        let mut doc = entity.clone();
        if !self.store.auto_increment() {
            set_document_key(&mut doc, key_name, &RecordKey::temporary());
        }
        tag_document(&mut doc, SyncAction::Create, SyncState::Unsynced);

        let key = self.store.add(doc.clone()).await?;
        set_document_key(&mut doc, key_name, &key);
        let local = Record::from_document(doc)?;
        debug!("Created {} locally", key);

        if !self.is_online() {
            self.generations.bump(&key);
            return Ok(Some(local));
        }

        let flight = self.generations.bump_and_begin(&key);
        let request =
            RemoteRequest::new(Method::Post, &self.config.paths.create).with_body(Value::Object(entity));

        match self.call(Operation::Create, Some(&key), request).await {
            Reply::Success(response) => {
                if flight.changed(&key) {
                    debug!("Discarding stale create response for {}", key);
                    return self.load(&key).await;
                }
                let Some((server_key, server_doc, record)) =
                    self.ingest(Operation::Create, Some(&key), &response)
                else {
                    return Ok(Some(local));
                };

                let mut ops = Vec::with_capacity(2);
                if server_key != key {
                    ops.push(BatchOp::Delete(key.clone()));
                }
                ops.push(BatchOp::Put(server_doc));
                self.store.batch(ops).await?;

                info!("Created {} on remote as {}", key, server_key);
                self.events.emit_created(&record);
                Ok(Some(record))
            }
            Reply::NotFound => {
                if flight.changed(&key) {
                    return self.load(&key).await;
                }
                debug!("Create of {} answered 404, removing placeholder", key);
                self.store.delete(&key).await?;
                Ok(None)
            }
            Reply::Failed => Ok(Some(local)),
        }
    }

    /// Read a record.
    ///
    /// The remote is consulted only when online, when `force_sync` is set or
    /// the record is missing locally, and when the record is not a pending
    /// creation. Temporary keys are never looked up remotely. A 404 removes
    /// the local copy.
    pub async fn read(&self, key: &RecordKey, force_sync: bool) -> Result<Option<Record<T>>> {
        let local_doc = self.store.get(key).await?;
        let force_sync = force_sync || local_doc.is_none();
        let pending = key.is_temporary()
            || local_doc
                .as_ref()
                .is_some_and(|doc| document_action(doc) == Some(SyncAction::Create));
        let local = local_doc.map(Record::from_document).transpose()?;

        let result = if self.is_online() && force_sync && !pending {
            self.read_remote(key, local).await?
        } else {
            local
        };

        self.events.emit_read(&result);
        Ok(result)
    }

    async fn read_remote(
        &self,
        key: &RecordKey,
        local: Option<Record<T>>,
    ) -> Result<Option<Record<T>>> {
        let flight = self.generations.begin();
        let request = self.addressed(Method::Get, &self.config.paths.read, key);

        match self.call(Operation::Read, Some(key), request).await {
            Reply::Success(response) => {
                if flight.changed(key) {
                    debug!("Discarding stale read response for {}", key);
                    return self.load(key).await;
                }
                let Some((_, server_doc, record)) =
                    self.ingest(Operation::Read, Some(key), &response)
                else {
                    return Ok(local);
                };
                self.store.put(server_doc).await?;
                Ok(Some(record))
            }
            Reply::NotFound => {
                if flight.changed(key) {
                    return self.load(key).await;
                }
                debug!("{} is gone on remote, removing local copy", key);
                self.store.delete(key).await?;
                Ok(None)
            }
            Reply::Failed => Ok(local),
        }
    }

    /// Update a record.
    ///
    /// Pending creations, and any record under a temporary key, stay
    /// `create`/`unsynced` and are not sent. Other records are tagged
    /// `update`/`unsynced` and, when online, put to the remote.
    ///
    /// Returns `None` when the remote answers 404: the local copy is
    /// removed as a tombstone.
    ///
    /// # Errors
    /// - `MissingKey` if `data` has no primary key, before any I/O
    /// - store errors
    pub async fn update(&self, data: T) -> Result<Option<Record<T>>> {
        let entity = entity_to_document(&data)?;
        let key_name = self.config.key_name.as_str();
        let key = document_key(&entity, key_name)
            .ok_or_else(|| Error::MissingKey(key_name.to_string()))?;

        let pending = key.is_temporary()
            || self
                .store
                .get(&key)
                .await?
                .is_some_and(|doc| document_action(&doc) == Some(SyncAction::Create));

        let mut doc = entity.clone();
        set_document_key(&mut doc, key_name, &key);
        if pending {
            tag_document(&mut doc, SyncAction::Create, SyncState::Unsynced);
            self.store.put(doc.clone()).await?;
            self.generations.bump(&key);
            debug!("Updated pending creation {} locally", key);
            return Record::from_document(doc).map(Some);
        }

        tag_document(&mut doc, SyncAction::Update, SyncState::Unsynced);
        self.store.put(doc.clone()).await?;
        let local = Record::from_document(doc)?;
        debug!("Updated {} locally", key);

        if !self.is_online() {
            self.generations.bump(&key);
            return Ok(Some(local));
        }

        let flight = self.generations.bump_and_begin(&key);
        let request = self
            .addressed(Method::Put, &self.config.paths.update, &key)
            .with_body(Value::Object(entity));

        match self.call(Operation::Update, Some(&key), request).await {
            Reply::Success(response) => {
                if flight.changed(&key) {
                    debug!("Discarding stale update response for {}", key);
                    return self.load(&key).await;
                }
                let Some((_, server_doc, record)) =
                    self.ingest(Operation::Update, Some(&key), &response)
                else {
                    return Ok(Some(local));
                };
                self.store.put(server_doc).await?;
                self.events.emit_updated(&record);
                Ok(Some(record))
            }
            Reply::NotFound => {
                if flight.changed(&key) {
                    return self.load(&key).await;
                }
                debug!("{} is gone on remote, removing local copy", key);
                self.store.delete(&key).await?;
                Ok(None)
            }
            Reply::Failed => Ok(Some(local)),
        }
    }

    /// Delete a record.
    ///
    /// Pending creations and temporary keys are dropped locally. Other
    /// records become `delete`/`unsynced` tombstones until the remote
    /// acknowledges the delete (or reports the record as already gone).
    pub async fn delete(&self, key: &RecordKey) -> Result<()> {
        let existing = self.store.get(key).await?;

        let pending = key.is_temporary()
            || existing
                .as_ref()
                .is_some_and(|doc| document_action(doc) == Some(SyncAction::Create));
        if pending {
            self.store.delete(key).await?;
            self.generations.bump(key);
            debug!("Dropped pending creation {}", key);
            return Ok(());
        }

        let online = self.is_online();
        let flight = match existing {
            Some(mut doc) => {
                tag_document(&mut doc, SyncAction::Delete, SyncState::Unsynced);
                self.store.put(doc).await?;
                debug!("Marked {} as deleted locally", key);
                if !online {
                    self.generations.bump(key);
                    return Ok(());
                }
                self.generations.bump_and_begin(key)
            }
            None if !online => return Ok(()),
            None => self.generations.begin(),
        };

        let request = self.addressed(Method::Delete, &self.config.paths.delete, key);
        match self.call(Operation::Delete, Some(key), request).await {
            Reply::Success(_) | Reply::NotFound => {
                if flight.changed(key) {
                    debug!("Keeping {}, it changed while the delete was in flight", key);
                    return Ok(());
                }
                self.store.delete(key).await?;
                self.events.emit_deleted(key);
                Ok(())
            }
            Reply::Failed => Ok(()),
        }
    }

    /// Read every record.
    ///
    /// When online and the store is empty (or `force_sync` is set) the
    /// collection is fetched and merged: local records missing on the remote
    /// are removed, except pending creations, and remote records are stored
    /// as `none`/`synced`. Returns the remote records followed by the
    /// pending creations.
    pub async fn read_all(&self, force_sync: bool) -> Result<Vec<Record<T>>> {
        let flight = self.generations.begin();
        let local_docs = self.store.list_all().await?;

        let docs = if self.is_online() && (local_docs.is_empty() || force_sync) {
            self.read_all_remote(local_docs, &flight).await?
        } else {
            local_docs
        };

        let records = docs
            .into_iter()
            .map(Record::from_document)
            .collect::<Result<Vec<_>>>()?;
        self.events.emit_read_all(&records);
        Ok(records)
    }

    async fn read_all_remote(
        &self,
        local_docs: Vec<Document>,
        flight: &InFlight,
    ) -> Result<Vec<Document>> {
        let request = RemoteRequest::new(Method::Get, &self.config.paths.read_all);

        let response = match self.call(Operation::ReadAll, None, request).await {
            Reply::Success(response) => response,
            Reply::NotFound => {
                self.fail(
                    Operation::ReadAll,
                    None,
                    &Error::Remote {
                        status: 404,
                        message: "collection not found".to_string(),
                    },
                );
                return Ok(local_docs);
            }
            Reply::Failed => return Ok(local_docs),
        };

        let server_docs = match response
            .json::<Vec<Document>>()
            .and_then(|docs| self.normalize_all(docs))
        {
            Ok(docs) => docs,
            Err(e) => {
                self.fail(Operation::ReadAll, None, &e);
                return Ok(local_docs);
            }
        };

        let key_name = self.config.key_name.as_str();
        let server_keys: HashSet<RecordKey> =
            server_docs.iter().map(|(key, _)| key.clone()).collect();

        let mut ops = Vec::new();
        let mut pending = Vec::new();
        let mut kept_local: HashMap<RecordKey, Document> = HashMap::new();
        for doc in local_docs {
            let Some(key) = document_key(&doc, key_name) else {
                continue;
            };
            if document_action(&doc) == Some(SyncAction::Create) {
                pending.push(doc);
            } else if flight.changed(&key) {
                kept_local.insert(key, doc);
            } else if !server_keys.contains(&key) {
                ops.push(BatchOp::Delete(key));
            }
        }

        let mut merged = Vec::with_capacity(server_docs.len() + pending.len());
        for (key, doc) in server_docs {
            if flight.changed(&key) {
                debug!("Keeping local {}, it changed during read_all", key);
                if let Some(local) = kept_local.remove(&key) {
                    merged.push(local);
                }
                continue;
            }
            ops.push(BatchOp::Put(doc.clone()));
            merged.push(doc);
        }
        merged.extend(kept_local.into_values());

        self.store.batch(ops).await?;
        info!(
            "Fetched {} records, {} pending creations kept",
            merged.len(),
            pending.len()
        );

        merged.extend(pending);
        Ok(merged)
    }

    /// Reconcile every unsynced record with the remote, asking for changes
    /// since the last applied sync.
    pub async fn sync(&self) -> Result<SyncOutcome<T>> {
        let since = self.last_sync().await;
        self.sync_since(since).await
    }

    /// Reconcile every unsynced record with the remote, asking for changes
    /// since `since`.
    ///
    /// # Errors
    /// Only local store errors. Remote failures come back as
    /// [`SyncOutcome::Failed`].
    pub async fn sync_since(&self, since: SyncTimestamp) -> Result<SyncOutcome<T>> {
        if !self.is_online() {
            debug!("Skipping sync while offline");
            return Ok(SyncOutcome::Offline);
        }

        let flight = self.generations.begin();
        let unsynced = self
            .store
            .list_by_index(SyncState::Unsynced.into())
            .await?;
        let body = SyncRequestBody::from_unsynced(unsynced);
        if body.is_empty() {
            debug!("Nothing to sync");
            return Ok(SyncOutcome::NothingToSync);
        }

        let key_name = self.config.key_name.as_str();
        let created_keys: Vec<RecordKey> = body
            .create
            .iter()
            .filter_map(|doc| document_key(doc, key_name))
            .collect();

        info!(
            "Starting sync: {} created, {} updated, {} deleted",
            body.create.len(),
            body.update.len(),
            body.delete.len()
        );

        let request = RemoteRequest::new(Method::Post, &self.config.paths.sync)
            .with_query("t", since.as_millis().to_string())
            .with_body(serde_json::to_value(&body)?);

        let response = match self.transport.send(request).await {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                let failure = self.fail(Operation::Sync, None, &response.into_error());
                return Ok(SyncOutcome::Failed(failure));
            }
            Err(e) => {
                let failure = self.fail(Operation::Sync, None, &e);
                return Ok(SyncOutcome::Failed(failure));
            }
        };

        let decoded = response.json::<SyncResponseBody>().and_then(|answer| {
            let changed = self.normalize_all(answer.changed)?;
            let records = changed
                .iter()
                .map(|(_, doc)| Record::from_document(doc.clone()))
                .collect::<Result<Vec<Record<T>>>>()
                .map_err(|e| Error::Decode(e.to_string()))?;
            Ok((changed, records, answer.deleted, answer.timestamp))
        });
        let (changed, records, deleted, timestamp) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                let failure = self.fail(Operation::Sync, None, &e);
                return Ok(SyncOutcome::Failed(failure));
            }
        };

        // A pending creation edited during the sync keeps its placeholder,
        // still `create`/`unsynced`, and goes out again with the next sync.
        let mut ops = Vec::with_capacity(created_keys.len() + deleted.len() + changed.len());
        for key in created_keys {
            if flight.changed(&key) {
                debug!("Keeping {}, it changed during sync", key);
                continue;
            }
            ops.push(BatchOp::Delete(key));
        }
        ops.extend(deleted.iter().cloned().map(BatchOp::Delete));
        for (key, doc) in changed {
            if flight.changed(&key) {
                debug!("Not applying synced {}, it changed during sync", key);
                continue;
            }
            ops.push(BatchOp::Put(doc));
        }
        self.store.batch(ops).await?;

        *self.last_sync.write().await = timestamp;

        let report = SyncReport {
            changed: records,
            deleted,
            timestamp,
        };
        info!(
            "Sync completed: {} changed, {} deleted, server time {}",
            report.changed.len(),
            report.deleted.len(),
            report.timestamp
        );
        self.events.emit_synced(&report);
        Ok(SyncOutcome::Synced(report))
    }

    /// Request for a single resource, addressed by `?<key_name>=<key>`.
    /// Callers never pass temporary keys.
    fn addressed(&self, method: Method, path: &str, key: &RecordKey) -> RemoteRequest {
        RemoteRequest::new(method, path).with_query(self.config.key_name.as_str(), key.as_str())
    }

    /// Issue a single-record call, reporting transport errors and
    /// unexpected statuses.
    async fn call(
        &self,
        operation: Operation,
        key: Option<&RecordKey>,
        request: RemoteRequest,
    ) -> Reply {
        debug!("{} {}", operation, request);
        match self.transport.send(request).await {
            Ok(response) if response.is_success() => Reply::Success(response),
            Ok(response) if response.is_not_found() => Reply::NotFound,
            Ok(response) => {
                self.fail(operation, key, &response.into_error());
                Reply::Failed
            }
            Err(e) => {
                self.fail(operation, key, &e);
                Reply::Failed
            }
        }
    }

    /// Decode a single-record response into its stored form. Failures are
    /// reported and yield `None`.
    fn ingest(
        &self,
        operation: Operation,
        key: Option<&RecordKey>,
        response: &RemoteResponse,
    ) -> Option<(RecordKey, Document, Record<T>)> {
        let decoded = response
            .json::<Document>()
            .and_then(|doc| self.normalize(doc))
            .and_then(|(server_key, doc)| {
                let record = Record::from_document(doc.clone())
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok((server_key, doc, record))
            });

        match decoded {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                self.fail(operation, key, &e);
                None
            }
        }
    }

    /// Normalize a server record: string key, `none`/`synced` envelope.
    fn normalize(&self, mut doc: Document) -> Result<(RecordKey, Document)> {
        let key_name = self.config.key_name.as_str();
        let key = document_key(&doc, key_name).ok_or_else(|| {
            Error::Decode(format!("server record has no '{}' field", key_name))
        })?;
        set_document_key(&mut doc, key_name, &key);
        tag_document(&mut doc, SyncAction::None, SyncState::Synced);
        Ok((key, doc))
    }

    fn normalize_all(&self, docs: Vec<Document>) -> Result<Vec<(RecordKey, Document)>> {
        docs.into_iter().map(|doc| self.normalize(doc)).collect()
    }

    async fn load(&self, key: &RecordKey) -> Result<Option<Record<T>>> {
        self.store
            .get(key)
            .await?
            .map(Record::from_document)
            .transpose()
    }

    fn fail(&self, operation: Operation, key: Option<&RecordKey>, error: &Error) -> RemoteFailure {
        match key {
            Some(key) => warn!("Remote {} of {} failed: {}", operation, key, error),
            None => warn!("Remote {} failed: {}", operation, error),
        }
        let failure = RemoteFailure {
            operation,
            key: key.cloned(),
            reason: error.to_string(),
        };
        self.events.emit_failed(failure.clone());
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dry_run::SequentialKeyGenerator;
    use serde::Deserialize;
    use serde_json::json;
    use synceddb_remote::MockTransport;
    use synceddb_storage::{MemoryStore, StoreConfig};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Todo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
    }

    fn todo(id: &str, name: &str) -> Todo {
        Todo {
            id: Some(id.to_string()),
            name: name.to_string(),
        }
    }

    fn new_todo(name: &str) -> Todo {
        Todo {
            id: None,
            name: name.to_string(),
        }
    }

    fn key(k: &str) -> RecordKey {
        RecordKey::new(k).unwrap()
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn stored(id: &str, name: &str, action: &str, state: &str) -> Document {
        doc(json!({"id": id, "name": name, "sync_action": action, "sync_state": state}))
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        remote: Arc<MockTransport>,
        connectivity: Connectivity,
        engine: SyncedStore<Todo>,
    }

    fn fixture_with(network: NetworkState, config: SyncConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MockTransport::new());
        let connectivity = Connectivity::new(network);
        let engine = SyncedStore::builder(store.clone())
            .transport(remote.clone())
            .connectivity(connectivity.clone())
            .config(config)
            .build()
            .unwrap();
        Fixture {
            store,
            remote,
            connectivity,
            engine,
        }
    }

    fn fixture(network: NetworkState) -> Fixture {
        fixture_with(network, SyncConfig::default())
    }

    async fn fill_db(store: &MemoryStore) {
        store
            .put_bulk(vec![
                stored("1", "test", "none", "synced"),
                stored("2", "test", "none", "synced"),
                stored("3", "test", "none", "synced"),
                stored("TMP-1", "test", "create", "unsynced"),
            ])
            .await
            .unwrap();
    }

    async fn create_sync_items(store: &MemoryStore) {
        store
            .put_bulk(vec![
                stored("1", "test1", "none", "synced"),
                stored("2", "test2", "update", "unsynced"),
                stored("3", "test3", "delete", "unsynced"),
                stored("TMP-1", "test4", "create", "unsynced"),
            ])
            .await
            .unwrap();
    }

    fn sync_response() -> RemoteResponse {
        RemoteResponse::ok(json!({
            "changed": [{"id": "2", "name": "test2"}, {"id": "4", "name": "test4"}],
            "deleted": ["3"],
            "timestamp": "2023-01-01T00:00:00.000Z"
        }))
    }

    async fn snapshot(store: &MemoryStore) -> Vec<Value> {
        store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(Value::Object)
            .collect()
    }

    async fn wait_for_requests(remote: &MockTransport, count: usize) {
        while remote.request_count() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_build_rejects_key_mismatch() {
        let store = Arc::new(MemoryStore::with_config(StoreConfig::new("uuid")));
        let result = SyncedStore::<Todo>::builder(store)
            .transport(Arc::new(MockTransport::new()))
            .build();
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_build_requires_transport() {
        let result = SyncedStore::<Todo>::builder(Arc::new(MemoryStore::new())).build();
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_create_offline() {
        let f = fixture(NetworkState::Offline);
        let record = f.engine.create(new_todo("offline")).await.unwrap().unwrap();

        let id = record.data.id.clone().unwrap();
        assert!(id.starts_with("TMP-"));
        assert_eq!(record.sync_action, SyncAction::Create);
        assert_eq!(record.sync_state, SyncState::Unsynced);
        assert_eq!(f.remote.request_count(), 0);

        let stored = f.store.get(&key(&id)).await.unwrap().unwrap();
        assert_eq!(stored["name"], json!("offline"));
    }

    #[tokio::test]
    async fn test_create_online_replaces_temporary_key() {
        let f = fixture(NetworkState::Online);
        f.remote.respond(
            Method::Post,
            "/api/create",
            RemoteResponse::new(201).with_body(json!({"id": 10, "name": "a"})),
        );
        let mut created = f.engine.events().subscribe_created();

        let record = f.engine.create(new_todo("a")).await.unwrap().unwrap();
        assert_eq!(record.data, todo("10", "a"));
        assert!(record.is_synced());

        // Entity only: no placeholder key, no envelope.
        let requests = f.remote.requests();
        assert_eq!(requests[0].body, Some(json!({"name": "a"})));
        assert!(requests[0].query.is_empty());

        assert_eq!(
            snapshot(&f.store).await,
            vec![json!({"id": "10", "name": "a", "sync_action": "none", "sync_state": "synced"})]
        );
        assert_eq!(created.recv().await.unwrap().data.id.as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn test_create_remote_failure_keeps_local() {
        let f = fixture(NetworkState::Online);
        f.remote
            .respond(Method::Post, "/api/create", RemoteResponse::new(500));
        let mut failed = f.engine.events().subscribe_failed();

        let record = f.engine.create(new_todo("a")).await.unwrap().unwrap();
        assert!(record.is_pending_creation());
        assert_eq!(f.store.len(), 1);

        let failure = failed.recv().await.unwrap();
        assert_eq!(failure.operation, Operation::Create);
        assert!(failure.key.unwrap().is_temporary());
    }

    #[tokio::test]
    async fn test_create_network_error_keeps_local() {
        let f = fixture(NetworkState::Online);
        f.remote.fail(Method::Post, "/api/create", "connection refused");

        let record = f.engine.create(new_todo("a")).await.unwrap().unwrap();
        assert!(record.is_pending_creation());
        assert_eq!(f.store.len(), 1);
    }

    #[tokio::test]
    async fn test_create_undecodable_response_keeps_local() {
        let f = fixture(NetworkState::Online);
        f.remote.respond(
            Method::Post,
            "/api/create",
            RemoteResponse::ok(json!({"name": "no key"})),
        );

        let record = f.engine.create(new_todo("a")).await.unwrap().unwrap();
        assert!(record.is_pending_creation());
    }

    #[tokio::test]
    async fn test_create_not_found_removes_placeholder() {
        let f = fixture(NetworkState::Online);
        f.remote
            .respond(Method::Post, "/api/create", RemoteResponse::new(404));

        let mut failed = f.engine.events().subscribe_failed();

        let record = f.engine.create(new_todo("a")).await.unwrap();
        assert!(record.is_none());
        assert!(f.store.is_empty());
        assert!(matches!(
            failed.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_create_with_store_assigned_key() {
        let store = Arc::new(MemoryStore::with_config(
            StoreConfig::new("id").with_auto_increment(true),
        ));
        let engine: SyncedStore<Todo> = SyncedStore::builder(store.clone())
            .transport(Arc::new(MockTransport::new()))
            .connectivity(Connectivity::offline())
            .build()
            .unwrap();

        let record = engine.create(new_todo("a")).await.unwrap().unwrap();
        assert_eq!(record.data.id.as_deref(), Some("1"));
        assert!(record.is_pending_creation());
    }

    #[tokio::test]
    async fn test_read_local_without_remote() {
        let f = fixture(NetworkState::Online);
        fill_db(&f.store).await;

        let record = f.engine.read(&key("1"), false).await.unwrap().unwrap();
        assert_eq!(record.data, todo("1", "test"));
        assert_eq!(f.remote.request_count(), 0);
    }

    #[tokio::test]
    async fn test_read_missing_fetches_remote() {
        let f = fixture(NetworkState::Online);
        f.remote.respond(
            Method::Get,
            "/api/read",
            RemoteResponse::ok(json!({"id": "5", "name": "remote"})),
        );

        let record = f.engine.read(&key("5"), false).await.unwrap().unwrap();
        assert_eq!(record.data, todo("5", "remote"));
        assert!(record.is_synced());
        assert_eq!(
            f.remote.requests()[0].query_param("id"),
            Some("5")
        );
        assert!(f.store.get(&key("5")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_read_not_found_removes_local() {
        let f = fixture(NetworkState::Online);
        fill_db(&f.store).await;
        f.remote
            .respond(Method::Get, "/api/read", RemoteResponse::new(404));
        let mut reads = f.engine.events().subscribe_read();

        let record = f.engine.read(&key("3"), true).await.unwrap();
        assert!(record.is_none());
        assert!(f.store.get(&key("3")).await.unwrap().is_none());
        assert_eq!(reads.recv().await.unwrap(), None);

        // A plain read afterwards finds nothing locally and asks again.
        let again = f.engine.read(&key("3"), false).await.unwrap();
        assert!(again.is_none());
        let requests = f.remote.requests_to(Method::Get, "/api/read");
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.query_param("id") == Some("3")));
    }

    #[tokio::test]
    async fn test_temporary_keys_never_reach_remote() {
        let f = fixture(NetworkState::Online);
        f.remote.respond(
            Method::Get,
            "/api/read",
            RemoteResponse::ok(json!({"id": "7", "name": "someone else"})),
        );
        f.remote
            .respond(Method::Delete, "/api/delete", RemoteResponse::new(204));

        assert!(f.engine.read(&key("TMP-gone"), true).await.unwrap().is_none());
        f.engine.delete(&key("TMP-gone")).await.unwrap();

        let record = f
            .engine
            .update(todo("TMP-gone", "revived"))
            .await
            .unwrap()
            .unwrap();
        assert!(record.is_pending_creation());

        assert_eq!(f.remote.request_count(), 0);
        assert_eq!(
            snapshot(&f.store).await,
            vec![json!({"id": "TMP-gone", "name": "revived", "sync_action": "create", "sync_state": "unsynced"})]
        );
    }

    #[tokio::test]
    async fn test_read_pending_creation_stays_local() {
        let f = fixture(NetworkState::Online);
        fill_db(&f.store).await;

        let record = f.engine.read(&key("TMP-1"), true).await.unwrap().unwrap();
        assert!(record.is_pending_creation());
        assert_eq!(f.remote.request_count(), 0);
    }

    #[tokio::test]
    async fn test_read_failure_returns_local() {
        let f = fixture(NetworkState::Online);
        fill_db(&f.store).await;
        f.remote
            .respond(Method::Get, "/api/read", RemoteResponse::new(503));

        let record = f.engine.read(&key("2"), true).await.unwrap().unwrap();
        assert_eq!(record.data, todo("2", "test"));
    }

    #[tokio::test]
    async fn test_read_offline_missing_is_none() {
        let f = fixture(NetworkState::Offline);
        let record = f.engine.read(&key("1"), true).await.unwrap();
        assert!(record.is_none());
        assert_eq!(f.remote.request_count(), 0);
    }

    #[tokio::test]
    async fn test_update_requires_key() {
        let f = fixture(NetworkState::Online);
        let result = f.engine.update(new_todo("a")).await;
        assert!(matches!(result, Err(Error::MissingKey(_))));
        assert_eq!(f.remote.request_count(), 0);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_update_offline_marks_update() {
        let f = fixture(NetworkState::Offline);
        fill_db(&f.store).await;

        let record = f.engine.update(todo("2", "changed")).await.unwrap().unwrap();
        assert_eq!(record.sync_action, SyncAction::Update);
        assert_eq!(record.sync_state, SyncState::Unsynced);
        assert_eq!(
            Value::Object(f.store.get(&key("2")).await.unwrap().unwrap()),
            json!({"id": "2", "name": "changed", "sync_action": "update", "sync_state": "unsynced"})
        );
    }

    #[tokio::test]
    async fn test_update_online_acknowledged() {
        let f = fixture(NetworkState::Online);
        fill_db(&f.store).await;
        f.remote.respond(
            Method::Put,
            "/api/update",
            RemoteResponse::ok(json!({"id": "2", "name": "changed"})),
        );
        let mut updated = f.engine.events().subscribe_updated();

        let record = f.engine.update(todo("2", "changed")).await.unwrap().unwrap();
        assert!(record.is_synced());

        let request = &f.remote.requests()[0];
        assert_eq!(request.query_param("id"), Some("2"));
        assert_eq!(request.body, Some(json!({"id": "2", "name": "changed"})));
        assert_eq!(updated.recv().await.unwrap().data.name, "changed");
    }

    #[tokio::test]
    async fn test_update_pending_creation_stays_create() {
        let f = fixture(NetworkState::Online);
        fill_db(&f.store).await;

        let record = f.engine.update(todo("TMP-1", "renamed")).await.unwrap().unwrap();
        assert!(record.is_pending_creation());
        assert_eq!(f.remote.request_count(), 0);

        let stored = f.store.get(&key("TMP-1")).await.unwrap().unwrap();
        assert_eq!(stored["name"], json!("renamed"));
        assert_eq!(stored["sync_action"], json!("create"));
    }

    #[tokio::test]
    async fn test_update_not_found_removes_local() {
        let f = fixture(NetworkState::Online);
        fill_db(&f.store).await;
        f.remote
            .respond(Method::Put, "/api/update", RemoteResponse::new(404));

        let record = f.engine.update(todo("2", "changed")).await.unwrap();
        assert!(record.is_none());
        assert!(f.store.get(&key("2")).await.unwrap().is_none());
        assert_eq!(f.engine.read(&key("2"), false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_failure_keeps_pending() {
        let f = fixture(NetworkState::Online);
        fill_db(&f.store).await;
        f.remote
            .respond(Method::Put, "/api/update", RemoteResponse::new(500));

        let record = f.engine.update(todo("2", "changed")).await.unwrap().unwrap();
        assert_eq!(record.sync_action, SyncAction::Update);
        assert_eq!(f.engine.pending().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_offline_keeps_tombstone() {
        let f = fixture(NetworkState::Offline);
        fill_db(&f.store).await;

        f.engine.delete(&key("1")).await.unwrap();

        let record = f.engine.read(&key("1"), false).await.unwrap().unwrap();
        assert_eq!(record.sync_action, SyncAction::Delete);
        assert_eq!(record.sync_state, SyncState::Unsynced);
    }

    #[tokio::test]
    async fn test_delete_pending_creation_is_local_only() {
        let f = fixture(NetworkState::Online);
        fill_db(&f.store).await;

        f.engine.delete(&key("TMP-1")).await.unwrap();
        assert!(f.store.get(&key("TMP-1")).await.unwrap().is_none());
        assert_eq!(f.remote.request_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_online_acknowledged() {
        let f = fixture(NetworkState::Online);
        fill_db(&f.store).await;
        f.remote
            .respond(Method::Delete, "/api/delete", RemoteResponse::new(204));
        let mut deleted = f.engine.events().subscribe_deleted();

        f.engine.delete(&key("1")).await.unwrap();
        assert!(f.store.get(&key("1")).await.unwrap().is_none());
        assert_eq!(f.remote.requests()[0].query_param("id"), Some("1"));
        assert_eq!(deleted.recv().await.unwrap(), key("1"));
    }

    #[tokio::test]
    async fn test_delete_already_gone() {
        let f = fixture(NetworkState::Online);
        fill_db(&f.store).await;
        f.remote
            .respond(Method::Delete, "/api/delete", RemoteResponse::new(404));

        f.engine.delete(&key("1")).await.unwrap();
        assert!(f.store.get(&key("1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_tombstone() {
        let f = fixture(NetworkState::Online);
        fill_db(&f.store).await;
        f.remote
            .respond(Method::Delete, "/api/delete", RemoteResponse::new(500));

        f.engine.delete(&key("1")).await.unwrap();
        let stored = f.store.get(&key("1")).await.unwrap().unwrap();
        assert_eq!(stored["sync_action"], json!("delete"));
        assert_eq!(stored["sync_state"], json!("unsynced"));
    }

    #[tokio::test]
    async fn test_delete_unknown_key() {
        let offline = fixture(NetworkState::Offline);
        offline.engine.delete(&key("9")).await.unwrap();
        assert_eq!(offline.remote.request_count(), 0);
        assert!(offline.store.is_empty());

        let online = fixture(NetworkState::Online);
        online
            .remote
            .respond(Method::Delete, "/api/delete", RemoteResponse::new(204));
        online.engine.delete(&key("9")).await.unwrap();
        assert_eq!(online.remote.request_count(), 1);
        assert!(online.store.is_empty());
    }

    #[tokio::test]
    async fn test_read_all_merges_server_state() {
        let f = fixture(NetworkState::Online);
        fill_db(&f.store).await;
        f.remote.respond(
            Method::Get,
            "/api/read_all",
            RemoteResponse::ok(json!([{"id": "1", "name": "test"}, {"id": "2", "name": "test2"}])),
        );

        let records = f.engine.read_all(true).await.unwrap();
        let data: Vec<Todo> = records.iter().map(|r| r.data.clone()).collect();
        assert_eq!(
            data,
            vec![todo("1", "test"), todo("2", "test2"), todo("TMP-1", "test")]
        );
        assert!(records[0].is_synced());
        assert!(records[2].is_pending_creation());

        assert_eq!(
            snapshot(&f.store).await,
            vec![
                json!({"id": "1", "name": "test", "sync_action": "none", "sync_state": "synced"}),
                json!({"id": "2", "name": "test2", "sync_action": "none", "sync_state": "synced"}),
                json!({"id": "TMP-1", "name": "test", "sync_action": "create", "sync_state": "unsynced"}),
            ]
        );
    }

    #[tokio::test]
    async fn test_read_all_fetches_only_when_empty_or_forced() {
        let f = fixture(NetworkState::Online);
        f.remote.respond(
            Method::Get,
            "/api/read_all",
            RemoteResponse::ok(json!([{"id": "1", "name": "remote"}])),
        );

        let first = f.engine.read_all(false).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(f.remote.request_count(), 1);

        let second = f.engine.read_all(false).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(f.remote.request_count(), 1);
    }

    #[tokio::test]
    async fn test_read_all_failure_returns_local() {
        let f = fixture(NetworkState::Online);
        fill_db(&f.store).await;
        f.remote
            .respond(Method::Get, "/api/read_all", RemoteResponse::new(500));
        let mut all = f.engine.events().subscribe_read_all();

        let records = f.engine.read_all(true).await.unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(f.store.len(), 4);
        assert_eq!(all.recv().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_sync_batches_unsynced_records() {
        let f = fixture(NetworkState::Online);
        create_sync_items(&f.store).await;
        f.remote.respond(Method::Post, "/api/sync", sync_response());
        let mut synced = f.engine.events().subscribe_synced();

        let outcome = f.engine.sync().await.unwrap();
        let SyncOutcome::Synced(report) = outcome else {
            panic!("expected a synced outcome, got {:?}", outcome);
        };
        assert_eq!(report.deleted, vec![key("3")]);
        assert_eq!(report.changed.len(), 2);

        let request = &f.remote.requests_to(Method::Post, "/api/sync")[0];
        assert_eq!(request.query_param("t"), Some("0"));
        assert_eq!(
            request.body,
            Some(json!({
                "create": [{"id": "TMP-1", "name": "test4", "sync_action": "create", "sync_state": "unsynced"}],
                "update": [{"id": "2", "name": "test2", "sync_action": "update", "sync_state": "unsynced"}],
                "delete": [{"id": "3", "name": "test3", "sync_action": "delete", "sync_state": "unsynced"}],
            }))
        );

        assert_eq!(
            snapshot(&f.store).await,
            vec![
                json!({"id": "1", "name": "test1", "sync_action": "none", "sync_state": "synced"}),
                json!({"id": "2", "name": "test2", "sync_action": "none", "sync_state": "synced"}),
                json!({"id": "4", "name": "test4", "sync_action": "none", "sync_state": "synced"}),
            ]
        );
        assert_eq!(
            f.engine.last_sync().await.as_millis(),
            1_672_531_200_000
        );
        assert_eq!(synced.recv().await.unwrap().timestamp, report.timestamp);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let f = fixture(NetworkState::Online);
        create_sync_items(&f.store).await;
        f.remote.respond(Method::Post, "/api/sync", sync_response());

        f.engine.sync().await.unwrap();
        let after_first = snapshot(&f.store).await;

        let outcome = f.engine.sync().await.unwrap();
        assert_eq!(outcome, SyncOutcome::NothingToSync);
        assert_eq!(f.remote.request_count(), 1);
        assert_eq!(snapshot(&f.store).await, after_first);
    }

    #[tokio::test]
    async fn test_sync_uses_last_sync_timestamp() {
        let f = fixture(NetworkState::Online);
        create_sync_items(&f.store).await;
        f.remote.respond(Method::Post, "/api/sync", sync_response());

        f.engine.sync().await.unwrap();
        f.store
            .put(stored("1", "again", "update", "unsynced"))
            .await
            .unwrap();
        f.engine.sync().await.unwrap();

        let requests = f.remote.requests_to(Method::Post, "/api/sync");
        assert_eq!(requests[1].query_param("t"), Some("1672531200000"));

        f.engine
            .sync_since(SyncTimestamp::from_millis(42))
            .await
            .unwrap();
        let requests = f.remote.requests_to(Method::Post, "/api/sync");
        assert_eq!(requests[2].query_param("t"), Some("42"));
    }

    #[tokio::test]
    async fn test_sync_offline_leaves_store() {
        let f = fixture(NetworkState::Offline);
        create_sync_items(&f.store).await;
        let before = snapshot(&f.store).await;

        let outcome = f.engine.sync().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Offline);
        assert_eq!(f.remote.request_count(), 0);
        assert_eq!(snapshot(&f.store).await, before);
    }

    #[tokio::test]
    async fn test_sync_failure_leaves_store() {
        let f = fixture(NetworkState::Online);
        create_sync_items(&f.store).await;
        f.remote
            .respond(Method::Post, "/api/sync", RemoteResponse::new(500));
        let before = snapshot(&f.store).await;

        let outcome = f.engine.sync().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Failed(ref failure) if failure.operation == Operation::Sync));
        assert_eq!(snapshot(&f.store).await, before);
        assert_eq!(f.engine.last_sync().await.as_millis(), 0);
    }

    #[tokio::test]
    async fn test_sync_rejects_malformed_response() {
        let f = fixture(NetworkState::Online);
        create_sync_items(&f.store).await;
        f.remote.respond(
            Method::Post,
            "/api/sync",
            RemoteResponse::ok(json!({"changed": [], "deleted": []})),
        );
        let before = snapshot(&f.store).await;

        let outcome = f.engine.sync().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Failed(_)));
        assert_eq!(snapshot(&f.store).await, before);
    }

    #[tokio::test]
    async fn test_auto_sync_on_reconnect() {
        let f = fixture_with(
            NetworkState::Offline,
            SyncConfig::default().with_auto_sync(true),
        );
        create_sync_items(&f.store).await;
        f.remote.respond(Method::Post, "/api/sync", sync_response());
        let status = f.engine.status();
        assert_eq!(status.current(), SyncStatus::Unsynced);

        f.connectivity.set_online();
        assert_eq!(status.settled().await, SyncStatus::Synced);

        let keys: Vec<Value> = snapshot(&f.store)
            .await
            .into_iter()
            .map(|d| d["id"].clone())
            .collect();
        assert_eq!(keys, vec![json!("1"), json!("2"), json!("4")]);

        f.connectivity.set_offline();
        assert_eq!(status.settled().await, SyncStatus::Unsynced);
    }

    #[tokio::test]
    async fn test_auto_sync_settles_after_failure() {
        let f = fixture_with(
            NetworkState::Offline,
            SyncConfig::default().with_auto_sync(true),
        );
        create_sync_items(&f.store).await;
        f.remote
            .respond(Method::Post, "/api/sync", RemoteResponse::new(502));

        f.connectivity.set_online();
        assert_eq!(f.engine.status().settled().await, SyncStatus::Synced);
        assert_eq!(f.engine.pending().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stale_update_response_is_discarded() {
        let f = fixture(NetworkState::Online);
        fill_db(&f.store).await;
        f.remote.respond(
            Method::Put,
            "/api/update",
            RemoteResponse::ok(json!({"id": "2", "name": "first"})),
        );
        let gate = f.remote.hold_next();

        let in_flight = {
            let engine = f.engine.clone();
            tokio::spawn(async move { engine.update(todo("2", "first")).await })
        };
        wait_for_requests(&f.remote, 1).await;

        f.connectivity.set_offline();
        f.engine.update(todo("2", "second")).await.unwrap();
        gate.notify_one();

        let record = in_flight.await.unwrap().unwrap().unwrap();
        assert_eq!(record.data.name, "second");
        assert_eq!(record.sync_action, SyncAction::Update);

        let stored = f.store.get(&key("2")).await.unwrap().unwrap();
        assert_eq!(stored["name"], json!("second"));
        assert_eq!(stored["sync_state"], json!("unsynced"));
    }

    #[tokio::test]
    async fn test_sync_skips_records_mutated_in_flight() {
        let f = fixture(NetworkState::Online);
        create_sync_items(&f.store).await;
        f.remote.respond(Method::Post, "/api/sync", sync_response());
        let gate = f.remote.hold_next();

        let in_flight = {
            let engine = f.engine.clone();
            tokio::spawn(async move { engine.sync().await })
        };
        wait_for_requests(&f.remote, 1).await;

        f.connectivity.set_offline();
        f.engine.update(todo("2", "newer")).await.unwrap();
        gate.notify_one();

        let outcome = in_flight.await.unwrap().unwrap();
        assert!(matches!(outcome, SyncOutcome::Synced(_)));

        let record_2 = f.store.get(&key("2")).await.unwrap().unwrap();
        assert_eq!(record_2["name"], json!("newer"));
        assert_eq!(record_2["sync_action"], json!("update"));
        // Server deletions still apply.
        assert!(f.store.get(&key("3")).await.unwrap().is_none());
        assert!(f.store.get(&key("4")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sync_keeps_creation_edited_in_flight() {
        let f = fixture(NetworkState::Online);
        create_sync_items(&f.store).await;
        f.remote.respond(Method::Post, "/api/sync", sync_response());
        let gate = f.remote.hold_next();

        let in_flight = {
            let engine = f.engine.clone();
            tokio::spawn(async move { engine.sync().await })
        };
        wait_for_requests(&f.remote, 1).await;

        f.engine.update(todo("TMP-1", "edited")).await.unwrap();
        gate.notify_one();

        let outcome = in_flight.await.unwrap().unwrap();
        assert!(matches!(outcome, SyncOutcome::Synced(_)));

        // The edit survives as a pending creation for the next sync.
        let survivor = f.store.get(&key("TMP-1")).await.unwrap().unwrap();
        assert_eq!(survivor["name"], json!("edited"));
        assert_eq!(survivor["sync_action"], json!("create"));
        assert_eq!(survivor["sync_state"], json!("unsynced"));
        assert!(f.store.get(&key("4")).await.unwrap().is_some());
        assert_eq!(f.engine.generations.tracked(), 0);
    }

    #[test]
    fn test_generations_drain_when_quiet() {
        let generations = Arc::new(Generations::default());
        generations.bump(&key("1"));
        assert_eq!(generations.tracked(), 0);

        let first = generations.begin();
        generations.bump(&key("1"));
        assert!(first.changed(&key("1")));
        assert!(!first.changed(&key("2")));

        let second = generations.bump_and_begin(&key("2"));
        generations.bump(&key("2"));
        assert_eq!(generations.tracked(), 2);
        assert!(second.changed(&key("2")));

        drop(first);
        assert_eq!(generations.tracked(), 1);
        assert!(!second.changed(&key("1")));

        drop(second);
        assert_eq!(generations.tracked(), 0);
    }

    #[tokio::test]
    async fn test_generations_drain_after_operations() {
        let f = fixture(NetworkState::Online);
        fill_db(&f.store).await;
        f.remote.respond(
            Method::Put,
            "/api/update",
            RemoteResponse::ok(json!({"id": "2", "name": "b"})),
        );
        f.remote
            .respond(Method::Delete, "/api/delete", RemoteResponse::new(404));

        f.engine.update(todo("2", "b")).await.unwrap();
        f.engine.delete(&key("1")).await.unwrap();
        f.engine.delete(&key("TMP-1")).await.unwrap();
        f.connectivity.set_offline();
        f.engine.update(todo("3", "c")).await.unwrap();

        assert_eq!(f.engine.generations.tracked(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let engine: SyncedStore<Todo> = SyncedStore::builder(store.clone())
            .config(SyncConfig::default().with_dry_run(true))
            .key_generator(Arc::new(SequentialKeyGenerator::starting_at(100)))
            .build()
            .unwrap();
        assert_eq!(engine.transport_name(), "dry-run");

        let created = engine.create(new_todo("a")).await.unwrap().unwrap();
        assert_eq!(created.data, todo("100", "a"));
        assert!(created.is_synced());

        store
            .put(stored("TMP-x", "b", "create", "unsynced"))
            .await
            .unwrap();
        let outcome = engine.sync().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Synced(_)));

        let keys: Vec<Value> = snapshot(&store)
            .await
            .into_iter()
            .map(|d| d["id"].clone())
            .collect();
        assert_eq!(keys, vec![json!("100"), json!("101")]);
    }
}
