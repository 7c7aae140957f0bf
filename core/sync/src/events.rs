//! Typed engine notifications.
//!
//! Each event kind has its own broadcast channel. Subscribers only see
//! events emitted after they subscribed, and a slow subscriber loses the
//! oldest events once its buffer is full. Emitting without subscribers is
//! not an error.

use std::fmt;
use tokio::sync::broadcast;

use synceddb_common::RecordKey;

use crate::record::{Record, SyncTimestamp};

const CHANNEL_CAPACITY: usize = 64;

/// Engine operation that talked to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    ReadAll,
    Sync,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::ReadAll => "read_all",
            Operation::Sync => "sync",
        };
        f.write_str(name)
    }
}

/// A remote call that failed and was swallowed.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFailure {
    pub operation: Operation,
    pub key: Option<RecordKey>,
    pub reason: String,
}

/// Server answer to a batched sync, after it was applied locally.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport<T> {
    pub changed: Vec<Record<T>>,
    pub deleted: Vec<RecordKey>,
    pub timestamp: SyncTimestamp,
}

/// Broadcast channels for every engine event.
pub struct SyncEvents<T> {
    created: broadcast::Sender<Record<T>>,
    read: broadcast::Sender<Option<Record<T>>>,
    read_all: broadcast::Sender<Vec<Record<T>>>,
    updated: broadcast::Sender<Record<T>>,
    deleted: broadcast::Sender<RecordKey>,
    synced: broadcast::Sender<SyncReport<T>>,
    failed: broadcast::Sender<RemoteFailure>,
}

impl<T: Clone> SyncEvents<T> {
    pub fn new() -> Self {
        Self {
            created: broadcast::channel(CHANNEL_CAPACITY).0,
            read: broadcast::channel(CHANNEL_CAPACITY).0,
            read_all: broadcast::channel(CHANNEL_CAPACITY).0,
            updated: broadcast::channel(CHANNEL_CAPACITY).0,
            deleted: broadcast::channel(CHANNEL_CAPACITY).0,
            synced: broadcast::channel(CHANNEL_CAPACITY).0,
            failed: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Records acknowledged by a remote create.
    pub fn subscribe_created(&self) -> broadcast::Receiver<Record<T>> {
        self.created.subscribe()
    }

    /// Results of `read`, including misses.
    pub fn subscribe_read(&self) -> broadcast::Receiver<Option<Record<T>>> {
        self.read.subscribe()
    }

    /// Results of `read_all`.
    pub fn subscribe_read_all(&self) -> broadcast::Receiver<Vec<Record<T>>> {
        self.read_all.subscribe()
    }

    /// Records acknowledged by a remote update.
    pub fn subscribe_updated(&self) -> broadcast::Receiver<Record<T>> {
        self.updated.subscribe()
    }

    /// Keys whose remote delete was acknowledged.
    pub fn subscribe_deleted(&self) -> broadcast::Receiver<RecordKey> {
        self.deleted.subscribe()
    }

    /// Applied sync responses.
    pub fn subscribe_synced(&self) -> broadcast::Receiver<SyncReport<T>> {
        self.synced.subscribe()
    }

    /// Remote failures the engine swallowed.
    pub fn subscribe_failed(&self) -> broadcast::Receiver<RemoteFailure> {
        self.failed.subscribe()
    }

    pub(crate) fn emit_created(&self, record: &Record<T>) {
        let _ = self.created.send(record.clone());
    }

    pub(crate) fn emit_read(&self, record: &Option<Record<T>>) {
        let _ = self.read.send(record.clone());
    }

    pub(crate) fn emit_read_all(&self, records: &[Record<T>]) {
        let _ = self.read_all.send(records.to_vec());
    }

    pub(crate) fn emit_updated(&self, record: &Record<T>) {
        let _ = self.updated.send(record.clone());
    }

    pub(crate) fn emit_deleted(&self, key: &RecordKey) {
        let _ = self.deleted.send(key.clone());
    }

    pub(crate) fn emit_synced(&self, report: &SyncReport<T>) {
        let _ = self.synced.send(report.clone());
    }

    pub(crate) fn emit_failed(&self, failure: RemoteFailure) {
        let _ = self.failed.send(failure);
    }
}

impl<T: Clone> Default for SyncEvents<T> {
    fn default() -> Self {
        Self::new()
    }
}
