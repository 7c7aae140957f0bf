//! SyncedDB Sync Engine
//!
//! This module provides offline-first synchronization of a local keyed
//! store with a remote authoritative store, including:
//! - Optimistic local writes tagged with a sync envelope
//! - Temporary keys replaced by server keys on acknowledgment
//! - Batched reconciliation of every unsynced record
//! - Connectivity-triggered background sync
//! - Dry-run mode with fabricated remote responses

pub mod config;
pub mod dry_run;
pub mod engine;
pub mod events;
pub mod monitor;
pub mod record;

// Re-export main types
pub use config::{SyncConfig, SyncPaths};
pub use dry_run::{DryRunTransport, KeyGenerator, SequentialKeyGenerator, TimestampKeyGenerator};
pub use engine::{SyncOutcome, SyncedStore, SyncedStoreBuilder};
pub use events::{Operation, RemoteFailure, SyncEvents, SyncReport};
pub use monitor::{Connectivity, NetworkState, SyncStatus, SyncStatusHandle};
pub use record::{entity_to_document, Record, SyncRequestBody, SyncResponseBody, SyncTimestamp};
