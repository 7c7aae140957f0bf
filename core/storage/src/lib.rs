//! Local store abstraction for SyncedDB.
//!
//! This module provides a trait-based interface over keyed document stores
//! and two implementations: an in-memory store for tests and an SQLite
//! store for durable use.
//!
//! # Design Principles
//! - Store isolation: no sync logic in the stores, only keyed persistence
//! - Async operations: all I/O operations are async
//! - Atomic batches: multi-key updates are applied all-or-nothing
//! - Indexed envelope: `sync_state` and `sync_action` are always queryable

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{BatchOp, IndexValue, LocalStore, StoreConfig, StoreIndex};
