//! Common utilities and types shared across SyncedDB crates.
//!
//! This module provides the record key, the sync envelope and the error
//! type used by the store adapters, the transport adapters and the engine.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    document_action, document_key, document_state, set_document_key, strip_envelope,
    tag_document, Document, RecordKey, SyncAction, SyncState, SYNC_ACTION_FIELD,
    SYNC_STATE_FIELD, TEMPORARY_KEY_PREFIX,
};
