//! Common error types for SyncedDB.

use thiserror::Error;

/// Top-level error type for SyncedDB operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization of a local value failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A record was passed without a usable primary key.
    #[error("Missing key: record has no value for '{0}'")]
    MissingKey(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The remote could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote answered with a status the engine does not accept.
    #[error("Remote error: {status} - {message}")]
    Remote {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// A remote payload did not match the expected schema.
    #[error("Decode error: {0}")]
    Decode(String),
}

impl Error {
    /// Whether the failure belongs to the network leg of an operation.
    ///
    /// Transient failures are swallowed by the engine: the record stays
    /// unsynced and the caller retries with a later `sync()`.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Remote { .. } | Error::Decode(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
