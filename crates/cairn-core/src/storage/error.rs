//! Storage error types

use thiserror::Error;

/// Storage error type
#[derive(Debug, Error)]
pub enum StorageError {
    /// Handle requested for a name that was never registered
    #[error("database not registered: {0}")]
    NotRegistered(String),

    /// Write enqueued for a name that has no batch queue
    #[error("database not registered for batching: {0}")]
    NotRegisteredForBatching(String),

    /// A statement in a batch failed; the whole batch was rolled back
    #[error("transaction failed on {name} at operation {index}: {source}")]
    TransactionFailed {
        name: String,
        index: usize,
        #[source]
        source: rusqlite::Error,
    },

    /// Snapshot could not be written; the previous file on disk is intact
    #[error("failed to persist {name}: {source}")]
    PersistenceFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// Snapshot file exists but could not be loaded
    #[error("snapshot for {name} is unreadable: {source}")]
    LoadCorrupted {
        name: String,
        #[source]
        source: rusqlite::Error,
    },

    /// SQLite error outside a batch
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Structural errors are caller mistakes and are always surfaced;
    /// everything else is a runtime failure of the store itself
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            StorageError::NotRegistered(_) | StorageError::NotRegisteredForBatching(_)
        )
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
