//! Error types for lectern-core

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias using lectern-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in lectern-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Document not found
    #[error("Document not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Collection is not present in the schema registry
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// Collection is mirrored read-only and rejects local writes
    #[error("Collection is read-only: {0}")]
    ReadOnlyCollection(String),

    /// Remote store failure that escaped a sync cycle
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A sync round did not finish in time
    #[error("Sync timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A collection stopped replicating and needs caller action
    #[error("Replication of {collection} stopped: {reason}")]
    ReplicationStopped { collection: String, reason: String },

    /// The replicator was shut down while work was in flight
    #[error("Replication was cancelled")]
    Cancelled,
}
