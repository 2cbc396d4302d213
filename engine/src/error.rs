//! Error types for the Saltpeter engine.

use crate::CollectionName;
use thiserror::Error;

/// All possible errors from the Saltpeter engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid document id: {0}")]
    InvalidId(String),

    #[error("incomparable id in collection '{collection}': expected {expected} id, got {actual} id")]
    IncomparableIds {
        collection: CollectionName,
        expected: String,
        actual: String,
    },

    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("{0} is closed")]
    Closed(String),

    // Constraint errors
    #[error("unique constraint violated: {0}")]
    UniqueConstraint(String),

    // Index errors
    #[error("indexing failed: {0}")]
    Indexing(String),

    // Storage errors
    #[error("storage I/O error: {0}")]
    StorageIo(String),

    // Replication errors
    #[error("replication failed: {message}")]
    Replication { message: String, fatal: bool },
}

impl Error {
    /// Build a replication error that allows retrying the same delta range.
    pub fn replication(message: impl Into<String>) -> Self {
        Error::Replication {
            message: message.into(),
            fatal: false,
        }
    }

    /// Build a replication error that terminates the replication session.
    pub fn fatal_replication(message: impl Into<String>) -> Self {
        Error::Replication {
            message: message.into(),
            fatal: true,
        }
    }

    /// Whether the error should end a replication session.
    ///
    /// Storage failures are fatal too: the store is unusable until reopened.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Replication { fatal, .. } => *fatal,
            Error::StorageIo(_) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageIo(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::StorageIo(format!("serialization: {err}"))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
