//! Error types for z-credits storage.

use z_credits_core::LedgerError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Record identifier.
        id: String,
    },

    /// A record with this key already exists in an append-only table.
    #[error("{entity} already exists: {id}")]
    Duplicate {
        /// Kind of record.
        entity: &'static str,
        /// Record identifier.
        id: String,
    },

    /// Lock wait timed out or the transaction lost a write conflict.
    ///
    /// The whole unit of work can be retried.
    #[error("transaction conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    /// Whether retrying the unit of work may succeed.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        match err.kind() {
            rocksdb::ErrorKind::Busy
            | rocksdb::ErrorKind::TimedOut
            | rocksdb::ErrorKind::TryAgain => Self::Conflict(err.to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::Duplicate { entity, id } => {
                Self::Conflict(format!("{entity} already exists: {id}"))
            }
            // Callers retry conflicts first; one reaching here was not retried.
            StoreError::Conflict(_) => Self::Concurrency { attempts: 1 },
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Storage(msg),
        }
    }
}
