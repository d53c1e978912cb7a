//! Storage error types for litstore-sqlite.
//!
//! [`StorageError`] covers every failure mode of the backend: engine errors,
//! schema migration, (de)serialization of stored payloads, contract
//! violations by the caller, and an exhausted bounded retry policy.

use litstore_core::{CoreError, Hash};
use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The SQLite engine reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Applying the schema migrations failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation literal was stored without its causal-history header.
    #[error("missing causal history received while trying to store op {op_hash}")]
    MissingOpHeader { op_hash: Hash },

    /// A literal lacked a field required for indexing or frontier tracking.
    #[error("malformed literal {hash}: {reason}")]
    MalformedLiteral { hash: Hash, reason: String },

    /// A search cursor could not be parsed as a sequence number.
    #[error("invalid search cursor: {0:?}")]
    InvalidCursor(String),

    /// The backend was closed before the store was attempted.
    #[error("backend {database} is closed")]
    Closed { database: String },

    /// A bounded retry policy gave up on a busy/locked database.
    #[error("{operation} still contended after {attempts} attempts on {database}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        database: String,
    },
}

impl StorageError {
    /// True for transient contention (`SQLITE_BUSY` / `SQLITE_LOCKED`).
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Sqlite(err) => matches!(
                err.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }
}

impl From<CoreError> for StorageError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::MissingOpHeader { op_hash } => StorageError::MissingOpHeader { op_hash },
            CoreError::MalformedLiteral { hash, reason } => {
                StorageError::MalformedLiteral { hash, reason }
            }
        }
    }
}

impl From<rusqlite_migration::Error> for StorageError {
    fn from(err: rusqlite_migration::Error) -> Self {
        match err {
            // Keep the engine error so busy/locked during schema setup is retried.
            rusqlite_migration::Error::RusqliteError { err, .. } => StorageError::Sqlite(err),
            other => StorageError::Migration(other.to_string()),
        }
    }
}
