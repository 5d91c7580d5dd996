//! # Database Error Types
//!
//! Error types for LocalStore operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)     CoreError (schema, key paths)          │
//! │       │                              │                                  │
//! │       └──────────────┬───────────────┘                                  │
//! │                      ▼                                                  │
//! │  DbError (this module) ← Adds context and categorization               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Immediate caller (UI code, SyncOutbox, SyncCoordinator)               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A cache miss is not an error: cache reads return `Ok(None)`.

use fieldsync_core::CoreError;
use thiserror::Error;

/// LocalStore operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// The engine cannot be reached.
    ///
    /// ## When This Occurs
    /// - Database file can't be created or opened
    /// - Pool closed after `close()`
    /// - Operation issued against an engine that was never opened
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A single-store transaction failed and was rolled back.
    #[error("Transaction failed: {0}")]
    TransactionError(String),

    /// The store is not part of the schema.
    #[error("Unknown store: {0}")]
    UnknownStore(String),

    /// The index is not declared on the store.
    #[error("Unknown index '{index}' on store '{store}'")]
    UnknownIndex { store: String, index: String },

    /// A value written to a store has no usable primary key.
    #[error("Value written to '{store}' has no key at path '{path}'")]
    MissingKey { store: String, path: String },

    /// Schema validation or upgrade failure.
    #[error("Schema error: {0}")]
    Schema(#[from] CoreError),

    /// Value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    /// Creates an UnknownIndex error.
    pub fn unknown_index(store: impl Into<String>, index: impl Into<String>) -> Self {
        DbError::UnknownIndex {
            store: store.into(),
            index: index.into(),
        }
    }

    /// True for failures of a single write/read that left the store intact.
    pub fn is_transaction_error(&self) -> bool {
        matches!(
            self,
            DbError::TransactionError(_) | DbError::MissingKey { .. } | DbError::Serialization(_)
        )
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::PoolTimedOut   → DbError::StorageUnavailable
/// sqlx::Error::PoolClosed     → DbError::StorageUnavailable
/// sqlx::Error::Io             → DbError::StorageUnavailable
/// sqlx::Error::Configuration  → DbError::StorageUnavailable
/// Other                       → DbError::TransactionError
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => {
                DbError::StorageUnavailable("connection pool timed out".to_string())
            }
            sqlx::Error::PoolClosed => DbError::StorageUnavailable("pool is closed".to_string()),
            sqlx::Error::Io(e) => DbError::StorageUnavailable(e.to_string()),
            sqlx::Error::Configuration(e) => DbError::StorageUnavailable(e.to_string()),
            sqlx::Error::Database(db_err) => {
                DbError::TransactionError(db_err.message().to_string())
            }
            other => DbError::TransactionError(other.to_string()),
        }
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;
