//! # Error Types
//!
//! Domain errors for fieldsync-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  fieldsync-core (this file)                                            │
//! │  └── CoreError   - schema and key-path violations                      │
//! │                                                                         │
//! │  fieldsync-db                                                          │
//! │  └── DbError     - StorageUnavailable / TransactionError               │
//! │                                                                         │
//! │  fieldsync-sync                                                        │
//! │  └── SyncError   - network, auth, channel failures                     │
//! │                                                                         │
//! │  Flow: CoreError → DbError → SyncError → presentation layer            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Schema and data-shape errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// A store was declared twice in one schema.
    #[error("Store '{0}' is declared more than once")]
    DuplicateStore(String),

    /// An index was declared twice on the same store.
    #[error("Index '{index}' is declared more than once on store '{store}'")]
    DuplicateIndex { store: String, index: String },

    /// A key path is empty or malformed.
    #[error("Invalid key path '{path}' on store '{store}'")]
    InvalidKeyPath { store: String, path: String },

    /// Schema version went backwards.
    ///
    /// ## When This Occurs
    /// - An older build opens a database upgraded by a newer build
    #[error("Schema version {requested} is older than persisted version {persisted}")]
    VersionRegression { requested: u32, persisted: u32 },

    /// An upgrade tried to remove or alter something. Upgrades are additive only.
    #[error("Non-additive schema change: {0}")]
    NonAdditiveChange(String),

    /// A value has no usable primary key at the store's key path.
    #[error("Value has no key at path '{path}'")]
    MissingKey { path: String },
}

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
