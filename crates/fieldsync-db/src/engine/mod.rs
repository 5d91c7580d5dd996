//! # Storage Engines
//!
//! The capability LocalStore is built on. Engines know nothing about
//! records, tasks or caches: they hold JSON values under string keys in
//! named stores and keep secondary indexes current.
//!
//! ## Implementations
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         StorageEngine                                   │
//! │                                                                         │
//! │   LocalStore ──► Arc<dyn StorageEngine>                                │
//! │                        │                                                │
//! │          ┌─────────────┴──────────────┐                                 │
//! │          ▼                            ▼                                 │
//! │   ┌──────────────┐            ┌──────────────┐                          │
//! │   │ MemoryEngine │            │ SqliteEngine │                          │
//! │   │ BTreeMaps    │            │ sqlx + WAL   │                          │
//! │   │ (tests,      │            │ records +    │                          │
//! │   │  ephemeral)  │            │ index tables │                          │
//! │   └──────────────┘            └──────────────┘                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every call is one single-store transaction: it either applies fully or
//! returns an error and leaves the store untouched.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;

use fieldsync_core::{extract_path, index_value, Schema, StoreSchema};

use crate::error::DbResult;
use crate::query::KeyRange;

pub use memory::MemoryEngine;
pub use sqlite::SqliteEngine;

#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Opens the engine with `schema`, creating new stores and back-filling
    /// new indexes. Fails if the persisted schema is newer or the change is
    /// not additive.
    async fn open(&self, schema: &Schema) -> DbResult<()>;

    async fn get(&self, store: &str, key: &str) -> DbResult<Option<Value>>;

    /// Values whose key falls in `range`, ascending by key.
    async fn get_all(
        &self,
        store: &str,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> DbResult<Vec<Value>>;

    /// Values whose index entry equals `value` (see `index_value`),
    /// ascending by primary key.
    async fn scan_index(&self, store: &str, index: &str, value: &str) -> DbResult<Vec<Value>>;

    /// Inserts or replaces.
    async fn put(&self, store: &str, key: &str, value: &Value) -> DbResult<()>;

    /// Inserts or replaces all entries in one transaction.
    async fn put_many(&self, store: &str, entries: &[(String, Value)]) -> DbResult<()>;

    /// Returns whether a value was removed.
    async fn delete(&self, store: &str, key: &str) -> DbResult<bool>;

    async fn clear(&self, store: &str) -> DbResult<()>;

    /// Releases resources. Later calls fail with `StorageUnavailable`.
    async fn close(&self);
}

/// `(index name, encoded value)` for every index `value` participates in.
///
/// Values missing the indexed path, or holding a non-scalar there, are
/// left out of that index.
pub(crate) fn index_entries(store: &StoreSchema, value: &Value) -> Vec<(String, String)> {
    store
        .indexes
        .iter()
        .filter_map(|index| {
            extract_path(value, &index.key_path)
                .and_then(index_value)
                .map(|encoded| (index.name.clone(), encoded))
        })
        .collect()
}
