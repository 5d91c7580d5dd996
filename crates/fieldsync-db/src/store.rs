//! # LocalStore
//!
//! Schema-aware object stores over a [`StorageEngine`].
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         LocalStore                                      │
//! │                                                                         │
//! │  LocalStore::new(engine, schema)   ← nothing opened yet                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  first call (or init())  ──► engine.open(schema + system stores)       │
//! │       │                      exactly once, concurrent callers wait      │
//! │       ▼                                                                 │
//! │  get / get_all / get_by_index / put / bulk_put / delete / clear        │
//! │  set_cache / get_cache / ...   (see cache.rs)                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  close()                                                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each operation touches exactly one store and is atomic on its own.
//! Nothing spans stores.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use fieldsync_core::{extract_key, index_value, Clock, Schema, StoreSchema, SystemClock};

use crate::engine::StorageEngine;
use crate::error::{DbError, DbResult};
use crate::query::Query;
use crate::repository::queue::SyncQueueRepository;
use crate::repository::records::RecordRepository;

/// Handle to the local database. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct LocalStore {
    engine: Arc<dyn StorageEngine>,
    schema: Arc<Schema>,
    opened: Arc<OnceCell<()>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("version", &self.schema.version)
            .field("stores", &self.schema.stores.len())
            .field("opened", &self.opened.initialized())
            .finish()
    }
}

impl LocalStore {
    /// Creates a store over `engine`. The system stores are added to
    /// `schema` automatically.
    pub fn new(engine: Arc<dyn StorageEngine>, schema: Schema) -> Self {
        LocalStore {
            engine,
            schema: Arc::new(schema.with_system_stores()),
            opened: Arc::new(OnceCell::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used for cache timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The effective schema, system stores included.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Opens the engine. Idempotent; every operation calls it first.
    pub async fn init(&self) -> DbResult<()> {
        self.opened
            .get_or_try_init(|| async {
                info!(
                    version = self.schema.version,
                    stores = self.schema.stores.len(),
                    "Opening local store"
                );
                self.engine.open(&self.schema).await
            })
            .await?;
        Ok(())
    }

    /// Closes the engine. Later calls fail with `StorageUnavailable`.
    pub async fn close(&self) {
        self.engine.close().await;
    }

    fn store_schema(&self, store: &str) -> DbResult<&StoreSchema> {
        self.schema
            .find_store(store)
            .ok_or_else(|| DbError::UnknownStore(store.to_string()))
    }

    // =========================================================================
    // Object Store Operations
    // =========================================================================

    pub async fn get(&self, store: &str, key: &str) -> DbResult<Option<Value>> {
        self.init().await?;
        self.store_schema(store)?;
        self.engine.get(store, key).await
    }

    /// All values in `store`, or those matching `query`, ascending by key.
    pub async fn get_all(&self, store: &str, query: Option<Query>) -> DbResult<Vec<Value>> {
        self.init().await?;
        self.store_schema(store)?;
        let query = query.unwrap_or_default();
        self.engine.get_all(store, &query.range, query.limit).await
    }

    /// Values whose `index` equals `value`. Non-scalar values match nothing.
    pub async fn get_by_index(
        &self,
        store: &str,
        index: &str,
        value: &Value,
    ) -> DbResult<Vec<Value>> {
        self.init().await?;
        if self.store_schema(store)?.find_index(index).is_none() {
            return Err(DbError::unknown_index(store, index));
        }
        match index_value(value) {
            Some(encoded) => self.engine.scan_index(store, index, &encoded).await,
            None => Ok(Vec::new()),
        }
    }

    /// Inserts or replaces `value`, keyed by the store's key path.
    /// Returns the key.
    pub async fn put(&self, store: &str, value: Value) -> DbResult<String> {
        self.init().await?;
        let key = self.key_for(store, &value)?;
        self.engine.put(store, &key, &value).await?;
        debug!(store, key = %key, "Stored value");
        Ok(key)
    }

    /// Writes every value in one transaction. Returns the keys in input order.
    pub async fn bulk_put(&self, store: &str, values: Vec<Value>) -> DbResult<Vec<String>> {
        self.init().await?;
        let entries = values
            .into_iter()
            .map(|value| Ok((self.key_for(store, &value)?, value)))
            .collect::<DbResult<Vec<_>>>()?;

        self.engine.put_many(store, &entries).await?;
        debug!(store, count = entries.len(), "Stored values");
        Ok(entries.into_iter().map(|(key, _)| key).collect())
    }

    /// Deleting a missing key is not an error.
    pub async fn delete(&self, store: &str, key: &str) -> DbResult<()> {
        self.init().await?;
        self.store_schema(store)?;
        let removed = self.engine.delete(store, key).await?;
        debug!(store, key, removed, "Deleted value");
        Ok(())
    }

    pub async fn clear(&self, store: &str) -> DbResult<()> {
        self.init().await?;
        self.store_schema(store)?;
        self.engine.clear(store).await
    }

    fn key_for(&self, store: &str, value: &Value) -> DbResult<String> {
        let schema = self.store_schema(store)?;
        extract_key(value, &schema.key_path).map_err(|_| DbError::MissingKey {
            store: store.to_string(),
            path: schema.key_path.clone(),
        })
    }

    // =========================================================================
    // Typed Helpers
    // =========================================================================

    pub async fn get_as<T: DeserializeOwned>(&self, store: &str, key: &str) -> DbResult<Option<T>> {
        match self.get(store, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn get_all_as<T: DeserializeOwned>(
        &self,
        store: &str,
        query: Option<Query>,
    ) -> DbResult<Vec<T>> {
        self.get_all(store, query)
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(DbError::from))
            .collect()
    }

    pub async fn put_as<T: Serialize>(&self, store: &str, item: &T) -> DbResult<String> {
        self.put(store, serde_json::to_value(item)?).await
    }

    // =========================================================================
    // Repositories
    // =========================================================================

    /// Returns the sync queue repository.
    pub fn sync_queue(&self) -> SyncQueueRepository {
        SyncQueueRepository::new(self.clone())
    }

    /// Returns the domain record repository.
    pub fn records(&self) -> RecordRepository {
        RecordRepository::new(self.clone())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
