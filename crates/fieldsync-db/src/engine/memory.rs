//! In-memory engine: one `BTreeMap` per store behind an async mutex.
//!
//! Data and the persisted schema survive `close()` so a test can reopen the
//! same engine with a newer schema, the way a process restart would.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use fieldsync_core::{Schema, StoreSchema};

use super::{index_entries, StorageEngine};
use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::query::KeyRange;

#[derive(Debug, Default)]
struct MemoryState {
    open: bool,
    schema: Option<Schema>,
    stores: HashMap<String, BTreeMap<String, Value>>,
}

impl MemoryState {
    fn schema_for(&self, store: &str) -> DbResult<&StoreSchema> {
        if !self.open {
            return Err(DbError::StorageUnavailable("memory engine is closed".into()));
        }
        self.schema
            .as_ref()
            .and_then(|s| s.find_store(store))
            .ok_or_else(|| DbError::UnknownStore(store.to_string()))
    }

    fn store(&self, store: &str) -> DbResult<&BTreeMap<String, Value>> {
        self.schema_for(store)?;
        self.stores
            .get(store)
            .ok_or_else(|| DbError::UnknownStore(store.to_string()))
    }

    fn store_mut(&mut self, store: &str) -> DbResult<&mut BTreeMap<String, Value>> {
        self.schema_for(store)?;
        self.stores
            .get_mut(store)
            .ok_or_else(|| DbError::UnknownStore(store.to_string()))
    }
}

/// Ephemeral engine for tests and sessions that need no persistence.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: Mutex<MemoryState>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        MemoryEngine::default()
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    async fn open(&self, schema: &Schema) -> DbResult<()> {
        let mut state = self.state.lock().await;

        let diff = migrations::plan_upgrade(schema, state.schema.as_ref())?;
        for name in &diff.new_stores {
            state.stores.entry(name.clone()).or_default();
        }
        // Indexes are evaluated on every scan, so nothing to back-fill.

        state.schema = Some(schema.clone());
        state.open = true;

        debug!(version = schema.version, "Memory engine opened");
        Ok(())
    }

    async fn get(&self, store: &str, key: &str) -> DbResult<Option<Value>> {
        let state = self.state.lock().await;
        Ok(state.store(store)?.get(key).cloned())
    }

    async fn get_all(
        &self,
        store: &str,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> DbResult<Vec<Value>> {
        let state = self.state.lock().await;
        let values = state
            .store(store)?
            .iter()
            .filter(|(key, _)| range.contains(key))
            .map(|(_, value)| value.clone())
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok(values)
    }

    async fn scan_index(&self, store: &str, index: &str, value: &str) -> DbResult<Vec<Value>> {
        let state = self.state.lock().await;
        let schema = state.schema_for(store)?;
        if schema.find_index(index).is_none() {
            return Err(DbError::unknown_index(store, index));
        }

        let values = state
            .store(store)?
            .values()
            .filter(|v| {
                index_entries(schema, v)
                    .iter()
                    .any(|(name, encoded)| name == index && encoded == value)
            })
            .cloned()
            .collect();
        Ok(values)
    }

    async fn put(&self, store: &str, key: &str, value: &Value) -> DbResult<()> {
        let mut state = self.state.lock().await;
        state
            .store_mut(store)?
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn put_many(&self, store: &str, entries: &[(String, Value)]) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let map = state.store_mut(store)?;
        for (key, value) in entries {
            map.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn delete(&self, store: &str, key: &str) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state.store_mut(store)?.remove(key).is_some())
    }

    async fn clear(&self, store: &str) -> DbResult<()> {
        let mut state = self.state.lock().await;
        state.store_mut(store)?.clear();
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().await.open = false;
    }
}
