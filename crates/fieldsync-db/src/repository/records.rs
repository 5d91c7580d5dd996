//! # Record Repository
//!
//! Domain records (`{id, payload, syncStatus, lastModified}`) in the
//! application's stores. Those stores must use `id` as their key path.
//!
//! Conflicts between local and server copies are settled by
//! last-write-wins on `lastModified`; equal timestamps accept the incoming
//! write.

use tracing::debug;

use fieldsync_core::{Record, RecordStatus};

use crate::error::DbResult;
use crate::store::LocalStore;

/// Repository for domain records.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    store: LocalStore,
}

impl RecordRepository {
    pub fn new(store: LocalStore) -> Self {
        RecordRepository { store }
    }

    pub async fn get(&self, store: &str, id: &str) -> DbResult<Option<Record>> {
        self.store.get_as(store, id).await
    }

    /// Unconditional write.
    pub async fn save(&self, store: &str, record: &Record) -> DbResult<()> {
        self.store.put_as(store, record).await?;
        Ok(())
    }

    /// Writes `record` unless the stored copy is strictly newer.
    /// Returns whether it was written.
    pub async fn upsert_if_newer(&self, store: &str, record: &Record) -> DbResult<bool> {
        if let Some(existing) = self.get(store, &record.id).await? {
            if !record.supersedes(&existing) {
                debug!(
                    store,
                    id = %record.id,
                    incoming = record.last_modified,
                    existing = existing.last_modified,
                    "Stale upsert ignored"
                );
                return Ok(false);
            }
        }

        self.save(store, record).await?;
        Ok(true)
    }

    /// Deletes the record unless the stored copy is strictly newer than
    /// `last_modified`. A missing record counts as deleted.
    pub async fn delete_if_not_newer(
        &self,
        store: &str,
        id: &str,
        last_modified: i64,
    ) -> DbResult<bool> {
        if let Some(existing) = self.get(store, id).await? {
            if existing.last_modified > last_modified {
                debug!(store, id, "Stale delete ignored");
                return Ok(false);
            }
        }

        self.remove(store, id).await?;
        Ok(true)
    }

    /// Returns false if the record does not exist.
    pub async fn set_status(&self, store: &str, id: &str, status: RecordStatus) -> DbResult<bool> {
        let Some(mut record) = self.get(store, id).await? else {
            return Ok(false);
        };
        if record.sync_status != status {
            record.sync_status = status;
            self.save(store, &record).await?;
        }
        Ok(true)
    }

    pub async fn remove(&self, store: &str, id: &str) -> DbResult<()> {
        self.store.delete(store, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fieldsync_core::{Schema, StoreSchema};
    use serde_json::json;

    use crate::engine::MemoryEngine;

    fn repo() -> RecordRepository {
        let schema = Schema::new(1).store(StoreSchema::new("patients", "id"));
        LocalStore::new(Arc::new(MemoryEngine::new()), schema).records()
    }

    #[tokio::test]
    async fn test_upsert_last_write_wins() {
        let repo = repo();
        let local = Record::pending("p-1", json!({ "name": "local" }), 200);
        repo.save("patients", &local).await.unwrap();

        let older = Record::synced("p-1", json!({ "name": "old" }), 100);
        assert!(!repo.upsert_if_newer("patients", &older).await.unwrap());

        let tie = Record::synced("p-1", json!({ "name": "tie" }), 200);
        assert!(repo.upsert_if_newer("patients", &tie).await.unwrap());

        let stored = repo.get("patients", "p-1").await.unwrap().unwrap();
        assert_eq!(stored.payload["name"], "tie");
        assert_eq!(stored.sync_status, RecordStatus::Synced);
    }

    #[tokio::test]
    async fn test_upsert_into_empty_store() {
        let repo = repo();
        let r = Record::synced("p-2", json!({}), 1);
        assert!(repo.upsert_if_newer("patients", &r).await.unwrap());
        assert!(repo.get("patients", "p-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_respects_newer_local_copy() {
        let repo = repo();
        repo.save("patients", &Record::pending("p-1", json!({}), 500))
            .await
            .unwrap();

        assert!(!repo.delete_if_not_newer("patients", "p-1", 400).await.unwrap());
        assert!(repo.get("patients", "p-1").await.unwrap().is_some());

        assert!(repo.delete_if_not_newer("patients", "p-1", 500).await.unwrap());
        assert!(repo.get("patients", "p-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_status() {
        let repo = repo();
        repo.save("patients", &Record::pending("p-1", json!({}), 1))
            .await
            .unwrap();

        assert!(repo.set_status("patients", "p-1", RecordStatus::Synced).await.unwrap());
        let r = repo.get("patients", "p-1").await.unwrap().unwrap();
        assert_eq!(r.sync_status, RecordStatus::Synced);

        assert!(!repo.set_status("patients", "gone", RecordStatus::Failed).await.unwrap());
    }
}
