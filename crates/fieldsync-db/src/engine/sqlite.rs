//! # SQLite Engine
//!
//! All stores share two tables: `fs_records` holds the JSON values and
//! `fs_index_entries` holds one row per `(index, encoded value, key)`.
//!
//! ```text
//! fs_records                         fs_index_entries
//! ┌──────────┬───────┬──────────┐    ┌──────────┬────────────┬─────────┬───────┐
//! │ store    │ key   │ value    │    │ store    │ idx        │ value   │ key   │
//! ├──────────┼───────┼──────────┤    ├──────────┼────────────┼─────────┼───────┤
//! │ patients │ p-1   │ {...}    │◄───│ patients │ by_village │ Ahero   │ p-1   │
//! │ sync_... │ 7f3.. │ {...}    │◄───│ sync_... │ by_status  │ pending │ 7f3.. │
//! └──────────┴───────┴──────────┘    └──────────┴────────────┴─────────┴───────┘
//! ```
//!
//! Writes replace the record row and its index rows in one transaction.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::RwLock;
use tracing::{debug, info};

use fieldsync_core::{extract_path, index_value, Schema, StoreSchema};

use super::{index_entries, StorageEngine};
use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::pool::{connect_pool, DbConfig};
use crate::query::KeyRange;

/// Durable engine backed by sqlx + SQLite.
#[derive(Debug)]
pub struct SqliteEngine {
    pool: SqlitePool,
    schema: RwLock<Option<Schema>>,
}

impl SqliteEngine {
    /// Creates the pool and the bookkeeping tables. Stores are created by
    /// [`StorageEngine::open`].
    pub async fn connect(config: &DbConfig) -> DbResult<Self> {
        let pool = connect_pool(config).await?;
        migrations::bootstrap(&pool).await?;

        Ok(SqliteEngine {
            pool,
            schema: RwLock::new(None),
        })
    }

    /// Runs a trivial query; a closed or unreachable pool is
    /// `StorageUnavailable`.
    pub async fn health_check(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        debug!("Database health check passed");
        Ok(())
    }

    async fn store_schema(&self, store: &str) -> DbResult<StoreSchema> {
        let guard = self.schema.read().await;
        let schema = guard
            .as_ref()
            .ok_or_else(|| DbError::StorageUnavailable("sqlite engine is not open".into()))?;
        schema
            .find_store(store)
            .cloned()
            .ok_or_else(|| DbError::UnknownStore(store.to_string()))
    }
}

async fn write_record(
    tx: &mut Transaction<'_, Sqlite>,
    store: &StoreSchema,
    key: &str,
    value: &Value,
) -> DbResult<()> {
    let raw = serde_json::to_string(value)?;

    sqlx::query("INSERT OR REPLACE INTO fs_records (store, key, value) VALUES (?1, ?2, ?3)")
        .bind(store.name.as_str())
        .bind(key)
        .bind(raw)
        .execute(&mut **tx)
        .await?;

    sqlx::query("DELETE FROM fs_index_entries WHERE store = ?1 AND key = ?2")
        .bind(store.name.as_str())
        .bind(key)
        .execute(&mut **tx)
        .await?;

    for (index, encoded) in index_entries(store, value) {
        insert_index_entry(tx, &store.name, &index, &encoded, key).await?;
    }

    Ok(())
}

async fn insert_index_entry(
    tx: &mut Transaction<'_, Sqlite>,
    store: &str,
    index: &str,
    encoded: &str,
    key: &str,
) -> DbResult<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO fs_index_entries (store, idx, value, key) VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(store)
    .bind(index)
    .bind(encoded)
    .bind(key)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn decode_all(rows: Vec<String>) -> DbResult<Vec<Value>> {
    rows.iter()
        .map(|raw| serde_json::from_str(raw).map_err(DbError::from))
        .collect()
}

#[async_trait]
impl StorageEngine for SqliteEngine {
    async fn open(&self, schema: &Schema) -> DbResult<()> {
        let persisted = migrations::load_schema(&self.pool).await?;
        let diff = migrations::plan_upgrade(schema, persisted.as_ref())?;

        let mut tx = self.pool.begin().await?;

        for (store_name, index_name) in &diff.new_indexes {
            let index = schema
                .find_store(store_name)
                .and_then(|s| s.find_index(index_name))
                .ok_or_else(|| DbError::unknown_index(store_name.as_str(), index_name.as_str()))?;

            let rows: Vec<(String, String)> =
                sqlx::query_as("SELECT key, value FROM fs_records WHERE store = ?1")
                    .bind(store_name.as_str())
                    .fetch_all(&mut *tx)
                    .await?;

            let mut filled = 0usize;
            for (key, raw) in rows {
                let value: Value = serde_json::from_str(&raw)?;
                if let Some(encoded) = extract_path(&value, &index.key_path).and_then(index_value) {
                    insert_index_entry(&mut tx, store_name, index_name, &encoded, &key).await?;
                    filled += 1;
                }
            }

            info!(store = %store_name, index = %index_name, filled, "Back-filled index");
        }

        migrations::save_schema(&mut tx, schema).await?;
        tx.commit().await?;

        *self.schema.write().await = Some(schema.clone());

        info!(version = schema.version, "SQLite engine opened");
        Ok(())
    }

    async fn get(&self, store: &str, key: &str) -> DbResult<Option<Value>> {
        self.store_schema(store).await?;

        let raw: Option<String> =
            sqlx::query_scalar("SELECT value FROM fs_records WHERE store = ?1 AND key = ?2")
                .bind(store)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn get_all(
        &self,
        store: &str,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> DbResult<Vec<Value>> {
        self.store_schema(store).await?;

        // SQLite treats a negative LIMIT as "no limit"
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT value FROM fs_records
            WHERE store = ?1
              AND (?2 IS NULL OR key >= ?2)
              AND (?3 IS NULL OR key <= ?3)
            ORDER BY key ASC
            LIMIT ?4
            "#,
        )
        .bind(store)
        .bind(range.lower.as_deref())
        .bind(range.upper.as_deref())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        decode_all(rows)
    }

    async fn scan_index(&self, store: &str, index: &str, value: &str) -> DbResult<Vec<Value>> {
        let schema = self.store_schema(store).await?;
        if schema.find_index(index).is_none() {
            return Err(DbError::unknown_index(store, index));
        }

        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT r.value
            FROM fs_index_entries i
            JOIN fs_records r ON r.store = i.store AND r.key = i.key
            WHERE i.store = ?1 AND i.idx = ?2 AND i.value = ?3
            ORDER BY i.key ASC
            "#,
        )
        .bind(store)
        .bind(index)
        .bind(value)
        .fetch_all(&self.pool)
        .await?;

        decode_all(rows)
    }

    async fn put(&self, store: &str, key: &str, value: &Value) -> DbResult<()> {
        let schema = self.store_schema(store).await?;

        let mut tx = self.pool.begin().await?;
        write_record(&mut tx, &schema, key, value).await?;
        tx.commit().await?;

        debug!(store, key, "put");
        Ok(())
    }

    async fn put_many(&self, store: &str, entries: &[(String, Value)]) -> DbResult<()> {
        let schema = self.store_schema(store).await?;

        let mut tx = self.pool.begin().await?;
        for (key, value) in entries {
            write_record(&mut tx, &schema, key, value).await?;
        }
        tx.commit().await?;

        debug!(store, count = entries.len(), "put_many");
        Ok(())
    }

    async fn delete(&self, store: &str, key: &str) -> DbResult<bool> {
        self.store_schema(store).await?;

        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM fs_records WHERE store = ?1 AND key = ?2")
            .bind(store)
            .bind(key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM fs_index_entries WHERE store = ?1 AND key = ?2")
            .bind(store)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(removed > 0)
    }

    async fn clear(&self, store: &str) -> DbResult<()> {
        self.store_schema(store).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM fs_records WHERE store = ?1")
            .bind(store)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM fs_index_entries WHERE store = ?1")
            .bind(store)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(store, "Store cleared");
        Ok(())
    }

    async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v1() -> Schema {
        Schema::new(1).store(StoreSchema::new("patients", "id"))
    }

    fn v2() -> Schema {
        Schema::new(2).store(StoreSchema::new("patients", "id").index("by_village", "village"))
    }

    #[tokio::test]
    async fn test_put_get_delete_roundtrip() {
        let engine = SqliteEngine::connect(&DbConfig::in_memory()).await.unwrap();
        engine.open(&v2()).await.unwrap();

        let value = json!({ "id": "p-1", "village": "Ahero" });
        engine.put("patients", "p-1", &value).await.unwrap();
        assert_eq!(engine.get("patients", "p-1").await.unwrap(), Some(value));

        let hits = engine.scan_index("patients", "by_village", "s:Ahero").await.unwrap();
        assert_eq!(hits.len(), 1);

        assert!(engine.delete("patients", "p-1").await.unwrap());
        assert!(!engine.delete("patients", "p-1").await.unwrap());
        assert!(engine
            .scan_index("patients", "by_village", "s:Ahero")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_rewrite_moves_index_entry() {
        let engine = SqliteEngine::connect(&DbConfig::in_memory()).await.unwrap();
        engine.open(&v2()).await.unwrap();

        engine
            .put("patients", "p-1", &json!({ "id": "p-1", "village": "Ahero" }))
            .await
            .unwrap();
        engine
            .put("patients", "p-1", &json!({ "id": "p-1", "village": "Awasi" }))
            .await
            .unwrap();

        assert!(engine
            .scan_index("patients", "by_village", "s:Ahero")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            engine
                .scan_index("patients", "by_village", "s:Awasi")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_upgrade_backfills_new_index_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = DbConfig::new(dir.path().join("fieldsync.db"));

        {
            let engine = SqliteEngine::connect(&config).await.unwrap();
            engine.open(&v1()).await.unwrap();
            let entries = vec![
                ("p-1".to_string(), json!({ "id": "p-1", "village": "Ahero" })),
                ("p-2".to_string(), json!({ "id": "p-2", "village": "Awasi" })),
                ("p-3".to_string(), json!({ "id": "p-3" })),
            ];
            engine.put_many("patients", &entries).await.unwrap();
            engine.close().await;
        }

        let engine = SqliteEngine::connect(&config).await.unwrap();
        engine.open(&v2()).await.unwrap();

        let ahero = engine.scan_index("patients", "by_village", "s:Ahero").await.unwrap();
        assert_eq!(ahero.len(), 1);
        assert_eq!(ahero[0]["id"], "p-1");

        let all = engine.get_all("patients", &KeyRange::all(), None).await.unwrap();
        assert_eq!(all.len(), 3);
        engine.close().await;

        // v1 after v2 is a downgrade
        let engine = SqliteEngine::connect(&config).await.unwrap();
        assert!(matches!(engine.open(&v1()).await, Err(DbError::Schema(_))));
    }

    #[tokio::test]
    async fn test_closed_pool_is_unavailable() {
        let engine = SqliteEngine::connect(&DbConfig::in_memory()).await.unwrap();
        engine.open(&v1()).await.unwrap();
        engine.health_check().await.unwrap();
        engine.close().await;

        let err = engine.get("patients", "p-1").await.unwrap_err();
        assert!(matches!(err, DbError::StorageUnavailable(_)));
        assert!(matches!(
            engine.health_check().await,
            Err(DbError::StorageUnavailable(_))
        ));
    }
}
