//! # Schema Migrations
//!
//! Runtime schema versioning. There are no SQL migration files: the store
//! layout is data (a [`Schema`]) and upgrades are computed by diffing the
//! requested schema against the one persisted by the last open.
//!
//! ## How Upgrades Work
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Upgrade Process                                    │
//! │                                                                         │
//! │  engine.open(schema)                                                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Create bookkeeping tables (IF NOT EXISTS)                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Load persisted schema from fs_meta                                    │
//! │       │                                                                 │
//! │       ├── none?      every store is new                                │
//! │       ├── newer?     VersionRegression, open fails                     │
//! │       ├── removed?   NonAdditiveChange, open fails                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Back-fill new indexes from existing rows                              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Persist requested schema  (same transaction as the back-fill)         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use fieldsync_core::{Schema, SchemaDiff};

use crate::error::DbResult;

/// Bookkeeping tables shared by every store.
const BOOTSTRAP_SQL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS fs_meta (
        key   TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fs_records (
        store TEXT NOT NULL,
        key   TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (store, key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fs_index_entries (
        store TEXT NOT NULL,
        idx   TEXT NOT NULL,
        value TEXT NOT NULL,
        key   TEXT NOT NULL,
        PRIMARY KEY (store, idx, value, key)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS fs_index_entries_by_key ON fs_index_entries (store, key)",
];

const SCHEMA_META_KEY: &str = "schema";

/// Validates `requested` and diffs it against `persisted`.
///
/// With nothing persisted every store is new.
pub fn plan_upgrade(requested: &Schema, persisted: Option<&Schema>) -> DbResult<SchemaDiff> {
    requested.validate()?;

    let diff = match persisted {
        None => SchemaDiff {
            new_stores: requested.stores.iter().map(|s| s.name.clone()).collect(),
            new_indexes: Vec::new(),
        },
        Some(old) => requested.check_upgrade(old)?,
    };

    if !diff.is_empty() {
        info!(
            version = requested.version,
            from = persisted.map(|s| s.version),
            new_stores = diff.new_stores.len(),
            new_indexes = diff.new_indexes.len(),
            "Schema upgrade planned"
        );
    }

    Ok(diff)
}

/// Creates the bookkeeping tables. Idempotent.
pub async fn bootstrap(pool: &SqlitePool) -> DbResult<()> {
    debug!("Ensuring bookkeeping tables");
    for statement in BOOTSTRAP_SQL {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Loads the schema persisted by the last successful open.
pub async fn load_schema(pool: &SqlitePool) -> DbResult<Option<Schema>> {
    let raw: Option<String> = sqlx::query_scalar("SELECT value FROM fs_meta WHERE key = ?1")
        .bind(SCHEMA_META_KEY)
        .fetch_optional(pool)
        .await?;

    match raw {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Persists `schema` inside an open transaction.
pub async fn save_schema(tx: &mut Transaction<'_, Sqlite>, schema: &Schema) -> DbResult<()> {
    let json = serde_json::to_string(schema)?;
    sqlx::query("INSERT OR REPLACE INTO fs_meta (key, value) VALUES (?1, ?2)")
        .bind(SCHEMA_META_KEY)
        .bind(json)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
