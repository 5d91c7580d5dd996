//! # fieldsync-db: LocalStore for FieldSync
//!
//! Persistent, schema-versioned object stores with secondary indexes and a
//! TTL cache, over a swappable storage engine.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        FieldSync Data Flow                              │
//! │                                                                         │
//! │  SyncCoordinator / UI code                                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  fieldsync-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │  LocalStore   │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │  (store.rs)   │◄───│  (queue.rs,   │    │  (runtime    │  │   │
//! │  │   │  + cache.rs   │    │   records.rs) │    │   schema)    │  │   │
//! │  │   └───────┬───────┘    └───────────────┘    └──────────────┘  │   │
//! │  │           │                                                     │   │
//! │  │           ▼                                                     │   │
//! │  │   StorageEngine ── MemoryEngine │ SqliteEngine                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   ~/.local/share/fieldsync/fieldsync.db                         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`engine`] - Storage engine trait and implementations
//! - [`store`] - LocalStore object-store operations
//! - [`cache`] - TTL cache on top of LocalStore
//! - [`pool`] - SQLite pool configuration
//! - [`migrations`] - Runtime schema versioning
//! - [`repository`] - Sync queue and record repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldsync_db::{DbConfig, LocalStore, SqliteEngine};
//!
//! let engine = SqliteEngine::connect(&DbConfig::new("fieldsync.db")).await?;
//! let store = LocalStore::new(Arc::new(engine), schema);
//!
//! store.put("patients", json!({ "id": "p-1", "name": "Amina" })).await?;
//! store.set_cache("facility:42", facility, None).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cache;
pub mod engine;
pub mod error;
pub mod migrations;
pub mod pool;
pub mod query;
pub mod repository;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use engine::{MemoryEngine, SqliteEngine, StorageEngine};
pub use error::{DbError, DbResult};
pub use pool::DbConfig;
pub use query::{KeyRange, Query};
pub use store::LocalStore;

// Repository re-exports for convenience
pub use repository::queue::SyncQueueRepository;
pub use repository::records::RecordRepository;
