//! # fieldsync-core: Pure Types for the FieldSync Engine
//!
//! Everything in this crate is free of I/O so that it can be shared by the
//! storage layer, the sync layer and the UI bindings.
//!
//! ## Module Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         fieldsync-core                                  │
//! │                                                                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌────────────┐  │
//! │  │    types     │  │    schema    │  │   backoff    │  │   clock    │  │
//! │  │              │  │              │  │              │  │            │  │
//! │  │ Record       │  │ Schema       │  │ Backoff-     │  │ Clock      │  │
//! │  │ SyncTask     │  │ StoreSchema  │  │ Policy       │  │ System-    │  │
//! │  │ CacheEntry   │  │ key paths    │  │ Exponential  │  │ Manual     │  │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use fieldsync_core::{SyncOperation, SyncTask};
//!
//! let task = SyncTask::new(
//!     SyncOperation::Create,
//!     "patients",
//!     serde_json::json!({ "id": "p-1", "name": "Amina" }),
//!     5,
//!     1_700_000_000_000,
//! );
//! assert_eq!(task.retry_count, 0);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod backoff;
pub mod clock;
pub mod error;
pub mod schema;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use backoff::{BackoffPolicy, ExponentialPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use schema::{
    extract_key, extract_path, index_value, IndexSchema, Schema, SchemaDiff, StoreSchema,
};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Name of the system store holding durable sync tasks.
pub const SYNC_QUEUE_STORE: &str = "sync_queue";

/// Name of the system store holding TTL cache entries.
pub const CACHE_STORE: &str = "cache";

/// Index on `sync_queue` by task status.
pub const SYNC_QUEUE_STATUS_INDEX: &str = "by_status";

/// Default cache time-to-live (5 minutes).
pub const DEFAULT_CACHE_TTL_MS: i64 = 300_000;
