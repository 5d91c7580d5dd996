//! # Repository Module
//!
//! Typed views over LocalStore stores.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern                                   │
//! │                                                                         │
//! │  SyncOutbox / SyncCoordinator                                          │
//! │       │                                                                 │
//! │       │  store.sync_queue().eligible(10, 50)                           │
//! │       │  store.records().upsert_if_newer("patients", &record)          │
//! │       ▼                                                                 │
//! │  SyncQueueRepository            RecordRepository                       │
//! │  ├── insert / get / all         ├── get / save                         │
//! │  ├── eligible / stuck           ├── upsert_if_newer                    │
//! │  ├── mark_in_flight / failed    ├── delete_if_not_newer                │
//! │  ├── mark_pending / requeue     ├── set_status                         │
//! │  └── remove / reset_in_flight   └── remove                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  LocalStore (JSON values, one store per call)                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod queue;
pub mod records;
