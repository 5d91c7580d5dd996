//! # Domain Types
//!
//! Core types persisted by the LocalStore and moved by the sync engine.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │     Record      │   │    SyncTask     │   │   CacheEntry    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id             │   │  id (UUID)      │   │  key            │       │
//! │  │  payload        │   │  operation      │   │  data           │       │
//! │  │  syncStatus     │   │  store, payload │   │  timestamp      │       │
//! │  │  lastModified   │   │  priority       │   │  ttl            │       │
//! │  └─────────────────┘   │  status         │   └─────────────────┘       │
//! │                        │  retryCount     │                              │
//! │                        │  createdAt      │                              │
//! │                        └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All timestamps are epoch milliseconds. Field names are camelCase on disk
//! and on the wire so the UI layer and the remote service see one shape.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use uuid::Uuid;

// =============================================================================
// Record
// =============================================================================

/// Local sync state of a domain record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Changed locally, not yet acknowledged by the remote service.
    #[default]
    Pending,
    /// Matches the remote service.
    Synced,
    /// Last upload attempt failed; a retry is queued.
    Failed,
}

/// A domain record (patient, encounter, facility...) as held in a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,

    /// Application data. Opaque to the engine.
    #[ts(type = "unknown")]
    pub payload: Value,

    #[serde(default)]
    pub sync_status: RecordStatus,

    /// Epoch milliseconds of the last write, used for last-write-wins.
    pub last_modified: i64,
}

impl Record {
    /// Creates a locally modified record awaiting upload.
    pub fn pending(id: impl Into<String>, payload: Value, now_ms: i64) -> Self {
        Record {
            id: id.into(),
            payload,
            sync_status: RecordStatus::Pending,
            last_modified: now_ms,
        }
    }

    /// Creates a record received from the remote service.
    pub fn synced(id: impl Into<String>, payload: Value, last_modified: i64) -> Self {
        Record {
            id: id.into(),
            payload,
            sync_status: RecordStatus::Synced,
            last_modified,
        }
    }

    /// Returns true if this record should replace `existing` under
    /// last-write-wins. Ties go to the incoming write.
    pub fn supersedes(&self, existing: &Record) -> bool {
        self.last_modified >= existing.last_modified
    }
}

// =============================================================================
// Sync Operation
// =============================================================================

/// The kind of mutation a sync task replays against the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOperation::Create => write!(f, "CREATE"),
            SyncOperation::Update => write!(f, "UPDATE"),
            SyncOperation::Delete => write!(f, "DELETE"),
        }
    }
}

// =============================================================================
// Task Status
// =============================================================================

/// Lifecycle of a sync task.
///
/// ```text
///   enqueue ──► Pending ──► InFlight ──┬──► (deleted on success)
///                  ▲                    │
///                  │ cancel / requeue   └──► Failed ──► InFlight ...
///                  └────────────────────────────┘
/// ```
///
/// `Done` exists for the durable shape; successful tasks are removed
/// rather than kept in this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InFlight,
    Failed,
    Done,
}

impl TaskStatus {
    /// The string stored in the `by_status` index.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InFlight => "in_flight",
            TaskStatus::Failed => "failed",
            TaskStatus::Done => "done",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Sync Task
// =============================================================================

/// A queued local mutation awaiting transmission to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncTask {
    /// Unique identifier (UUID v4).
    pub id: String,

    pub operation: SyncOperation,

    /// Logical store the payload belongs to (e.g. "patients").
    pub store: String,

    #[ts(type = "unknown")]
    pub payload: Value,

    /// Higher runs first.
    pub priority: i32,

    pub status: TaskStatus,

    /// Number of failed attempts so far.
    pub retry_count: u32,

    /// Epoch milliseconds. Unique per outbox, so FIFO is total.
    pub created_at: i64,

    /// Last failure reason, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncTask {
    /// Creates a pending task with a fresh id.
    pub fn new(
        operation: SyncOperation,
        store: impl Into<String>,
        payload: Value,
        priority: i32,
        created_at: i64,
    ) -> Self {
        SyncTask {
            id: Uuid::new_v4().to_string(),
            operation,
            store: store.into(),
            payload,
            priority,
            status: TaskStatus::Pending,
            retry_count: 0,
            created_at,
            last_error: None,
        }
    }

    /// The id of the entity this task mutates, read from `payload.id`.
    ///
    /// Numeric ids are rendered as strings.
    pub fn entity_id(&self) -> Option<String> {
        entity_id_of(&self.payload)
    }

    /// Returns true once the task has used up its attempts.
    ///
    /// `max_attempts == 0` means unbounded.
    pub fn is_stuck(&self, max_attempts: u32) -> bool {
        max_attempts > 0 && self.retry_count >= max_attempts
    }

    /// Returns true if a drain may pick this task up.
    pub fn is_eligible(&self, max_attempts: u32) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Failed)
            && !self.is_stuck(max_attempts)
    }
}

/// Reads `payload.id`, rendering numeric ids as strings.
pub fn entity_id_of(payload: &Value) -> Option<String> {
    match payload.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Dequeue order: `priority` descending, then `created_at` ascending.
///
/// The id breaks exact ties so the order is total.
pub fn dequeue_order(a: &SyncTask, b: &SyncTask) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

// =============================================================================
// Cache Entry
// =============================================================================

/// A value in the TTL cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,

    #[ts(type = "unknown")]
    pub data: Value,

    /// Epoch milliseconds when the entry was written.
    pub timestamp: i64,

    /// Time-to-live in milliseconds.
    pub ttl: i64,
}

impl CacheEntry {
    /// Epoch milliseconds at which the entry stops being readable.
    pub fn expires_at(&self) -> i64 {
        self.timestamp.saturating_add(self.ttl)
    }

    /// An entry is expired at or after `timestamp + ttl`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(priority: i32, created_at: i64) -> SyncTask {
        SyncTask::new(SyncOperation::Create, "patients", json!({}), priority, created_at)
    }

    #[test]
    fn test_dequeue_order_priority_then_fifo() {
        let t1 = task(1, 100);
        let t2 = task(5, 200);
        let t3 = task(1, 300);

        let mut tasks = vec![t1.clone(), t2.clone(), t3.clone()];
        tasks.sort_by(dequeue_order);

        let order: Vec<_> = tasks.iter().map(|t| t.id.clone()).collect();
        assert_eq!(order, vec![t2.id, t1.id, t3.id]);
    }

    #[test]
    fn test_sync_task_wire_shape() {
        let t = task(3, 42);
        let value = serde_json::to_value(&t).unwrap();

        assert_eq!(value["operation"], "CREATE");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["retryCount"], 0);
        assert_eq!(value["createdAt"], 42);
        assert!(value.get("lastError").is_none());
    }

    #[test]
    fn test_entity_id_from_payload() {
        let mut t = task(0, 0);
        t.payload = json!({ "id": "p-7" });
        assert_eq!(t.entity_id().as_deref(), Some("p-7"));

        t.payload = json!({ "id": 42 });
        assert_eq!(t.entity_id().as_deref(), Some("42"));

        t.payload = json!({ "name": "no id" });
        assert_eq!(t.entity_id(), None);
    }

    #[test]
    fn test_task_eligibility_and_stuck_bound() {
        let mut t = task(0, 0);
        assert!(t.is_eligible(3));

        t.status = TaskStatus::InFlight;
        assert!(!t.is_eligible(3));

        t.status = TaskStatus::Failed;
        t.retry_count = 3;
        assert!(t.is_stuck(3));
        assert!(!t.is_eligible(3));

        // 0 = unbounded
        assert!(!t.is_stuck(0));
        assert!(t.is_eligible(0));
    }

    #[test]
    fn test_cache_entry_expiry_boundary() {
        let entry = CacheEntry {
            key: "facility:42".into(),
            data: json!({ "name": "Kisumu HC" }),
            timestamp: 1_000,
            ttl: 1_000,
        };

        assert!(!entry.is_expired(1_500));
        assert!(!entry.is_expired(1_999));
        assert!(entry.is_expired(2_000));
        assert!(entry.is_expired(2_500));
    }

    #[test]
    fn test_record_last_write_wins() {
        let local = Record::pending("p-1", json!({ "v": 1 }), 100);
        let older = Record::synced("p-1", json!({ "v": 0 }), 50);
        let newer = Record::synced("p-1", json!({ "v": 2 }), 150);
        let tie = Record::synced("p-1", json!({ "v": 3 }), 100);

        assert!(!older.supersedes(&local));
        assert!(newer.supersedes(&local));
        assert!(tie.supersedes(&local));
    }

    #[test]
    fn test_record_wire_shape() {
        let r = Record::pending("p-1", json!({}), 7);
        let value = serde_json::to_value(&r).unwrap();
        assert_eq!(value["syncStatus"], "pending");
        assert_eq!(value["lastModified"], 7);
    }
}
