//! # Sync Queue Repository
//!
//! Durable storage for [`SyncTask`]s in the `sync_queue` system store.
//!
//! ## Task Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Sync Queue Lifecycle                                 │
//! │                                                                         │
//! │  LOCAL MUTATION                                                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  insert(task)            status = pending, retryCount = 0              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  eligible(max, limit)    pending + failed below the attempt bound,     │
//! │       │                  priority desc, createdAt asc                   │
//! │       ▼                                                                 │
//! │  mark_in_flight(id)                                                    │
//! │       │                                                                 │
//! │       ├── success ──► remove(id)                                       │
//! │       ├── failure ──► mark_failed(id, err)   retryCount += 1           │
//! │       └── cancel  ──► mark_pending(id)                                 │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                       │
//! │  • Tasks are never dropped on failure                                  │
//! │  • A crash mid-flight is undone by reset_in_flight() on startup        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde_json::Value;
use tracing::{debug, info};

use fieldsync_core::{
    dequeue_order, SyncTask, TaskStatus, SYNC_QUEUE_STATUS_INDEX, SYNC_QUEUE_STORE,
};

use crate::error::{DbError, DbResult};
use crate::store::LocalStore;

/// Repository for sync queue operations.
#[derive(Debug, Clone)]
pub struct SyncQueueRepository {
    store: LocalStore,
}

impl SyncQueueRepository {
    /// Creates a new SyncQueueRepository.
    pub fn new(store: LocalStore) -> Self {
        SyncQueueRepository { store }
    }

    /// Persists a task (insert or replace).
    pub async fn insert(&self, task: &SyncTask) -> DbResult<()> {
        self.store.put_as(SYNC_QUEUE_STORE, task).await?;
        debug!(
            task_id = %task.id,
            operation = %task.operation,
            store = %task.store,
            priority = task.priority,
            "Task queued"
        );
        Ok(())
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<SyncTask>> {
        self.store.get_as(SYNC_QUEUE_STORE, id).await
    }

    /// Every task, in key order.
    pub async fn all(&self) -> DbResult<Vec<SyncTask>> {
        self.store.get_all_as(SYNC_QUEUE_STORE, None).await
    }

    pub async fn by_status(&self, status: TaskStatus) -> DbResult<Vec<SyncTask>> {
        self.store
            .get_by_index(
                SYNC_QUEUE_STORE,
                SYNC_QUEUE_STATUS_INDEX,
                &Value::String(status.as_str().to_string()),
            )
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(DbError::from))
            .collect()
    }

    /// Tasks a drain may pick up, in dequeue order, at most `limit`.
    ///
    /// `max_attempts == 0` means unbounded.
    pub async fn eligible(&self, max_attempts: u32, limit: usize) -> DbResult<Vec<SyncTask>> {
        let mut tasks = self.by_status(TaskStatus::Pending).await?;
        tasks.extend(self.by_status(TaskStatus::Failed).await?);

        tasks.retain(|t| t.is_eligible(max_attempts));
        tasks.sort_by(dequeue_order);
        tasks.truncate(limit);
        Ok(tasks)
    }

    /// Failed tasks that reached the attempt bound, in dequeue order.
    pub async fn stuck(&self, max_attempts: u32) -> DbResult<Vec<SyncTask>> {
        let mut tasks = self.by_status(TaskStatus::Failed).await?;
        tasks.retain(|t| t.is_stuck(max_attempts));
        tasks.sort_by(dequeue_order);
        Ok(tasks)
    }

    async fn update<F>(&self, id: &str, apply: F) -> DbResult<Option<SyncTask>>
    where
        F: FnOnce(&mut SyncTask),
    {
        let Some(mut task) = self.get(id).await? else {
            return Ok(None);
        };
        apply(&mut task);
        self.store.put_as(SYNC_QUEUE_STORE, &task).await?;
        Ok(Some(task))
    }

    pub async fn mark_in_flight(&self, id: &str) -> DbResult<Option<SyncTask>> {
        self.update(id, |t| t.status = TaskStatus::InFlight).await
    }

    /// Records a failed attempt.
    pub async fn mark_failed(&self, id: &str, error: &str) -> DbResult<Option<SyncTask>> {
        let task = self
            .update(id, |t| {
                t.status = TaskStatus::Failed;
                t.retry_count += 1;
                t.last_error = Some(error.to_string());
            })
            .await?;

        if let Some(task) = &task {
            debug!(task_id = %id, retry_count = task.retry_count, error, "Task failed");
        }
        Ok(task)
    }

    /// Returns the task to `pending` without counting an attempt.
    pub async fn mark_pending(&self, id: &str) -> DbResult<Option<SyncTask>> {
        self.update(id, |t| t.status = TaskStatus::Pending).await
    }

    /// Resets a task to `pending` with a clean attempt counter.
    pub async fn requeue(&self, id: &str) -> DbResult<Option<SyncTask>> {
        self.update(id, |t| {
            t.status = TaskStatus::Pending;
            t.retry_count = 0;
            t.last_error = None;
        })
        .await
    }

    /// Deletes a task (success or discard).
    pub async fn remove(&self, id: &str) -> DbResult<()> {
        self.store.delete(SYNC_QUEUE_STORE, id).await
    }

    /// Resets tasks left `in_flight` by an interrupted process.
    pub async fn reset_in_flight(&self) -> DbResult<usize> {
        let stranded = self.by_status(TaskStatus::InFlight).await?;
        for task in &stranded {
            self.mark_pending(&task.id).await?;
        }

        if !stranded.is_empty() {
            info!(count = stranded.len(), "Recovered in-flight tasks");
        }
        Ok(stranded.len())
    }

    /// Number of tasks still in the queue, whatever their status.
    pub async fn count(&self) -> DbResult<usize> {
        Ok(self.all().await?.len())
    }

    /// Latest `createdAt` in the queue.
    pub async fn max_created_at(&self) -> DbResult<Option<i64>> {
        Ok(self.all().await?.iter().map(|t| t.created_at).max())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fieldsync_core::{Schema, SyncOperation};
    use serde_json::json;

    use crate::engine::MemoryEngine;

    fn repo() -> SyncQueueRepository {
        LocalStore::new(Arc::new(MemoryEngine::new()), Schema::new(1)).sync_queue()
    }

    fn task(priority: i32, created_at: i64) -> SyncTask {
        SyncTask::new(
            SyncOperation::Update,
            "patients",
            json!({ "id": format!("p-{created_at}") }),
            priority,
            created_at,
        )
    }

    #[tokio::test]
    async fn test_eligible_orders_priority_then_fifo() {
        let repo = repo();
        let t1 = task(1, 1);
        let t2 = task(5, 2);
        let t3 = task(1, 3);
        for t in [&t1, &t2, &t3] {
            repo.insert(t).await.unwrap();
        }

        let batch = repo.eligible(10, 10).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![t2.id.as_str(), t1.id.as_str(), t3.id.as_str()]);

        let limited = repo.eligible(10, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_task_and_counts_attempts() {
        let repo = repo();
        let t = task(0, 1);
        repo.insert(&t).await.unwrap();

        repo.mark_in_flight(&t.id).await.unwrap();
        assert!(repo.eligible(10, 10).await.unwrap().is_empty());

        let failed = repo.mark_failed(&t.id, "503").await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("503"));

        // failed tasks are retried
        assert_eq!(repo.eligible(10, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stuck_tasks_skipped_until_requeued() {
        let repo = repo();
        let t = task(0, 1);
        repo.insert(&t).await.unwrap();

        repo.mark_failed(&t.id, "e1").await.unwrap();
        repo.mark_failed(&t.id, "e2").await.unwrap();

        assert!(repo.eligible(2, 10).await.unwrap().is_empty());
        assert_eq!(repo.stuck(2).await.unwrap().len(), 1);
        assert_eq!(repo.count().await.unwrap(), 1);

        let requeued = repo.requeue(&t.id).await.unwrap().unwrap();
        assert_eq!(requeued.retry_count, 0);
        assert_eq!(repo.eligible(2, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_in_flight_and_remove() {
        let repo = repo();
        let a = task(0, 1);
        let b = task(0, 2);
        repo.insert(&a).await.unwrap();
        repo.insert(&b).await.unwrap();
        repo.mark_in_flight(&a.id).await.unwrap();

        assert_eq!(repo.reset_in_flight().await.unwrap(), 1);
        assert_eq!(repo.by_status(TaskStatus::Pending).await.unwrap().len(), 2);

        repo.remove(&a.id).await.unwrap();
        assert!(repo.get(&a.id).await.unwrap().is_none());
        assert_eq!(repo.max_created_at().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_update_missing_task_is_none() {
        let repo = repo();
        assert!(repo.mark_failed("nope", "x").await.unwrap().is_none());
    }
}
