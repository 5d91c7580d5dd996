//! # Sync Outbox
//!
//! Durable queue of local mutations waiting to reach the server.
//!
//! ## Drain Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncOutbox::drain                                │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  sync_queue (LocalStore)                        │   │
//! │  │                                                                 │   │
//! │  │  id  | operation | store    | priority | status  | retryCount  │   │
//! │  │  ────┼───────────┼──────────┼──────────┼─────────┼──────────── │   │
//! │  │  t-1 | CREATE    | patients | 5        | pending | 0           │   │
//! │  │  t-2 | UPDATE    | visits   | 1        | failed  | 2           │   │
//! │  └────────────────────────────┬────────────────────────────────────┘   │
//! │                               │ dequeue_batch(): priority desc,         │
//! │                               ▼                  createdAt asc          │
//! │  for each task:                                                        │
//! │    1. mark in_flight                                                   │
//! │    2. RouteResolver ──► RemoteGateway.request                          │
//! │    3. ok          ──► delete task                                      │
//! │       error       ──► failed, retryCount+1, lastError, next task       │
//! │       cancelled   ──► pending, stop                                    │
//! │       AuthExpired ──► pending, stop, propagate                         │
//! │                                                                         │
//! │  Tasks at max_task_attempts are stuck: kept, skipped, reported.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use fieldsync_core::{Clock, SyncOperation, SyncTask};
use fieldsync_db::{LocalStore, SyncQueueRepository};

use crate::error::{SyncError, SyncResult};
use crate::gateway::{Method, RemoteGateway};

// =============================================================================
// Routing
// =============================================================================

/// Where and how a task is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

/// Maps a task to an HTTP call.
pub trait RouteResolver: Send + Sync {
    fn resolve(&self, task: &SyncTask) -> SyncResult<Route>;
}

/// `CREATE → POST {base}/{store}`, `UPDATE → PUT {base}/{store}/{id}`,
/// `DELETE → DELETE {base}/{store}/{id}`, where `id` is `payload.id`.
#[derive(Debug, Clone)]
pub struct RestRoutes {
    base: Url,
}

impl RestRoutes {
    pub fn new(base_url: &str) -> SyncResult<Self> {
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(SyncError::InvalidUrl(format!(
                "{base_url} cannot be used as a base URL"
            )));
        }
        Ok(RestRoutes { base })
    }
}

impl RouteResolver for RestRoutes {
    fn resolve(&self, task: &SyncTask) -> SyncResult<Route> {
        let id = match task.operation {
            SyncOperation::Create => None,
            SyncOperation::Update | SyncOperation::Delete => Some(task.entity_id().ok_or_else(|| {
                SyncError::InvalidMessage(format!("{} task has no payload.id", task.operation))
            })?),
        };

        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SyncError::InvalidUrl(self.base.to_string()))?;
            segments.pop_if_empty().push(&task.store);
            if let Some(id) = &id {
                segments.push(id);
            }
        }

        let (method, body) = match task.operation {
            SyncOperation::Create => (Method::Post, Some(task.payload.clone())),
            SyncOperation::Update => (Method::Put, Some(task.payload.clone())),
            SyncOperation::Delete => (Method::Delete, None),
        };

        Ok(Route {
            method,
            url: url.to_string(),
            body,
        })
    }
}

// =============================================================================
// Outbox
// =============================================================================

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub batch_size: usize,
    /// 0 = retry forever.
    pub max_task_attempts: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        OutboxConfig {
            batch_size: 50,
            max_task_attempts: 10,
        }
    }
}

/// What one drain did.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Delivered and removed from the queue.
    pub succeeded: Vec<SyncTask>,
    /// Failed this time; state after the failure.
    pub failed: Vec<SyncTask>,
    /// Reached the attempt bound during this drain (also in `failed`).
    pub stuck: Vec<SyncTask>,
    pub cancelled: bool,
    /// Another drain was already running.
    pub skipped: bool,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

pub struct SyncOutbox {
    queue: SyncQueueRepository,
    gateway: Arc<RemoteGateway>,
    routes: Arc<dyn RouteResolver>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    /// Last `createdAt` handed out; keeps FIFO order under a coarse clock.
    last_created_at: Mutex<Option<i64>>,
    drain_lock: Mutex<()>,
}

impl std::fmt::Debug for SyncOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOutbox")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncOutbox {
    /// Routes default to [`RestRoutes`] under the gateway's base URL.
    pub fn new(
        store: &LocalStore,
        gateway: Arc<RemoteGateway>,
        config: OutboxConfig,
    ) -> SyncResult<Self> {
        let routes = RestRoutes::new(&gateway.config().base_url)?;
        Ok(SyncOutbox {
            queue: store.sync_queue(),
            gateway,
            routes: Arc::new(routes),
            clock: store.clock().clone(),
            config,
            last_created_at: Mutex::new(None),
            drain_lock: Mutex::new(()),
        })
    }

    pub fn with_routes(mut self, routes: Arc<dyn RouteResolver>) -> Self {
        self.routes = routes;
        self
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Persists a new pending task.
    pub async fn enqueue(
        &self,
        operation: SyncOperation,
        store: &str,
        payload: Value,
        priority: i32,
    ) -> SyncResult<SyncTask> {
        let mut last = self.last_created_at.lock().await;
        let floor = match *last {
            Some(at) => at,
            None => self.queue.max_created_at().await?.unwrap_or(i64::MIN),
        };
        let created_at = self.clock.now_millis().max(floor.saturating_add(1));

        let task = SyncTask::new(operation, store, payload, priority, created_at);
        self.queue.insert(&task).await?;
        *last = Some(created_at);

        Ok(task)
    }

    /// Next tasks to send: pending or failed below the attempt bound,
    /// priority desc then createdAt asc, at most `batch_size`.
    pub async fn dequeue_batch(&self) -> SyncResult<Vec<SyncTask>> {
        Ok(self
            .queue
            .eligible(self.config.max_task_attempts, self.config.batch_size)
            .await?)
    }

    pub async fn drain(&self, cancel: Option<&CancellationToken>) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();
        self.drain_into(cancel, &mut report).await?;
        Ok(report)
    }

    /// Sends every eligible task once. Results accumulate in `report` even
    /// when the drain stops early with an error.
    pub async fn drain_into(
        &self,
        cancel: Option<&CancellationToken>,
        report: &mut DrainReport,
    ) -> SyncResult<()> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("Drain already running");
            report.skipped = true;
            return Ok(());
        };
        let cancel = cancel.cloned().unwrap_or_else(CancellationToken::new);
        let mut attempted = HashSet::new();

        loop {
            let mut batch = self
                .queue
                .eligible(self.config.max_task_attempts, usize::MAX)
                .await?;
            batch.retain(|t| !attempted.contains(&t.id));
            batch.truncate(self.config.batch_size);

            if batch.is_empty() {
                break;
            }
            debug!(count = batch.len(), "Draining batch");

            for task in batch {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    return Ok(());
                }
                attempted.insert(task.id.clone());

                self.queue.mark_in_flight(&task.id).await?;
                let result = match self.routes.resolve(&task) {
                    Ok(route) => self
                        .gateway
                        .request(route.method, &route.url, route.body, Some(&cancel))
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                };

                match result {
                    Ok(()) => {
                        self.queue.remove(&task.id).await?;
                        debug!(task_id = %task.id, operation = %task.operation, "Task delivered");
                        report.succeeded.push(task);
                    }
                    Err(SyncError::Cancelled) => {
                        self.queue.mark_pending(&task.id).await?;
                        info!(task_id = %task.id, "Drain cancelled");
                        report.cancelled = true;
                        return Ok(());
                    }
                    Err(SyncError::AuthExpired) => {
                        self.queue.mark_pending(&task.id).await?;
                        warn!(task_id = %task.id, "Session expired during drain");
                        return Err(SyncError::AuthExpired);
                    }
                    Err(e) => {
                        let Some(failed) = self.queue.mark_failed(&task.id, &e.to_string()).await?
                        else {
                            continue;
                        };
                        warn!(
                            task_id = %failed.id,
                            retry_count = failed.retry_count,
                            error = %e,
                            "Task failed"
                        );
                        if failed.is_stuck(self.config.max_task_attempts) {
                            warn!(task_id = %failed.id, "Task reached the attempt bound");
                            report.stuck.push(failed.clone());
                        }
                        report.failed.push(failed);
                    }
                }
            }
        }

        if report.attempted() > 0 {
            info!(
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                "Outbox drained"
            );
        }
        Ok(())
    }

    /// Tasks parked at the attempt bound.
    pub async fn stuck_tasks(&self) -> SyncResult<Vec<SyncTask>> {
        Ok(self.queue.stuck(self.config.max_task_attempts).await?)
    }

    /// Gives a task a fresh set of attempts. Returns false if unknown.
    pub async fn requeue(&self, id: &str) -> SyncResult<bool> {
        let found = self.queue.requeue(id).await?.is_some();
        if found {
            info!(task_id = id, "Task requeued");
        }
        Ok(found)
    }

    /// Drops a task for good. Returns false if unknown.
    pub async fn discard(&self, id: &str) -> SyncResult<bool> {
        if self.queue.get(id).await?.is_none() {
            return Ok(false);
        }
        self.queue.remove(id).await?;
        info!(task_id = id, "Task discarded");
        Ok(true)
    }

    /// Returns tasks a crash left `in_flight` to `pending`.
    pub async fn recover_in_flight(&self) -> SyncResult<usize> {
        Ok(self.queue.reset_in_flight().await?)
    }

    /// Tasks still queued, stuck ones included.
    pub async fn pending_count(&self) -> SyncResult<usize> {
        Ok(self.queue.count().await?)
    }

    /// Queued tasks that mutate `store`/`id`.
    pub async fn queued_for(&self, store: &str, id: &str) -> SyncResult<usize> {
        Ok(self
            .queue
            .all()
            .await?
            .iter()
            .filter(|t| t.store == store && t.entity_id().as_deref() == Some(id))
            .count())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fieldsync_core::{ManualClock, Schema, TaskStatus};
    use fieldsync_db::MemoryEngine;
    use serde_json::json;

    use crate::auth::TokenStore;
    use crate::gateway::tests::ScriptedClient;
    use crate::gateway::{GatewayConfig, HttpResponse};

    fn store(clock: &ManualClock) -> LocalStore {
        LocalStore::new(Arc::new(MemoryEngine::new()), Schema::new(1))
            .with_clock(Arc::new(clock.clone()))
    }

    fn outbox(store: &LocalStore, client: Arc<ScriptedClient>, max_attempts: u32) -> SyncOutbox {
        let config = GatewayConfig {
            base_url: "https://api.test/v1".into(),
            refresh_url: "https://api.test/v1/auth/refresh".into(),
            max_retries: 0,
            ..Default::default()
        };
        let gateway = RemoteGateway::new(
            client,
            TokenStore::new(Some("a".into()), Some("r".into())),
            config,
        )
        .with_policy(Arc::new(|_: u32| Duration::from_millis(1)));

        SyncOutbox::new(
            store,
            Arc::new(gateway),
            OutboxConfig {
                batch_size: 10,
                max_task_attempts: max_attempts,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_rest_routes() {
        let routes = RestRoutes::new("https://api.test/v1/").unwrap();
        let payload = json!({ "id": "p 1", "name": "Amina" });

        let create = SyncTask::new(SyncOperation::Create, "patients", payload.clone(), 0, 1);
        let route = routes.resolve(&create).unwrap();
        assert_eq!(route.method, Method::Post);
        assert_eq!(route.url, "https://api.test/v1/patients");
        assert_eq!(route.body, Some(payload.clone()));

        let update = SyncTask::new(SyncOperation::Update, "patients", payload.clone(), 0, 1);
        let route = routes.resolve(&update).unwrap();
        assert_eq!(route.method, Method::Put);
        assert_eq!(route.url, "https://api.test/v1/patients/p%201");

        let delete = SyncTask::new(SyncOperation::Delete, "patients", json!({ "id": 7 }), 0, 1);
        let route = routes.resolve(&delete).unwrap();
        assert_eq!(route.method, Method::Delete);
        assert_eq!(route.url, "https://api.test/v1/patients/7");
        assert!(route.body.is_none());

        let no_id = SyncTask::new(SyncOperation::Update, "patients", json!({}), 0, 1);
        assert!(matches!(routes.resolve(&no_id), Err(SyncError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn test_enqueue_keeps_fifo_under_frozen_clock() {
        let clock = ManualClock::new(1_000);
        let store = store(&clock);
        let outbox = outbox(&store, Arc::new(ScriptedClient::default()), 10);

        let mut created = Vec::new();
        for i in 0..3 {
            let task = outbox
                .enqueue(SyncOperation::Create, "patients", json!({ "id": i }), 0)
                .await
                .unwrap();
            assert_eq!(task.status, TaskStatus::Pending);
            assert_eq!(task.retry_count, 0);
            created.push(task.created_at);
        }
        assert_eq!(created, vec![1_000, 1_001, 1_002]);
        assert_eq!(outbox.pending_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_dequeue_batch_priority_then_fifo() {
        let clock = ManualClock::new(1);
        let store = store(&clock);
        let outbox = outbox(&store, Arc::new(ScriptedClient::default()), 10);

        let mut ids = Vec::new();
        for priority in [1, 5, 1] {
            let task = outbox
                .enqueue(SyncOperation::Update, "patients", json!({ "id": "p" }), priority)
                .await
                .unwrap();
            ids.push(task.id);
            clock.advance(10);
        }

        let batch: Vec<_> = outbox
            .dequeue_batch()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(batch, vec![ids[1].clone(), ids[0].clone(), ids[2].clone()]);
    }

    #[tokio::test]
    async fn test_drain_all_success_empties_queue() {
        let clock = ManualClock::new(1);
        let store = store(&clock);
        let client = Arc::new(ScriptedClient::default());
        let outbox = outbox(&store, client.clone(), 10);

        outbox
            .enqueue(SyncOperation::Create, "patients", json!({ "id": "p-1" }), 0)
            .await
            .unwrap();
        outbox
            .enqueue(SyncOperation::Update, "patients", json!({ "id": "p-2" }), 0)
            .await
            .unwrap();
        outbox
            .enqueue(SyncOperation::Delete, "patients", json!({ "id": "p-3" }), 0)
            .await
            .unwrap();

        let report = outbox.drain(None).await.unwrap();
        assert_eq!(report.succeeded.len(), 3);
        assert_eq!(outbox.pending_count().await.unwrap(), 0);

        let sent: Vec<_> = client
            .sent()
            .into_iter()
            .map(|r| (r.method, r.url))
            .collect();
        assert_eq!(
            sent,
            vec![
                (Method::Post, "https://api.test/v1/patients".to_string()),
                (Method::Put, "https://api.test/v1/patients/p-2".to_string()),
                (Method::Delete, "https://api.test/v1/patients/p-3".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let clock = ManualClock::new(1);
        let store = store(&clock);
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(HttpResponse::new(503, "")),
            Ok(HttpResponse::new(200, "{}")),
        ]));
        let outbox = outbox(&store, client, 10);

        let first = outbox
            .enqueue(SyncOperation::Create, "patients", json!({ "id": "p-1" }), 5)
            .await
            .unwrap();
        outbox
            .enqueue(SyncOperation::Create, "patients", json!({ "id": "p-2" }), 0)
            .await
            .unwrap();

        let report = outbox.drain(None).await.unwrap();
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.failed.len(), 1);

        let failed = store.sync_queue().get(&first.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("Server error 503"));
        assert_eq!(outbox.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stuck_tasks_and_escape_hatches() {
        let clock = ManualClock::new(1);
        let store = store(&clock);
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(HttpResponse::new(500, "")),
            Ok(HttpResponse::new(500, "")),
        ]));
        let outbox = outbox(&store, client.clone(), 2);

        let task = outbox
            .enqueue(SyncOperation::Create, "patients", json!({ "id": "p-1" }), 0)
            .await
            .unwrap();

        assert!(outbox.drain(None).await.unwrap().stuck.is_empty());
        let second = outbox.drain(None).await.unwrap();
        assert_eq!(second.stuck.len(), 1);

        // parked: not sent again
        let third = outbox.drain(None).await.unwrap();
        assert_eq!(third.attempted(), 0);
        assert_eq!(client.sent().len(), 2);
        assert_eq!(outbox.stuck_tasks().await.unwrap().len(), 1);

        assert!(outbox.requeue(&task.id).await.unwrap());
        assert_eq!(outbox.dequeue_batch().await.unwrap().len(), 1);

        assert!(outbox.discard(&task.id).await.unwrap());
        assert!(!outbox.discard(&task.id).await.unwrap());
        assert_eq!(outbox.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_auth_expired_aborts_drain() {
        let clock = ManualClock::new(1);
        let store = store(&clock);
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(HttpResponse::new(401, "")),
            Ok(HttpResponse::new(401, "refresh token revoked")),
        ]));
        let outbox = outbox(&store, client.clone(), 10);

        let first = outbox
            .enqueue(SyncOperation::Create, "patients", json!({ "id": "p-1" }), 0)
            .await
            .unwrap();
        outbox
            .enqueue(SyncOperation::Create, "patients", json!({ "id": "p-2" }), 0)
            .await
            .unwrap();

        let err = outbox.drain(None).await.unwrap_err();
        assert!(matches!(err, SyncError::AuthExpired));

        let task = store.sync_queue().get(&first.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        // request + refresh, second task untouched
        assert_eq!(client.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_returns_task_to_pending() {
        let clock = ManualClock::new(1);
        let store = store(&clock);
        let client = Arc::new(ScriptedClient::hanging());
        let outbox = Arc::new(outbox(&store, client.clone(), 10));

        let task = outbox
            .enqueue(SyncOperation::Create, "patients", json!({ "id": "p-1" }), 0)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let drain = {
            let outbox = outbox.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { outbox.drain(Some(&cancel)).await })
        };
        while client.sent().is_empty() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let report = drain.await.unwrap().unwrap();
        assert!(report.cancelled);

        let task = store.sync_queue().get(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_recover_in_flight() {
        let clock = ManualClock::new(1);
        let store = store(&clock);
        let outbox = outbox(&store, Arc::new(ScriptedClient::default()), 10);

        let task = outbox
            .enqueue(SyncOperation::Create, "patients", json!({ "id": "p-1" }), 0)
            .await
            .unwrap();
        store.sync_queue().mark_in_flight(&task.id).await.unwrap();
        assert!(outbox.dequeue_batch().await.unwrap().is_empty());

        assert_eq!(outbox.recover_in_flight().await.unwrap(), 1);
        assert_eq!(outbox.dequeue_batch().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unroutable_task_fails_without_request() {
        let clock = ManualClock::new(1);
        let store = store(&clock);
        let client = Arc::new(ScriptedClient::default());
        let outbox = outbox(&store, client.clone(), 10);

        outbox
            .enqueue(SyncOperation::Update, "patients", json!({ "name": "no id" }), 0)
            .await
            .unwrap();

        let report = outbox.drain(None).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(client.sent().is_empty());
    }
}
