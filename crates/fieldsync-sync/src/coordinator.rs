//! # Sync Coordinator
//!
//! Wires the outbox, the realtime channel and the local store together and
//! runs the background loops.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncCoordinator                                  │
//! │                                                                         │
//! │  UI ── submit() ──► records (pending) ──► SyncOutbox.enqueue           │
//! │                                                                         │
//! │  ┌──────────────── drain loop ───────────────────────────────────────┐ │
//! │  │  wakes on: interval tick │ notify_online() │ channel → Connected  │ │
//! │  │  notify_online() also restarts a Failed channel                    │ │
//! │  │  SyncOutbox.drain ──► records synced / failed ──► Progress event   │ │
//! │  │  AuthExpired ──► SessionExpired event                              │ │
//! │  └────────────────────────────────────────────────────────────────────┘ │
//! │                                                                         │
//! │  ┌──────────────── inbound loop ─────────────────────────────────────┐ │
//! │  │  record:upsert {store, record}            ──► LWW upsert          │ │
//! │  │  record:delete {store, id, lastModified}  ──► LWW delete          │ │
//! │  │  applied ──► invalidate "{store}:{id}", "{store}:{id}:*"          │ │
//! │  │          ──► Refresh event                                         │ │
//! │  └────────────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Inbound changes are applied in arrival order. They do not look at
//! outbound tasks still queued for the same record; last-write-wins on
//! `lastModified` is the only conflict rule.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fieldsync_core::{entity_id_of, Record, RecordStatus, SyncOperation, SyncTask};
use fieldsync_db::{LocalStore, RecordRepository};

use crate::channel::{
    ChannelPhase, ChannelState, HandlerId, RealtimeChannel, EVENT_CONNECT_ERROR, EVENT_ERROR,
    EVENT_RECONNECT_FAILED, EVENT_UNAUTHORIZED,
};
use crate::error::{SyncError, SyncResult};
use crate::events::{NoOpEmitter, SyncEvent, SyncEventEmitter};
use crate::outbox::{DrainReport, SyncOutbox};

/// Server pushed a new or changed record.
pub const EVENT_RECORD_UPSERT: &str = "record:upsert";

/// Server deleted a record.
pub const EVENT_RECORD_DELETE: &str = "record:delete";

const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct UpsertMessage {
    store: String,
    record: Record,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteMessage {
    store: String,
    id: String,
    last_modified: i64,
}

enum Inbound {
    Upsert(Value),
    Delete(Value),
}

enum Wake {
    Shutdown,
    Tick,
    Online,
    Channel(Option<ChannelState>),
}

struct Running {
    tasks: Vec<JoinHandle<()>>,
    handlers: Vec<(&'static str, HandlerId)>,
}

struct CoordinatorInner {
    store: LocalStore,
    records: RecordRepository,
    outbox: Arc<SyncOutbox>,
    channel: Option<RealtimeChannel>,
    emitter: Arc<dyn SyncEventEmitter>,
    drain_interval: Duration,
    online: Notify,
    shutdown: CancellationToken,
}

// =============================================================================
// Builder
// =============================================================================

pub struct SyncCoordinatorBuilder {
    store: LocalStore,
    outbox: Arc<SyncOutbox>,
    channel: Option<RealtimeChannel>,
    emitter: Arc<dyn SyncEventEmitter>,
    drain_interval: Duration,
}

impl SyncCoordinatorBuilder {
    /// Without a channel only the timer and `notify_online` trigger drains.
    pub fn with_channel(mut self, channel: RealtimeChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    pub fn build(self) -> SyncCoordinator {
        SyncCoordinator {
            inner: Arc::new(CoordinatorInner {
                records: self.store.records(),
                store: self.store,
                outbox: self.outbox,
                channel: self.channel,
                emitter: self.emitter,
                drain_interval: self.drain_interval,
                online: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
            running: Mutex::new(None),
        }
    }
}

// =============================================================================
// SyncCoordinator
// =============================================================================

pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("drain_interval", &self.inner.drain_interval)
            .field("channel", &self.inner.channel.is_some())
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    pub fn builder(store: LocalStore, outbox: Arc<SyncOutbox>) -> SyncCoordinatorBuilder {
        SyncCoordinatorBuilder {
            store,
            outbox,
            channel: None,
            emitter: Arc::new(NoOpEmitter),
            drain_interval: DEFAULT_DRAIN_INTERVAL,
        }
    }

    pub fn outbox(&self) -> &Arc<SyncOutbox> {
        &self.inner.outbox
    }

    pub fn channel(&self) -> Option<&RealtimeChannel> {
        self.inner.channel.as_ref()
    }

    /// Recovers interrupted tasks, subscribes to server changes and spawns
    /// the drain and inbound loops. Calling it again is a no-op.
    pub async fn start(&self) -> SyncResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(SyncError::ShuttingDown);
        }

        self.inner.store.init().await?;
        let recovered = self.inner.outbox.recover_in_flight().await?;
        if recovered > 0 {
            info!(recovered, "Returned interrupted tasks to the queue");
        }

        let mut tasks = Vec::new();
        let mut handlers = Vec::new();

        if let Some(channel) = &self.inner.channel {
            let (tx, rx) = mpsc::unbounded_channel();

            let upserts = tx.clone();
            let id = channel
                .on(EVENT_RECORD_UPSERT, move |payload: &Value| {
                    let _ = upserts.send(Inbound::Upsert(payload.clone()));
                })
                .await;
            handlers.push((EVENT_RECORD_UPSERT, id));

            let id = channel
                .on(EVENT_RECORD_DELETE, move |payload: &Value| {
                    let _ = tx.send(Inbound::Delete(payload.clone()));
                })
                .await;
            handlers.push((EVENT_RECORD_DELETE, id));

            let emitter = self.inner.emitter.clone();
            let id = channel
                .on(EVENT_UNAUTHORIZED, move |_: &Value| {
                    emitter.emit(SyncEvent::SessionExpired {
                        reason: "realtime channel unauthorized".into(),
                    });
                })
                .await;
            handlers.push((EVENT_UNAUTHORIZED, id));

            for event in [EVENT_CONNECT_ERROR, EVENT_ERROR, EVENT_RECONNECT_FAILED] {
                let id = channel
                    .on(event, move |payload: &Value| {
                        warn!(event, %payload, "Realtime channel problem");
                    })
                    .await;
                handlers.push((event, id));
            }

            tasks.push(tokio::spawn(inbound_loop(self.inner.clone(), rx)));
        }

        tasks.push(tokio::spawn(drain_loop(self.inner.clone())));
        *running = Some(Running { tasks, handlers });

        info!(
            drain_interval_secs = self.inner.drain_interval.as_secs(),
            "Sync coordinator started"
        );
        Ok(())
    }

    /// Connectivity came back; drain soon and restart a channel that gave
    /// up reconnecting.
    pub fn notify_online(&self) {
        debug!("Online signal received");
        self.inner.online.notify_one();
    }

    /// Records a local change and queues it for upload.
    ///
    /// The record is written before the task, so a crash in between leaves
    /// a pending record that can be submitted again.
    pub async fn submit(
        &self,
        operation: SyncOperation,
        store: &str,
        payload: Value,
        priority: i32,
    ) -> SyncResult<SyncTask> {
        let id = entity_id_of(&payload)
            .ok_or_else(|| SyncError::InvalidMessage(format!("{operation} payload has no id")))?;

        match operation {
            SyncOperation::Create | SyncOperation::Update => {
                let now = self.inner.store.clock().now_millis();
                let record = Record::pending(id.as_str(), payload.clone(), now);
                self.inner.records.save(store, &record).await?;
            }
            SyncOperation::Delete => self.inner.records.remove(store, &id).await?,
        }

        let task = self
            .inner
            .outbox
            .enqueue(operation, store, payload, priority)
            .await?;
        debug!(task_id = %task.id, %operation, store, id = %id, "Change submitted");
        Ok(task)
    }

    /// Drains the outbox now and settles record statuses.
    pub async fn drain_now(&self) -> SyncResult<DrainReport> {
        self.inner.drain().await
    }

    /// Stops the loops, unsubscribes and disconnects the channel.
    pub async fn teardown(&self) {
        self.inner.shutdown.cancel();

        let running = self.running.lock().await.take();
        if let Some(running) = running {
            for task in running.tasks {
                if let Err(e) = task.await {
                    error!(?e, "Coordinator task panicked");
                }
            }
            if let Some(channel) = &self.inner.channel {
                for (event, id) in running.handlers {
                    channel.off(event, id).await;
                }
            }
        }

        if let Some(channel) = &self.inner.channel {
            channel.disconnect().await;
        }
        info!("Sync coordinator stopped");
    }
}

// =============================================================================
// Internals
// =============================================================================

impl CoordinatorInner {
    /// Restarts a channel that stopped retrying. Runs detached so the drain
    /// does not wait on the handshake.
    fn revive_channel(&self) {
        let Some(channel) = self.channel.clone() else {
            return;
        };
        if channel.phase() != ChannelPhase::Failed {
            return;
        }

        info!("Restarting realtime channel after online signal");
        tokio::spawn(async move {
            if let Err(e) = channel.connect(None).await {
                warn!(?e, "Realtime channel still unreachable");
            }
        });
    }

    async fn drain(&self) -> SyncResult<DrainReport> {
        let cancel = self.shutdown.child_token();
        let mut report = DrainReport::default();
        let result = self.outbox.drain_into(Some(&cancel), &mut report).await;

        if report.skipped {
            return result.map(|()| report);
        }

        for task in &report.succeeded {
            if let Err(e) = self.settle(task, RecordStatus::Synced).await {
                warn!(?e, task_id = %task.id, "Failed to mark record synced");
            }
        }
        for task in &report.failed {
            if let Err(e) = self.settle(task, RecordStatus::Failed).await {
                warn!(?e, task_id = %task.id, "Failed to mark record failed");
            }
        }

        for task in &report.stuck {
            self.emitter.emit(SyncEvent::TaskStuck {
                task_id: task.id.clone(),
                store: task.store.clone(),
                retry_count: task.retry_count,
                last_error: task.last_error.clone(),
            });
        }

        match self.outbox.pending_count().await {
            Ok(pending) => self.emitter.emit(SyncEvent::Progress {
                pending,
                succeeded: report.succeeded.len(),
                failed: report.failed.len(),
            }),
            Err(e) => warn!(?e, "Failed to count queued tasks"),
        }

        match result {
            Ok(()) => Ok(report),
            Err(SyncError::AuthExpired) => {
                self.emitter.emit(SyncEvent::SessionExpired {
                    reason: "session expired during sync".into(),
                });
                Err(SyncError::AuthExpired)
            }
            Err(e) => {
                self.emitter.emit(SyncEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Updates the record a task carried, unless a later local edit has
    /// replaced it since.
    async fn settle(&self, task: &SyncTask, status: RecordStatus) -> SyncResult<()> {
        if task.operation == SyncOperation::Delete {
            return Ok(());
        }
        let Some(id) = task.entity_id() else {
            return Ok(());
        };
        let Some(mut record) = self.records.get(&task.store, &id).await? else {
            return Ok(());
        };

        if record.last_modified > task.created_at || record.sync_status == status {
            return Ok(());
        }
        if status == RecordStatus::Synced && self.outbox.queued_for(&task.store, &id).await? > 0 {
            return Ok(());
        }

        record.sync_status = status;
        self.records.save(&task.store, &record).await?;
        Ok(())
    }

    async fn apply_inbound(&self, message: Inbound) -> SyncResult<()> {
        match message {
            Inbound::Upsert(payload) => {
                let UpsertMessage { store, mut record } = serde_json::from_value(payload)?;
                record.sync_status = RecordStatus::Synced;

                if self.records.upsert_if_newer(&store, &record).await? {
                    debug!(%store, id = %record.id, "Applied server upsert");
                    self.refresh(&store, &record.id).await?;
                }
            }
            Inbound::Delete(payload) => {
                let DeleteMessage {
                    store,
                    id,
                    last_modified,
                } = serde_json::from_value(payload)?;

                if self.records.delete_if_not_newer(&store, &id, last_modified).await? {
                    debug!(%store, %id, "Applied server delete");
                    self.refresh(&store, &id).await?;
                }
            }
        }
        Ok(())
    }

    async fn refresh(&self, store: &str, id: &str) -> SyncResult<()> {
        let key = format!("{store}:{id}");
        self.store.invalidate_cache(&key).await?;
        self.store.invalidate_cache_prefix(&format!("{key}:")).await?;

        self.emitter.emit(SyncEvent::Refresh {
            store: store.to_string(),
            id: id.to_string(),
        });
        Ok(())
    }
}

async fn inbound_loop(inner: Arc<CoordinatorInner>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    loop {
        let message = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if let Err(e) = inner.apply_inbound(message).await {
            warn!(?e, "Failed to apply server change");
            inner.emitter.emit(SyncEvent::Error {
                message: e.to_string(),
            });
        }
    }
    debug!("Inbound loop stopped");
}

async fn drain_loop(inner: Arc<CoordinatorInner>) {
    let mut ticker = tokio::time::interval(inner.drain_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut state_rx = inner.channel.as_ref().map(RealtimeChannel::subscribe_state);
    let mut was_connected = inner
        .channel
        .as_ref()
        .is_some_and(RealtimeChannel::is_connected);

    loop {
        let wake = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => Wake::Shutdown,
            changed = next_state(&mut state_rx) => Wake::Channel(changed),
            _ = inner.online.notified() => Wake::Online,
            _ = ticker.tick() => Wake::Tick,
        };

        match wake {
            Wake::Shutdown => break,
            Wake::Tick => {}
            Wake::Online => {
                debug!("Draining after online signal");
                inner.revive_channel();
            }
            Wake::Channel(None) => {
                state_rx = None;
                continue;
            }
            Wake::Channel(Some(state)) => {
                inner.emitter.emit(SyncEvent::ChannelState(state));
                let connected = state.phase == ChannelPhase::Connected;
                let came_online = connected && !was_connected;
                was_connected = connected;
                if !came_online {
                    continue;
                }
                debug!("Draining after channel connected");
            }
        }

        match inner.drain().await {
            Ok(_) | Err(SyncError::AuthExpired) => {}
            Err(e) => warn!(?e, "Drain failed"),
        }
    }
    debug!("Drain loop stopped");
}

/// Next channel state, or `None` once the channel is gone. Never resolves
/// without a channel.
async fn next_state(rx: &mut Option<watch::Receiver<ChannelState>>) -> Option<ChannelState> {
    match rx {
        Some(rx) => {
            rx.changed().await.ok()?;
            let state = *rx.borrow_and_update();
            Some(state)
        }
        None => std::future::pending().await,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
