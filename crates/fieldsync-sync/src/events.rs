//! # Sync Events
//!
//! Notifications for the UI layer. The coordinator never talks to the UI
//! directly; it goes through a [`SyncEventEmitter`].
//!
//! ```text
//! SyncCoordinator ──emit(SyncEvent)──► SyncEventEmitter
//!                                        ├── NoOpEmitter      (headless, tests)
//!                                        └── ChannelEmitter   (tokio broadcast,
//!                                                              any number of
//!                                                              subscribers)
//! ```

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::channel::ChannelState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// After every drain.
    #[serde(rename_all = "camelCase")]
    Progress {
        pending: usize,
        succeeded: usize,
        failed: usize,
    },

    /// A task hit the attempt bound and is parked.
    #[serde(rename_all = "camelCase")]
    TaskStuck {
        task_id: String,
        store: String,
        retry_count: u32,
        last_error: Option<String>,
    },

    /// A server change was applied locally; views of this record are stale.
    Refresh { store: String, id: String },

    /// Credentials are gone; the user must sign in again.
    SessionExpired { reason: String },

    ChannelState(ChannelState),

    /// A drain or inbound apply failed for a non-session reason.
    Error { message: String },
}

/// Receives sync events.
pub trait SyncEventEmitter: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

/// Emitter that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit(&self, _event: SyncEvent) {}
}

/// Fans events out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    tx: broadcast::Sender<SyncEvent>,
}

impl ChannelEmitter {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<SyncEvent>) {
        let (tx, rx) = broadcast::channel(capacity);
        (ChannelEmitter { tx }, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl SyncEventEmitter for ChannelEmitter {
    fn emit(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            trace!("No sync event subscribers");
        }
    }
}
