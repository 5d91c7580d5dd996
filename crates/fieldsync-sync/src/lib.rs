//! # fieldsync-sync: Sync Engine for FieldSync
//!
//! Keeps the local store and the clinic server in step: queued local
//! changes go up over HTTP, server changes come down over a realtime
//! channel.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncCoordinator (Main Orchestrator)              │  │
//! │  │                                                                  │  │
//! │  │  Built by the app's composition root                            │  │
//! │  │  Drain loop + inbound loop, explicit start()/teardown()         │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   SyncOutbox   │  │ RemoteGateway  │  │  RealtimeChannel       │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Durable queue  │─►│ Bearer auth,   │  │ WebSocket with auth    │    │
//! │  │ priority+FIFO  │  │ refresh once,  │  │ handshake, reconnect,  │    │
//! │  │ stuck tasks    │  │ 429/5xx retry  │  │ emit buffer, acks      │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  EVENTS (to the UI layer via SyncEventEmitter):                        │
//! │  • progress       - after every drain                                  │
//! │  • taskStuck      - a task reached its attempt bound                   │
//! │  • refresh        - a server change was applied locally                │
//! │  • sessionExpired - credentials are gone                               │
//! │  • channelState   - realtime phase transitions                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`coordinator`] - `SyncCoordinator` orchestrator
//! - [`outbox`] - Sync queue drain and REST routing
//! - [`gateway`] - Authenticated HTTP with refresh and retry
//! - [`channel`] - Realtime channel with reconnection
//! - [`auth`] - Shared token store and session observer
//! - [`backoff`] - `BackoffPolicy` adapter for the `backoff` crate
//! - [`config`] - TOML configuration with env overrides
//! - [`events`] - Events for the UI layer
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldsync_sync::{SyncConfig, SyncCoordinator};
//!
//! let config = SyncConfig::load_or_default(None);
//! let coordinator = SyncCoordinator::builder(store, outbox)
//!     .with_channel(channel)
//!     .drain_interval(config.drain_interval())
//!     .build();
//!
//! coordinator.start().await?;
//! coordinator
//!     .submit(SyncOperation::Create, "patients", json!({ "id": "p-1" }), 0)
//!     .await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod auth;
pub mod backoff;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod gateway;
pub mod outbox;

// =============================================================================
// Re-exports
// =============================================================================

pub use auth::{AuthObserver, Credentials, NoOpAuthObserver, TokenStore};
pub use backoff::PolicyBackoff;
pub use channel::{
    ChannelConfig, ChannelConnector, ChannelFrame, ChannelLink, ChannelPhase, ChannelState,
    HandlerId, RealtimeChannel, RealtimeChannelBuilder, WebSocketConnector,
};
pub use config::{OutboxSettings, RealtimeSettings, RemoteSettings, StorageSettings, SyncConfig};
pub use coordinator::{
    SyncCoordinator, SyncCoordinatorBuilder, EVENT_RECORD_DELETE, EVENT_RECORD_UPSERT,
};
pub use error::{SyncError, SyncResult};
pub use events::{ChannelEmitter, NoOpEmitter, SyncEvent, SyncEventEmitter};
pub use gateway::{
    GatewayConfig, HttpClient, HttpRequest, HttpResponse, Method, RemoteGateway, ReqwestClient,
};
pub use outbox::{DrainReport, OutboxConfig, RestRoutes, Route, RouteResolver, SyncOutbox};
