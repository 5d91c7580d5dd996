//! # FieldSync Field Agent
//!
//! Headless process that keeps a device's local store in sync with the
//! clinic server.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. tracing (RUST_LOG, default info)                                   │
//! │  2. SyncConfig::load_or_default (file → FIELDSYNC_* env)               │
//! │  3. SQLite health check, LocalStore init()                             │
//! │  4. TokenStore from FIELDSYNC_ACCESS_TOKEN / FIELDSYNC_REFRESH_TOKEN   │
//! │  5. RemoteGateway → SyncOutbox, RealtimeChannel                        │
//! │  6. SyncCoordinator.start(), channel.connect()                         │
//! │  7. Ctrl+C → teardown(), close store                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use fieldsync_db::{DbConfig, LocalStore, SqliteEngine};
use fieldsync_sync::{
    AuthObserver, ChannelEmitter, RealtimeChannel, RemoteGateway, ReqwestClient, SyncConfig,
    SyncCoordinator, SyncEvent, SyncOutbox, TokenStore, WebSocketConnector,
};

/// Logs session expiry; the agent has no sign-in flow of its own.
struct LogSessionObserver;

impl AuthObserver for LogSessionObserver {
    fn on_session_expired(&self, reason: &str) {
        warn!(reason, "Session expired, new credentials required");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    info!("Starting FieldSync agent...");

    let config = SyncConfig::load_or_default(None);
    let db_path = config.database_path();
    info!(
        base_url = %config.remote.base_url,
        realtime_url = %config.realtime.url,
        db_path = %db_path.display(),
        "Configuration loaded"
    );

    // Storage
    let engine = SqliteEngine::connect(&DbConfig::new(&db_path)).await?;
    engine.health_check().await?;
    let store = LocalStore::new(Arc::new(engine), config.schema());
    store.init().await?;

    // Network
    let tokens = TokenStore::from_env();
    if !tokens.has_access_token().await {
        warn!("No access token configured; requests will be rejected until one is set");
    }
    let observer: Arc<dyn AuthObserver> = Arc::new(LogSessionObserver);
    let policy = Arc::new(config.retry_policy());

    let gateway = RemoteGateway::new(
        Arc::new(ReqwestClient::new()?),
        tokens.clone(),
        config.gateway_config(),
    )
    .with_observer(observer.clone())
    .with_policy(policy.clone());

    let channel = RealtimeChannel::builder(
        Arc::new(WebSocketConnector),
        tokens,
        config.channel_config(),
    )
    .with_observer(observer)
    .with_policy(policy)
    .build();

    let outbox = SyncOutbox::new(&store, Arc::new(gateway), config.outbox_config())?;

    // Coordinator
    let (emitter, events) = ChannelEmitter::new(256);
    let coordinator = SyncCoordinator::builder(store.clone(), Arc::new(outbox))
        .with_channel(channel.clone())
        .with_emitter(Arc::new(emitter))
        .drain_interval(config.drain_interval())
        .build();

    let reporter = tokio::spawn(report_events(events));

    coordinator.start().await?;
    if let Err(e) = channel.connect(None).await {
        warn!(?e, "Realtime channel not connected yet");
    }

    shutdown_signal().await;

    coordinator.teardown().await;
    reporter.abort();
    store.close().await;

    info!("FieldSync agent stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fieldsync=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Stands in for a UI: logs every sync event.
async fn report_events(mut events: broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(SyncEvent::Progress {
                pending,
                succeeded,
                failed,
            }) => info!(pending, succeeded, failed, "Sync progress"),
            Ok(SyncEvent::TaskStuck {
                task_id,
                store,
                retry_count,
                last_error,
            }) => warn!(%task_id, %store, retry_count, ?last_error, "Task stuck"),
            Ok(SyncEvent::SessionExpired { reason }) => warn!(%reason, "Session expired"),
            Ok(SyncEvent::Error { message }) => warn!(%message, "Sync error"),
            Ok(event) => debug!(?event, "Sync event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event reporter lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Waits for Ctrl+C (or SIGTERM on unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping...");
}
