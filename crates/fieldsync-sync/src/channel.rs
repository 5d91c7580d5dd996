//! # Realtime Channel
//!
//! Authenticated, auto-reconnecting event channel to the server with a
//! bounded outbound buffer and acknowledgements.
//!
//! ## Connection States
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     RealtimeChannel Phases                              │
//! │                                                                         │
//! │  Disconnected ──connect()──► Connecting ──connected──► Connected       │
//! │       ▲                          │                         │            │
//! │       │                   connect_error               link dropped     │
//! │       │                          ▼                         │            │
//! │       │                    Reconnecting ◄──────────────────┘            │
//! │       │                    (attempt+1, wait backoff)                    │
//! │       │                          │                                      │
//! │       │                   attempts exhausted ──► Failed                 │
//! │       │                                                                 │
//! │       ├── disconnect() from any phase                                  │
//! │       └── server `unauthorized`: credentials cleared, no reconnect     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! JSON text frames `{"event": "...", "payload": ..., "ackId": 7}`. The
//! token travels as a `token` query parameter and again in the first
//! `auth` frame; the server answers `connected`, `connect_error` or
//! `unauthorized`. Acknowledgements come back as `ack` frames carrying the
//! same `ackId`.
//!
//! ## Outbound Buffer
//! While not connected, emits queue in a FIFO of at most `buffer_capacity`
//! frames (oldest dropped first). On every (re)connection the buffer is
//! flushed in order under the same lock that gates new emits, so nothing
//! overtakes it.
//!
//! ## Heartbeat
//! While connected, a `ping` goes out every `ping_interval`. A ping left
//! unanswered for `ping_timeout` counts as a dropped link and the channel
//! moves to `Reconnecting`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use fieldsync_core::{BackoffPolicy, ExponentialPolicy};

use crate::auth::{AuthObserver, NoOpAuthObserver, TokenStore};
use crate::backoff::PolicyBackoff;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Reserved Events
// =============================================================================

pub const EVENT_AUTH: &str = "auth";
pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_CONNECT_ERROR: &str = "connect_error";
pub const EVENT_UNAUTHORIZED: &str = "unauthorized";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_ACK: &str = "ack";
pub const EVENT_PING: &str = "ping";
/// Local only: dispatched when reconnect attempts run out.
pub const EVENT_RECONNECT_FAILED: &str = "reconnect_failed";

// =============================================================================
// Frames and Transport Seam
// =============================================================================

/// One message on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ackId", default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
}

impl ChannelFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        ChannelFrame {
            event: event.into(),
            payload,
            ack_id: None,
        }
    }

    pub fn with_ack(mut self, ack_id: u64) -> Self {
        self.ack_id = Some(ack_id);
        self
    }
}

/// An open connection as a pair of frame queues. The connection is over
/// when `inbound` yields `None`; dropping `outbound` closes it.
#[derive(Debug)]
pub struct ChannelLink {
    pub outbound: mpsc::UnboundedSender<ChannelFrame>,
    pub inbound: mpsc::UnboundedReceiver<ChannelFrame>,
}

/// Opens transport connections for the channel.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> SyncResult<ChannelLink>;
}

/// WebSocket transport (tokio-tungstenite).
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> SyncResult<ChannelLink> {
        let (ws_stream, response) = connect_async(url.as_str()).await?;
        debug!(status = ?response.status(), "WebSocket handshake complete");

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ChannelFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        // One pump owns both halves so pongs and frames share the sink.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else {
                            let _ = write.send(WsMessage::Close(None)).await;
                            break;
                        };
                        match serde_json::to_string(&frame) {
                            Ok(json) => {
                                if let Err(e) = write.send(WsMessage::Text(json.into())).await {
                                    warn!(?e, "WebSocket send failed");
                                    break;
                                }
                            }
                            Err(e) => warn!(?e, event = %frame.event, "Failed to encode frame"),
                        }
                    }

                    message = read.next() => {
                        match message {
                            Some(Ok(WsMessage::Text(text))) => {
                                match serde_json::from_str::<ChannelFrame>(&text) {
                                    Ok(frame) => {
                                        if inbound_tx.send(frame).is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => warn!(?e, "Failed to parse frame"),
                                }
                            }
                            Some(Ok(WsMessage::Ping(data))) => {
                                if write.send(WsMessage::Pong(data)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(WsMessage::Close(frame))) => {
                                info!(?frame, "Received close frame");
                                break;
                            }
                            Some(Ok(WsMessage::Binary(_))) => {
                                warn!("Received unexpected binary message");
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(?e, "WebSocket error");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            debug!("WebSocket pump stopped");
        });

        Ok(ChannelLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

// =============================================================================
// State and Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ChannelPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelPhase::Disconnected => write!(f, "disconnected"),
            ChannelPhase::Connecting => write!(f, "connecting"),
            ChannelPhase::Connected => write!(f, "connected"),
            ChannelPhase::Reconnecting => write!(f, "reconnecting"),
            ChannelPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot published on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelState {
    pub phase: ChannelPhase,
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    /// 0 = infinite.
    pub max_reconnect_attempts: u32,
    pub buffer_capacity: usize,
    pub connect_timeout: Duration,
    pub ping_timeout: Duration,
    /// Heartbeat period while connected; zero disables it.
    pub ping_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            url: "ws://localhost:8080/realtime".to_string(),
            max_reconnect_attempts: 5,
            buffer_capacity: 100,
            connect_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(25),
        }
    }
}

/// Registration handle returned by [`RealtimeChannel::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone)]
enum ConnectOutcome {
    Connected,
    ConnectError(String),
    Unauthorized,
    Failed { attempts: u32 },
    Stopped,
}

enum SessionEnd {
    Dropped,
    /// A heartbeat went unanswered for `ping_timeout`.
    Unresponsive,
    Unauthorized(Value),
    Cancelled,
}

struct Outbound {
    buffer: VecDeque<ChannelFrame>,
    live: Option<mpsc::UnboundedSender<ChannelFrame>>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ChannelInner {
    config: ChannelConfig,
    connector: Arc<dyn ChannelConnector>,
    tokens: TokenStore,
    observer: Arc<dyn AuthObserver>,
    policy: Arc<dyn BackoffPolicy>,
    state_tx: watch::Sender<ChannelState>,
    outcome_tx: broadcast::Sender<ConnectOutcome>,
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_handler_id: AtomicU64,
    // Lock order: outbound before acks.
    outbound: Mutex<Outbound>,
    acks: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_ack_id: AtomicU64,
    running: Mutex<Option<Running>>,
}

// =============================================================================
// Builder
// =============================================================================

pub struct RealtimeChannelBuilder {
    config: ChannelConfig,
    connector: Arc<dyn ChannelConnector>,
    tokens: TokenStore,
    observer: Arc<dyn AuthObserver>,
    policy: Arc<dyn BackoffPolicy>,
}

impl RealtimeChannelBuilder {
    pub fn with_observer(mut self, observer: Arc<dyn AuthObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Reconnect delay schedule.
    pub fn with_policy(mut self, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> RealtimeChannel {
        let (state_tx, _) = watch::channel(ChannelState::default());
        let (outcome_tx, _) = broadcast::channel(16);

        RealtimeChannel {
            inner: Arc::new(ChannelInner {
                config: self.config,
                connector: self.connector,
                tokens: self.tokens,
                observer: self.observer,
                policy: self.policy,
                state_tx,
                outcome_tx,
                handlers: RwLock::new(HashMap::new()),
                next_handler_id: AtomicU64::new(1),
                outbound: Mutex::new(Outbound {
                    buffer: VecDeque::new(),
                    live: None,
                }),
                acks: Mutex::new(HashMap::new()),
                next_ack_id: AtomicU64::new(1),
                running: Mutex::new(None),
            }),
        }
    }
}

// =============================================================================
// RealtimeChannel
// =============================================================================

/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RealtimeChannel {
    pub fn builder(
        connector: Arc<dyn ChannelConnector>,
        tokens: TokenStore,
        config: ChannelConfig,
    ) -> RealtimeChannelBuilder {
        RealtimeChannelBuilder {
            config,
            connector,
            tokens,
            observer: Arc::new(NoOpAuthObserver),
            policy: Arc::new(ExponentialPolicy::default()),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state_tx.borrow()
    }

    pub fn phase(&self) -> ChannelPhase {
        self.state().phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == ChannelPhase::Connected
    }

    /// Receives every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }

    /// Frames waiting for a connection.
    pub async fn buffered_len(&self) -> usize {
        self.inner.outbound.lock().await.buffer.len()
    }

    /// Starts the connection loop (if not running) and waits for the first
    /// outcome. After a `connect_error` the loop keeps reconnecting in the
    /// background. `token` replaces the stored access token when given.
    pub async fn connect(&self, token: Option<String>) -> SyncResult<()> {
        if let Some(token) = token {
            self.inner.tokens.set_tokens(token, None).await;
        }

        let mut outcomes = self.inner.outcome_tx.subscribe();
        {
            let mut running = self.inner.running.lock().await;
            if self.is_connected() {
                return Ok(());
            }

            let alive = running.as_ref().is_some_and(|r| !r.task.is_finished());
            if !alive || self.phase() == ChannelPhase::Failed {
                // a Failed loop has already published its last outcome
                if let Some(stale) = running.take() {
                    if let Err(e) = stale.task.await {
                        error!(?e, "Realtime channel loop panicked");
                    }
                }
                outcomes = self.inner.outcome_tx.subscribe();

                let cancel = CancellationToken::new();
                let task = tokio::spawn(run_loop(self.inner.clone(), cancel.clone()));
                *running = Some(Running { cancel, task });
            }
        }

        loop {
            match outcomes.recv().await {
                Ok(ConnectOutcome::Connected) => return Ok(()),
                Ok(ConnectOutcome::ConnectError(message)) => {
                    return Err(SyncError::ChannelConnectFailed(message))
                }
                Ok(ConnectOutcome::Unauthorized) => return Err(SyncError::ChannelUnauthorized),
                Ok(ConnectOutcome::Failed { attempts }) => {
                    return Err(SyncError::ChannelReconnectFailed { attempts })
                }
                Ok(ConnectOutcome::Stopped) => return Err(SyncError::Cancelled),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(SyncError::ShuttingDown),
            }
        }
    }

    /// Stops the connection loop. Buffered emits are kept for the next
    /// connection.
    pub async fn disconnect(&self) {
        let running = self.inner.running.lock().await.take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.task.await {
                error!(?e, "Realtime channel loop panicked");
            }
        }

        self.inner.go_offline().await;
        self.inner.set_state(ChannelPhase::Disconnected, 0);
        info!("Realtime channel disconnected");
    }

    /// Registers a handler for `event`. Handlers persist across reconnects.
    pub async fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(handler);
        self.inner
            .handlers
            .write()
            .await
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        debug!(event, "Handler registered");
        id
    }

    /// Returns false if no such registration exists.
    pub async fn off(&self, event: &str, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write().await;
        let Some(list) = handlers.get_mut(event) else {
            return false;
        };

        let before = list.len();
        list.retain(|(registered, _)| *registered != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event);
        }
        removed
    }

    /// Sends now if connected, otherwise buffers.
    pub async fn emit(&self, event: &str, payload: Value) {
        self.inner
            .send_or_buffer(ChannelFrame::new(event, payload))
            .await;
    }

    /// Like [`emit`](Self::emit), resolving with the server's `ack` payload.
    /// The receiver errors if the frame is dropped from the buffer or the
    /// connection goes away before the ack arrives.
    pub async fn emit_with_ack(&self, event: &str, payload: Value) -> oneshot::Receiver<Value> {
        let (id, rx) = self.inner.register_ack().await;
        self.inner
            .send_or_buffer(ChannelFrame::new(event, payload).with_ack(id))
            .await;
        rx
    }

    /// Round trip through the server; returns the latency.
    pub async fn ping(&self) -> SyncResult<Duration> {
        let Some((id, rx)) = self.inner.send_ping().await else {
            return Err(SyncError::NotConnected);
        };

        let started = tokio::time::Instant::now();
        match timeout(self.inner.config.ping_timeout, rx).await {
            Ok(Ok(_)) => {
                let rtt = started.elapsed();
                debug!(rtt_ms = rtt.as_millis() as u64, "Pong");
                Ok(rtt)
            }
            Ok(Err(_)) => Err(SyncError::NotConnected),
            Err(_) => {
                self.inner.acks.lock().await.remove(&id);
                warn!("Ping timed out");
                Err(SyncError::PingTimeout(
                    self.inner.config.ping_timeout.as_millis() as u64,
                ))
            }
        }
    }
}

// =============================================================================
// Internals
// =============================================================================

impl ChannelInner {
    fn set_state(&self, phase: ChannelPhase, reconnect_attempts: u32) {
        self.state_tx.send_replace(ChannelState {
            phase,
            reconnect_attempts,
        });
    }

    fn publish(&self, outcome: ConnectOutcome) {
        // nobody waiting in connect() is fine
        let _ = self.outcome_tx.send(outcome);
    }

    async fn dispatch(&self, event: &str, payload: &Value) {
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .await
            .get(event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(event, "No handlers for event");
        }
        for handler in handlers {
            handler(payload);
        }
    }

    async fn register_ack(&self) -> (u64, oneshot::Receiver<Value>) {
        let id = self.next_ack_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.acks.lock().await.insert(id, tx);
        (id, rx)
    }

    async fn resolve_ack(&self, frame: ChannelFrame) {
        let Some(id) = frame.ack_id else {
            warn!("Ack frame without ackId");
            return;
        };
        match self.acks.lock().await.remove(&id) {
            Some(tx) => {
                let _ = tx.send(frame.payload);
            }
            None => debug!(ack_id = id, "Ack for unknown or expired request"),
        }
    }

    /// Sends a `ping` on the live link only; pings are never buffered.
    async fn send_ping(&self) -> Option<(u64, oneshot::Receiver<Value>)> {
        let (id, rx) = self.register_ack().await;
        let frame = ChannelFrame::new(EVENT_PING, Value::Null).with_ack(id);

        let sent = {
            let outbound = self.outbound.lock().await;
            outbound
                .live
                .as_ref()
                .is_some_and(|tx| tx.send(frame).is_ok())
        };
        if !sent {
            self.acks.lock().await.remove(&id);
            return None;
        }
        Some((id, rx))
    }

    async fn send_or_buffer(&self, frame: ChannelFrame) {
        let mut outbound = self.outbound.lock().await;

        let mut frame = frame;
        if let Some(tx) = &outbound.live {
            match tx.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => frame = returned,
            }
        }

        outbound.live = None;
        outbound.buffer.push_back(frame);

        while outbound.buffer.len() > self.config.buffer_capacity {
            if let Some(dropped) = outbound.buffer.pop_front() {
                warn!(event = %dropped.event, "Emit buffer full, dropping oldest frame");
                if let Some(id) = dropped.ack_id {
                    self.acks.lock().await.remove(&id);
                }
            }
        }
    }

    /// Flushes the buffer into `tx`, then routes new emits to it.
    async fn go_online(&self, tx: mpsc::UnboundedSender<ChannelFrame>) -> usize {
        let mut outbound = self.outbound.lock().await;
        let mut flushed = 0;

        while let Some(frame) = outbound.buffer.pop_front() {
            if let Err(mpsc::error::SendError(frame)) = tx.send(frame) {
                outbound.buffer.push_front(frame);
                return flushed;
            }
            flushed += 1;
        }

        outbound.live = Some(tx);
        flushed
    }

    /// Detaches the live link and fails acks for frames already sent.
    async fn go_offline(&self) {
        let mut outbound = self.outbound.lock().await;
        outbound.live = None;

        let buffered: HashSet<u64> = outbound.buffer.iter().filter_map(|f| f.ack_id).collect();
        let mut acks = self.acks.lock().await;
        let before = acks.len();
        acks.retain(|id, _| buffered.contains(id));

        if acks.len() != before {
            debug!(count = before - acks.len(), "Dropped acks for sent frames");
        }
    }

    /// Connects the transport and performs the auth handshake.
    async fn establish(&self, cancel: &CancellationToken) -> SyncResult<ChannelLink> {
        let token = self.tokens.access_token().await;
        let mut url = Url::parse(&self.config.url)?;
        if let Some(t) = &token {
            url.query_pairs_mut().append_pair("token", t);
        }

        let handshake = async {
            let mut link = self.connector.connect(&url).await?;
            link.outbound
                .send(ChannelFrame::new(EVENT_AUTH, json!({ "token": token })))
                .map_err(|_| SyncError::ChannelConnectFailed("link closed before auth".into()))?;

            loop {
                let Some(frame) = link.inbound.recv().await else {
                    return Err(SyncError::ChannelConnectFailed(
                        "link closed during handshake".into(),
                    ));
                };
                match frame.event.as_str() {
                    EVENT_CONNECTED => return Ok(link),
                    EVENT_CONNECT_ERROR => {
                        return Err(SyncError::ChannelConnectFailed(error_message(
                            &frame.payload,
                        )))
                    }
                    EVENT_UNAUTHORIZED => return Err(SyncError::ChannelUnauthorized),
                    other => debug!(event = other, "Ignoring frame before handshake"),
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = timeout(self.config.connect_timeout, handshake) => match result {
                Ok(result) => result,
                Err(_) => Err(SyncError::ChannelConnectFailed(format!(
                    "handshake timed out after {} ms",
                    self.config.connect_timeout.as_millis()
                ))),
            },
        }
    }

    /// Dispatches inbound frames until the link ends. Every `ping_interval`
    /// a heartbeat goes out; no answer within `ping_timeout` ends the session.
    async fn session(
        &self,
        inbound: &mut mpsc::UnboundedReceiver<ChannelFrame>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let heartbeat_enabled = !self.config.ping_interval.is_zero();
        let period = if heartbeat_enabled {
            self.config.ping_interval
        } else {
            Duration::from_secs(3600)
        };
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut awaiting: Option<(Instant, oneshot::Receiver<Value>)> = None;
        let deadline = tokio::time::sleep(self.config.ping_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                frame = inbound.recv() => {
                    let Some(frame) = frame else {
                        return SessionEnd::Dropped;
                    };
                    match frame.event.as_str() {
                        EVENT_UNAUTHORIZED => return SessionEnd::Unauthorized(frame.payload),
                        EVENT_ACK => self.resolve_ack(frame).await,
                        EVENT_ERROR => {
                            warn!(payload = %frame.payload, "Realtime channel error event");
                            self.dispatch(EVENT_ERROR, &frame.payload).await;
                        }
                        _ => self.dispatch(&frame.event, &frame.payload).await,
                    }
                }
                reply = async {
                    match awaiting.as_mut() {
                        Some((_, rx)) => rx.await.is_ok(),
                        None => std::future::pending().await,
                    }
                }, if awaiting.is_some() => {
                    let sent_at = awaiting.take().map(|(at, _)| at);
                    if !reply {
                        return SessionEnd::Dropped;
                    }
                    if let Some(at) = sent_at {
                        debug!(rtt_ms = at.elapsed().as_millis() as u64, "Heartbeat answered");
                    }
                }
                _ = &mut deadline, if awaiting.is_some() => {
                    return SessionEnd::Unresponsive;
                }
                _ = heartbeat.tick(), if heartbeat_enabled && awaiting.is_none() => {
                    let Some((_, rx)) = self.send_ping().await else {
                        return SessionEnd::Dropped;
                    };
                    let now = Instant::now();
                    deadline.as_mut().reset(now + self.config.ping_timeout);
                    awaiting = Some((now, rx));
                }
            }
        }
    }

    async fn handle_unauthorized(&self, payload: &Value) {
        warn!("Realtime channel unauthorized, clearing session");
        self.go_offline().await;
        self.tokens.clear().await;
        self.observer
            .on_session_expired("realtime channel unauthorized");
        self.dispatch(EVENT_UNAUTHORIZED, payload).await;
        self.set_state(ChannelPhase::Disconnected, 0);
        self.publish(ConnectOutcome::Unauthorized);
    }
}

fn error_message(payload: &Value) -> String {
    payload
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string())
}

/// Connect, serve, reconnect until cancelled, unauthorized or out of attempts.
async fn run_loop(inner: Arc<ChannelInner>, cancel: CancellationToken) {
    info!(url = %inner.config.url, "Realtime channel starting");

    let mut backoff = PolicyBackoff::new(inner.policy.clone())
        .with_max_attempts(inner.config.max_reconnect_attempts);
    let mut attempts = 0u32;

    loop {
        if attempts == 0 {
            inner.set_state(ChannelPhase::Connecting, 0);
        }

        match inner.establish(&cancel).await {
            Ok(ChannelLink {
                outbound,
                mut inbound,
            }) => {
                backoff.reset();
                attempts = 0;

                let flushed = inner.go_online(outbound).await;
                inner.set_state(ChannelPhase::Connected, 0);
                info!(flushed, "Realtime channel connected");
                inner.publish(ConnectOutcome::Connected);

                let end = inner.session(&mut inbound, &cancel).await;
                inner.go_offline().await;

                match end {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Unauthorized(payload) => {
                        inner.handle_unauthorized(&payload).await;
                        return;
                    }
                    SessionEnd::Dropped => warn!("Realtime channel dropped"),
                    SessionEnd::Unresponsive => warn!(
                        timeout_ms = inner.config.ping_timeout.as_millis() as u64,
                        "Heartbeat unanswered, dropping realtime link"
                    ),
                }
            }
            Err(SyncError::Cancelled) => break,
            Err(SyncError::ChannelUnauthorized) => {
                inner.handle_unauthorized(&Value::Null).await;
                return;
            }
            Err(e) => {
                warn!(?e, attempt = attempts, "Realtime connect failed");
                let message = match e {
                    SyncError::ChannelConnectFailed(message) => message,
                    other => other.to_string(),
                };
                inner
                    .dispatch(EVENT_CONNECT_ERROR, &json!({ "message": message }))
                    .await;
                inner.publish(ConnectOutcome::ConnectError(message));
            }
        }

        let Some(delay) = backoff.next_backoff() else {
            error!(attempts, "Reconnect attempts exhausted");
            inner
                .dispatch(EVENT_RECONNECT_FAILED, &json!({ "attempts": attempts }))
                .await;
            inner.set_state(ChannelPhase::Failed, attempts);
            inner.publish(ConnectOutcome::Failed { attempts });
            return;
        };

        attempts += 1;
        inner.set_state(ChannelPhase::Reconnecting, attempts);
        debug!(?delay, attempt = attempts, "Waiting before reconnect");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    inner.go_offline().await;
    inner.set_state(ChannelPhase::Disconnected, 0);
    inner.publish(ConnectOutcome::Stopped);
    info!("Realtime channel stopped");
}

// =============================================================================
// Unit Tests
// =============================================================================
