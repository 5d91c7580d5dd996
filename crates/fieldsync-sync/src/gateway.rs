//! # Remote Gateway
//!
//! Authenticated HTTP requests with one-shot token refresh and bounded
//! retry for rate limiting and server errors.
//!
//! ## Request Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       RemoteGateway::request                            │
//! │                                                                         │
//! │   send (Bearer token)                                                  │
//! │     │                                                                   │
//! │     ├── 2xx ───────────────► Ok(json body)                             │
//! │     │                                                                   │
//! │     ├── 401 (first) ───────► refresh token ──► replay once             │
//! │     ├── 401 (after replay)─► clear tokens, observer ──► AuthExpired    │
//! │     │   (refresh unreachable or 5xx: transient error, tokens kept)     │
//! │     │                                                                   │
//! │     ├── 429 ───────────────► wait Retry-After or backoff ──► resend    │
//! │     ├── 5xx ───────────────► wait backoff ──► resend                   │
//! │     │        (max_retries exhausted ► RateLimited / ServerError)       │
//! │     │                                                                   │
//! │     ├── other 4xx ─────────► Rejected { status, body }                 │
//! │     └── timeout / network ─► Timeout / Network (no retry)              │
//! │                                                                         │
//! │   A cancelled token aborts the send or the backoff sleep: Cancelled.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fieldsync_core::{BackoffPolicy, ExponentialPolicy};

use crate::auth::{AuthObserver, NoOpAuthObserver, TokenStore};
use crate::backoff::PolicyBackoff;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// HTTP Seam
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Patch => write!(f, "PATCH"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A single outgoing HTTP call.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub bearer: Option<String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

/// Status, lower-cased headers and raw body.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        HttpResponse {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses the body; an empty body is `null`.
    pub fn json(&self) -> SyncResult<Value> {
        if self.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Sends one HTTP request. Implementations report transport failures as
/// [`SyncError::Timeout`] or [`SyncError::Network`] and never retry. The
/// gateway bounds every send by `request_timeout` regardless.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse>;
}

/// Production client over reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("fieldsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(ReqwestClient { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let timeout_ms = request.timeout.as_millis() as u64;
        let mut builder = self
            .client
            .request(request.method.into(), &request.url)
            .timeout(request.timeout);

        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                SyncError::Timeout(timeout_ms)
            } else {
                SyncError::Network(e.to_string())
            }
        };

        let response = builder.send().await.map_err(map_err)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(map_err)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

// =============================================================================
// Gateway
// =============================================================================

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Relative request paths are resolved against this.
    pub base_url: String,
    pub refresh_url: String,
    pub request_timeout: Duration,
    /// Resends after a 429/5xx; at most `max_retries + 1` sends.
    pub max_retries: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            base_url: "http://localhost:8080/api".to_string(),
            refresh_url: "http://localhost:8080/api/auth/refresh".to_string(),
            request_timeout: Duration::from_secs(15),
            max_retries: 3,
        }
    }
}

/// Authenticated HTTP access to the server.
pub struct RemoteGateway {
    http: Arc<dyn HttpClient>,
    tokens: TokenStore,
    observer: Arc<dyn AuthObserver>,
    policy: Arc<dyn BackoffPolicy>,
    config: GatewayConfig,
    /// Serializes refreshes so concurrent 401s share one.
    refresh_lock: Mutex<()>,
}

impl std::fmt::Debug for RemoteGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteGateway")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RemoteGateway {
    pub fn new(http: Arc<dyn HttpClient>, tokens: TokenStore, config: GatewayConfig) -> Self {
        RemoteGateway {
            http,
            tokens,
            observer: Arc::new(NoOpAuthObserver),
            policy: Arc::new(ExponentialPolicy::default()),
            config,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn AuthObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Sends `payload` to `url` (absolute, or relative to the base URL) and
    /// returns the parsed JSON body.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        payload: Option<Value>,
        cancel: Option<&CancellationToken>,
    ) -> SyncResult<Value> {
        let cancel = cancel.cloned().unwrap_or_else(CancellationToken::new);
        let url = self.resolve_url(url)?;

        let mut backoff =
            PolicyBackoff::new(self.policy.clone()).with_retry_limit(self.config.max_retries);
        let mut refreshed = false;

        loop {
            let sent_with = self.tokens.access_token().await;
            let response = self
                .send_once(method, &url, sent_with.clone(), payload.clone(), &cancel)
                .await?;

            match response.status {
                200..=299 => {
                    debug!(%method, %url, status = response.status, "Request succeeded");
                    return response.json();
                }
                401 => {
                    if refreshed {
                        return Err(self.expire_session("request rejected after refresh").await);
                    }
                    refreshed = true;

                    match self.refresh(sent_with, &cancel).await {
                        Ok(()) => debug!(%url, "Replaying request with refreshed token"),
                        Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                        Err(e) if e.is_retryable() => {
                            warn!(?e, "Token refresh could not reach the server");
                            return Err(e);
                        }
                        Err(e) => {
                            warn!(?e, "Token refresh failed");
                            return Err(self.expire_session("token refresh failed").await);
                        }
                    }
                }
                429 | 500..=599 => {
                    let status = response.status;
                    let Some(policy_delay) = backoff.next_backoff() else {
                        let sends = backoff.attempts() + 1;
                        warn!(%method, %url, status, sends, "Retries exhausted");
                        return Err(if status == 429 {
                            SyncError::RateLimited { attempts: sends }
                        } else {
                            SyncError::ServerError { status }
                        });
                    };

                    let delay = if status == 429 {
                        retry_after(&response).unwrap_or(policy_delay)
                    } else {
                        policy_delay
                    };

                    warn!(
                        %method,
                        %url,
                        status,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Retrying request"
                    );
                    sleep_or_cancel(delay, &cancel).await?;
                }
                status => {
                    debug!(%method, %url, status, "Request rejected");
                    return Err(SyncError::Rejected {
                        status,
                        body: response.body,
                    });
                }
            }
        }
    }

    pub async fn get(&self, url: &str, cancel: Option<&CancellationToken>) -> SyncResult<Value> {
        self.request(Method::Get, url, None, cancel).await
    }

    pub async fn post(
        &self,
        url: &str,
        payload: Value,
        cancel: Option<&CancellationToken>,
    ) -> SyncResult<Value> {
        self.request(Method::Post, url, Some(payload), cancel).await
    }

    pub async fn put(
        &self,
        url: &str,
        payload: Value,
        cancel: Option<&CancellationToken>,
    ) -> SyncResult<Value> {
        self.request(Method::Put, url, Some(payload), cancel).await
    }

    pub async fn delete(&self, url: &str, cancel: Option<&CancellationToken>) -> SyncResult<Value> {
        self.request(Method::Delete, url, None, cancel).await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn resolve_url(&self, url: &str) -> SyncResult<String> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(url::Url::parse(url)?.to_string());
        }
        let joined = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            url.trim_start_matches('/')
        );
        Ok(url::Url::parse(&joined)?.to_string())
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        bearer: Option<String>,
        body: Option<Value>,
        cancel: &CancellationToken,
    ) -> SyncResult<HttpResponse> {
        let request = HttpRequest {
            method,
            url: url.to_string(),
            bearer,
            body,
            timeout: self.config.request_timeout,
        };

        let timeout = self.config.request_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(%method, %url, "Request cancelled");
                Err(SyncError::Cancelled)
            }
            result = tokio::time::timeout(timeout, self.http.send(request)) => {
                result.unwrap_or_else(|_| {
                    let timeout_ms = timeout.as_millis() as u64;
                    warn!(%method, %url, timeout_ms, "Request timed out");
                    Err(SyncError::Timeout(timeout_ms))
                })
            }
        }
    }

    /// Exchanges the refresh token for a new access token, unless another
    /// request already replaced the token that was rejected.
    async fn refresh(
        &self,
        rejected: Option<String>,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.tokens.access_token().await;
        if current.is_some() && current != rejected {
            debug!("Token already refreshed by a concurrent request");
            return Ok(());
        }

        let Some(refresh_token) = self.tokens.refresh_token().await else {
            return Err(SyncError::AuthExpired);
        };

        let response = self
            .send_once(
                Method::Post,
                &self.config.refresh_url,
                None,
                Some(json!({ "refreshToken": refresh_token })),
                cancel,
            )
            .await?;

        match response.status {
            200..=299 => {}
            429 => return Err(SyncError::RateLimited { attempts: 1 }),
            status @ 500..=599 => return Err(SyncError::ServerError { status }),
            status => {
                return Err(SyncError::Rejected {
                    status,
                    body: response.body,
                })
            }
        }

        let body = response.json()?;
        let token = body
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::InvalidMessage("refresh response has no token".into()))?;
        let rotated = body
            .get("refreshToken")
            .and_then(Value::as_str)
            .map(str::to_string);

        self.tokens.set_tokens(token.to_string(), rotated).await;
        info!("Access token refreshed");
        Ok(())
    }

    async fn expire_session(&self, reason: &str) -> SyncError {
        warn!(reason, "Session expired");
        self.tokens.clear().await;
        self.observer.on_session_expired(reason);
        SyncError::AuthExpired
    }
}

/// `Retry-After` as delta-seconds or an HTTP date.
fn retry_after(response: &HttpResponse) -> Option<Duration> {
    let value = response.header("retry-after")?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let millis = (at.with_timezone(&chrono::Utc) - chrono::Utc::now())
        .num_milliseconds()
        .max(0);
    Some(Duration::from_millis(millis as u64))
}

/// Sleeps unless `cancel` fires first.
pub(crate) async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> SyncResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use crate::auth::tests::RecordingObserver;

    /// Replays canned responses and records every request.
    #[derive(Default)]
    pub(crate) struct ScriptedClient {
        script: StdMutex<VecDeque<SyncResult<HttpResponse>>>,
        pub requests: StdMutex<Vec<HttpRequest>>,
        /// Never answers when the script is empty.
        pub hang_when_empty: bool,
    }

    impl ScriptedClient {
        pub fn new(script: Vec<SyncResult<HttpResponse>>) -> Self {
            ScriptedClient {
                script: StdMutex::new(script.into()),
                ..Default::default()
            }
        }

        pub fn hanging() -> Self {
            ScriptedClient {
                hang_when_empty: true,
                ..Default::default()
            }
        }

        pub fn push(&self, response: SyncResult<HttpResponse>) {
            self.script.lock().unwrap().push_back(response);
        }

        pub fn sent(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None if self.hang_when_empty => std::future::pending().await,
                None => Ok(HttpResponse::new(200, "{}")),
            }
        }
    }

    fn gateway(client: Arc<ScriptedClient>, tokens: TokenStore) -> RemoteGateway {
        let config = GatewayConfig {
            base_url: "https://api.test/v1".into(),
            refresh_url: "https://api.test/v1/auth/refresh".into(),
            ..Default::default()
        };
        RemoteGateway::new(client, tokens, config)
            .with_policy(Arc::new(|_: u32| Duration::from_millis(10)))
    }

    fn tokens() -> TokenStore {
        TokenStore::new(Some("access-1".into()), Some("refresh-1".into()))
    }

    #[tokio::test]
    async fn test_success_attaches_bearer_and_parses_json() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(HttpResponse::new(
            201,
            r#"{"id":"p-1"}"#,
        ))]));
        let gw = gateway(client.clone(), tokens());

        let body = gw
            .post("patients", json!({ "id": "p-1" }), None)
            .await
            .unwrap();
        assert_eq!(body["id"], "p-1");

        let sent = client.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].url, "https://api.test/v1/patients");
        assert_eq!(sent[0].bearer.as_deref(), Some("access-1"));
    }

    #[tokio::test]
    async fn test_no_bearer_without_token() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let gw = gateway(client.clone(), TokenStore::default());

        gw.get("ping", None).await.unwrap();
        assert!(client.sent()[0].bearer.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_retry_then_give_up() {
        let client = Arc::new(ScriptedClient::new(
            (0..10).map(|_| Ok(HttpResponse::new(503, ""))).collect(),
        ));
        let gw = gateway(client.clone(), tokens());

        let err = gw.get("patients", None).await.unwrap_err();
        assert!(matches!(err, SyncError::ServerError { status: 503 }));
        // one send plus max_retries resends
        assert_eq!(client.sent().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_recovers() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(HttpResponse::new(429, "").with_header("Retry-After", "2")),
            Ok(HttpResponse::new(200, r#"{"ok":true}"#)),
        ]));
        let gw = gateway(client.clone(), tokens());

        let started = tokio::time::Instant::now();
        let body = gw.get("patients", None).await.unwrap();
        assert_eq!(body["ok"], true);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(client.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhaustion_is_distinguishable() {
        let client = Arc::new(ScriptedClient::new(
            (0..4).map(|_| Ok(HttpResponse::new(429, ""))).collect(),
        ));
        let gw = gateway(client.clone(), tokens());

        let err = gw.get("patients", None).await.unwrap_err();
        assert!(matches!(err, SyncError::RateLimited { attempts: 4 }));
    }

    #[tokio::test]
    async fn test_other_client_errors_are_not_retried() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(HttpResponse::new(
            422,
            "bad field",
        ))]));
        let gw = gateway(client.clone(), tokens());

        let err = gw.put("patients/p-1", json!({}), None).await.unwrap_err();
        match err {
            SyncError::Rejected { status, body } => {
                assert_eq!(status, 422);
                assert_eq!(body, "bad field");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(client.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_errors_are_not_retried() {
        let client = Arc::new(ScriptedClient::new(vec![Err(SyncError::Timeout(15_000))]));
        let gw = gateway(client.clone(), tokens());

        assert!(matches!(
            gw.get("patients", None).await,
            Err(SyncError::Timeout(15_000))
        ));
        assert_eq!(client.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_once_and_replays() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(HttpResponse::new(401, "")),
            Ok(HttpResponse::new(
                200,
                r#"{"token":"access-2","refreshToken":"refresh-2"}"#,
            )),
            Ok(HttpResponse::new(200, r#"{"ok":true}"#)),
        ]));
        let store = tokens();
        let gw = gateway(client.clone(), store.clone());

        gw.get("patients", None).await.unwrap();

        let sent = client.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].url, "https://api.test/v1/auth/refresh");
        assert_eq!(sent[1].body.as_ref().unwrap()["refreshToken"], "refresh-1");
        assert_eq!(sent[2].bearer.as_deref(), Some("access-2"));
        assert_eq!(store.refresh_token().await.as_deref(), Some("refresh-2"));
    }

    #[tokio::test]
    async fn test_replay_rejected_expires_session() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(HttpResponse::new(401, "")),
            Ok(HttpResponse::new(200, r#"{"token":"access-2"}"#)),
            Ok(HttpResponse::new(401, "")),
        ]));
        let observer = Arc::new(RecordingObserver::default());
        let store = tokens();
        let gw = gateway(client.clone(), store.clone()).with_observer(observer.clone());

        let err = gw.get("patients", None).await.unwrap_err();
        assert!(matches!(err, SyncError::AuthExpired));
        assert_eq!(client.sent().len(), 3);
        assert_eq!(observer.count(), 1);
        assert!(!store.has_access_token().await);
    }

    #[tokio::test]
    async fn test_refresh_failure_expires_session() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(HttpResponse::new(401, "")),
            Ok(HttpResponse::new(400, "invalid refresh token")),
        ]));
        let observer = Arc::new(RecordingObserver::default());
        let gw = gateway(client.clone(), tokens()).with_observer(observer.clone());

        assert!(matches!(
            gw.get("patients", None).await,
            Err(SyncError::AuthExpired)
        ));
        assert_eq!(client.sent().len(), 2);
        assert_eq!(observer.count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_request() {
        let client = Arc::new(ScriptedClient::hanging());
        let gw = Arc::new(gateway(client.clone(), tokens()));
        let cancel = CancellationToken::new();

        let task = {
            let gw = gw.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gw.get("patients", Some(&cancel)).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();

        assert!(matches!(task.await.unwrap(), Err(SyncError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_backoff_sleep() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(HttpResponse::new(503, ""))]));
        let config = GatewayConfig {
            base_url: "https://api.test/v1".into(),
            ..Default::default()
        };
        let gw = Arc::new(
            RemoteGateway::new(client.clone(), tokens(), config)
                .with_policy(Arc::new(|_: u32| Duration::from_secs(3600))),
        );
        let cancel = CancellationToken::new();

        let task = {
            let gw = gw.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gw.get("patients", Some(&cancel)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert!(matches!(task.await.unwrap(), Err(SyncError::Cancelled)));
        assert_eq!(client.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_client_times_out() {
        let client = Arc::new(ScriptedClient::hanging());
        let config = GatewayConfig {
            base_url: "https://api.test/v1".into(),
            request_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let gw = RemoteGateway::new(client.clone(), tokens(), config);

        let outcome = tokio::time::timeout(Duration::from_secs(60), gw.get("patients", None))
            .await
            .expect("gateway should give up on its own");
        assert!(matches!(outcome, Err(SyncError::Timeout(100))));
        assert_eq!(client.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_refresh_keeps_session() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(HttpResponse::new(401, "")),
            Err(SyncError::Network("connection reset".into())),
        ]));
        let observer = Arc::new(RecordingObserver::default());
        let store = tokens();
        let gw = gateway(client.clone(), store.clone()).with_observer(observer.clone());

        assert!(matches!(
            gw.get("patients", None).await,
            Err(SyncError::Network(_))
        ));
        assert_eq!(observer.count(), 0);
        assert!(store.has_access_token().await);
        assert_eq!(store.refresh_token().await.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_refresh_server_error_keeps_session() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(HttpResponse::new(401, "")),
            Ok(HttpResponse::new(502, "")),
        ]));
        let observer = Arc::new(RecordingObserver::default());
        let gw = gateway(client.clone(), tokens()).with_observer(observer.clone());

        assert!(matches!(
            gw.get("patients", None).await,
            Err(SyncError::ServerError { status: 502 })
        ));
        assert_eq!(observer.count(), 0);
    }

    #[test]
    fn test_retry_after_parsing() {
        let secs = HttpResponse::new(429, "").with_header("Retry-After", "7");
        assert_eq!(retry_after(&secs), Some(Duration::from_secs(7)));

        let past = HttpResponse::new(429, "")
            .with_header("Retry-After", "Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(retry_after(&past), Some(Duration::ZERO));

        let junk = HttpResponse::new(429, "").with_header("Retry-After", "soon");
        assert_eq!(retry_after(&junk), None);
    }
}
