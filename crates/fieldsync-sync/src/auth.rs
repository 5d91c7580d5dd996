//! # Session Credentials
//!
//! In-memory access/refresh tokens shared by the gateway and the realtime
//! channel, plus the hook the application implements to learn that the
//! session is gone.
//!
//! ## Token Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Token Lifecycle                                 │
//! │                                                                         │
//! │  auth module ── set_tokens(access, refresh) ──► TokenStore             │
//! │                                                   │                     │
//! │          ┌────────────────────────────────────────┤                     │
//! │          ▼                                        ▼                     │
//! │  RemoteGateway                             RealtimeChannel              │
//! │  Bearer header, 401 → refresh              ?token= + auth frame         │
//! │          │                                        │                     │
//! │          │  refresh fails / replay 401            │  server unauthorized│
//! │          └───────────────┬────────────────────────┘                     │
//! │                          ▼                                              │
//! │              clear() + AuthObserver::on_session_expired                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Access and refresh tokens for the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Shared, swappable session credentials.
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    inner: Arc<RwLock<Credentials>>,
}

impl TokenStore {
    pub fn new(access_token: Option<String>, refresh_token: Option<String>) -> Self {
        TokenStore {
            inner: Arc::new(RwLock::new(Credentials {
                access_token,
                refresh_token,
            })),
        }
    }

    /// Reads `FIELDSYNC_ACCESS_TOKEN` / `FIELDSYNC_REFRESH_TOKEN`.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("FIELDSYNC_ACCESS_TOKEN").ok(),
            std::env::var("FIELDSYNC_REFRESH_TOKEN").ok(),
        )
    }

    pub async fn access_token(&self) -> Option<String> {
        self.inner.read().await.access_token.clone()
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.inner.read().await.refresh_token.clone()
    }

    pub async fn snapshot(&self) -> Credentials {
        self.inner.read().await.clone()
    }

    /// Replaces the access token; keeps the refresh token unless a new one is given.
    pub async fn set_tokens(&self, access_token: String, refresh_token: Option<String>) {
        let mut creds = self.inner.write().await;
        creds.access_token = Some(access_token);
        if let Some(refresh) = refresh_token {
            creds.refresh_token = Some(refresh);
        }
        debug!("Session tokens updated");
    }

    pub async fn clear(&self) {
        *self.inner.write().await = Credentials::default();
        info!("Session credentials cleared");
    }

    pub async fn has_access_token(&self) -> bool {
        self.inner.read().await.access_token.is_some()
    }
}

/// Notified when the session can no longer be recovered.
pub trait AuthObserver: Send + Sync {
    fn on_session_expired(&self, reason: &str);
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpAuthObserver;

impl AuthObserver for NoOpAuthObserver {
    fn on_session_expired(&self, _reason: &str) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every expiry reason.
    #[derive(Default)]
    pub(crate) struct RecordingObserver {
        pub reasons: Mutex<Vec<String>>,
    }

    impl RecordingObserver {
        pub fn count(&self) -> usize {
            self.reasons.lock().unwrap().len()
        }
    }

    impl AuthObserver for RecordingObserver {
        fn on_session_expired(&self, reason: &str) {
            self.reasons.lock().unwrap().push(reason.to_string());
        }
    }

    #[tokio::test]
    async fn test_set_tokens_keeps_refresh_token() {
        let tokens = TokenStore::new(Some("a1".into()), Some("r1".into()));
        tokens.set_tokens("a2".into(), None).await;

        assert_eq!(tokens.access_token().await.as_deref(), Some("a2"));
        assert_eq!(tokens.refresh_token().await.as_deref(), Some("r1"));

        tokens.set_tokens("a3".into(), Some("r2".into())).await;
        assert_eq!(tokens.refresh_token().await.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_clones_share_credentials() {
        let tokens = TokenStore::new(Some("a1".into()), None);
        let other = tokens.clone();

        other.clear().await;
        assert!(!tokens.has_access_token().await);
        assert_eq!(tokens.snapshot().await, Credentials::default());
    }
}
