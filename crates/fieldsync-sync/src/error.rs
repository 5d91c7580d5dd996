//! # Sync Error Types
//!
//! Error types for the network layer.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Where sync failures come from                        │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │    Gateway      │  │     Channel             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Network        │  │  ChannelUnauthorized    │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │  ChannelConnectFailed   │ │
//! │  │  ConfigLoad/Save│  │  AuthExpired    │  │  ChannelReconnectFailed │ │
//! │  └─────────────────┘  │  RateLimited    │  │  PingTimeout            │ │
//! │                       │  ServerError    │  │  NotConnected           │ │
//! │                       │  Rejected       │  └─────────────────────────┘ │
//! │                       │  Cancelled      │                              │
//! │                       └─────────────────┘                              │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Storage      │  │    Protocol     │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Storage(DbErr) │  │  Serialization  │  │  ShuttingDown           │ │
//! │  │                 │  │  InvalidMessage │  │  ChannelError           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  Only AuthExpired and ChannelUnauthorized end the session.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use fieldsync_db::DbError;

/// Shorthand result for the network layer.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering every network-layer failure.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// A setting is out of range or missing.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed server or channel URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The config file could not be read or parsed.
    #[error("Could not load config: {0}")]
    ConfigLoadFailed(String),

    /// The config file could not be written.
    #[error("Could not save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Gateway Errors
    // =========================================================================
    /// Connection could not be established or was reset.
    #[error("Network error: {0}")]
    Network(String),

    /// The request exceeded its timeout.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// Token refresh failed or the replayed request was rejected again.
    #[error("Session expired")]
    AuthExpired,

    /// Still rate limited after the last retry.
    #[error("Rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    /// Still failing with 5xx after the last retry.
    #[error("Server error {status}")]
    ServerError { status: u16 },

    /// Non-retryable 4xx response.
    #[error("Request rejected with {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Aborted through a cancellation token.
    #[error("Request cancelled")]
    Cancelled,

    // =========================================================================
    // Channel Errors
    // =========================================================================
    /// Server sent `unauthorized`; credentials have been cleared.
    #[error("Realtime channel unauthorized")]
    ChannelUnauthorized,

    /// Handshake failed (`connect_error` or transport failure).
    #[error("Realtime channel connect failed: {0}")]
    ChannelConnectFailed(String),

    /// Reconnect attempts exhausted.
    #[error("Realtime channel gave up after {attempts} reconnect attempts")]
    ChannelReconnectFailed { attempts: u32 },

    /// Ping got no answer in time.
    #[error("Ping timed out after {0} ms")]
    PingTimeout(u64),

    /// Operation needs a live connection.
    #[error("Realtime channel is not connected")]
    NotConnected,

    // =========================================================================
    // Storage Errors
    // =========================================================================
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Failed to serialize or deserialize a payload.
    #[error("Malformed payload: {0}")]
    SerializationFailed(String),

    /// Payload is well-formed JSON but not the expected shape.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Coordinator or channel is shutting down.
    #[error("Sync is shutting down")]
    ShuttingDown,

    /// Internal channel send/receive failed.
    #[error("Internal channel closed: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                SyncError::Network("connection closed".into())
            }
            WsError::Io(io) => SyncError::Network(io.to_string()),
            WsError::Url(u) => SyncError::InvalidUrl(u.to_string()),
            other => SyncError::ChannelConnectFailed(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(0)
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Classification
// =============================================================================

impl SyncError {
    /// Returns true if a later attempt may succeed.
    ///
    /// ## Retryable Errors
    /// - Network failures and timeouts
    /// - Rate limiting and 5xx responses
    /// - Channel handshake failures
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - 4xx rejections
    /// - Session-terminal errors
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_)
                | SyncError::Timeout(_)
                | SyncError::RateLimited { .. }
                | SyncError::ServerError { .. }
                | SyncError::ChannelConnectFailed(_)
                | SyncError::PingTimeout(_)
                | SyncError::NotConnected
        )
    }

    /// Returns true if the user must sign in again.
    pub fn is_session_terminal(&self) -> bool {
        matches!(self, SyncError::AuthExpired | SyncError::ChannelUnauthorized)
    }

    /// Returns true for settings or URL problems.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(SyncError::Network("reset".into()).is_retryable());
        assert!(SyncError::Timeout(15_000).is_retryable());
        assert!(SyncError::ServerError { status: 503 }.is_retryable());
        assert!(SyncError::RateLimited { attempts: 4 }.is_retryable());

        assert!(!SyncError::AuthExpired.is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::Rejected {
            status: 422,
            body: "{}".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_session_terminal_errors() {
        assert!(SyncError::AuthExpired.is_session_terminal());
        assert!(SyncError::ChannelUnauthorized.is_session_terminal());
        assert!(!SyncError::ChannelConnectFailed("refused".into()).is_session_terminal());
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: SyncError = DbError::UnknownStore("ghost".into()).into();
        assert!(matches!(err, SyncError::Storage(_)));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::Rejected {
            status: 409,
            body: "conflict".into(),
        };
        assert!(err.to_string().contains("409"));
        assert!(err.to_string().contains("conflict"));
    }
}
