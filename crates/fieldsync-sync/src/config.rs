//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FIELDSYNC_BASE_URL=https://api.clinic.example/v1                   │
//! │     FIELDSYNC_REALTIME_URL=wss://api.clinic.example/realtime           │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/fieldsync/fieldsync.toml (Linux)                         │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [remote]
//! base_url = "https://api.clinic.example/v1"
//! request_timeout_ms = 15000
//! max_retries = 3
//!
//! [realtime]
//! url = "wss://api.clinic.example/realtime"
//! max_reconnect_attempts = 5
//! buffer_capacity = 100
//!
//! [outbox]
//! batch_size = 50
//! drain_interval_secs = 30
//! max_task_attempts = 10
//!
//! [storage]
//! schema_version = 1
//!
//! [[storage.stores]]
//! name = "patients"
//! key_path = "id"
//! indexes = [{ name = "by_facility", key_path = "payload.facilityId" }]
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use fieldsync_core::{ExponentialPolicy, Schema, StoreSchema};

use crate::channel::ChannelConfig;
use crate::error::{SyncError, SyncResult};
use crate::gateway::GatewayConfig;
use crate::outbox::OutboxConfig;

// =============================================================================
// Remote (HTTP) Settings
// =============================================================================

/// Settings for the RemoteGateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// REST API root; outbox routes are built under it.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Token refresh endpoint. Defaults to `{base_url}/auth/refresh`.
    #[serde(default)]
    pub refresh_url: Option<String>,

    /// Per-request timeout (milliseconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Retries after a 429/5xx before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay (milliseconds).
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Upper bound on any retry delay (milliseconds).
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}
fn default_request_timeout() -> u64 {
    15_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    1_000
}
fn default_backoff_cap() -> u64 {
    30_000
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            base_url: default_base_url(),
            refresh_url: None,
            request_timeout_ms: default_request_timeout(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
        }
    }
}

// =============================================================================
// Realtime Channel Settings
// =============================================================================

/// Settings for the RealtimeChannel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSettings {
    #[serde(default = "default_realtime_url")]
    pub url: String,

    /// Reconnect attempts before the channel goes `Failed`.
    /// Set to 0 for infinite retries.
    #[serde(default = "default_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Emits held while disconnected; the oldest is dropped beyond this.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Handshake timeout (milliseconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,

    /// Heartbeat period while connected (milliseconds); 0 disables it.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,
}

fn default_realtime_url() -> String {
    "ws://localhost:8080/realtime".to_string()
}
fn default_reconnect_attempts() -> u32 {
    5
}
fn default_buffer_capacity() -> usize {
    100
}
fn default_connect_timeout() -> u64 {
    10_000
}
fn default_ping_timeout() -> u64 {
    5_000
}
fn default_ping_interval() -> u64 {
    25_000
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        RealtimeSettings {
            url: default_realtime_url(),
            max_reconnect_attempts: default_reconnect_attempts(),
            buffer_capacity: default_buffer_capacity(),
            connect_timeout_ms: default_connect_timeout(),
            ping_timeout_ms: default_ping_timeout(),
            ping_interval_ms: default_ping_interval(),
        }
    }
}

// =============================================================================
// Outbox Settings
// =============================================================================

/// Settings for the SyncOutbox and the coordinator's drain loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxSettings {
    /// Tasks taken per dequeue.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Interval between periodic drains (seconds).
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,

    /// Failed attempts before a task is parked as stuck.
    /// Set to 0 to retry forever.
    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: u32,
}

fn default_batch_size() -> usize {
    50
}
fn default_drain_interval() -> u64 {
    30
}
fn default_max_task_attempts() -> u32 {
    10
}

impl Default for OutboxSettings {
    fn default() -> Self {
        OutboxSettings {
            batch_size: default_batch_size(),
            drain_interval_secs: default_drain_interval(),
            max_task_attempts: default_max_task_attempts(),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Where the LocalStore lives and which stores it declares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// Application stores; `sync_queue` and `cache` are added automatically.
    #[serde(default = "default_stores")]
    pub stores: Vec<StoreSchema>,
}

fn default_schema_version() -> u32 {
    1
}

fn default_stores() -> Vec<StoreSchema> {
    vec![
        StoreSchema::new("patients", "id").index("by_facility", "payload.facilityId"),
        StoreSchema::new("encounters", "id").index("by_patient", "payload.patientId"),
        StoreSchema::new("facilities", "id"),
    ]
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            path: None,
            schema_version: default_schema_version(),
            stores: default_stores(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub realtime: RealtimeSettings,

    #[serde(default)]
    pub outbox: OutboxSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (fieldsync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let base = url::Url::parse(&self.remote.base_url)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "Base URL must start with http:// or https://, got: {}",
                self.remote.base_url
            )));
        }

        if let Some(ref refresh) = self.remote.refresh_url {
            url::Url::parse(refresh)?;
        }

        let realtime = url::Url::parse(&self.realtime.url)?;
        if !matches!(realtime.scheme(), "ws" | "wss") {
            return Err(SyncError::InvalidUrl(format!(
                "Realtime URL must start with ws:// or wss://, got: {}",
                self.realtime.url
            )));
        }

        if self.remote.request_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_ms must be greater than 0".into(),
            ));
        }

        if self.realtime.buffer_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "buffer_capacity must be greater than 0".into(),
            ));
        }

        if self.outbox.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }

        if self.outbox.drain_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "drain_interval_secs must be greater than 0".into(),
            ));
        }

        self.schema()
            .validate()
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("FIELDSYNC_BASE_URL") {
            debug!(url = %url, "Overriding base URL from environment");
            self.remote.base_url = url;
        }

        if let Ok(url) = std::env::var("FIELDSYNC_REFRESH_URL") {
            self.remote.refresh_url = Some(url);
        }

        if let Ok(url) = std::env::var("FIELDSYNC_REALTIME_URL") {
            debug!(url = %url, "Overriding realtime URL from environment");
            self.realtime.url = url;
        }

        if let Ok(path) = std::env::var("FIELDSYNC_DB_PATH") {
            self.storage.path = Some(PathBuf::from(path));
        }

        if let Ok(retries) = std::env::var("FIELDSYNC_MAX_RETRIES") {
            match retries.parse::<u32>() {
                Ok(r) => self.remote.max_retries = r,
                Err(_) => warn!(value = %retries, "Ignoring invalid FIELDSYNC_MAX_RETRIES"),
            }
        }

        if let Ok(size) = std::env::var("FIELDSYNC_BATCH_SIZE") {
            if let Ok(s) = size.parse::<usize>() {
                self.outbox.batch_size = s;
            }
        }

        if let Ok(secs) = std::env::var("FIELDSYNC_DRAIN_INTERVAL_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                debug!(secs = s, "Overriding drain interval from environment");
                self.outbox.drain_interval_secs = s;
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "fieldsync", "fieldsync")
            .map(|dirs| dirs.config_dir().join("fieldsync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// SQLite path: configured, or `fieldsync.db` in the platform data dir.
    pub fn database_path(&self) -> PathBuf {
        self.storage.path.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("org", "fieldsync", "fieldsync")
                .map(|dirs| dirs.data_dir().join("fieldsync.db"))
                .unwrap_or_else(|| PathBuf::from("fieldsync.db"))
        })
    }

    /// The declared LocalStore schema (system stores included).
    pub fn schema(&self) -> Schema {
        self.storage
            .stores
            .iter()
            .cloned()
            .fold(Schema::new(self.storage.schema_version), Schema::store)
            .with_system_stores()
    }

    pub fn refresh_url(&self) -> String {
        self.remote.refresh_url.clone().unwrap_or_else(|| {
            format!("{}/auth/refresh", self.remote.base_url.trim_end_matches('/'))
        })
    }

    pub fn retry_policy(&self) -> ExponentialPolicy {
        ExponentialPolicy::new(
            Duration::from_millis(self.remote.backoff_base_ms),
            Duration::from_millis(self.remote.backoff_cap_ms),
        )
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            base_url: self.remote.base_url.clone(),
            refresh_url: self.refresh_url(),
            request_timeout: Duration::from_millis(self.remote.request_timeout_ms),
            max_retries: self.remote.max_retries,
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            url: self.realtime.url.clone(),
            max_reconnect_attempts: self.realtime.max_reconnect_attempts,
            buffer_capacity: self.realtime.buffer_capacity,
            connect_timeout: Duration::from_millis(self.realtime.connect_timeout_ms),
            ping_timeout: Duration::from_millis(self.realtime.ping_timeout_ms),
            ping_interval: Duration::from_millis(self.realtime.ping_interval_ms),
        }
    }

    pub fn outbox_config(&self) -> OutboxConfig {
        OutboxConfig {
            batch_size: self.outbox.batch_size,
            max_task_attempts: self.outbox.max_task_attempts,
        }
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.outbox.drain_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.remote.max_retries, 3);
        assert_eq!(config.realtime.buffer_capacity, 100);
        assert_eq!(config.realtime.ping_timeout_ms, 5_000);
        assert_eq!(config.realtime.ping_interval_ms, 25_000);
        assert_eq!(config.outbox.max_task_attempts, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.realtime.url = "http://not-a-socket".to_string();
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.realtime.url = "wss://api.clinic.example/realtime".to_string();
        config.remote.base_url = "ftp://files".to_string();
        assert!(config.validate().unwrap_err().is_config_error());

        config.remote.base_url = "https://api.clinic.example/v1".to_string();
        config.outbox.batch_size = 0;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));

        config.outbox.batch_size = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_store_is_invalid() {
        let mut config = SyncConfig::default();
        config.storage.stores.push(StoreSchema::new("patients", "id"));
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));
    }

    #[test]
    fn test_schema_includes_system_stores() {
        let schema = SyncConfig::default().schema();
        assert!(schema.find_store("patients").is_some());
        assert!(schema.find_store(fieldsync_core::SYNC_QUEUE_STORE).is_some());
        assert!(schema.find_store(fieldsync_core::CACHE_STORE).is_some());
    }

    #[test]
    fn test_refresh_url_default() {
        let mut config = SyncConfig::default();
        config.remote.base_url = "https://api.clinic.example/v1/".to_string();
        assert_eq!(config.refresh_url(), "https://api.clinic.example/v1/auth/refresh");

        config.remote.refresh_url = Some("https://auth.clinic.example/refresh".to_string());
        assert_eq!(config.refresh_url(), "https://auth.clinic.example/refresh");
    }

    #[test]
    fn test_toml_serialization() {
        let config = SyncConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[remote]"));
        assert!(toml_str.contains("[outbox]"));
    }

    #[test]
    fn test_parse_partial_file() {
        let config: SyncConfig = toml::from_str(
            r#"
            [outbox]
            batch_size = 5

            [[storage.stores]]
            name = "visits"
            key_path = "id"
            indexes = [{ name = "by_day", key_path = "payload.day" }]
            "#,
        )
        .unwrap();

        assert_eq!(config.outbox.batch_size, 5);
        assert_eq!(config.outbox.drain_interval_secs, 30);
        assert_eq!(config.storage.stores.len(), 1);
        assert_eq!(config.storage.stores[0].indexes[0].key_path, "payload.day");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fieldsync.toml");

        let mut config = SyncConfig::default();
        config.outbox.batch_size = 7;
        config.save(Some(path.clone())).unwrap();

        let loaded = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.outbox.batch_size, 7);
    }
}
