//! # TTL Cache
//!
//! A key/value cache kept in the `cache` system store, so it survives
//! restarts like everything else in LocalStore.
//!
//! ## Expiry
//! ```text
//!   set_cache(k, data, ttl)          timestamp = now
//!        │
//!        │   now < timestamp + ttl   get_cache(k) → Some(data)
//!        │
//!        ▼   now ≥ timestamp + ttl   get_cache(k) → None, entry deleted
//! ```
//!
//! Expiry is lazy: entries are only removed when read, or by an explicit
//! [`LocalStore::purge_expired_cache`] sweep.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use fieldsync_core::{CacheEntry, CACHE_STORE, DEFAULT_CACHE_TTL_MS};

use crate::error::DbResult;
use crate::query::{KeyRange, Query};
use crate::store::LocalStore;

impl LocalStore {
    /// Caches `data` under `key`. `ttl` defaults to five minutes.
    pub async fn set_cache(&self, key: &str, data: Value, ttl: Option<Duration>) -> DbResult<()> {
        let ttl_ms = ttl
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(DEFAULT_CACHE_TTL_MS);

        let entry = CacheEntry {
            key: key.to_string(),
            data,
            timestamp: self.clock().now_millis(),
            ttl: ttl_ms,
        };
        self.put_as(CACHE_STORE, &entry).await?;

        debug!(key, ttl_ms, "Cache set");
        Ok(())
    }

    /// Returns the cached value, or `None` if absent or expired.
    /// Expired entries are deleted on the way out.
    pub async fn get_cache(&self, key: &str) -> DbResult<Option<Value>> {
        let entry: Option<CacheEntry> = self.get_as(CACHE_STORE, key).await?;

        match entry {
            Some(entry) if entry.is_expired(self.clock().now_millis()) => {
                self.delete(CACHE_STORE, key).await?;
                debug!(key, "Cache entry expired");
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.data)),
            None => Ok(None),
        }
    }

    pub async fn get_cache_as<T: DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        match self.get_cache(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Removes every cache entry.
    pub async fn clear_cache(&self) -> DbResult<()> {
        self.clear(CACHE_STORE).await
    }

    /// Removes one entry.
    pub async fn invalidate_cache(&self, key: &str) -> DbResult<()> {
        self.delete(CACHE_STORE, key).await
    }

    /// Removes every entry whose key starts with `prefix`. Returns how many.
    pub async fn invalidate_cache_prefix(&self, prefix: &str) -> DbResult<usize> {
        let entries: Vec<CacheEntry> = self
            .get_all_as(CACHE_STORE, Some(Query::range(KeyRange::prefix(prefix))))
            .await?;

        for entry in &entries {
            self.delete(CACHE_STORE, &entry.key).await?;
        }

        if !entries.is_empty() {
            debug!(prefix, count = entries.len(), "Cache prefix invalidated");
        }
        Ok(entries.len())
    }

    /// Deletes every expired entry. Returns how many.
    pub async fn purge_expired_cache(&self) -> DbResult<usize> {
        let now = self.clock().now_millis();
        let entries: Vec<CacheEntry> = self.get_all_as(CACHE_STORE, None).await?;

        let mut purged = 0;
        for entry in entries.iter().filter(|e| e.is_expired(now)) {
            self.delete(CACHE_STORE, &entry.key).await?;
            purged += 1;
        }

        if purged > 0 {
            info!(purged, "Purged expired cache entries");
        }
        Ok(purged)
    }
}
