//! Versioned, expiring key-value cache on top of [`KeyValueStorage`].
//!
//! Every public operation degrades instead of failing: storage errors,
//! corrupt JSON and schema-version mismatches all read as a cache miss, and
//! a failed write returns `false` after sweeping expired entries. A broken
//! cache behaves like a cold one.

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::entry::{format_age, CacheEntry, CACHE_VERSION};
use super::staleness::{predates, WriteTracker, WRITE_TIMESTAMP_KEY};
use super::storage::KeyValueStorage;

/// Storage key of the persisted schema-version marker.
pub const VERSION_KEY: &str = "oncocache_version";

/// TTL for data that stays cached until explicitly invalidated.
pub const NO_EXPIRY: Duration = Duration::MAX;

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn is_internal_key(key: &str) -> bool {
    key == VERSION_KEY || key == WRITE_TIMESTAMP_KEY
}

pub struct CacheStore {
    storage: Arc<dyn KeyValueStorage>,
    clock: Arc<dyn Clock>,
    tracker: WriteTracker,
    version: String,
}

impl CacheStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>, clock: Arc<dyn Clock>) -> Self {
        Self::with_version(storage, clock, CACHE_VERSION)
    }

    pub fn with_version(
        storage: Arc<dyn KeyValueStorage>,
        clock: Arc<dyn Clock>,
        version: impl Into<String>,
    ) -> Self {
        let tracker = WriteTracker::new(Arc::clone(&storage), Arc::clone(&clock));
        Self {
            storage,
            clock,
            tracker,
            version: version.into(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Compare the persisted schema version with ours and wipe on mismatch.
    ///
    /// Returns `true` when a wipe happened. Safe to call any number of times.
    pub fn init(&self) -> bool {
        match self.storage.get_item(VERSION_KEY) {
            Ok(Some(found)) if found == self.version => {
                debug!(version = %self.version, "Cache schema version current");
                false
            }
            found => {
                let previous = found.ok().flatten();
                info!(
                    previous = ?previous,
                    current = %self.version,
                    "Cache schema version changed, wiping cache"
                );
                self.wipe();
                true
            }
        }
    }

    /// Store `data` under `key` for `ttl`. Returns `false` if it could not be persisted.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T, metadata: Value, ttl: Duration) -> bool {
        let timestamp = self.tracker.entry_timestamp();
        let entry = CacheEntry {
            data,
            metadata,
            timestamp,
            expiry: timestamp.saturating_add(ttl_millis(ttl)),
            version: self.version.clone(),
            is_stale: false,
        };
        self.persist(key, &entry)
    }

    /// Write an existing entry back, keeping its expiry.
    pub fn rewrite<T: Serialize>(&self, key: &str, entry: &CacheEntry<T>) -> bool {
        self.persist(key, entry)
    }

    fn persist<T: Serialize>(&self, key: &str, entry: &CacheEntry<T>) -> bool {
        let text = match serde_json::to_string(entry) {
            Ok(text) => text,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize cache entry");
                return false;
            }
        };

        match self.storage.set_item(key, &text) {
            Ok(()) => {
                debug!(key = %key, bytes = text.len(), "Cached entry");
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache write failed, sweeping expired entries");
                // Never leave the value this write was meant to replace
                if let Err(e) = self.storage.remove_item(key) {
                    debug!(key = %key, error = %e, "Failed to drop superseded entry");
                }
                let swept = self.clear_expired_only();
                debug!(swept, "Expired entries removed after failed write");
                false
            }
        }
    }

    /// Read an entry.
    ///
    /// Missing, corrupt, expired and version-mismatched entries return `None`
    /// (the latter three are evicted). An entry cached before the last known
    /// write is returned with `is_stale` set, or evicted when `allow_stale`
    /// is false.
    pub fn get<T: DeserializeOwned>(&self, key: &str, allow_stale: bool) -> Option<CacheEntry<T>> {
        let raw = match self.storage.get_item(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(key = %key, "Cache miss");
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed");
                return None;
            }
        };

        let mut entry: CacheEntry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "Corrupt cache entry, evicting");
                self.remove(key);
                return None;
            }
        };

        if entry.version != self.version {
            debug!(key = %key, found = %entry.version, "Cache entry from another schema version, evicting");
            self.remove(key);
            return None;
        }

        if entry.is_expired_at(self.clock.now_ms()) {
            debug!(key = %key, "Cache entry expired, evicting");
            self.remove(key);
            return None;
        }

        if self.tracker.written_since(entry.timestamp) {
            if !allow_stale {
                debug!(key = %key, "Cache entry predates last write, evicting");
                self.remove(key);
                return None;
            }
            entry.is_stale = true;
        }

        debug!(key = %key, stale = entry.is_stale, "Cache hit");
        Some(entry)
    }

    pub fn remove(&self, key: &str) -> bool {
        match self.storage.remove_item(key) {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to remove cache entry");
                false
            }
        }
    }

    /// Cache-owned keys (the version and write-timestamp markers excluded).
    pub fn keys(&self) -> Vec<String> {
        match self.storage.keys() {
            Ok(keys) => keys.into_iter().filter(|k| !is_internal_key(k)).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list cache keys");
                Vec::new()
            }
        }
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect()
    }

    pub fn remove_prefix(&self, prefix: &str) -> usize {
        self.keys_with_prefix(prefix)
            .iter()
            .filter(|key| self.remove(key))
            .count()
    }

    /// Remove every entry and re-stamp the write timestamp.
    pub fn clear_all(&self) -> usize {
        let count = self.keys().len();
        self.wipe();
        info!(count, "Cleared all cache entries");
        count
    }

    fn wipe(&self) {
        if let Err(e) = self.storage.clear() {
            warn!(error = %e, "Failed to clear cache storage");
        }
        if let Err(e) = self.storage.set_item(VERSION_KEY, &self.version) {
            warn!(error = %e, "Failed to write cache version marker");
        }
        self.tracker.reset();
        self.tracker.update_write_timestamp();
    }

    /// Remove expired, corrupt and version-mismatched entries. Returns how many went.
    pub fn clear_expired_only(&self) -> usize {
        let now = self.clock.now_ms();
        let mut removed = 0;
        for key in self.keys() {
            let keep = match self.storage.get_item(&key) {
                Ok(Some(raw)) => match serde_json::from_str::<CacheEntry<Value>>(&raw) {
                    Ok(entry) => entry.version == self.version && !entry.is_expired_at(now),
                    Err(_) => false,
                },
                Ok(None) => true,
                Err(_) => false,
            };
            if !keep && self.remove(&key) {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Swept expired cache entries");
        }
        removed
    }

    pub fn update_write_timestamp(&self) -> i64 {
        self.tracker.update_write_timestamp()
    }

    pub fn last_write_timestamp(&self) -> i64 {
        self.tracker.last_write_timestamp()
    }

    /// Timestamp a value cached right now would carry.
    pub fn entry_timestamp(&self) -> i64 {
        self.tracker.entry_timestamp()
    }

    /// Snapshot for a cache-management panel.
    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now_ms();
        let last_write = self.tracker.last_write_timestamp();
        let mut stats = CacheStats {
            last_write,
            quota_bytes: self.storage.quota_bytes(),
            bytes_used: self.storage.used_bytes().unwrap_or(0),
            ..CacheStats::default()
        };

        for key in self.keys() {
            let Ok(Some(raw)) = self.storage.get_item(&key) else {
                continue;
            };
            let Ok(entry) = serde_json::from_str::<CacheEntry<Value>>(&raw) else {
                stats.invalid += 1;
                continue;
            };
            if entry.version != self.version || entry.is_expired_at(now) {
                stats.invalid += 1;
                continue;
            }
            stats.entries += 1;
            if predates(entry.timestamp, last_write) {
                stats.stale += 1;
            }
            stats.oldest = Some(stats.oldest.map_or(entry.timestamp, |t| t.min(entry.timestamp)));
            stats.newest = Some(stats.newest.map_or(entry.timestamp, |t| t.max(entry.timestamp)));
        }
        stats
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Live entries.
    pub entries: usize,
    /// Live entries cached before the last write.
    pub stale: usize,
    /// Expired, corrupt or version-mismatched entries awaiting a sweep.
    pub invalid: usize,
    pub bytes_used: usize,
    pub quota_bytes: usize,
    pub last_write: i64,
    pub oldest: Option<i64>,
    pub newest: Option<i64>,
}

impl CacheStats {
    pub fn oldest_age(&self, now_ms: i64) -> String {
        self.oldest
            .map(|t| format_age(now_ms - t))
            .unwrap_or_else(|| "never".to_string())
    }

    pub fn newest_age(&self, now_ms: i64) -> String {
        self.newest
            .map(|t| format_age(now_ms - t))
            .unwrap_or_else(|| "never".to_string())
    }

    pub fn usage_percent(&self) -> u32 {
        if self.quota_bytes == 0 {
            return 100;
        }
        ((self.bytes_used as f64 / self.quota_bytes as f64) * 100.0).round() as u32
    }
}
