//! Process-wide "last write" marker.
//!
//! Every successful create/update/delete stamps the marker. A cached read
//! whose timestamp predates the marker may be missing that write and is
//! flagged stale. The marker is collection-agnostic: any write anywhere
//! marks every older entry stale. False positives are acceptable, false
//! negatives are not.
//!
//! Stamps are millisecond wall-clock times nudged to stay ordered: a write
//! is always stamped past the previous marker, and an entry cached after a
//! write is stamped past that write. Two events in the same millisecond
//! therefore still compare in the order they happened.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tracing::warn;

use super::clock::Clock;
use super::storage::KeyValueStorage;

/// Storage key of the persisted marker. Lives outside the versioned,
/// expirable entries.
pub const WRITE_TIMESTAMP_KEY: &str = "oncocache_last_write";

/// Whether an entry stamped `cached_at` may be missing a write stamped `last_write`.
///
/// A write in the same millisecond counts; an unset marker (`0`) never does.
pub fn predates(cached_at: i64, last_write: i64) -> bool {
    last_write > 0 && last_write >= cached_at
}

pub struct WriteTracker {
    storage: Arc<dyn KeyValueStorage>,
    clock: Arc<dyn Clock>,
    /// In-process copy so a failed persist never hides a write from this process.
    local: AtomicI64,
}

impl WriteTracker {
    pub fn new(storage: Arc<dyn KeyValueStorage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            local: AtomicI64::new(0),
        }
    }

    /// Stamp the marker with the current time, or just past the previous
    /// marker if the clock has not moved beyond it, and return the stamp.
    pub fn update_write_timestamp(&self) -> i64 {
        let stamp = self
            .clock
            .now_ms()
            .max(self.last_write_timestamp().saturating_add(1));
        self.local.fetch_max(stamp, Ordering::SeqCst);
        if let Err(e) = self.storage.set_item(WRITE_TIMESTAMP_KEY, &stamp.to_string()) {
            warn!(error = %e, "Failed to persist write timestamp");
        }
        stamp
    }

    /// Timestamp for an entry cached now: the current time, pushed past the
    /// marker so data fetched after a write never reads as predating it.
    pub fn entry_timestamp(&self) -> i64 {
        let now = self.clock.now_ms();
        match self.last_write_timestamp() {
            0 => now,
            last => now.max(last.saturating_add(1)),
        }
    }

    /// Latest write seen by this process or persisted by another one, `0` if never set.
    pub fn last_write_timestamp(&self) -> i64 {
        let persisted = match self.storage.get_item(WRITE_TIMESTAMP_KEY) {
            Ok(Some(raw)) => raw.trim().parse::<i64>().unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                warn!(error = %e, "Failed to read write timestamp");
                0
            }
        };
        persisted.max(self.local.load(Ordering::SeqCst))
    }

    /// Whether a write happened at or after `cached_at`.
    pub fn written_since(&self, cached_at: i64) -> bool {
        predates(cached_at, self.last_write_timestamp())
    }

    /// Forget every write. Only a full cache wipe calls this, and it re-stamps right after.
    pub(crate) fn reset(&self) {
        self.local.store(0, Ordering::SeqCst);
        if let Err(e) = self.storage.remove_item(WRITE_TIMESTAMP_KEY) {
            warn!(error = %e, "Failed to remove write timestamp");
        }
    }
}
