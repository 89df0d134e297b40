//! Chunked storage for collections too large for a single entry.
//!
//! A collection is stored as one metadata entry (`<prefix>_meta`) and
//! `ceil(total / chunk_size)` chunk entries (`<prefix>_chunk_<i>`), chunk `i`
//! holding items `[i * chunk_size, min((i + 1) * chunk_size, total))`.
//!
//! Reads are best effort: a missing chunk is skipped with a warning and the
//! caller gets a shorter result flagged stale, never an error. Chunk size and
//! the record ceiling can change at runtime; each operation takes one
//! snapshot of the limits when it starts.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::store::CacheStore;

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_MAX_RECORDS: usize = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    pub chunk_size: usize,
    pub max_records: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_records: DEFAULT_MAX_RECORDS,
        }
    }
}

/// Metadata entry describing a chunked collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "camelCase")]
pub struct CollectionMeta {
    pub total_items: usize,
    pub total_chunks: usize,
    /// Chunk size the collection was written with.
    #[serde(default)]
    pub chunk_size: usize,
    pub has_more: bool,
    #[cfg_attr(feature = "ts", ts(type = "unknown"))]
    pub params: Value,
    pub timestamp: i64,
    /// Items dropped at write time because the collection exceeded the ceiling.
    #[serde(default)]
    pub truncated_from: Option<usize>,
}

impl CollectionMeta {
    /// Whether the chunk count matches the item count at the recorded chunk size.
    pub fn is_consistent(&self) -> bool {
        self.chunk_size > 0 && self.total_chunks == self.total_items.div_ceil(self.chunk_size)
    }
}

/// A reassembled collection.
#[derive(Debug, Clone)]
pub struct ChunkedCollection<T> {
    pub data: Vec<T>,
    pub meta: CollectionMeta,
    pub timestamp: i64,
    /// Cached before the last write, or missing chunks.
    pub is_stale: bool,
    pub missing_chunks: Vec<usize>,
}

impl<T> ChunkedCollection<T> {
    pub fn is_complete(&self) -> bool {
        self.missing_chunks.is_empty()
    }
}

pub struct ChunkedCache {
    store: Arc<CacheStore>,
    prefix: String,
    ttl: Duration,
    limits: RwLock<ChunkLimits>,
}

impl ChunkedCache {
    pub fn new(store: Arc<CacheStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self::with_limits(store, prefix, ttl, ChunkLimits::default())
    }

    pub fn with_limits(
        store: Arc<CacheStore>,
        prefix: impl Into<String>,
        ttl: Duration,
        limits: ChunkLimits,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl,
            limits: RwLock::new(limits),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn limits(&self) -> ChunkLimits {
        match self.limits.read() {
            Ok(limits) => *limits,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_limits(&self, limits: ChunkLimits) {
        match self.limits.write() {
            Ok(mut current) => *current = limits,
            Err(poisoned) => *poisoned.into_inner() = limits,
        }
    }

    fn meta_key(&self) -> String {
        format!("{}_meta", self.prefix)
    }

    fn chunk_key(&self, index: usize) -> String {
        format!("{}_chunk_{}", self.prefix, index)
    }

    /// Store `items` using the current limits.
    pub fn cache_collection<T: Serialize>(&self, items: &[T], params: &Value, has_more: bool) -> bool {
        self.cache_collection_with(items, params, has_more, self.limits())
    }

    /// Store `items` using explicit limits.
    ///
    /// Items past `limits.max_records` are dropped. Chunk write failures are
    /// logged and skipped; the result is `true` as long as the metadata
    /// entry was written.
    pub fn cache_collection_with<T: Serialize>(
        &self,
        items: &[T],
        params: &Value,
        has_more: bool,
        limits: ChunkLimits,
    ) -> bool {
        let chunk_size = limits.chunk_size.max(1);
        let kept = items.len().min(limits.max_records);
        let truncated_from = if kept < items.len() {
            warn!(
                prefix = %self.prefix,
                total = items.len(),
                kept,
                "Collection exceeds record ceiling, truncating"
            );
            Some(items.len())
        } else {
            None
        };
        let items = &items[..kept];

        // Drop chunks left over from a previous, larger collection
        self.clear();

        let total_chunks = items.len().div_ceil(chunk_size);
        let meta = CollectionMeta {
            total_items: items.len(),
            total_chunks,
            chunk_size,
            has_more: has_more || truncated_from.is_some(),
            params: params.clone(),
            timestamp: self.store.now_ms(),
            truncated_from,
        };

        if !self.store.set(&self.meta_key(), &meta, json!({}), self.ttl) {
            warn!(prefix = %self.prefix, "Failed to write collection metadata");
            return false;
        }

        let mut failed = 0;
        for (index, chunk) in items.chunks(chunk_size).enumerate() {
            let metadata = json!({ "chunkIndex": index, "totalChunks": total_chunks });
            if !self.store.set(&self.chunk_key(index), chunk, metadata, self.ttl) {
                warn!(prefix = %self.prefix, chunk = index, "Failed to write chunk");
                failed += 1;
            }
        }

        info!(
            prefix = %self.prefix,
            items = items.len(),
            chunks = total_chunks,
            failed,
            "Cached chunked collection"
        );
        true
    }

    /// Reassemble the collection using the current record ceiling.
    pub fn get_collection<T: DeserializeOwned>(
        &self,
        on_progress: Option<&mut dyn FnMut(u32)>,
    ) -> Option<ChunkedCollection<T>> {
        self.get_collection_with(on_progress, self.limits())
    }

    /// Reassemble the collection, stopping once `limits.max_records` items are loaded.
    ///
    /// `on_progress` receives `round(loaded / total * 100)` after each chunk.
    pub fn get_collection_with<T: DeserializeOwned>(
        &self,
        mut on_progress: Option<&mut dyn FnMut(u32)>,
        limits: ChunkLimits,
    ) -> Option<ChunkedCollection<T>> {
        let meta_entry = self.store.get::<CollectionMeta>(&self.meta_key(), true)?;
        let meta = meta_entry.data;
        if !meta.is_consistent() {
            warn!(
                prefix = %self.prefix,
                total_items = meta.total_items,
                total_chunks = meta.total_chunks,
                chunk_size = meta.chunk_size,
                "Inconsistent collection metadata, evicting"
            );
            self.store.remove(&self.meta_key());
            return None;
        }
        let mut is_stale = meta_entry.is_stale;

        let ceiling = limits.max_records;
        let mut data: Vec<T> = Vec::with_capacity(meta.total_items.min(ceiling));
        let mut missing_chunks = Vec::new();

        for index in 0..meta.total_chunks {
            if data.len() >= ceiling {
                debug!(prefix = %self.prefix, ceiling, "Record ceiling reached, stopping early");
                break;
            }

            match self.store.get::<Vec<T>>(&self.chunk_key(index), true) {
                Some(chunk) => {
                    is_stale |= chunk.is_stale;
                    data.extend(chunk.data);
                }
                None => {
                    warn!(prefix = %self.prefix, chunk = index, "Missing chunk, skipping");
                    missing_chunks.push(index);
                }
            }

            if let Some(ref mut progress) = on_progress {
                let percent = if meta.total_items == 0 {
                    100
                } else {
                    let loaded = data.len().min(meta.total_items);
                    ((loaded as f64 / meta.total_items as f64) * 100.0).round() as u32
                };
                progress(percent);
            }
        }

        data.truncate(ceiling);
        if !missing_chunks.is_empty() {
            is_stale = true;
        }

        Some(ChunkedCollection {
            data,
            timestamp: meta.timestamp,
            meta,
            is_stale,
            missing_chunks,
        })
    }

    /// Remove the metadata and every chunk.
    pub fn clear(&self) -> usize {
        let prefix = format!("{}_", self.prefix);
        self.store.remove_prefix(&prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::storage::{KeyValueStorage, MemoryStorage};

    const TTL: Duration = Duration::from_secs(1800);

    fn setup(limits: ChunkLimits) -> (ChunkedCache, Arc<MemoryStorage>, Arc<CacheStore>) {
        let storage = Arc::new(MemoryStorage::with_quota(50 * 1024 * 1024));
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(CacheStore::new(storage.clone(), clock));
        store.init();
        let cache = ChunkedCache::with_limits(store.clone(), "services_all", TTL, limits);
        (cache, storage, store)
    }

    fn records(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({"id": i, "name": format!("svc-{}", i)})).collect()
    }

    #[test]
    fn test_round_trip_preserves_order_for_edge_sizes() {
        let c = 4;
        let limits = ChunkLimits {
            chunk_size: c,
            max_records: 100,
        };
        for n in [0, 1, c - 1, c, c + 1, 5 * c] {
            let (cache, _, _) = setup(limits);
            let items = records(n);
            assert!(cache.cache_collection(&items, &json!({}), false));

            let loaded = cache.get_collection::<Value>(None).unwrap();
            assert_eq!(loaded.data, items, "n = {}", n);
            assert_eq!(loaded.meta.total_chunks, n.div_ceil(c));
            assert!(!loaded.is_stale);
            assert!(loaded.is_complete());
        }
    }

    #[test]
    fn test_truncates_to_max_records_on_write() {
        let (cache, _, _) = setup(ChunkLimits {
            chunk_size: 3,
            max_records: 7,
        });
        let items = records(10);
        assert!(cache.cache_collection(&items, &json!({"page": 1}), false));

        let loaded = cache.get_collection::<Value>(None).unwrap();
        assert_eq!(loaded.data, items[..7].to_vec());
        assert_eq!(loaded.meta.truncated_from, Some(10));
        assert!(loaded.meta.has_more);
        assert_eq!(loaded.meta.params, json!({"page": 1}));
    }

    #[test]
    fn test_read_uses_current_ceiling() {
        let (cache, _, _) = setup(ChunkLimits {
            chunk_size: 4,
            max_records: 100,
        });
        cache.cache_collection(&records(20), &json!({}), false);

        cache.set_limits(ChunkLimits {
            chunk_size: 4,
            max_records: 6,
        });
        let loaded = cache.get_collection::<Value>(None).unwrap();
        assert_eq!(loaded.data, records(6));
    }

    #[test]
    fn test_missing_chunk_is_skipped() {
        let (cache, storage, _) = setup(ChunkLimits {
            chunk_size: 5,
            max_records: 100,
        });
        let items = records(15);
        cache.cache_collection(&items, &json!({}), false);
        storage.remove_item("services_all_chunk_1").unwrap();

        let loaded = cache.get_collection::<Value>(None).unwrap();
        assert_eq!(loaded.data.len(), 10);
        assert!(loaded.data.len() < loaded.meta.total_items);
        assert_eq!(loaded.data[..5], items[..5]);
        assert_eq!(loaded.data[5..], items[10..]);
        assert_eq!(loaded.missing_chunks, vec![1]);
        assert!(loaded.is_stale);
    }

    #[test]
    fn test_missing_or_invalid_meta_is_none() {
        let (cache, storage, store) = setup(ChunkLimits::default());
        assert!(cache.get_collection::<Value>(None).is_none());

        store.set("services_all_meta", &json!({"hasMore": false}), json!({}), TTL);
        assert!(cache.get_collection::<Value>(None).is_none());
        assert!(storage.get_item("services_all_meta").unwrap().is_none());
    }

    #[test]
    fn test_inconsistent_chunk_count_is_none() {
        let (cache, storage, store) = setup(ChunkLimits::default());
        let corrupt = json!({
            "totalItems": 3,
            "totalChunks": 5_000_000,
            "chunkSize": 500,
            "hasMore": false,
            "params": {},
            "timestamp": 1_000
        });
        store.set("services_all_meta", &corrupt, json!({}), TTL);
        assert!(cache.get_collection::<Value>(None).is_none());
        assert!(storage.get_item("services_all_meta").unwrap().is_none());

        // Metadata without a chunk size cannot be checked either
        let r#unsized = json!({"totalItems": 0, "totalChunks": 0, "hasMore": false, "params": {}, "timestamp": 1_000});
        store.set("services_all_meta", &r#unsized, json!({}), TTL);
        assert!(cache.get_collection::<Value>(None).is_none());
    }

    #[test]
    fn test_read_after_chunk_size_change() {
        let (cache, _, _) = setup(ChunkLimits {
            chunk_size: 3,
            max_records: 100,
        });
        cache.cache_collection(&records(10), &json!({}), false);
        cache.set_limits(ChunkLimits {
            chunk_size: 4,
            max_records: 100,
        });

        let loaded = cache.get_collection::<Value>(None).unwrap();
        assert_eq!(loaded.data, records(10));
        assert_eq!(loaded.meta.chunk_size, 3);
    }

    #[test]
    fn test_progress_reports_each_chunk() {
        let (cache, _, _) = setup(ChunkLimits {
            chunk_size: 3,
            max_records: 100,
        });
        cache.cache_collection(&records(9), &json!({}), false);

        let mut seen = Vec::new();
        let mut record = |p: u32| seen.push(p);
        cache.get_collection::<Value>(Some(&mut record)).unwrap();
        assert_eq!(seen, vec![33, 67, 100]);
    }

    #[test]
    fn test_rewrite_with_fewer_chunks_drops_old_ones() {
        let (cache, storage, _) = setup(ChunkLimits {
            chunk_size: 2,
            max_records: 100,
        });
        cache.cache_collection(&records(10), &json!({}), false);
        cache.cache_collection(&records(3), &json!({}), false);

        assert!(storage.get_item("services_all_chunk_4").unwrap().is_none());
        assert_eq!(cache.get_collection::<Value>(None).unwrap().data, records(3));
    }

    #[test]
    fn test_partial_write_failure_still_succeeds() {
        let storage = Arc::new(MemoryStorage::with_quota(700));
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(CacheStore::new(storage.clone(), clock));
        store.init();
        let cache = ChunkedCache::with_limits(
            store,
            "big",
            TTL,
            ChunkLimits {
                chunk_size: 2,
                max_records: 100,
            },
        );

        let items: Vec<Value> = (0..8).map(|i| json!({"id": i, "blob": "z".repeat(40)})).collect();
        assert!(cache.cache_collection(&items, &json!({}), false));

        let loaded = cache.get_collection::<Value>(None).unwrap();
        assert!(!loaded.missing_chunks.is_empty());
        assert!(loaded.data.len() < items.len());
        assert_eq!(loaded.data[..2], items[..2]);
    }
}
