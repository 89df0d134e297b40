//! Per-collection cache policy on top of the shared [`CacheStore`].
//!
//! A [`DomainCache`] owns one key prefix (`services_`, `patients_`,
//! `dropdown_fee-schedules`, ...) and decides how its collection is keyed,
//! how long entries live, whether caching is enabled at all, and when the
//! next read must bypass the cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::models::{Collection, Page};

use super::entry::{merge_record, CacheEntry, CachePayload};
use super::events::{CacheEvent, CacheEvents};
use super::key::QueryParams;
use super::staleness::predates;
use super::store::CacheStore;

/// Outcome of [`DomainCache::update_record_in_all_caches`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchReport {
    pub success: bool,
    pub updated_count: usize,
    pub errors: Vec<String>,
}

pub struct DomainCache {
    collection: Collection,
    store: Arc<CacheStore>,
    events: CacheEvents,
    ttl: Duration,
    enabled: AtomicBool,
    force_revalidation: AtomicBool,
}

impl DomainCache {
    pub fn new(collection: Collection, store: Arc<CacheStore>, events: CacheEvents) -> Self {
        let ttl = collection.default_ttl();
        Self::with_ttl(collection, store, events, ttl)
    }

    pub fn with_ttl(
        collection: Collection,
        store: Arc<CacheStore>,
        events: CacheEvents,
        ttl: Duration,
    ) -> Self {
        Self {
            collection,
            store,
            events,
            ttl,
            enabled: AtomicBool::new(true),
            force_revalidation: AtomicBool::new(false),
        }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Prefix shared by every key this cache writes, e.g. `services_`.
    pub fn prefix(&self) -> String {
        format!("{}_", self.collection.cache_name())
    }

    pub fn key_for(&self, params: &QueryParams) -> String {
        params.cache_key(&self.collection.cache_name())
    }

    // ===== Manager-level controls =====

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable caching. Disabled reads always go to the server.
    pub fn toggle_cache(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!(collection = %self.collection, enabled, "Cache toggled");
            self.events.publish(CacheEvent::Toggled {
                collection: self.collection.cache_name(),
                enabled,
            });
        }
    }

    /// Remove every entry under this collection's prefix.
    pub fn clear_cache(&self) -> usize {
        let prefix = self.prefix();
        let removed = self.store.remove_prefix(&prefix);
        info!(collection = %self.collection, removed, "Cleared collection cache");
        self.events.publish(CacheEvent::Cleared {
            prefix: Some(prefix),
            removed,
        });
        removed
    }

    /// Make the next read bypass the cache. Stays raised until a fresh page is stored.
    pub fn force_revalidation(&self) {
        debug!(collection = %self.collection, "Forced revalidation requested");
        self.force_revalidation.store(true, Ordering::SeqCst);
    }

    pub fn revalidation_forced(&self) -> bool {
        self.force_revalidation.load(Ordering::SeqCst)
    }

    /// Whether reads should consult the cache at all right now.
    pub fn should_read_cache(&self) -> bool {
        self.is_enabled() && !self.revalidation_forced()
    }

    // ===== Pages =====

    /// Cached page for `params`, `None` when disabled, forced, or absent.
    pub fn read_page(&self, params: &QueryParams) -> Option<CacheEntry<Page>> {
        if !self.should_read_cache() {
            return None;
        }
        self.store.get::<Page>(&self.key_for(params), true)
    }

    /// Store a freshly fetched page and clear any forced revalidation.
    pub fn store_page(&self, params: &QueryParams, page: &Page) -> bool {
        self.force_revalidation.store(false, Ordering::SeqCst);
        if !self.is_enabled() {
            return false;
        }
        let metadata = json!({ "params": params, "count": page.len() });
        self.store.set(&self.key_for(params), page, metadata, self.ttl)
    }

    // ===== Whole-list values (dropdown options) =====

    pub fn list_key(&self) -> String {
        format!("{}options", self.prefix())
    }

    pub fn read_list<T: serde::de::DeserializeOwned>(&self) -> Option<CacheEntry<Vec<T>>> {
        if !self.should_read_cache() {
            return None;
        }
        self.store.get::<Vec<T>>(&self.list_key(), true)
    }

    pub fn store_list<T: Serialize>(&self, items: &[T]) -> bool {
        self.force_revalidation.store(false, Ordering::SeqCst);
        if !self.is_enabled() {
            return false;
        }
        let metadata = json!({ "count": items.len() });
        self.store.set(&self.list_key(), items, metadata, self.ttl)
    }

    // ===== Selective patch =====

    /// Merge `updated` into every cached copy of the record with the same id.
    ///
    /// Every entry under this collection's prefix is classified; collections
    /// are scanned for a matching id and single records compared directly.
    /// Unrecognised shapes are skipped. Entries that were fresh are
    /// re-stamped (their expiry is kept); stale ones stay stale.
    pub fn update_record_in_all_caches(&self, updated: &Value) -> PatchReport {
        self.update_record_after_write(updated, self.store.last_write_timestamp())
    }

    /// Patch cached copies after this process wrote `updated` to the server.
    ///
    /// `previous_write` is the write marker as it stood before that write was
    /// stamped. Entries cached after it missed nothing but this update and
    /// are re-stamped so they read fresh; older entries keep their timestamp
    /// because some earlier write still needs a revalidation.
    pub fn update_record_after_write(&self, updated: &Value, previous_write: i64) -> PatchReport {
        let id_field = self.collection.id_field();
        let Some(id) = updated.get(id_field).filter(|id| !id.is_null()) else {
            return PatchReport {
                success: false,
                updated_count: 0,
                errors: vec![format!("record has no `{}` field", id_field)],
            };
        };

        let mut report = PatchReport {
            success: true,
            ..PatchReport::default()
        };

        for key in self.store.keys_with_prefix(&self.prefix()) {
            let Some(entry) = self.store.get::<Value>(&key, true) else {
                continue;
            };

            let mut payload = CachePayload::from_value(entry.data);
            let patched = match &mut payload {
                CachePayload::Collection { items, .. } => {
                    let mut hit = false;
                    for item in items.iter_mut().filter(|item| item.get(id_field) == Some(id)) {
                        hit |= merge_record(item, updated);
                    }
                    hit
                }
                CachePayload::Record(record) if record.get(id_field) == Some(id) => {
                    merge_record(record, updated)
                }
                CachePayload::Record(_) => false,
            };

            if !patched {
                continue;
            }

            let timestamp = if predates(entry.timestamp, previous_write) {
                entry.timestamp
            } else {
                self.store.entry_timestamp()
            };
            let rewritten = CacheEntry {
                data: payload.into_value(),
                metadata: entry.metadata,
                timestamp,
                expiry: entry.expiry,
                version: entry.version,
                is_stale: false,
            };
            if self.store.rewrite(&key, &rewritten) {
                report.updated_count += 1;
            } else {
                warn!(key = %key, "Failed to write patched entry");
                report.success = false;
                report.errors.push(format!("failed to write {}", key));
            }
        }

        debug!(
            collection = %self.collection,
            id = %id,
            updated = report.updated_count,
            "Patched record in cached collections"
        );
        report
    }
}
