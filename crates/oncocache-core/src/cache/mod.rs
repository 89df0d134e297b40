//! Persistent caching for catalog and clinical collections.
//!
//! The layers, bottom up:
//!
//! - [`KeyValueStorage`]: a synchronous string store with a byte quota
//!   (in memory, or one JSON file per key on disk)
//! - [`CacheStore`]: versioned entries with expiry and write-timestamp
//!   staleness on top of a storage backend
//! - [`ChunkedCache`]: large collections split across several entries
//! - [`DomainCache`]: per-collection keys, TTLs and manager controls
//! - [`Revalidator`]: cache-first reads with background revalidation
//!
//! [`CacheService`] wires one of each together for the whole application.

pub mod chunked;
pub mod clock;
pub mod entry;
pub mod events;
pub mod key;
pub mod manager;
pub mod revalidation;
pub mod scheduler;
pub mod staleness;
pub mod storage;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use serde::Serialize;
use tracing::warn;

use crate::config::CacheSettings;
use crate::models::{Collection, DropdownKind, DropdownOption};

pub use chunked::{ChunkLimits, ChunkedCache, ChunkedCollection, CollectionMeta};
pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{format_age, merge_record, CacheEntry, CachePayload, CACHE_VERSION};
pub use events::{CacheEvent, CacheEvents, DataSource};
pub use key::{QueryParams, SortOrder};
pub use manager::{DomainCache, PatchReport};
pub use revalidation::{
    CatalogOutcome, FocusDecision, FocusEvent, FocusPolicy, FocusSubscription, NullSink,
    ReadOutcome, ReadPath, RecordSource, Revalidator, ViewSink,
};
pub use scheduler::TaskScheduler;
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage, StorageError};
pub use store::{CacheStats, CacheStore, NO_EXPIRY};

/// Prefix of the chunked full-catalog entries.
pub const CATALOG_PREFIX: &str = "services_all";

/// One row of the cache-management panel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainStatus {
    pub name: String,
    pub enabled: bool,
    pub revalidation_forced: bool,
    pub entries: usize,
    pub ttl_secs: Option<u64>,
}

/// Snapshot for the cache-management panel.
#[derive(Debug, Clone)]
pub struct CacheStatus {
    pub domains: Vec<DomainStatus>,
    pub stats: CacheStats,
    pub now_ms: i64,
}

impl CacheStatus {
    pub fn oldest_age(&self) -> String {
        self.stats.oldest_age(self.now_ms)
    }

    pub fn newest_age(&self) -> String {
        self.stats.newest_age(self.now_ms)
    }

    pub fn last_write_age(&self) -> Option<String> {
        (self.stats.last_write > 0).then(|| format_age(self.now_ms - self.stats.last_write))
    }
}

/// Every cache the application uses, sharing one store and one event bus.
pub struct CacheService {
    store: Arc<CacheStore>,
    events: CacheEvents,
    services: Arc<DomainCache>,
    patients: Arc<DomainCache>,
    protocols: Arc<DomainCache>,
    preauthorizations: Arc<DomainCache>,
    dropdowns: [Arc<DomainCache>; 6],
    catalog: Arc<ChunkedCache>,
    focus: FocusPolicy,
    search_debounce: Duration,
}

impl CacheService {
    pub fn new(storage: Arc<dyn KeyValueStorage>, clock: Arc<dyn Clock>, settings: &CacheSettings) -> Self {
        let store = Arc::new(CacheStore::new(storage, clock));
        let events = CacheEvents::new();

        let domain = |collection: Collection, ttl: Duration| {
            let cache = DomainCache::with_ttl(collection, Arc::clone(&store), events.clone(), ttl);
            cache.toggle_cache(settings.enabled);
            Arc::new(cache)
        };

        let services = domain(Collection::Services, settings.service_ttl());
        let patients = domain(Collection::Patients, settings.clinical_ttl());
        let protocols = domain(Collection::Protocols, settings.clinical_ttl());
        let preauthorizations = domain(Collection::PreAuthorizations, settings.clinical_ttl());
        let dropdowns = DropdownKind::ALL.map(|kind| domain(Collection::Dropdown(kind), NO_EXPIRY));

        let catalog = Arc::new(ChunkedCache::with_limits(
            Arc::clone(&store),
            CATALOG_PREFIX,
            settings.service_ttl(),
            ChunkLimits {
                chunk_size: settings.chunk_size,
                max_records: settings.max_records,
            },
        ));

        Self {
            store,
            events,
            services,
            patients,
            protocols,
            preauthorizations,
            dropdowns,
            catalog,
            focus: settings.focus_policy(),
            search_debounce: settings.search_debounce(),
        }
    }

    /// Check the schema version, wiping the store on mismatch. Call once at startup.
    pub fn init(&self) -> bool {
        self.store.init()
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn events(&self) -> &CacheEvents {
        &self.events
    }

    pub fn catalog(&self) -> &Arc<ChunkedCache> {
        &self.catalog
    }

    pub fn domain(&self, collection: Collection) -> &Arc<DomainCache> {
        match collection {
            Collection::Services => &self.services,
            Collection::Patients => &self.patients,
            Collection::Protocols => &self.protocols,
            Collection::PreAuthorizations => &self.preauthorizations,
            Collection::Dropdown(kind) => &self.dropdowns[kind as usize],
        }
    }

    fn domains(&self) -> impl Iterator<Item = &Arc<DomainCache>> {
        [&self.services, &self.patients, &self.protocols, &self.preauthorizations]
            .into_iter()
            .chain(self.dropdowns.iter())
    }

    /// A cache-first loader for `collection` pushing into `sink`.
    pub fn revalidator(
        &self,
        collection: Collection,
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn ViewSink>,
    ) -> Revalidator {
        let revalidator = Revalidator::new(
            Arc::clone(self.domain(collection)),
            source,
            sink,
            self.events.clone(),
        )
        .with_focus_policy(self.focus)
        .with_search_debounce(self.search_debounce);
        if collection == Collection::Services {
            revalidator.with_catalog(Arc::clone(&self.catalog))
        } else {
            revalidator
        }
    }

    /// Dropdown options for `kind`, from the cache when fresh.
    ///
    /// Options are kept until invalidated. A stale list is refetched, and
    /// still served if the refetch fails.
    pub async fn load_options(
        &self,
        source: &dyn RecordSource,
        kind: DropdownKind,
    ) -> Result<(Vec<DropdownOption>, DataSource)> {
        let cache = self.domain(Collection::Dropdown(kind));
        let cached = cache.read_list::<DropdownOption>();

        if let Some(entry) = cached.as_ref().filter(|entry| !entry.is_stale) {
            return Ok((entry.data.clone(), DataSource::Cache));
        }

        match source.fetch_options(kind).await {
            Ok(options) => {
                cache.store_list(&options);
                Ok((options, DataSource::Server))
            }
            Err(e) => match cached {
                Some(entry) => {
                    warn!(kind = kind.path(), error = %e, "Option refresh failed, serving stale list");
                    Ok((entry.data, DataSource::Cache))
                }
                None => Err(e).with_context(|| format!("Failed to load {} options", kind.title())),
            },
        }
    }

    /// Every dropdown list at once; uncached lists are fetched concurrently.
    pub async fn load_all_options(
        &self,
        source: &dyn RecordSource,
    ) -> Vec<(DropdownKind, Result<Vec<DropdownOption>>)> {
        let loads = DropdownKind::ALL.map(|kind| async move {
            let options = self.load_options(source, kind).await.map(|(options, _)| options);
            (kind, options)
        });
        join_all(loads).await
    }

    // ===== Management panel =====

    pub fn toggle_all(&self, enabled: bool) {
        for domain in self.domains() {
            domain.toggle_cache(enabled);
        }
    }

    pub fn force_revalidation_all(&self) {
        for domain in self.domains() {
            domain.force_revalidation();
        }
    }

    /// Wipe every entry and re-stamp the write timestamp.
    pub fn clear_all(&self) -> usize {
        let removed = self.store.clear_all();
        self.events.publish(CacheEvent::Cleared {
            prefix: None,
            removed,
        });
        removed
    }

    pub fn sweep_expired(&self) -> usize {
        let removed = self.store.clear_expired_only();
        if removed > 0 {
            self.events.publish(CacheEvent::Cleared {
                prefix: None,
                removed,
            });
        }
        removed
    }

    pub fn status(&self) -> CacheStatus {
        let domains = self
            .domains()
            .map(|domain| DomainStatus {
                name: domain.collection().cache_name(),
                enabled: domain.is_enabled(),
                revalidation_forced: domain.revalidation_forced(),
                entries: self.store.keys_with_prefix(&domain.prefix()).len(),
                ttl_secs: (domain.ttl() != NO_EXPIRY).then(|| domain.ttl().as_secs()),
            })
            .collect();

        CacheStatus {
            domains,
            stats: self.store.stats(),
            now_ms: self.store.now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::models::Page;

    #[derive(Default)]
    struct OptionsSource {
        fail: AtomicBool,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl RecordSource for OptionsSource {
        async fn fetch_page(&self, _: Collection, _: &QueryParams) -> Result<Page> {
            Ok(Page::default())
        }

        async fn fetch_options(&self, kind: DropdownKind) -> Result<Vec<DropdownOption>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("offline"));
            }
            Ok(vec![DropdownOption {
                id: json!(1),
                label: kind.title().to_string(),
            }])
        }

        async fn create_record(&self, _: Collection, record: &Value) -> Result<Value> {
            Ok(record.clone())
        }

        async fn update_record(&self, _: Collection, _: &Value, record: &Value) -> Result<Value> {
            Ok(record.clone())
        }

        async fn delete_record(&self, _: Collection, _: &Value) -> Result<()> {
            Ok(())
        }
    }

    fn service() -> (CacheService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(5_000));
        let service = CacheService::new(
            Arc::new(MemoryStorage::new()),
            clock.clone(),
            &CacheSettings::default(),
        );
        service.init();
        clock.advance(1);
        (service, clock)
    }

    #[test]
    fn test_domains_share_store_but_not_prefixes() {
        let (service, _) = service();
        let params = QueryParams::default();
        let page = Page::new(vec![json!({"id": 1})]);
        service.domain(Collection::Services).store_page(&params, &page);
        service.domain(Collection::Patients).store_page(&params, &page);

        assert_eq!(service.domain(Collection::Services).clear_cache(), 1);
        assert!(service.domain(Collection::Patients).read_page(&params).is_some());
    }

    #[test]
    fn test_dropdown_domains_are_distinct() {
        let (service, _) = service();
        for kind in DropdownKind::ALL {
            assert_eq!(
                service.domain(Collection::Dropdown(kind)).collection(),
                Collection::Dropdown(kind)
            );
        }
    }

    #[test]
    fn test_disabled_settings_disable_every_domain() {
        let settings = CacheSettings {
            enabled: false,
            ..CacheSettings::default()
        };
        let service = CacheService::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(ManualClock::new(0)),
            &settings,
        );
        assert!(service.status().domains.iter().all(|d| !d.enabled));
    }

    #[test]
    fn test_status_reports_entries_and_ages() {
        let (service, clock) = service();
        let params = QueryParams::default();
        service
            .domain(Collection::Services)
            .store_page(&params, &Page::new(vec![json!({"id": 1})]));
        clock.advance(5 * 60 * 1000);
        service.force_revalidation_all();

        let status = service.status();
        let services = status.domains.iter().find(|d| d.name == "services").unwrap();
        assert_eq!(services.entries, 1);
        assert!(services.revalidation_forced);
        assert_eq!(services.ttl_secs, Some(30 * 60));
        let dropdown = status
            .domains
            .iter()
            .find(|d| d.name == "dropdown_fee-schedules")
            .unwrap();
        assert_eq!(dropdown.ttl_secs, None);
        assert_eq!(status.stats.entries, 1);
        assert_eq!(status.oldest_age(), "5m ago");
    }

    #[test]
    fn test_clear_all_publishes_event() {
        let (service, _) = service();
        let mut rx = service.events().subscribe();
        service
            .domain(Collection::Protocols)
            .store_page(&QueryParams::default(), &Page::default());

        assert_eq!(service.clear_all(), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            CacheEvent::Cleared {
                prefix: None,
                removed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_options_cached_then_served_stale_when_offline() {
        let (service, clock) = service();
        let source = OptionsSource::default();

        let (first, from) = service.load_options(&source, DropdownKind::FeeSchedule).await.unwrap();
        assert_eq!(from, DataSource::Server);
        let (second, from) = service.load_options(&source, DropdownKind::FeeSchedule).await.unwrap();
        assert_eq!(from, DataSource::Cache);
        assert_eq!(first, second);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        clock.advance(1);
        service.store().update_write_timestamp();
        clock.advance(1);
        source.fail.store(true, Ordering::SeqCst);

        let (third, from) = service.load_options(&source, DropdownKind::FeeSchedule).await.unwrap();
        assert_eq!(from, DataSource::Cache);
        assert_eq!(third, first);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);

        assert!(service
            .load_options(&source, DropdownKind::ActiveIngredient)
            .await
            .is_err());
    }

    #[test]
    fn test_revalidators_use_configured_search_debounce() {
        let settings = CacheSettings {
            search_debounce_ms: 75,
            ..CacheSettings::default()
        };
        let service = CacheService::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(ManualClock::new(0)),
            &settings,
        );
        let revalidator = service.revalidator(
            Collection::Patients,
            Arc::new(OptionsSource::default()),
            Arc::new(NullSink),
        );
        assert_eq!(revalidator.search_debounce(), Duration::from_millis(75));
    }

    #[tokio::test]
    async fn test_all_options_load_together() {
        let (service, _) = service();
        let source = OptionsSource::default();

        let all = service.load_all_options(&source).await;
        assert_eq!(all.len(), DropdownKind::ALL.len());
        assert!(all.iter().all(|(_, options)| options.as_ref().is_ok_and(|o| o.len() == 1)));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 6);

        service.load_all_options(&source).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_only_services_revalidator_loads_catalog() {
        let (service, _) = service();
        let source: Arc<dyn RecordSource> = Arc::new(OptionsSource::default());

        let services = service.revalidator(Collection::Services, source.clone(), Arc::new(NullSink));
        let catalog = services.load_catalog(|_| {}).await.unwrap();
        assert!(catalog.items.is_empty());
        assert_eq!(catalog.source, DataSource::Server);

        let patients = service.revalidator(Collection::Patients, source, Arc::new(NullSink));
        assert!(patients.load_catalog(|_| {}).await.is_err());
    }
}
