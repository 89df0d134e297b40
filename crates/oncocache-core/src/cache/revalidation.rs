//! Cache-first reads with stale-while-revalidate.
//!
//! A [`Revalidator`] sits between one collection's view and its remote
//! source. Reads go through three paths:
//!
//! - fresh hit: served from the cache, no network
//! - stale hit: served from the cache immediately, then refetched in the
//!   background; the refetched page only reaches the view if the view is
//!   still showing the same query
//! - miss (or bypass when caching is disabled or a revalidation was forced):
//!   fetched from the source, stored, then shown
//!
//! Background failures are logged and dropped; foreground failures are
//! returned to the caller and pushed to the view as an error.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::{Collection, DropdownKind, DropdownOption, Page};

use super::chunked::{ChunkLimits, ChunkedCache};
use super::events::{CacheEvent, CacheEvents, DataSource};
use super::key::{QueryParams, DEFAULT_PAGE_SIZE};
use super::manager::{DomainCache, PatchReport};
use super::scheduler::TaskScheduler;

/// Default minimum gap between focus-triggered refreshes.
pub const DEFAULT_FOCUS_COOLDOWN: Duration = Duration::from_secs(3 * 60);

/// Default age after which a focus event forces a refresh.
pub const DEFAULT_FOCUS_MAX_AGE: Duration = Duration::from_secs(10 * 60);

/// Quiet period before a typed search term is fetched.
pub const DEFAULT_SEARCH_DEBOUNCE: Duration = Duration::from_millis(300);

// ============================================================================
// Seams
// ============================================================================

/// The remote system of record.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_page(&self, collection: Collection, params: &QueryParams) -> Result<Page>;

    async fn fetch_options(&self, kind: DropdownKind) -> Result<Vec<DropdownOption>>;

    async fn create_record(&self, collection: Collection, record: &Value) -> Result<Value>;

    async fn update_record(&self, collection: Collection, id: &Value, record: &Value) -> Result<Value>;

    async fn delete_record(&self, collection: Collection, id: &Value) -> Result<()>;
}

/// Where a view wants its state pushed. The cache layer never owns the view.
pub trait ViewSink: Send + Sync {
    fn set_records(&self, collection: Collection, page: &Page);
    fn set_loading(&self, collection: Collection, loading: bool);
    fn set_error(&self, collection: Collection, error: Option<String>);
    fn set_data_source(&self, collection: Collection, source: DataSource);
}

/// A sink that discards everything, for callers that only want return values.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ViewSink for NullSink {
    fn set_records(&self, _: Collection, _: &Page) {}
    fn set_loading(&self, _: Collection, _: bool) {}
    fn set_error(&self, _: Collection, _: Option<String>) {}
    fn set_data_source(&self, _: Collection, _: DataSource) {}
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPath {
    FreshHit,
    StaleHit,
    Miss,
    /// Cache skipped: disabled, or a revalidation was forced.
    Bypass,
}

#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub page: Page,
    pub path: ReadPath,
    pub source: DataSource,
}

#[derive(Debug, Clone)]
pub struct CatalogOutcome {
    pub items: Vec<Value>,
    pub source: DataSource,
    pub is_stale: bool,
    /// Set when the source held more records than the cache will keep.
    pub truncated_from: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FocusPolicy {
    pub cooldown: Duration,
    pub max_age: Duration,
}

impl Default for FocusPolicy {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_FOCUS_COOLDOWN,
            max_age: DEFAULT_FOCUS_MAX_AGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusDecision {
    /// Refreshed too recently.
    Cooldown,
    /// A background refresh was started.
    Revalidate,
    /// Cached data is young enough.
    Fresh,
    /// Nothing is on screen yet.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusEvent {
    Gained,
    Lost,
}

/// Owns the task listening for focus events. Dropping it stops the listener.
pub struct FocusSubscription {
    handle: JoinHandle<()>,
}

impl FocusSubscription {
    pub fn unsubscribe(self) {
        self.handle.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for FocusSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ============================================================================
// Revalidator
// ============================================================================

/// Cache-first loader for one collection.
/// Clone is cheap; clones share the active query and pending tasks.
#[derive(Clone)]
pub struct Revalidator {
    cache: Arc<DomainCache>,
    catalog: Option<Arc<ChunkedCache>>,
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn ViewSink>,
    events: CacheEvents,
    scheduler: Arc<TaskScheduler>,
    active: Arc<Mutex<Option<QueryParams>>>,
    last_refresh: Arc<AtomicI64>,
    focus: FocusPolicy,
    search_debounce: Duration,
}

impl Revalidator {
    pub fn new(
        cache: Arc<DomainCache>,
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn ViewSink>,
        events: CacheEvents,
    ) -> Self {
        Self {
            cache,
            catalog: None,
            source,
            sink,
            events,
            scheduler: Arc::new(TaskScheduler::new()),
            active: Arc::new(Mutex::new(None)),
            last_refresh: Arc::new(AtomicI64::new(0)),
            focus: FocusPolicy::default(),
            search_debounce: DEFAULT_SEARCH_DEBOUNCE,
        }
    }

    /// Attach the chunked cache used by [`Revalidator::load_catalog`].
    pub fn with_catalog(mut self, catalog: Arc<ChunkedCache>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_focus_policy(mut self, focus: FocusPolicy) -> Self {
        self.focus = focus;
        self
    }

    pub fn with_search_debounce(mut self, delay: Duration) -> Self {
        self.search_debounce = delay;
        self
    }

    pub fn search_debounce(&self) -> Duration {
        self.search_debounce
    }

    pub fn collection(&self) -> Collection {
        self.cache.collection()
    }

    pub fn cache(&self) -> &Arc<DomainCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    // ===== Active query =====

    pub fn set_active(&self, params: QueryParams) {
        if let Ok(mut active) = self.active.lock() {
            *active = Some(params);
        }
    }

    pub fn active_params(&self) -> Option<QueryParams> {
        self.active.lock().map(|active| active.clone()).unwrap_or(None)
    }

    fn is_active(&self, params: &QueryParams) -> bool {
        self.active_params().as_ref() == Some(params)
    }

    /// Epoch ms of the last successful fetch, 0 if none.
    pub fn last_refresh(&self) -> i64 {
        self.last_refresh.load(Ordering::SeqCst)
    }

    fn mark_refreshed(&self) {
        self.last_refresh
            .store(self.cache.store().now_ms(), Ordering::SeqCst);
    }

    fn revalidation_task(&self) -> String {
        format!("revalidate:{}", self.cache.collection().cache_name())
    }

    fn show(&self, page: &Page, source: DataSource) {
        let collection = self.collection();
        self.sink.set_records(collection, page);
        self.sink.set_error(collection, None);
        self.sink.set_data_source(collection, source);
        self.events.publish(CacheEvent::DataSourceChanged {
            collection: collection.cache_name(),
            source,
        });
    }

    // ===== Reads =====

    /// Make `params` the active query and load it cache-first.
    pub async fn load(&self, params: QueryParams) -> Result<ReadOutcome> {
        self.set_active(params.clone());
        let collection = self.collection();

        if let Some(entry) = self.cache.read_page(&params) {
            self.show(&entry.data, DataSource::Cache);
            if entry.is_stale {
                debug!(collection = %collection, "Stale hit, revalidating in background");
                self.revalidate_in_background(params);
                return Ok(ReadOutcome {
                    page: entry.data,
                    path: ReadPath::StaleHit,
                    source: DataSource::Cache,
                });
            }
            debug!(collection = %collection, "Fresh hit");
            return Ok(ReadOutcome {
                page: entry.data,
                path: ReadPath::FreshHit,
                source: DataSource::Cache,
            });
        }

        let path = if self.cache.should_read_cache() {
            ReadPath::Miss
        } else {
            ReadPath::Bypass
        };
        debug!(collection = %collection, ?path, "Fetching from server");

        self.sink.set_loading(collection, true);
        let fetched = self.source.fetch_page(collection, &params).await;
        self.sink.set_loading(collection, false);

        match fetched {
            Ok(page) => {
                self.cache.store_page(&params, &page);
                self.mark_refreshed();
                if self.is_active(&params) {
                    self.show(&page, DataSource::Server);
                }
                Ok(ReadOutcome {
                    page,
                    path,
                    source: DataSource::Server,
                })
            }
            Err(e) => {
                if self.is_active(&params) {
                    self.sink.set_error(collection, Some(e.to_string()));
                }
                Err(e.context(format!("Failed to load {}", collection)))
            }
        }
    }

    /// Load `params` after `delay`, superseding any load still waiting.
    pub fn load_debounced(&self, params: QueryParams, delay: Duration) {
        let this = self.clone();
        let name = format!("search:{}", self.cache.collection().cache_name());
        self.scheduler.schedule(name, delay, async move {
            if let Err(e) = this.load(params).await {
                warn!(error = %e, "Debounced load failed");
            }
        });
    }

    /// Search as the user types: apply `term` to the active query from page 1
    /// and load it once input has been quiet for the debounce window.
    ///
    /// A blank term clears the search. Returns the parameters that will load.
    pub fn search(&self, term: &str, search_type: Option<String>) -> QueryParams {
        let params = self
            .active_params()
            .unwrap_or_default()
            .page(1)
            .search(term, search_type);
        self.load_debounced(params.clone(), self.search_debounce);
        params
    }

    /// Refetch `params` in the background, superseding a pending refetch of this collection.
    pub fn revalidate_in_background(&self, params: QueryParams) {
        let this = self.clone();
        self.scheduler
            .schedule(self.revalidation_task(), Duration::ZERO, async move {
                this.revalidate(params).await;
            });
    }

    /// Refetch and store `params`, then show it if it is still the active query.
    /// Returns whether the result reached the view.
    pub async fn revalidate(&self, params: QueryParams) -> bool {
        let collection = self.collection();
        let key = self.cache.key_for(&params);

        match self.source.fetch_page(collection, &params).await {
            Ok(page) => {
                self.cache.store_page(&params, &page);
                self.mark_refreshed();
                let applied = self.is_active(&params);
                if applied {
                    self.show(&page, DataSource::Server);
                } else {
                    debug!(key = %key, "Query changed during revalidation, result not shown");
                }
                info!(key = %key, applied, "Background revalidation complete");
                self.events.publish(CacheEvent::Revalidated { key, applied });
                applied
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Background revalidation failed");
                self.events.publish(CacheEvent::RevalidationFailed {
                    key,
                    error: e.to_string(),
                });
                false
            }
        }
    }

    // ===== Full catalog =====

    /// Load the whole collection through the chunked cache.
    ///
    /// `progress` receives a percentage as chunks are reassembled or pages
    /// arrive. A stale catalog is returned as-is and refreshed in the background.
    pub async fn load_catalog<F>(&self, mut progress: F) -> Result<CatalogOutcome>
    where
        F: FnMut(u32) + Send,
    {
        let catalog = self
            .catalog
            .clone()
            .ok_or_else(|| anyhow!("No catalog cache configured for {}", self.collection()))?;
        let limits = catalog.limits();

        if self.cache.should_read_cache() {
            let on_chunk: &mut dyn FnMut(u32) = &mut progress;
            if let Some(cached) = catalog.get_collection_with::<Value>(Some(on_chunk), limits) {
                if cached.is_stale {
                    self.refresh_catalog_in_background(Arc::clone(&catalog));
                }
                return Ok(CatalogOutcome {
                    items: cached.data,
                    source: DataSource::Cache,
                    is_stale: cached.is_stale,
                    truncated_from: cached.meta.truncated_from,
                });
            }
        }

        let (items, has_more) = self.fetch_all(limits, &mut progress).await?;
        let truncated_from = (items.len() > limits.max_records).then_some(items.len());
        if self.cache.is_enabled() {
            let params = json!({ "collection": self.collection().path() });
            catalog.cache_collection_with(&items, &params, has_more, limits);
        }
        self.mark_refreshed();

        let mut items = items;
        items.truncate(limits.max_records);
        Ok(CatalogOutcome {
            items,
            source: DataSource::Server,
            is_stale: false,
            truncated_from,
        })
    }

    fn refresh_catalog_in_background(&self, catalog: Arc<ChunkedCache>) {
        let this = self.clone();
        let name = format!("revalidate:{}", catalog.prefix());
        self.scheduler.schedule(name, Duration::ZERO, async move {
            let limits = catalog.limits();
            let key = format!("{}_meta", catalog.prefix());
            match this.fetch_all(limits, &mut |_| {}).await {
                Ok((items, has_more)) => {
                    let params = json!({ "collection": this.collection().path() });
                    catalog.cache_collection_with(&items, &params, has_more, limits);
                    this.mark_refreshed();
                    info!(prefix = %catalog.prefix(), items = items.len(), "Catalog refreshed");
                    this.events.publish(CacheEvent::Revalidated { key, applied: false });
                }
                Err(e) => {
                    warn!(prefix = %catalog.prefix(), error = %e, "Catalog refresh failed");
                    this.events.publish(CacheEvent::RevalidationFailed {
                        key,
                        error: e.to_string(),
                    });
                }
            }
        });
    }

    /// Page through the source until it runs dry or one record past the ceiling.
    async fn fetch_all<F>(&self, limits: ChunkLimits, progress: &mut F) -> Result<(Vec<Value>, bool)>
    where
        F: FnMut(u32) + Send,
    {
        let collection = self.collection();
        let mut items: Vec<Value> = Vec::new();
        let mut page_number = 1;

        loop {
            let params = QueryParams::default()
                .page(page_number)
                .page_size(DEFAULT_PAGE_SIZE);
            let page = self
                .source
                .fetch_page(collection, &params)
                .await
                .with_context(|| format!("Failed to fetch {} page {}", collection, page_number))?;

            let fetched = page.len();
            items.extend(page.data);

            if let Some(total) = page.total.filter(|total| *total > 0) {
                let loaded = items.len().min(total as usize);
                progress(((loaded as f64 / total as f64) * 100.0).round() as u32);
            }

            if !page.has_more || fetched == 0 {
                progress(100);
                return Ok((items, false));
            }
            if items.len() > limits.max_records {
                return Ok((items, true));
            }
            page_number += 1;
        }
    }

    // ===== Writes =====

    /// Create a record, then force the next read past the cache and reload the view.
    pub async fn create_record(&self, record: &Value) -> Result<Value> {
        let collection = self.collection();
        let created = self
            .source
            .create_record(collection, record)
            .await
            .with_context(|| format!("Failed to create {} record", collection))?;
        self.cache.store().update_write_timestamp();
        self.cache.force_revalidation();
        self.reload_active().await;
        Ok(created)
    }

    /// Update a record, then patch every cached copy in place.
    pub async fn update_record(&self, record: &Value) -> Result<PatchReport> {
        let collection = self.collection();
        let id = record
            .get(collection.id_field())
            .filter(|id| !id.is_null())
            .cloned()
            .ok_or_else(|| anyhow!("{} record has no `{}` field", collection, collection.id_field()))?;

        let saved = self
            .source
            .update_record(collection, &id, record)
            .await
            .with_context(|| format!("Failed to update {} record {}", collection, id))?;
        let previous_write = self.cache.store().last_write_timestamp();
        self.cache.store().update_write_timestamp();

        // Prefer the server's copy when it echoes the record back
        let patch = if saved.get(collection.id_field()) == Some(&id) {
            &saved
        } else {
            record
        };
        let report = self.cache.update_record_after_write(patch, previous_write);

        if let Some(params) = self.active_params() {
            if let Some(entry) = self.cache.read_page(&params) {
                self.show(&entry.data, DataSource::Cache);
            }
        }
        Ok(report)
    }

    /// Delete a record, then force the next read past the cache and reload the view.
    pub async fn delete_record(&self, id: &Value) -> Result<()> {
        let collection = self.collection();
        self.source
            .delete_record(collection, id)
            .await
            .with_context(|| format!("Failed to delete {} record {}", collection, id))?;
        self.cache.store().update_write_timestamp();
        self.cache.force_revalidation();
        self.reload_active().await;
        Ok(())
    }

    async fn reload_active(&self) {
        if let Some(params) = self.active_params() {
            if let Err(e) = self.load(params).await {
                warn!(error = %e, "Reload after write failed");
            }
        }
    }

    // ===== Focus =====

    /// Decide whether regaining focus should refresh the active query.
    pub fn on_focus(&self) -> FocusDecision {
        let now = self.cache.store().now_ms();
        let last = self.last_refresh();
        if last > 0 && now - last < self.focus.cooldown.as_millis() as i64 {
            return FocusDecision::Cooldown;
        }

        let Some(params) = self.active_params() else {
            return FocusDecision::Idle;
        };

        let key = self.cache.key_for(&params);
        let needs_refresh = match self.cache.store().get::<Value>(&key, true) {
            Some(entry) => entry.is_stale || entry.age_ms(now) > self.focus.max_age.as_millis() as i64,
            None => true,
        };
        if !needs_refresh {
            return FocusDecision::Fresh;
        }

        // Counts as a refresh for cooldown purposes even before it lands
        self.last_refresh.store(now, Ordering::SeqCst);
        self.revalidate_in_background(params);
        FocusDecision::Revalidate
    }

    /// Evaluate the focus policy for every `Gained` event received on `rx`.
    pub fn subscribe_focus(&self, mut rx: mpsc::Receiver<FocusEvent>) -> FocusSubscription {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event == FocusEvent::Gained {
                    let decision = this.on_focus();
                    debug!(collection = %this.collection(), ?decision, "Focus gained");
                }
            }
        });
        FocusSubscription { handle }
    }
}
