//! oncocache core library
//!
//! Client-side caching layer for the oncology services catalog: a persistent
//! key-value cache with expiry and schema versioning, a chunked cache for
//! large collections, a write-timestamp staleness tracker, per-domain cache
//! managers and background revalidation, plus the REST client and models
//! the cache sits in front of.

pub mod api;
pub mod cache;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError};
pub use cache::{
    CacheEntry, CacheEvent, CacheEvents, CacheService, CacheStore, ChunkedCache, DataSource,
    DomainCache, FileStorage, KeyValueStorage, MemoryStorage, QueryParams, Revalidator,
    SortOrder, ViewSink,
};
pub use config::Config;
