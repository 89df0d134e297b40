//! REST API client for the oncology services backend.
//!
//! This module provides the `ApiClient` used as the remote record source
//! behind the cache: paginated listings, dropdown reference lists, and
//! single-record create/update/delete.
//!
//! Requests carry an optional bearer token; HTTP 429 responses are retried
//! with exponential backoff.

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::ApiError;
