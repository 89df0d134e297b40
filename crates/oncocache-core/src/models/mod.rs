//! Data models for the services catalog.
//!
//! Records travel through the cache as JSON objects keyed by `id`; the
//! typed structs here are for consumers that want named fields.
//!
//! - `Collection`: the paginated collections and their cache policies
//! - `Page`: one page of a listing response
//! - `Service`: a catalog entry (medication service)
//! - `DropdownKind`, `DropdownOption`: foreign-key reference lists

pub mod collection;
pub mod dropdown;
pub mod page;
pub mod service;

pub use collection::Collection;
pub use dropdown::{DropdownKind, DropdownOption};
pub use page::Page;
pub use service::Service;
