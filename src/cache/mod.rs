//! Versioned response cache for offline support.
//!
//! This module provides:
//! - `CacheStorage`: named caches of HTTP responses keyed by method + URL
//! - `SqliteStorage`: the persistent implementation
//! - `CacheLifecycle`: install / activate of cache versions and explicit
//!   lesson downloads driven by client messages

mod lifecycle;
mod storage;

pub use lifecycle::{CacheLifecycle, CacheVersions};
pub use storage::{CacheStorage, CachedEntry, SqliteStorage};
