//! Page cache: shared, position-keyed page buffers with copy-on-write.
//!
//! Readers share cached pages through a reference counter; writers take a
//! private copy. Unshared pages are evicted oldest-first once the cache
//! exceeds its capacity.

mod cache;

pub use cache::{CacheStats, CachedPage, PageCache, PageRef, WRITER};
