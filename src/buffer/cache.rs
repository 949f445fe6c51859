//! Position-keyed page cache.
//!
//! Pages on disk never change while they are visible to a read version: log
//! pages are append-only and home positions are only rewritten by an
//! exclusive checkpoint. The cache can therefore hand the same page to many
//! readers without locking the page itself. Each entry carries a share
//! counter: readers increment it, a writer claims the page by swapping the
//! counter from 0 to [`WRITER`] in a single compare-and-swap. A claimed page
//! leaves the cache and becomes the writer's private copy; when readers hold
//! it the writer clones instead.

use crate::error::Result;
use crate::page::{PageBuf, SlottedPage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Share counter value of a page claimed by a writer
pub const WRITER: i32 = -1;

/// A page held by the cache
#[derive(Debug)]
pub struct CachedPage {
    position: u32,
    share_counter: AtomicI32,
    timestamp: AtomicU64,
    page: SlottedPage,
}

impl CachedPage {
    fn new(position: u32, page: SlottedPage, now: u64) -> Self {
        Self {
            position,
            share_counter: AtomicI32::new(0),
            timestamp: AtomicU64::new(now),
            page,
        }
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn share_counter(&self) -> i32 {
        self.share_counter.load(Ordering::Acquire)
    }

    /// Add a reader unless a writer owns the page
    fn try_share(&self) -> bool {
        let mut current = self.share_counter.load(Ordering::Acquire);
        loop {
            if current < 0 {
                return false;
            }
            match self.share_counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn try_claim(&self) -> bool {
        self.share_counter
            .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A readable page: shared with the cache or a private copy
#[derive(Debug)]
pub enum PageRef {
    Shared(Arc<CachedPage>),
    Owned(SlottedPage),
}

impl Deref for PageRef {
    type Target = SlottedPage;

    fn deref(&self) -> &SlottedPage {
        match self {
            Self::Shared(cached) => &cached.page,
            Self::Owned(page) => page,
        }
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        if let Self::Shared(cached) = self {
            cached.share_counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Counters exposed through engine statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub cached_pages: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    pages: HashMap<u32, Arc<CachedPage>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// The page cache
#[derive(Debug)]
pub struct PageCache {
    inner: Mutex<CacheInner>,
    clock: AtomicU64,
    capacity: usize,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            clock: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Get a page for reading, loading it with `load` on a miss
    pub fn get_readable<F>(&self, position: u32, load: F) -> Result<PageRef>
    where
        F: FnOnce(u32) -> Result<PageBuf>,
    {
        let cached = {
            let mut inner = self.inner.lock();
            let found = inner.pages.get(&position).cloned();
            if found.is_some() {
                inner.hits += 1;
            } else {
                inner.misses += 1;
            }
            found
        };

        if let Some(cached) = cached {
            cached.timestamp.store(self.tick(), Ordering::Relaxed);
            if cached.try_share() {
                return Ok(PageRef::Shared(cached));
            }
            // a writer holds it: read our own copy
            return Ok(PageRef::Owned(SlottedPage::load(load(position)?)?));
        }

        trace!(position, "page cache miss");
        let page = SlottedPage::load(load(position)?)?;
        let cached = Arc::new(CachedPage::new(position, page, self.tick()));
        cached.share_counter.store(1, Ordering::Release);

        let mut inner = self.inner.lock();
        let entry = inner
            .pages
            .entry(position)
            .or_insert_with(|| Arc::clone(&cached));
        if !Arc::ptr_eq(entry, &cached) {
            // lost a race with another loader; hand out the private copy
            cached.share_counter.store(0, Ordering::Release);
            return Ok(PageRef::Owned(cached.page.clone()));
        }
        self.evict_locked(&mut inner);
        Ok(PageRef::Shared(cached))
    }

    /// Get a private, writable copy of a page
    pub fn get_writable<F>(&self, position: u32, load: F) -> Result<SlottedPage>
    where
        F: FnOnce(u32) -> Result<PageBuf>,
    {
        let claimed = {
            let mut inner = self.inner.lock();
            match inner.pages.get(&position).cloned() {
                Some(cached) if cached.try_claim() => {
                    inner.pages.remove(&position);
                    inner.hits += 1;
                    Some(Ok(cached))
                }
                Some(cached) => {
                    inner.hits += 1;
                    Some(Err(cached))
                }
                None => {
                    inner.misses += 1;
                    None
                }
            }
        };

        match claimed {
            Some(Ok(cached)) => match Arc::try_unwrap(cached) {
                Ok(owned) => Ok(owned.page),
                Err(still_shared) => Ok(still_shared.page.clone()),
            },
            // readers hold it: copy on write
            Some(Err(shared)) => Ok(shared.page.clone()),
            None => SlottedPage::load(load(position)?),
        }
    }

    /// Insert a page written at `position` (after commit or checkpoint)
    pub fn insert(&self, position: u32, page: SlottedPage) {
        let cached = Arc::new(CachedPage::new(position, page, self.tick()));
        let mut inner = self.inner.lock();
        inner.pages.insert(position, cached);
        self.evict_locked(&mut inner);
    }

    /// Drop every entry; outstanding `PageRef`s stay valid
    pub fn clear(&self) {
        self.inner.lock().pages.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            cached_pages: inner.pages.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }

    /// Evict unshared pages, oldest first, until within capacity
    fn evict_locked(&self, inner: &mut CacheInner) {
        if inner.pages.len() <= self.capacity {
            return;
        }

        let mut candidates: Vec<(u64, u32)> = inner
            .pages
            .values()
            .filter(|c| c.share_counter() == 0)
            .map(|c| (c.timestamp.load(Ordering::Relaxed), c.position))
            .collect();
        candidates.sort_unstable();

        let excess = inner.pages.len() - self.capacity;
        for (_, position) in candidates.into_iter().take(excess) {
            let claimed = inner
                .pages
                .get(&position)
                .map_or(false, |c| c.try_claim());
            if claimed {
                inner.pages.remove(&position);
                inner.evictions += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PageId, PageType};

    fn sealed(page_id: u32, fill: u8) -> PageBuf {
        let mut page = SlottedPage::new(PageId::new(page_id), PageType::Data, 1);
        let slot = page.insert(4).unwrap();
        page.get_mut(slot).unwrap().fill(fill);
        page.seal();
        PageBuf::from_bytes(page.as_bytes())
    }

    #[test]
    fn test_readers_share_one_copy() -> Result<()> {
        let cache = PageCache::new(8);
        let a = cache.get_readable(3, |_| Ok(sealed(3, 1)))?;
        let b = cache.get_readable(3, |_| panic!("should hit the cache"))?;
        assert!(matches!((&a, &b), (PageRef::Shared(_), PageRef::Shared(_))));
        if let PageRef::Shared(c) = &a {
            assert_eq!(c.share_counter(), 2);
        }
        drop(b);
        if let PageRef::Shared(c) = &a {
            assert_eq!(c.share_counter(), 1);
        }
        Ok(())
    }

    #[test]
    fn test_writer_copies_when_shared() -> Result<()> {
        let cache = PageCache::new(8);
        let reader = cache.get_readable(3, |_| Ok(sealed(3, 1)))?;

        let mut writable = cache.get_writable(3, |_| panic!("should hit the cache"))?;
        writable.get_mut(0)?.fill(9);

        // the reader still sees the original bytes
        assert_eq!(reader.get(0)?, &[1; 4]);
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[test]
    fn test_writer_claims_unshared_page() -> Result<()> {
        let cache = PageCache::new(8);
        drop(cache.get_readable(3, |_| Ok(sealed(3, 1)))?);

        let page = cache.get_writable(3, |_| panic!("should hit the cache"))?;
        assert_eq!(page.get(0)?, &[1; 4]);
        assert!(cache.is_empty());

        // the next reader loads from disk again
        let reread = cache.get_readable(3, |_| Ok(sealed(3, 2)))?;
        assert_eq!(reread.get(0)?, &[2; 4]);
        Ok(())
    }

    #[test]
    fn test_eviction_skips_shared_pages() -> Result<()> {
        let cache = PageCache::new(2);
        let pinned = cache.get_readable(1, |_| Ok(sealed(1, 1)))?;
        drop(cache.get_readable(2, |_| Ok(sealed(2, 2)))?);
        drop(cache.get_readable(3, |_| Ok(sealed(3, 3)))?);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
        // the pinned page survived, the oldest unshared one went
        cache.get_readable(1, |_| panic!("pinned page was evicted"))?;
        assert_eq!(pinned.get(0)?, &[1; 4]);
        Ok(())
    }

    #[test]
    fn test_corrupt_page_is_rejected() {
        let cache = PageCache::new(2);
        let result = cache.get_readable(1, |_| {
            let mut buf = sealed(1, 1);
            buf[200] ^= 0xFF;
            Ok(buf)
        });
        assert!(result.is_err());
        assert!(cache.is_empty());
    }
}
