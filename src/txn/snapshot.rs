//! A transaction's view of the pages.
//!
//! Reads resolve a page id in this order: the transaction's own dirty pages,
//! pages it already flushed to the log at a safepoint, the log index at the
//! transaction's read version, and finally the home position. Writes always
//! go to a private copy held in the dirty set until commit.

use crate::buffer::{PageCache, PageRef};
use crate::error::{Result, StorageError};
use crate::page::SlottedPage;
use crate::storage::{AllocDelta, AllocationMap, DiskManager, PageState};
use crate::types::{PageId, PageType};
use crate::wal::Wal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

/// Page-level services shared by every transaction
pub struct PageStore {
    pub disk: Arc<dyn DiskManager>,
    pub wal: Wal,
    pub cache: PageCache,
    pub alloc: AllocationMap,
}

impl PageStore {
    /// Read a committed page as seen at `read_version`
    pub fn read_page(&self, page_id: PageId, read_version: u64) -> Result<PageRef> {
        let position = self.wal.resolve(page_id, read_version)?;
        self.read_position(position)
    }

    fn read_position(&self, position: u32) -> Result<PageRef> {
        self.cache
            .get_readable(position, |pos| self.disk.read_page(pos))
    }

    fn writable_position(&self, position: u32) -> Result<SlottedPage> {
        self.cache
            .get_writable(position, |pos| self.disk.read_page(pos))
    }
}

#[cfg(test)]
impl PageStore {
    /// Empty store over an in-memory file, for unit tests
    pub(crate) fn in_memory() -> Arc<Self> {
        use crate::index::Collation;
        use crate::storage::{FileHeader, MemoryDiskManager};
        use crate::wal::Recovered;

        let disk: Arc<dyn DiskManager> = Arc::new(MemoryDiskManager::new());
        let header = FileHeader::new(Collation::default());
        let recovered = Recovered {
            next_position: 1,
            ..Recovered::default()
        };
        Arc::new(Self {
            wal: Wal::new(Arc::clone(&disk), header, recovered),
            disk,
            cache: PageCache::new(32),
            alloc: AllocationMap::new(),
        })
    }
}

/// A page borrowed from a snapshot
pub enum PageView<'a> {
    Dirty(&'a SlottedPage),
    Stored(PageRef),
}

impl Deref for PageView<'_> {
    type Target = SlottedPage;

    fn deref(&self) -> &SlottedPage {
        match self {
            Self::Dirty(page) => page,
            Self::Stored(page) => page,
        }
    }
}

pub struct Snapshot {
    store: Arc<PageStore>,
    tx_id: u32,
    read_version: u64,
    dirty: BTreeMap<PageId, SlottedPage>,
    /// Pages written to the log by a safepoint, not yet confirmed
    flushed: HashMap<PageId, u32>,
    flushed_positions: Vec<u32>,
    alloc: AllocDelta,
    writable: HashSet<u8>,
    max_dirty_pages: usize,
}

impl Snapshot {
    pub fn new(store: Arc<PageStore>, tx_id: u32, read_version: u64, max_dirty_pages: usize) -> Self {
        Self {
            store,
            tx_id,
            read_version,
            dirty: BTreeMap::new(),
            flushed: HashMap::new(),
            flushed_positions: Vec::new(),
            alloc: AllocDelta::new(),
            writable: HashSet::new(),
            max_dirty_pages: max_dirty_pages.max(1),
        }
    }

    /// A snapshot that can only read
    pub fn read_only(store: Arc<PageStore>, read_version: u64) -> Self {
        Self::new(store, 0, read_version, usize::MAX)
    }

    pub fn tx_id(&self) -> u32 {
        self.tx_id
    }

    pub fn read_version(&self) -> u64 {
        self.read_version
    }

    pub fn set_read_version(&mut self, read_version: u64) {
        self.read_version = read_version;
    }

    pub fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    /// Allow writes to pages of collection `col`
    pub fn allow_writes(&mut self, col: u8) {
        self.writable.insert(col);
    }

    pub fn can_write(&self, col: u8) -> bool {
        self.writable.contains(&col)
    }

    fn check_writable(&self, col: u8) -> Result<()> {
        if self.tx_id == 0 || !self.can_write(col) {
            return Err(StorageError::invalid_operation(format!(
                "collection {} is not locked for writing",
                col
            )));
        }
        Ok(())
    }

    /// Read a page
    pub fn page(&self, page_id: PageId) -> Result<PageView<'_>> {
        if let Some(page) = self.dirty.get(&page_id) {
            return Ok(PageView::Dirty(page));
        }
        if let Some(&position) = self.flushed.get(&page_id) {
            return Ok(PageView::Stored(self.store.read_position(position)?));
        }
        Ok(PageView::Stored(
            self.store.read_page(page_id, self.read_version)?,
        ))
    }

    /// Get a page for writing, copying it into the dirty set
    pub fn page_mut(&mut self, page_id: PageId) -> Result<&mut SlottedPage> {
        if !self.dirty.contains_key(&page_id) {
            let position = match self.flushed.get(&page_id) {
                Some(&position) => position,
                None => self.store.wal.resolve(page_id, self.read_version)?,
            };
            let page = self.store.writable_position(position)?;
            if page.page_id() != page_id {
                return Err(StorageError::corruption(format!(
                    "position {} holds page {}, expected {}",
                    position,
                    page.page_id(),
                    page_id
                )));
            }
            self.check_writable(page.col_id())?;
            self.dirty.insert(page_id, page);
        }

        let page = self
            .dirty
            .get_mut(&page_id)
            .ok_or(StorageError::PageNotFound(page_id))?;
        Ok(page)
    }

    /// Find or create a page of `col` with room for `required` bytes
    /// (record plus slot) and put it in the dirty set
    pub fn free_page(&mut self, col: u8, page_type: PageType, required: usize) -> Result<PageId> {
        self.check_writable(col)?;
        let (page_id, is_new) =
            self.store
                .alloc
                .get_free_page(&mut self.alloc, col, page_type, required)?;

        if is_new {
            self.dirty
                .insert(page_id, SlottedPage::new(page_id, page_type, col));
        } else {
            let page = self.page_mut(page_id)?;
            if page.page_type() != page_type || page.free_bytes() < required {
                return Err(StorageError::corruption(format!(
                    "allocation map offered page {} ({:?}, {} free) for {} bytes of {:?}",
                    page_id,
                    page.page_type(),
                    page.free_bytes(),
                    required,
                    page_type
                )));
            }
        }
        Ok(page_id)
    }

    /// Report a dirty page's free space to the allocation map. A page left
    /// without records is emptied.
    pub fn update_state(&mut self, page_id: PageId) -> Result<()> {
        let page = self
            .dirty
            .get_mut(&page_id)
            .ok_or_else(|| StorageError::invalid_operation(format!("page {} is not dirty", page_id)))?;
        let state = PageState::for_page(page);
        if state == PageState::Empty && page.page_type() != PageType::Empty {
            page.mark_as_empty();
        }
        let col = page.col_id();
        self.store
            .alloc
            .update_page_state(&mut self.alloc, col, page_id, state)
    }

    /// Release a page without reading it (collection drop)
    pub fn release_page(&mut self, col: u8, page_id: PageId) -> Result<()> {
        self.check_writable(col)?;
        self.dirty.remove(&page_id);
        self.store
            .alloc
            .update_page_state(&mut self.alloc, col, page_id, PageState::Empty)
    }

    /// Pages of `col` that hold records, this transaction's changes included
    pub fn collection_pages(&self, col: u8) -> Vec<PageId> {
        self.store.alloc.collection_pages(&self.alloc, col)
    }

    /// Flush dirty pages to the log when the dirty set reached its limit.
    /// Returns the number of pages flushed.
    pub fn safepoint(&mut self) -> Result<usize> {
        if self.dirty.len() < self.max_dirty_pages {
            return Ok(0);
        }

        let mut pages: Vec<SlottedPage> = std::mem::take(&mut self.dirty).into_values().collect();
        let positions = self.store.wal.writer().append(self.tx_id, &mut pages)?;
        for (page, &position) in pages.iter().zip(&positions) {
            self.flushed.insert(page.page_id(), position);
        }
        self.flushed_positions.extend_from_slice(&positions);

        debug!(tx_id = self.tx_id, pages = pages.len(), "safepoint flushed dirty pages");
        Ok(pages.len())
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn has_changes(&self) -> bool {
        !self.dirty.is_empty() || !self.flushed.is_empty() || !self.alloc.is_empty()
    }

    /// Move out what commit or rollback needs: dirty pages, safepoint log
    /// entries (page, position), every safepoint position and the
    /// allocation delta. The snapshot is left without changes.
    pub(crate) fn take_parts(&mut self) -> CommitParts {
        CommitParts {
            dirty: std::mem::take(&mut self.dirty).into_values().collect(),
            flushed: std::mem::take(&mut self.flushed),
            flushed_positions: std::mem::take(&mut self.flushed_positions),
            alloc: std::mem::take(&mut self.alloc),
        }
    }
}

pub(crate) struct CommitParts {
    pub dirty: Vec<SlottedPage>,
    pub flushed: HashMap<PageId, u32>,
    pub flushed_positions: Vec<u32>,
    pub alloc: AllocDelta,
}
