//! Allocation map.
//!
//! Tracks, per extent, which collection owns it and the free-space state of
//! each of its eight pages. The committed extent words mirror the allocation
//! map pages on disk; transactions never touch them directly. Instead every
//! transaction records its transitions in an [`AllocDelta`] which is turned
//! into map page images at commit and applied once those images are durable.
//!
//! For page selection each collection has a set of free lists (one per
//! bucket), built lazily from the committed words. A collection has a single
//! writer at a time, so its lists always equal "committed state plus the
//! current writer's changes". Rollback drops the lists of the collections it
//! touched so they are rebuilt from committed state.

use crate::error::{Result, StorageError};
use crate::page::SlottedPage;
use crate::storage::extent::{self, candidate_states, PageState};
use crate::types::{PageId, PageType, EXTENTS_PER_MAP_PAGE, EXTENT_PAGES};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Allocation changes made by one transaction
#[derive(Debug, Default)]
pub struct AllocDelta {
    /// Latest state of every page the transaction touched
    pages: HashMap<PageId, PageState>,
    /// Extents carved by the transaction and their collection
    extents: Vec<(u32, u8)>,
    collections: HashSet<u8>,
}

impl AllocDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.extents.is_empty()
    }

    /// Pages the transaction changed, with their new states
    pub fn pages(&self) -> impl Iterator<Item = (PageId, PageState)> + '_ {
        self.pages.iter().map(|(&p, &s)| (p, s))
    }
}

/// Free lists of one collection
#[derive(Debug, Default)]
struct FreeLists {
    empty: BTreeSet<PageId>,
    data_large: BTreeSet<PageId>,
    data_medium: BTreeSet<PageId>,
    data_small: BTreeSet<PageId>,
    index_free: BTreeSet<PageId>,
}

impl FreeLists {
    fn bucket(&mut self, state: PageState) -> Option<&mut BTreeSet<PageId>> {
        match state {
            PageState::Empty => Some(&mut self.empty),
            PageState::DataLarge => Some(&mut self.data_large),
            PageState::DataMedium => Some(&mut self.data_medium),
            PageState::DataSmall => Some(&mut self.data_small),
            PageState::IndexFree => Some(&mut self.index_free),
            PageState::DataFull | PageState::IndexFull | PageState::Reserved => None,
        }
    }

    fn insert(&mut self, page_id: PageId, state: PageState) {
        if let Some(bucket) = self.bucket(state) {
            bucket.insert(page_id);
        }
    }

    fn remove(&mut self, page_id: PageId, state: PageState) {
        if let Some(bucket) = self.bucket(state) {
            bucket.remove(&page_id);
        }
    }
}

#[derive(Debug)]
struct AllocState {
    /// Committed extent words, indexed by global extent number
    extents: Vec<u32>,
    /// Number of allocation map pages that exist on disk or in the log
    map_pages: u32,
    /// Extents carved by in-flight transactions
    reserved: HashMap<u32, u8>,
    free_lists: HashMap<u8, FreeLists>,
}

impl AllocState {
    fn committed_state(&self, page_id: PageId) -> Result<PageState> {
        let (extent, offset) = page_id
            .extent_slot()
            .ok_or_else(|| StorageError::invalid_operation(format!("page {} has no extent", page_id)))?;
        let word = self.extents.get(extent as usize).copied().unwrap_or(0);
        Ok(extent::page_state(word, offset))
    }

    fn owner(&self, extent: u32) -> u8 {
        match self.reserved.get(&extent) {
            Some(&col) => col,
            None => extent::collection(self.extents.get(extent as usize).copied().unwrap_or(0)),
        }
    }

    fn lists(&mut self, col: u8) -> &mut FreeLists {
        if !self.free_lists.contains_key(&col) {
            let mut lists = FreeLists::default();
            for (e, &word) in self.extents.iter().enumerate() {
                if word != 0 && extent::collection(word) == col {
                    let first = PageId::extent_start(e as u32).value();
                    for i in 0..EXTENT_PAGES {
                        lists.insert(PageId::new(first + i), extent::page_state(word, i));
                    }
                }
            }
            self.free_lists.insert(col, lists);
        }
        self.free_lists.entry(col).or_default()
    }

    fn carve(&mut self, delta: &mut AllocDelta, col: u8) -> u32 {
        let found = (0..self.extents.len() as u32)
            .find(|e| self.extents[*e as usize] == 0 && !self.reserved.contains_key(e));

        let extent = match found {
            Some(e) => e,
            None => {
                // every extent taken: the next map page opens a new range
                let e = self.extents.len() as u32;
                self.extents
                    .resize(self.extents.len() + EXTENTS_PER_MAP_PAGE as usize, 0);
                e
            }
        };

        self.reserved.insert(extent, col);
        let first = PageId::extent_start(extent).value();
        let lists = self.lists(col);
        for i in 0..EXTENT_PAGES {
            lists.empty.insert(PageId::new(first + i));
        }
        delta.extents.push((extent, col));
        delta.collections.insert(col);

        debug!(extent, col, first_page = first, "carved extent");
        extent
    }

    /// New words for every extent the delta touches
    fn merged_words(&self, delta: &AllocDelta) -> BTreeMap<u32, u32> {
        let mut words = BTreeMap::new();
        for &(e, col) in &delta.extents {
            words.insert(e, extent::new_extent(col));
        }
        for (&page_id, &state) in &delta.pages {
            if let Some((e, offset)) = page_id.extent_slot() {
                let word = words
                    .entry(e)
                    .or_insert_with(|| self.extents.get(e as usize).copied().unwrap_or(0));
                *word = extent::with_page_state(*word, offset, state);
            }
        }
        for word in words.values_mut() {
            if extent::is_all_empty(*word) {
                *word = 0;
            }
        }
        words
    }
}

/// The engine-wide allocation map service
#[derive(Debug)]
pub struct AllocationMap {
    state: Mutex<AllocState>,
}

impl AllocationMap {
    /// A map for a new database: one map page, every extent unowned
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AllocState {
                extents: vec![0; EXTENTS_PER_MAP_PAGE as usize],
                map_pages: 1,
                reserved: HashMap::new(),
                free_lists: HashMap::new(),
            }),
        }
    }

    /// Rebuild the committed words from map page images, in map page order
    pub fn load(pages: &[SlottedPage]) -> Result<Self> {
        if pages.is_empty() {
            return Err(StorageError::corruption("allocation map has no pages"));
        }

        let mut extents = Vec::with_capacity(pages.len() * EXTENTS_PER_MAP_PAGE as usize);
        for (k, page) in pages.iter().enumerate() {
            if page.page_type() != PageType::AllocationMap
                || page.page_id() != PageId::map_page(k as u32)
            {
                return Err(StorageError::corruption(format!(
                    "page {} is not allocation map page {}",
                    page.page_id(),
                    k
                )));
            }
            extents.extend(
                page.content()
                    .chunks_exact(4)
                    .take(EXTENTS_PER_MAP_PAGE as usize)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
            );
        }

        Ok(Self {
            state: Mutex::new(AllocState {
                extents,
                map_pages: pages.len() as u32,
                reserved: HashMap::new(),
                free_lists: HashMap::new(),
            }),
        })
    }

    /// Image of an empty map page
    pub fn empty_map_page(index: u32) -> SlottedPage {
        SlottedPage::new(PageId::map_page(index), PageType::AllocationMap, 0)
    }

    pub fn map_page_count(&self) -> u32 {
        self.state.lock().map_pages
    }

    /// Find a page of `col` able to take `required` bytes (record plus
    /// slot). Returns the page id and whether the page is Empty, in which
    /// case the caller must format it instead of reading it.
    pub fn get_free_page(
        &self,
        delta: &mut AllocDelta,
        col: u8,
        page_type: PageType,
        required: usize,
    ) -> Result<(PageId, bool)> {
        if !matches!(page_type, PageType::Data | PageType::Index) {
            return Err(StorageError::invalid_operation(format!(
                "cannot allocate a {:?} page",
                page_type
            )));
        }

        let mut state = self.state.lock();
        let lists = state.lists(col);
        for &candidate in candidate_states(page_type, required) {
            let bucket = lists.bucket(candidate);
            if let Some(&page_id) = bucket.and_then(|b| b.first()) {
                return Ok((page_id, candidate == PageState::Empty));
            }
        }

        let extent = state.carve(delta, col);
        Ok((PageId::extent_start(extent), true))
    }

    /// Record the free-space state of a page after a mutation
    pub fn update_page_state(
        &self,
        delta: &mut AllocDelta,
        col: u8,
        page_id: PageId,
        new_state: PageState,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let (extent, _) = page_id
            .extent_slot()
            .ok_or_else(|| StorageError::invalid_operation(format!("page {} has no extent", page_id)))?;
        let owner = state.owner(extent);
        if owner != col {
            return Err(StorageError::corruption(format!(
                "page {} belongs to collection {}, not {}",
                page_id, owner, col
            )));
        }

        let old_state = match delta.pages.get(&page_id) {
            Some(&s) => s,
            None => state.committed_state(page_id)?,
        };
        if old_state != new_state {
            let lists = state.lists(col);
            lists.remove(page_id, old_state);
            lists.insert(page_id, new_state);
        }
        delta.pages.insert(page_id, new_state);
        delta.collections.insert(col);
        Ok(())
    }

    /// Carve a new extent for `col`
    pub fn create_extent(&self, delta: &mut AllocDelta, col: u8) -> u32 {
        self.state.lock().carve(delta, col)
    }

    /// Allocation map page images reflecting the delta, for the commit log
    pub fn prepare(&self, delta: &AllocDelta) -> Vec<SlottedPage> {
        let state = self.state.lock();
        let words = state.merged_words(delta);

        let touched: BTreeSet<u32> = words.keys().map(|e| e / EXTENTS_PER_MAP_PAGE).collect();
        touched
            .into_iter()
            .map(|k| {
                let mut page = Self::empty_map_page(k);
                let base = (k * EXTENTS_PER_MAP_PAGE) as usize;
                let content = page.content_mut();
                for i in 0..EXTENTS_PER_MAP_PAGE as usize {
                    let e = (base + i) as u32;
                    let word = match words.get(&e) {
                        Some(&w) => w,
                        None => state.extents.get(base + i).copied().unwrap_or(0),
                    };
                    content[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
                }
                page
            })
            .collect()
    }

    /// Make a delta committed, after its map page images are durable
    pub fn apply(&self, delta: AllocDelta) {
        let mut state = self.state.lock();
        let words = state.merged_words(&delta);

        for (&e, &word) in &words {
            let idx = e as usize;
            if idx >= state.extents.len() {
                let grown = (idx / EXTENTS_PER_MAP_PAGE as usize + 1) * EXTENTS_PER_MAP_PAGE as usize;
                state.extents.resize(grown, 0);
            }
            let col = state.owner(e);
            state.extents[idx] = word;
            state.map_pages = state.map_pages.max(e / EXTENTS_PER_MAP_PAGE + 1);

            if word == 0 {
                let first = PageId::extent_start(e).value();
                if let Some(lists) = state.free_lists.get_mut(&col) {
                    for i in 0..EXTENT_PAGES {
                        let page_id = PageId::new(first + i);
                        lists.remove(page_id, PageState::Empty);
                    }
                }
                debug!(extent = e, col, "released extent");
            }
        }

        for (e, _) in &delta.extents {
            state.reserved.remove(e);
        }
    }

    /// Forget a delta; the touched collections' lists are rebuilt on demand
    pub fn rollback(&self, delta: AllocDelta) {
        let mut state = self.state.lock();
        for (e, _) in &delta.extents {
            state.reserved.remove(e);
        }
        for col in &delta.collections {
            state.free_lists.remove(col);
        }
    }

    /// Committed state of a page
    pub fn page_state(&self, page_id: PageId) -> Result<PageState> {
        self.state.lock().committed_state(page_id)
    }

    /// Committed per-state page counts of a collection
    pub fn bucket_counts(&self, col: u8) -> BTreeMap<PageState, usize> {
        let state = self.state.lock();
        let mut counts = BTreeMap::new();
        for &word in state.extents.iter().filter(|&&w| w != 0) {
            if extent::collection(word) == col {
                for i in 0..EXTENT_PAGES {
                    *counts.entry(extent::page_state(word, i)).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    /// Committed pages of a collection that hold records
    pub fn used_pages(&self, col: u8) -> Vec<(PageId, PageState)> {
        let state = self.state.lock();
        let mut pages = Vec::new();
        for (e, &word) in state.extents.iter().enumerate() {
            if word != 0 && extent::collection(word) == col {
                let first = PageId::extent_start(e as u32).value();
                for i in 0..EXTENT_PAGES {
                    let s = extent::page_state(word, i);
                    if s != PageState::Empty {
                        pages.push((PageId::new(first + i), s));
                    }
                }
            }
        }
        pages
    }

    /// Pages of `col` holding records once `delta` is applied
    pub fn collection_pages(&self, delta: &AllocDelta, col: u8) -> Vec<PageId> {
        let state = self.state.lock();
        let mut extents: BTreeSet<u32> = state
            .extents
            .iter()
            .enumerate()
            .filter(|(_, word)| **word != 0 && extent::collection(**word) == col)
            .map(|(e, _)| e as u32)
            .collect();
        extents.extend(delta.extents.iter().filter(|(_, c)| *c == col).map(|(e, _)| *e));

        let mut pages = Vec::new();
        for e in extents {
            let first = PageId::extent_start(e).value();
            for i in 0..EXTENT_PAGES {
                let page_id = PageId::new(first + i);
                let page_state = match delta.pages.get(&page_id) {
                    Some(&s) => s,
                    None => extent::page_state(state.extents.get(e as usize).copied().unwrap_or(0), i),
                };
                if page_state != PageState::Empty {
                    pages.push(page_id);
                }
            }
        }
        pages
    }

    /// Number of owned extents
    pub fn extent_count(&self) -> usize {
        self.state.lock().extents.iter().filter(|&&w| w != 0).count()
    }
}

impl Default for AllocationMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(map: &AllocationMap, delta: AllocDelta) -> Vec<SlottedPage> {
        let images = map.prepare(&delta);
        map.apply(delta);
        images
    }

    #[test]
    fn test_first_request_carves_extent() -> Result<()> {
        let map = AllocationMap::new();
        let mut delta = AllocDelta::new();

        let (page, is_new) = map.get_free_page(&mut delta, 3, PageType::Data, 100)?;
        assert_eq!(page, PageId::new(1));
        assert!(is_new);

        // same page until its state changes
        let (again, _) = map.get_free_page(&mut delta, 3, PageType::Data, 100)?;
        assert_eq!(again, page);

        map.update_page_state(&mut delta, 3, page, PageState::DataLarge)?;
        let (next, is_new) = map.get_free_page(&mut delta, 3, PageType::Data, 5000)?;
        assert_eq!(next, PageId::new(2));
        assert!(is_new);

        // a small request prefers the partially used page
        let (small, is_new) = map.get_free_page(&mut delta, 3, PageType::Data, 100)?;
        assert_eq!(small, page);
        assert!(!is_new);
        Ok(())
    }

    #[test]
    fn test_bucket_boundaries() -> Result<()> {
        use crate::types::{DATA_LARGE_FREE, DATA_MEDIUM_FREE, DATA_SMALL_FREE};

        let map = AllocationMap::new();
        let mut delta = AllocDelta::new();
        let (page, _) = map.get_free_page(&mut delta, 1, PageType::Data, 10)?;

        for free in [DATA_LARGE_FREE, DATA_MEDIUM_FREE, DATA_SMALL_FREE] {
            map.update_page_state(&mut delta, 1, page, PageState::for_data(free))?;

            let (hit, is_new) = map.get_free_page(&mut delta, 1, PageType::Data, free)?;
            assert_eq!((hit, is_new), (page, false), "request of {} bytes", free);

            let (miss, is_new) = map.get_free_page(&mut delta, 1, PageType::Data, free + 1)?;
            assert_ne!(miss, page, "request of {} bytes", free + 1);
            assert!(is_new);
        }
        Ok(())
    }

    #[test]
    fn test_collections_get_separate_extents() -> Result<()> {
        let map = AllocationMap::new();
        let mut a = AllocDelta::new();
        let mut b = AllocDelta::new();

        let (pa, _) = map.get_free_page(&mut a, 1, PageType::Data, 10)?;
        let (pb, _) = map.get_free_page(&mut b, 2, PageType::Index, 10)?;
        assert_eq!(pa, PageId::new(1));
        assert_eq!(pb, PageId::new(9));

        map.update_page_state(&mut a, 1, pa, PageState::DataFull)?;
        assert!(map.update_page_state(&mut b, 2, pa, PageState::IndexFree).is_err());
        Ok(())
    }

    #[test]
    fn test_collection_pages_include_uncommitted() -> Result<()> {
        let map = AllocationMap::new();
        let mut delta = AllocDelta::new();
        let (a, _) = map.get_free_page(&mut delta, 2, PageType::Data, 10)?;
        map.update_page_state(&mut delta, 2, a, PageState::DataLarge)?;
        commit(&map, delta);

        let mut delta = AllocDelta::new();
        let (b, _) = map.get_free_page(&mut delta, 2, PageType::Index, 9000)?;
        map.update_page_state(&mut delta, 2, b, PageState::IndexFull)?;
        map.update_page_state(&mut delta, 2, a, PageState::Empty)?;
        assert_eq!(map.collection_pages(&delta, 2), vec![b]);
        assert_eq!(map.collection_pages(&AllocDelta::new(), 2), vec![a]);
        assert!(map.collection_pages(&delta, 3).is_empty());
        Ok(())
    }

    #[test]
    fn test_commit_persists_words() -> Result<()> {
        let map = AllocationMap::new();
        let mut delta = AllocDelta::new();
        let (page, _) = map.get_free_page(&mut delta, 4, PageType::Index, 200)?;
        map.update_page_state(&mut delta, 4, page, PageState::IndexFree)?;

        let images = commit(&map, delta);
        assert_eq!(images.len(), 1);
        assert_eq!(map.page_state(page)?, PageState::IndexFree);

        let counts = map.bucket_counts(4);
        assert_eq!(counts[&PageState::IndexFree], 1);
        assert_eq!(counts[&PageState::Empty], 7);

        let reloaded = AllocationMap::load(&images)?;
        assert_eq!(reloaded.page_state(page)?, PageState::IndexFree);
        assert_eq!(reloaded.bucket_counts(4), counts);

        // next transaction on the reloaded map reuses the free index page
        let mut delta = AllocDelta::new();
        let (again, is_new) = reloaded.get_free_page(&mut delta, 4, PageType::Index, 200)?;
        assert_eq!(again, page);
        assert!(!is_new);
        Ok(())
    }

    #[test]
    fn test_empty_extent_is_released_on_commit() -> Result<()> {
        let map = AllocationMap::new();
        let mut delta = AllocDelta::new();
        let (page, _) = map.get_free_page(&mut delta, 1, PageType::Data, 10)?;
        map.update_page_state(&mut delta, 1, page, PageState::DataLarge)?;
        commit(&map, delta);
        assert_eq!(map.extent_count(), 1);

        let mut delta = AllocDelta::new();
        map.update_page_state(&mut delta, 1, page, PageState::Empty)?;
        commit(&map, delta);
        assert_eq!(map.extent_count(), 0);
        assert!(map.bucket_counts(1).is_empty());

        // another collection can take the extent now
        let mut delta = AllocDelta::new();
        let (other, _) = map.get_free_page(&mut delta, 2, PageType::Data, 10)?;
        assert_eq!(other, page);
        Ok(())
    }

    #[test]
    fn test_rollback_restores_committed_lists() -> Result<()> {
        let map = AllocationMap::new();
        let mut delta = AllocDelta::new();
        let (page, _) = map.get_free_page(&mut delta, 1, PageType::Data, 10)?;
        map.update_page_state(&mut delta, 1, page, PageState::DataMedium)?;
        commit(&map, delta);

        let mut delta = AllocDelta::new();
        map.update_page_state(&mut delta, 1, page, PageState::DataFull)?;
        map.create_extent(&mut delta, 1);
        map.rollback(delta);

        assert_eq!(map.extent_count(), 1);
        let mut delta = AllocDelta::new();
        let (again, is_new) = map.get_free_page(&mut delta, 1, PageType::Data, 500)?;
        assert_eq!(again, page);
        assert!(!is_new);

        // the rolled back extent is free again
        let extent = map.create_extent(&mut delta, 2);
        assert_eq!(extent, 1);
        Ok(())
    }

    #[test]
    fn test_new_map_page_when_full() -> Result<()> {
        let map = AllocationMap::new();
        let mut delta = AllocDelta::new();
        for _ in 0..EXTENTS_PER_MAP_PAGE {
            map.create_extent(&mut delta, 1);
        }
        let extent = map.create_extent(&mut delta, 1);
        assert_eq!(extent, EXTENTS_PER_MAP_PAGE);
        assert_eq!(PageId::extent_start(extent), PageId::new(PageId::map_page(1).value() + 1));

        let first = PageId::extent_start(0);
        let last = PageId::extent_start(extent);
        map.update_page_state(&mut delta, 1, first, PageState::DataFull)?;
        map.update_page_state(&mut delta, 1, last, PageState::DataFull)?;

        let images = commit(&map, delta);
        assert_eq!(images.len(), 2);
        assert_eq!(images[1].page_id(), PageId::map_page(1));
        assert_eq!(map.map_page_count(), 2);
        assert_eq!(map.extent_count(), 2);
        Ok(())
    }
}
