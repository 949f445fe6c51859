//! Extent words.
//!
//! An extent is a run of eight consecutive pages owned by one collection.
//! Its state is packed into a u32:
//!
//! ```text
//! bits 31..24   owning collection id (0 = unowned)
//! bits 23..0    eight 3-bit page states, page i at bits 3*i
//! ```

use crate::page::SlottedPage;
use crate::types::{
    PageType, DATA_LARGE_FREE, DATA_MEDIUM_FREE, DATA_SMALL_FREE, EXTENT_PAGES,
    INDEX_FREE_THRESHOLD,
};

/// Free-space state of a page as tracked by the allocation map
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PageState {
    Empty = 0,
    DataLarge = 1,
    DataMedium = 2,
    DataSmall = 3,
    DataFull = 4,
    IndexFree = 5,
    IndexFull = 6,
    Reserved = 7,
}

impl PageState {
    pub fn from_code(code: u8) -> Self {
        match code & 0b111 {
            0 => Self::Empty,
            1 => Self::DataLarge,
            2 => Self::DataMedium,
            3 => Self::DataSmall,
            4 => Self::DataFull,
            5 => Self::IndexFree,
            6 => Self::IndexFull,
            _ => Self::Reserved,
        }
    }

    /// State of a data page with `free` bytes left
    pub fn for_data(free: usize) -> Self {
        if free >= DATA_LARGE_FREE {
            Self::DataLarge
        } else if free >= DATA_MEDIUM_FREE {
            Self::DataMedium
        } else if free >= DATA_SMALL_FREE {
            Self::DataSmall
        } else {
            Self::DataFull
        }
    }

    /// State of an index page with `free` bytes left
    pub fn for_index(free: usize) -> Self {
        if free >= INDEX_FREE_THRESHOLD {
            Self::IndexFree
        } else {
            Self::IndexFull
        }
    }

    /// State a page should be filed under after a mutation
    pub fn for_page(page: &SlottedPage) -> Self {
        if page.items_count() == 0 {
            return Self::Empty;
        }
        match page.page_type() {
            PageType::Data => Self::for_data(page.free_bytes()),
            PageType::Index => Self::for_index(page.free_bytes()),
            PageType::Empty => Self::Empty,
            PageType::AllocationMap => Self::Reserved,
        }
    }

    /// Whether a page in this state may be handed out for `page_type`
    pub fn serves(self, page_type: PageType) -> bool {
        match self {
            Self::Empty => true,
            Self::DataLarge | Self::DataMedium | Self::DataSmall => page_type == PageType::Data,
            Self::IndexFree => page_type == PageType::Index,
            Self::DataFull | Self::IndexFull | Self::Reserved => false,
        }
    }
}

/// Buckets to search, most specific first, for a request of `required`
/// bytes (record plus slot)
pub fn candidate_states(page_type: PageType, required: usize) -> &'static [PageState] {
    use PageState::*;

    match page_type {
        PageType::Index if required <= INDEX_FREE_THRESHOLD => &[IndexFree, Empty],
        PageType::Index => &[Empty],
        _ if required <= DATA_SMALL_FREE => &[DataSmall, DataMedium, DataLarge, Empty],
        _ if required <= DATA_MEDIUM_FREE => &[DataMedium, DataLarge, Empty],
        _ if required <= DATA_LARGE_FREE => &[DataLarge, Empty],
        _ => &[Empty],
    }
}

/// Owning collection of an extent word (0 = unowned)
pub fn collection(word: u32) -> u8 {
    (word >> 24) as u8
}

/// State of page `offset` (0..8) inside an extent word
pub fn page_state(word: u32, offset: u32) -> PageState {
    PageState::from_code(((word >> (3 * offset)) & 0b111) as u8)
}

/// Word with page `offset` set to `state`
pub fn with_page_state(word: u32, offset: u32, state: PageState) -> u32 {
    let shift = 3 * offset;
    (word & !(0b111 << shift)) | ((state as u32) << shift)
}

/// A freshly carved extent: owned, every page Empty
pub fn new_extent(collection: u8) -> u32 {
    (collection as u32) << 24
}

/// Whether every page of the extent is Empty
pub fn is_all_empty(word: u32) -> bool {
    (0..EXTENT_PAGES).all(|i| page_state(word, i) == PageState::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_packing() {
        let mut word = new_extent(7);
        assert_eq!(collection(word), 7);
        assert!(is_all_empty(word));

        word = with_page_state(word, 0, PageState::DataFull);
        word = with_page_state(word, 7, PageState::Reserved);
        word = with_page_state(word, 3, PageState::IndexFree);
        assert_eq!(page_state(word, 0), PageState::DataFull);
        assert_eq!(page_state(word, 3), PageState::IndexFree);
        assert_eq!(page_state(word, 7), PageState::Reserved);
        assert_eq!(collection(word), 7);

        word = with_page_state(word, 7, PageState::Empty);
        assert_eq!(page_state(word, 7), PageState::Empty);
        assert!(!is_all_empty(word));
    }

    #[test]
    fn test_thresholds() {
        assert_eq!(PageState::for_data(5000), PageState::DataLarge);
        assert_eq!(PageState::for_data(4096), PageState::DataLarge);
        assert_eq!(PageState::for_data(4095), PageState::DataMedium);
        assert_eq!(PageState::for_data(1024), PageState::DataMedium);
        assert_eq!(PageState::for_data(300), PageState::DataSmall);
        assert_eq!(PageState::for_data(255), PageState::DataFull);
        assert_eq!(
            PageState::for_index(INDEX_FREE_THRESHOLD),
            PageState::IndexFree
        );
        assert_eq!(
            PageState::for_index(INDEX_FREE_THRESHOLD - 1),
            PageState::IndexFull
        );
    }

    #[test]
    fn test_candidates_serve_request() {
        for required in [10, 256, 257, 1024, 1025, 4096, 4097, 8152] {
            for state in candidate_states(PageType::Data, required) {
                assert!(state.serves(PageType::Data));
            }
        }
        assert_eq!(
            candidate_states(PageType::Data, 300),
            &[PageState::DataMedium, PageState::DataLarge, PageState::Empty]
        );
        assert_eq!(
            candidate_states(PageType::Index, 100),
            &[PageState::IndexFree, PageState::Empty]
        );
    }
}
