//! Page identifier type.

use crate::types::{EXTENTS_PER_MAP_PAGE, EXTENT_PAGES, MAP_PAGE_STRIDE};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical identifier of a page.
///
/// A page's home position in the data area equals its id. Allocation map
/// pages sit at every multiple of [`MAP_PAGE_STRIDE`]; the pages in between
/// belong to extents.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PageId(pub u32);

impl PageId {
    /// Invalid page ID, used as a sentinel value
    pub const INVALID: PageId = PageId(u32::MAX);

    /// Create a new page ID
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw page ID value
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Check if this is a valid page ID
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }

    /// Page id of the `index`-th allocation map page
    pub const fn map_page(index: u32) -> Self {
        Self(index * MAP_PAGE_STRIDE)
    }

    /// Whether this id is reserved for an allocation map page
    pub const fn is_map_page(self) -> bool {
        self.0 % MAP_PAGE_STRIDE == 0
    }

    /// Global extent number and position inside the extent, or `None` for
    /// allocation map pages
    pub fn extent_slot(self) -> Option<(u32, u32)> {
        if !self.is_valid() || self.is_map_page() {
            return None;
        }
        let map_index = self.0 / MAP_PAGE_STRIDE;
        let offset = self.0 % MAP_PAGE_STRIDE - 1;
        let extent = map_index * EXTENTS_PER_MAP_PAGE + offset / EXTENT_PAGES;
        Some((extent, offset % EXTENT_PAGES))
    }

    /// First page of a global extent number
    pub const fn extent_start(extent: u32) -> Self {
        let map_index = extent / EXTENTS_PER_MAP_PAGE;
        let local = extent % EXTENTS_PER_MAP_PAGE;
        Self(map_index * MAP_PAGE_STRIDE + 1 + local * EXTENT_PAGES)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "INVALID")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u32> for PageId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<PageId> for u32 {
    fn from(id: PageId) -> Self {
        id.0
    }
}
