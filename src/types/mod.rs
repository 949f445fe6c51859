//! Common types and on-disk constants used throughout the storage engine.

mod page_id;
mod row_address;

pub use page_id::PageId;
pub use row_address::RowAddress;

/// Page size in bytes (8KB)
pub const PAGE_SIZE: usize = 8192;

/// Size of the fixed page header
pub const PAGE_HEADER_SIZE: usize = 32;

/// Bytes available to records and the slot table
pub const PAGE_CONTENT_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Size of one slot table entry (u16 location + u16 length)
pub const SLOT_SIZE: usize = 4;

/// Serialized size of a [`RowAddress`]
pub const ROW_ADDRESS_SIZE: usize = 6;

/// Highest skip-list level
pub const MAX_LEVEL: u8 = 32;

/// Maximum encoded index key length
pub const MAX_INDEX_KEY_LENGTH: usize = 1023;

/// Index node bytes before the per-level pointers: slot, levels, data block,
/// next node
pub const INDEX_NODE_FIXED_SIZE: usize = 2 + ROW_ADDRESS_SIZE * 2;

/// Largest node an index page must be able to take
pub const MAX_INDEX_NODE_SIZE: usize =
    INDEX_NODE_FIXED_SIZE + MAX_LEVEL as usize * ROW_ADDRESS_SIZE * 2 + MAX_INDEX_KEY_LENGTH;

/// Data block bytes before the fragment: format, extend flag, next block
pub const DATA_BLOCK_FIXED_SIZE: usize = 2 + ROW_ADDRESS_SIZE;

/// Largest document fragment a single page can hold
pub const MAX_DATA_BYTES_PER_PAGE: usize = PAGE_CONTENT_SIZE - SLOT_SIZE - DATA_BLOCK_FIXED_SIZE;

/// Maximum serialized document size
pub const MAX_DOCUMENT_SIZE: usize = 2047 * MAX_DATA_BYTES_PER_PAGE;

/// Pages per extent
pub const EXTENT_PAGES: u32 = 8;

/// Extents described by one allocation map page (its whole content area)
pub const EXTENTS_PER_MAP_PAGE: u32 = (PAGE_CONTENT_SIZE / 4) as u32;

/// Distance between consecutive allocation map pages
pub const MAP_PAGE_STRIDE: u32 = 1 + EXTENTS_PER_MAP_PAGE * EXTENT_PAGES;

/// Collection that owns the master catalog document
pub const SYSTEM_COLLECTION_ID: u8 = 255;

/// Free-byte thresholds used to bucket data pages
pub const DATA_LARGE_FREE: usize = 4096;
pub const DATA_MEDIUM_FREE: usize = 1024;
pub const DATA_SMALL_FREE: usize = 256;

/// An index page keeps accepting nodes while it can take the largest one
pub const INDEX_FREE_THRESHOLD: usize = MAX_INDEX_NODE_SIZE + SLOT_SIZE;

/// Page types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageType {
    /// Unused page (all records deleted or never written)
    Empty = 0,
    /// Holds data blocks
    Data = 1,
    /// Holds skip-list nodes
    Index = 2,
    /// Holds extent words
    AllocationMap = 3,
}

impl PageType {
    /// Convert from byte value
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Empty),
            1 => Some(Self::Data),
            2 => Some(Self::Index),
            3 => Some(Self::AllocationMap),
            _ => None,
        }
    }
}
