//! Row address: the (page, slot) handle of a record.

use crate::types::{PageId, ROW_ADDRESS_SIZE};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Locates a data block or index node inside a page.
///
/// Layout (6 bytes, big-endian):
/// ```text
/// Offset  Size  Description
/// 0       4     Page id
/// 4       2     Slot index
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowAddress {
    pub page_id: PageId,
    pub index: u16,
}

impl RowAddress {
    /// Sentinel for "no record"
    pub const EMPTY: RowAddress = RowAddress {
        page_id: PageId::INVALID,
        index: u16::MAX,
    };

    pub const fn new(page_id: PageId, index: u16) -> Self {
        Self { page_id, index }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    pub fn read(bytes: &[u8]) -> Self {
        let page = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let index = u16::from_be_bytes([bytes[4], bytes[5]]);
        Self::new(PageId::new(page), index)
    }

    pub fn write(&self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&self.page_id.value().to_be_bytes());
        bytes[4..ROW_ADDRESS_SIZE].copy_from_slice(&self.index.to_be_bytes());
    }
}

impl Default for RowAddress {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Display for RowAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "(empty)")
        } else {
            write!(f, "({}:{})", self.page_id, self.index)
        }
    }
}
