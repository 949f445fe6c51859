//! Page header structure.
//!
//! The header occupies the first 32 bytes of every page. Besides the space
//! accounting used by the slot allocator it carries the fields the
//! write-ahead log relies on: the on-disk position, the writing transaction
//! and its confirmation flag.

use crate::types::{PageId, PageType, PAGE_HEADER_SIZE};

/// Offset of the confirmed flag (excluded from the checksum)
pub const CONFIRMED_OFFSET: usize = 9;

/// Offset of the checksum field
pub const CHECKSUM_OFFSET: usize = 28;

/// Value of `highest_index` when the page has no records
pub const NO_INDEX: u16 = u16::MAX;

/// Page header structure
///
/// Layout (32 bytes):
/// ```text
/// Offset  Size  Description
/// 0       4     Position on disk
/// 4       4     Logical page id
/// 8       1     Page type
/// 9       1     Confirmed flag
/// 10      1     Owning collection id
/// 11      1     Reserved
/// 12      4     Transaction id (0 in the data area)
/// 16      2     Items count
/// 18      2     Used bytes
/// 20      2     Fragmented bytes
/// 22      2     Next free position
/// 24      2     Highest slot index
/// 26      2     Reserved
/// 28      4     Checksum (CRC32)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub position: u32,
    pub page_id: PageId,
    pub page_type: PageType,
    pub confirmed: bool,
    pub col_id: u8,
    pub transaction_id: u32,
    pub items_count: u16,
    pub used_bytes: u16,
    pub fragmented_bytes: u16,
    pub next_free_position: u16,
    pub highest_index: u16,
}

impl PageHeader {
    /// Create the header of a fresh page at its home position
    pub fn new(page_id: PageId, page_type: PageType, col_id: u8) -> Self {
        Self {
            position: page_id.value(),
            page_id,
            page_type,
            confirmed: false,
            col_id,
            transaction_id: 0,
            items_count: 0,
            used_bytes: 0,
            fragmented_bytes: 0,
            next_free_position: PAGE_HEADER_SIZE as u16,
            highest_index: NO_INDEX,
        }
    }

    /// Read a page header from bytes
    pub fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PAGE_HEADER_SIZE {
            return None;
        }

        let u16_at = |i: usize| u16::from_be_bytes([bytes[i], bytes[i + 1]]);
        let u32_at =
            |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        Some(Self {
            position: u32_at(0),
            page_id: PageId::new(u32_at(4)),
            page_type: PageType::from_byte(bytes[8])?,
            confirmed: bytes[CONFIRMED_OFFSET] != 0,
            col_id: bytes[10],
            transaction_id: u32_at(12),
            items_count: u16_at(16),
            used_bytes: u16_at(18),
            fragmented_bytes: u16_at(20),
            next_free_position: u16_at(22),
            highest_index: u16_at(24),
        })
    }

    /// Write this header to bytes (the checksum is left untouched)
    pub fn write(&self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&self.position.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.page_id.value().to_be_bytes());
        bytes[8] = self.page_type as u8;
        bytes[CONFIRMED_OFFSET] = self.confirmed as u8;
        bytes[10] = self.col_id;
        bytes[11] = 0;
        bytes[12..16].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[16..18].copy_from_slice(&self.items_count.to_be_bytes());
        bytes[18..20].copy_from_slice(&self.used_bytes.to_be_bytes());
        bytes[20..22].copy_from_slice(&self.fragmented_bytes.to_be_bytes());
        bytes[22..24].copy_from_slice(&self.next_free_position.to_be_bytes());
        bytes[24..26].copy_from_slice(&self.highest_index.to_be_bytes());
        bytes[26..28].fill(0);
    }

    /// A page belongs to the log while it carries a transaction id
    pub fn is_log_page(&self) -> bool {
        self.transaction_id != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = PageHeader::new(PageId::new(12), PageType::Index, 4);
        header.position = 40;
        header.transaction_id = 9;
        header.confirmed = true;
        header.items_count = 3;
        header.used_bytes = 300;
        header.fragmented_bytes = 17;
        header.next_free_position = 349;
        header.highest_index = 2;

        let mut bytes = [0u8; PAGE_HEADER_SIZE];
        header.write(&mut bytes);
        assert_eq!(PageHeader::read(&bytes), Some(header));
        assert!(header.is_log_page());
    }

    #[test]
    fn test_invalid_page_type() {
        let mut bytes = [0u8; PAGE_HEADER_SIZE];
        bytes[8] = 0xEE;
        assert!(PageHeader::read(&bytes).is_none());
    }
}
