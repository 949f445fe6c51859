//! Slotted page implementation.
//!
//! A slotted page uses the following layout:
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                 Page Header (32 bytes)              │
//! ├────────────────────────────────────────────────────┤
//! │      [rec0][rec1][rec2]...   →                      │
//! │                                                    │
//! │                   Free Space                        │
//! │                                                    │
//! │                   ←   ...[slot2][slot1][slot0]      │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! Records are appended at `next_free_position`. The slot table grows
//! backward from the end of the page, four bytes per slot (location, length).
//! Slot indices are stable: defrag moves record bytes, never slots, so row
//! addresses stay valid across compaction.

use crate::error::{Result, StorageError};
use crate::page::header::{CHECKSUM_OFFSET, CONFIRMED_OFFSET, NO_INDEX};
use crate::page::{PageBuf, PageHeader};
use crate::types::{
    PageId, PageType, RowAddress, PAGE_CONTENT_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE, SLOT_SIZE,
};
use tracing::trace;

/// A page providing slot-addressed record storage
#[derive(Clone, Debug)]
pub struct SlottedPage {
    /// The raw page data
    data: PageBuf,
    /// Cached header (kept in sync with data)
    header: PageHeader,
}

impl SlottedPage {
    /// Create a new empty page
    pub fn new(page_id: PageId, page_type: PageType, col_id: u8) -> Self {
        let mut data = PageBuf::new();
        let header = PageHeader::new(page_id, page_type, col_id);
        header.write(&mut data);
        Self { data, header }
    }

    /// Load a page read from disk, verifying its checksum
    pub fn load(data: PageBuf) -> Result<Self> {
        let header = PageHeader::read(&data)
            .ok_or_else(|| StorageError::invalid_page("invalid page header"))?;
        let page = Self { data, header };
        let stored = page.stored_checksum();
        let computed = page.compute_checksum();
        if stored != computed {
            return Err(StorageError::corruption(format!(
                "page {} checksum mismatch (stored {:08x}, computed {:08x})",
                page.header.page_id, stored, computed
            )));
        }
        Ok(page)
    }

    /// Load a page from raw bytes without verifying the checksum
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let data = PageBuf::from_bytes(bytes);
        let header = PageHeader::read(&data)
            .ok_or_else(|| StorageError::invalid_page("invalid page header"))?;
        Ok(Self { data, header })
    }

    /// Get the raw bytes of this page
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Get the page header
    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    pub fn page_id(&self) -> PageId {
        self.header.page_id
    }

    pub fn page_type(&self) -> PageType {
        self.header.page_type
    }

    pub fn col_id(&self) -> u8 {
        self.header.col_id
    }

    pub fn items_count(&self) -> usize {
        self.header.items_count as usize
    }

    pub fn used_bytes(&self) -> usize {
        self.header.used_bytes as usize
    }

    pub fn fragmented_bytes(&self) -> usize {
        self.header.fragmented_bytes as usize
    }

    pub fn highest_index(&self) -> Option<u16> {
        (self.header.highest_index != NO_INDEX).then_some(self.header.highest_index)
    }

    /// Stamp the log fields before the page is written
    pub fn set_log_info(&mut self, position: u32, transaction_id: u32, confirmed: bool) {
        self.header.position = position;
        self.header.transaction_id = transaction_id;
        self.header.confirmed = confirmed;
        self.sync_header();
    }

    pub fn set_confirmed(&mut self, confirmed: bool) {
        self.header.confirmed = confirmed;
        self.sync_header();
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.header.page_type = page_type;
        self.sync_header();
    }

    /// CRC32 over the page, skipping the confirmed flag and the checksum
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..CONFIRMED_OFFSET]);
        hasher.update(&self.data[CONFIRMED_OFFSET + 1..CHECKSUM_OFFSET]);
        hasher.update(&self.data[PAGE_HEADER_SIZE..]);
        hasher.finalize()
    }

    fn stored_checksum(&self) -> u32 {
        let b = &self.data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4];
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    /// Write the checksum into the buffer; call before handing bytes to disk
    pub fn seal(&mut self) {
        let checksum = self.compute_checksum();
        self.data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_be_bytes());
    }

    /// Size of the slot table
    pub fn footer_size(&self) -> usize {
        match self.highest_index() {
            Some(h) => (h as usize + 1) * SLOT_SIZE,
            None => 0,
        }
    }

    /// Bytes that can still be claimed (after a defrag if necessary)
    pub fn free_bytes(&self) -> usize {
        PAGE_CONTENT_SIZE
            .saturating_sub(self.used_bytes())
            .saturating_sub(self.footer_size())
    }

    fn slot_offset(index: u16) -> usize {
        PAGE_SIZE - (index as usize + 1) * SLOT_SIZE
    }

    /// Read the (location, length) pair of a slot
    pub fn slot(&self, index: u16) -> (u16, u16) {
        let offset = Self::slot_offset(index);
        let location = u16::from_be_bytes([self.data[offset], self.data[offset + 1]]);
        let length = u16::from_be_bytes([self.data[offset + 2], self.data[offset + 3]]);
        (location, length)
    }

    fn set_slot(&mut self, index: u16, location: u16, length: u16) {
        let offset = Self::slot_offset(index);
        self.data[offset..offset + 2].copy_from_slice(&location.to_be_bytes());
        self.data[offset + 2..offset + 4].copy_from_slice(&length.to_be_bytes());
    }

    /// Whether a slot holds a live record
    pub fn is_used(&self, index: u16) -> bool {
        match self.highest_index() {
            Some(h) if index <= h => self.slot(index) != (0, 0),
            _ => false,
        }
    }

    /// Byte range of a live record, validated against the page bounds
    fn record_range(&self, index: u16) -> Result<std::ops::Range<usize>> {
        let address = RowAddress::new(self.page_id(), index);
        if !self.is_used(index) {
            return Err(StorageError::bad_record(address, "slot is free"));
        }
        let (location, length) = self.slot(index);
        let start = location as usize;
        let end = start + length as usize;
        if start < PAGE_HEADER_SIZE || end > PAGE_SIZE - self.footer_size() {
            return Err(StorageError::bad_record(
                address,
                format!("slot points outside content area ({}..{})", start, end),
            ));
        }
        Ok(start..end)
    }

    /// Get the bytes of a record
    pub fn get(&self, index: u16) -> Result<&[u8]> {
        let range = self.record_range(index)?;
        Ok(&self.data[range])
    }

    /// Get the bytes of a record for writing
    pub fn get_mut(&mut self, index: u16) -> Result<&mut [u8]> {
        let range = self.record_range(index)?;
        Ok(&mut self.data[range])
    }

    /// Indices of live records, ascending
    pub fn used_slots(&self) -> Vec<u16> {
        match self.highest_index() {
            Some(h) => (0..=h).filter(|&i| self.slot(i) != (0, 0)).collect(),
            None => Vec::new(),
        }
    }

    /// Lowest free slot index (a hole below the top, or one past it)
    pub fn free_slot_index(&self) -> u16 {
        match self.highest_index() {
            Some(h) => (0..=h).find(|&i| self.slot(i) == (0, 0)).unwrap_or(h + 1),
            None => 0,
        }
    }

    /// Reserve `length` bytes in a new slot and return its index
    pub fn insert(&mut self, length: usize) -> Result<u16> {
        let index = self.free_slot_index();
        self.insert_at(length, index)?;
        Ok(index)
    }

    /// Reserve `length` bytes under a specific free slot index
    fn insert_at(&mut self, length: usize, index: u16) -> Result<()> {
        if self.is_used(index) {
            return Err(StorageError::bad_record(
                RowAddress::new(self.page_id(), index),
                "slot already in use",
            ));
        }

        let footer_after = match self.highest_index() {
            Some(h) if index <= h => self.footer_size(),
            _ => (index as usize + 1) * SLOT_SIZE,
        };
        let growth = footer_after - self.footer_size();
        let needed = length + growth;

        if self.free_bytes() < needed {
            return Err(StorageError::PageFull {
                page_id: self.page_id(),
                needed,
                available: self.free_bytes(),
            });
        }

        let continuous = (PAGE_SIZE - footer_after)
            .saturating_sub(self.header.next_free_position as usize);
        if continuous < length {
            self.defrag();
            let continuous = (PAGE_SIZE - footer_after)
                .saturating_sub(self.header.next_free_position as usize);
            if continuous < length {
                return Err(StorageError::corruption(format!(
                    "page {} free space accounting is inconsistent after defrag",
                    self.page_id()
                )));
            }
        }

        let location = self.header.next_free_position;
        self.set_slot(index, location, length as u16);

        self.header.items_count += 1;
        self.header.used_bytes += length as u16;
        self.header.next_free_position += length as u16;
        if self.highest_index().map_or(true, |h| index > h) {
            self.header.highest_index = index;
        }
        self.sync_header();
        Ok(())
    }

    /// Resize a record. Shrinking releases the tail, growing keeps the
    /// current content as a prefix and may move the record inside the page.
    pub fn update(&mut self, index: u16, new_length: usize) -> Result<()> {
        let range = self.record_range(index)?;
        let (location, length) = (range.start, range.len());

        if new_length == length {
            return Ok(());
        }

        if new_length < length {
            let diff = length - new_length;
            self.data[location + new_length..location + length].fill(0);
            if location + length == self.header.next_free_position as usize {
                self.header.next_free_position -= diff as u16;
            } else {
                self.header.fragmented_bytes += diff as u16;
            }
            self.header.used_bytes -= diff as u16;
            self.set_slot(index, location as u16, new_length as u16);
            self.sync_header();
            return Ok(());
        }

        let diff = new_length - length;
        if self.free_bytes() < diff {
            return Err(StorageError::PageFull {
                page_id: self.page_id(),
                needed: diff,
                available: self.free_bytes(),
            });
        }

        // Last record with room behind it grows in place
        let end = location + length;
        if end == self.header.next_free_position as usize
            && end + diff <= PAGE_SIZE - self.footer_size()
        {
            self.header.next_free_position += diff as u16;
            self.header.used_bytes += diff as u16;
            self.set_slot(index, location as u16, new_length as u16);
            self.sync_header();
            return Ok(());
        }

        let content = self.data[range].to_vec();
        self.delete(index)?;
        self.insert_at(new_length, index)?;
        self.get_mut(index)?[..content.len()].copy_from_slice(&content);
        Ok(())
    }

    /// Free a record's slot and bytes
    pub fn delete(&mut self, index: u16) -> Result<()> {
        let range = self.record_range(index)?;
        let (location, length) = (range.start, range.len());

        self.data[range].fill(0);
        self.set_slot(index, 0, 0);

        self.header.items_count -= 1;
        self.header.used_bytes -= length as u16;

        if location + length == self.header.next_free_position as usize {
            self.header.next_free_position = location as u16;
        } else {
            self.header.fragmented_bytes += length as u16;
        }

        if Some(index) == self.highest_index() {
            self.header.highest_index = (0..index)
                .rev()
                .find(|&i| self.slot(i) != (0, 0))
                .unwrap_or(NO_INDEX);
        }

        if self.header.items_count == 0 {
            self.header.next_free_position = PAGE_HEADER_SIZE as u16;
            self.header.fragmented_bytes = 0;
            self.header.highest_index = NO_INDEX;
        }

        self.sync_header();
        Ok(())
    }

    /// Compact records toward the header, removing fragmentation.
    pub fn defrag(&mut self) {
        trace!(
            page_id = %self.page_id(),
            fragmented = self.fragmented_bytes(),
            "defragmenting page"
        );

        let mut records: Vec<(u16, u16, u16)> = self
            .used_slots()
            .into_iter()
            .map(|i| {
                let (location, length) = self.slot(i);
                (i, location, length)
            })
            .collect();
        records.sort_by_key(|&(_, location, _)| location);

        let mut next = PAGE_HEADER_SIZE;
        for (index, location, length) in records {
            let (location, length) = (location as usize, length as usize);
            if location != next {
                self.data.copy_within(location..location + length, next);
                self.set_slot(index, next as u16, length as u16);
            }
            next += length;
        }

        let footer_start = PAGE_SIZE - self.footer_size();
        self.data[next..footer_start].fill(0);

        self.header.fragmented_bytes = 0;
        self.header.next_free_position = next as u16;
        self.sync_header();
    }

    /// Drop every record and turn the page into an empty page
    pub fn mark_as_empty(&mut self) {
        self.data[PAGE_HEADER_SIZE..].fill(0);
        self.header.page_type = PageType::Empty;
        self.header.items_count = 0;
        self.header.used_bytes = 0;
        self.header.fragmented_bytes = 0;
        self.header.next_free_position = PAGE_HEADER_SIZE as u16;
        self.header.highest_index = NO_INDEX;
        self.sync_header();
    }

    /// The raw content area, for pages without slots (allocation map)
    pub fn content(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    pub fn content_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..]
    }

    /// Sync the cached header to the data buffer
    fn sync_header(&mut self) {
        self.header.write(&mut self.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn data_page() -> SlottedPage {
        SlottedPage::new(PageId::new(1), PageType::Data, 3)
    }

    fn write(page: &mut SlottedPage, index: u16, fill: u8) -> Result<()> {
        page.get_mut(index)?.fill(fill);
        Ok(())
    }

    #[test]
    fn test_new_page() {
        let page = data_page();
        assert_eq!(page.items_count(), 0);
        assert_eq!(page.free_bytes(), PAGE_CONTENT_SIZE);
        assert_eq!(page.highest_index(), None);
        assert_eq!(page.free_slot_index(), 0);
    }

    #[test]
    fn test_insert_and_get() -> Result<()> {
        let mut page = data_page();
        let a = page.insert(10)?;
        write(&mut page, a, 0xAA)?;
        let b = page.insert(20)?;
        write(&mut page, b, 0xBB)?;

        assert_eq!((a, b), (0, 1));
        assert_eq!(page.get(a)?, &[0xAA; 10]);
        assert_eq!(page.get(b)?, &[0xBB; 20]);
        assert_eq!(page.used_bytes(), 30);
        assert_eq!(page.free_bytes(), PAGE_CONTENT_SIZE - 30 - 2 * SLOT_SIZE);
        Ok(())
    }

    #[test]
    fn test_delete_reuses_slot_and_shrinks_highest() -> Result<()> {
        let mut page = data_page();
        for _ in 0..3 {
            page.insert(8)?;
        }
        page.delete(1)?;
        assert_eq!(page.fragmented_bytes(), 8);
        assert_eq!(page.free_slot_index(), 1);

        page.delete(2)?;
        assert_eq!(page.highest_index(), Some(0));

        page.delete(0)?;
        assert_eq!(page.items_count(), 0);
        assert_eq!(page.highest_index(), None);
        assert_eq!(page.fragmented_bytes(), 0);
        assert_eq!(page.free_bytes(), PAGE_CONTENT_SIZE);
        Ok(())
    }

    #[test]
    fn test_delete_free_slot_is_corruption() -> Result<()> {
        let mut page = data_page();
        page.insert(8)?;
        page.delete(0)?;
        assert!(matches!(page.delete(0), Err(StorageError::Corruption(_))));
        assert!(page.get(5).is_err());
        Ok(())
    }

    #[test]
    fn test_update_shrink_and_grow_keep_content() -> Result<()> {
        let mut page = data_page();
        let a = page.insert(16)?;
        write(&mut page, a, 1)?;
        let b = page.insert(16)?;
        write(&mut page, b, 2)?;

        page.update(a, 8)?;
        assert_eq!(page.get(a)?, &[1; 8]);
        assert_eq!(page.fragmented_bytes(), 8);

        page.update(a, 40)?;
        assert_eq!(&page.get(a)?[..8], &[1; 8]);
        assert_eq!(page.get(a)?.len(), 40);
        assert_eq!(page.get(b)?, &[2; 16]);
        assert_eq!(page.used_bytes(), 56);

        // last record grows in place
        let before = page.slot(a).0;
        page.update(a, 60)?;
        assert_eq!(page.slot(a).0, before);
        Ok(())
    }

    #[test]
    fn test_insert_triggers_defrag() -> Result<()> {
        let mut page = data_page();
        let big = (PAGE_CONTENT_SIZE - 3 * SLOT_SIZE) / 3;
        let a = page.insert(big)?;
        let b = page.insert(big)?;
        let c = page.insert(big)?;
        write(&mut page, c, 7)?;
        page.delete(a)?;
        page.delete(b)?;
        assert!(page.fragmented_bytes() > 0);

        let d = page.insert(big * 2 - SLOT_SIZE)?;
        assert_eq!(page.fragmented_bytes(), 0);
        assert_eq!(page.get(c)?, vec![7u8; big].as_slice());
        assert_eq!(page.get(d)?.len(), big * 2 - SLOT_SIZE);
        Ok(())
    }

    #[test]
    fn test_insert_page_full() -> Result<()> {
        let mut page = data_page();
        page.insert(PAGE_CONTENT_SIZE - SLOT_SIZE)?;
        assert_eq!(page.free_bytes(), 0);
        assert!(matches!(page.insert(1), Err(StorageError::PageFull { .. })));
        Ok(())
    }

    #[test]
    fn test_defrag_is_idempotent() -> Result<()> {
        let mut page = data_page();
        for i in 0..10u8 {
            let slot = page.insert(10 + i as usize)?;
            write(&mut page, slot, i)?;
        }
        for i in [1u16, 4, 5, 8] {
            page.delete(i)?;
        }
        page.update(2, 3)?;

        page.defrag();
        let once = page.as_bytes().to_vec();
        page.defrag();
        assert_eq!(page.as_bytes(), once.as_slice());

        for i in [0u16, 3, 6, 7, 9] {
            assert_eq!(page.get(i)?, vec![i as u8; 10 + i as usize].as_slice());
        }
        assert_eq!(page.get(2)?, &[2u8; 3]);
        Ok(())
    }

    #[test]
    fn test_random_operations_round_trip() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        let mut page = data_page();
        let mut live: HashMap<u16, Vec<u8>> = HashMap::new();

        for step in 0..4000u32 {
            let op = rng.gen_range(0..3);
            if op == 0 || live.is_empty() {
                let len = rng.gen_range(1..200);
                if page.free_bytes() < len + SLOT_SIZE {
                    continue;
                }
                let slot = page.insert(len)?;
                let bytes: Vec<u8> = (0..len).map(|i| (i as u32 + step) as u8).collect();
                page.get_mut(slot)?.copy_from_slice(&bytes);
                live.insert(slot, bytes);
            } else if op == 1 {
                let slot = *live.keys().nth(rng.gen_range(0..live.len())).unwrap();
                page.delete(slot)?;
                live.remove(&slot);
            } else {
                let slot = *live.keys().nth(rng.gen_range(0..live.len())).unwrap();
                let old = live[&slot].len();
                let len = rng.gen_range(1..300);
                if len > old && page.free_bytes() < len - old {
                    continue;
                }
                page.update(slot, len)?;
                let bytes: Vec<u8> = (0..len).map(|i| (i as u32 * 3 + step) as u8).collect();
                page.get_mut(slot)?.copy_from_slice(&bytes);
                live.insert(slot, bytes);
            }

            let used: usize = live.values().map(Vec::len).sum();
            assert_eq!(page.used_bytes(), used);
            assert_eq!(page.items_count(), live.len());
        }

        for (slot, bytes) in &live {
            assert_eq!(page.get(*slot)?, bytes.as_slice());
        }
        Ok(())
    }

    #[test]
    fn test_checksum_detects_corruption() -> Result<()> {
        let mut page = data_page();
        let slot = page.insert(4)?;
        page.get_mut(slot)?.copy_from_slice(b"abcd");
        page.seal();

        let reloaded = SlottedPage::load(page.data.clone())?;
        assert_eq!(reloaded.get(slot)?, b"abcd");

        // confirmation does not invalidate the checksum
        let mut confirmed = page.data.clone();
        confirmed[CONFIRMED_OFFSET] = 1;
        assert!(SlottedPage::load(confirmed)?.header().confirmed);

        let mut broken = page.data.clone();
        broken[100] ^= 0xFF;
        assert!(matches!(
            SlottedPage::load(broken),
            Err(StorageError::Corruption(_))
        ));
        Ok(())
    }
}
