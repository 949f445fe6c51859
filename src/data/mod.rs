//! Document storage in chained data blocks.
//!
//! A document is split into fragments of at most one page each. The first
//! block's row address is the document's address and never changes, even
//! when an update grows or shrinks the chain.

mod block;

pub use block::{DataBlock, FORMAT_RAW};

use crate::error::{Result, StorageError};
use crate::txn::Snapshot;
use crate::types::{
    PageType, RowAddress, DATA_BLOCK_FIXED_SIZE, MAX_DATA_BYTES_PER_PAGE, MAX_DOCUMENT_SIZE,
    SLOT_SIZE,
};

/// Most blocks a document chain may have
const MAX_BLOCKS: usize = MAX_DOCUMENT_SIZE / MAX_DATA_BYTES_PER_PAGE;

/// Data block store of one collection
pub struct DataService<'a> {
    snapshot: &'a mut Snapshot,
    col: u8,
}

impl<'a> DataService<'a> {
    pub fn new(snapshot: &'a mut Snapshot, col: u8) -> Self {
        Self { snapshot, col }
    }

    /// Store a document and return the address of its first block
    pub fn insert(&mut self, bytes: &[u8]) -> Result<RowAddress> {
        check_size(bytes)?;

        let mut first = RowAddress::EMPTY;
        let mut last = RowAddress::EMPTY;
        let mut offset = 0;
        loop {
            let len = (bytes.len() - offset).min(MAX_DATA_BYTES_PER_PAGE);
            let address = self.append_block(!last.is_empty(), &bytes[offset..offset + len])?;
            if last.is_empty() {
                first = address;
            } else {
                self.link(last, address)?;
            }
            last = address;
            offset += len;
            if offset >= bytes.len() {
                return Ok(first);
            }
        }
    }

    /// Read a whole document
    pub fn read(&self, address: RowAddress) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        let mut current = address;
        let mut blocks = 0;
        while !current.is_empty() {
            blocks += 1;
            if blocks > MAX_BLOCKS {
                return Err(StorageError::bad_record(address, "data block chain does not end"));
            }
            let page = self.snapshot.page(current.page_id)?;
            let block = self.read_block(&page, current, blocks == 1)?;
            bytes.extend_from_slice(DataBlock::fragment(&page, current.index)?);
            current = block.next_block;
        }
        Ok(bytes)
    }

    /// Replace a document, keeping its first block address. Existing blocks
    /// are rewritten in place with as much as their page can hold, missing
    /// blocks are appended and left-over blocks deleted.
    pub fn update(&mut self, address: RowAddress, bytes: &[u8]) -> Result<()> {
        check_size(bytes)?;

        let mut existing = address;
        let mut last = RowAddress::EMPTY;
        let mut offset = 0;
        let mut blocks = 0;
        loop {
            let remaining = bytes.len() - offset;
            let first = last.is_empty();

            let current = if !existing.is_empty() {
                blocks += 1;
                if blocks > MAX_BLOCKS {
                    return Err(StorageError::bad_record(address, "data block chain does not end"));
                }
                let page = self.snapshot.page_mut(existing.page_id)?;
                let block = {
                    let block = DataBlock::read(page, existing.index)?;
                    if block.extend == first {
                        return Err(StorageError::bad_record(existing, "unexpected extend flag"));
                    }
                    block
                };
                let capacity = (page.free_bytes() + block.fragment_len).min(MAX_DATA_BYTES_PER_PAGE);
                let len = remaining.min(capacity);
                page.update(existing.index, DATA_BLOCK_FIXED_SIZE + len)?;
                DataBlock::write(
                    page,
                    existing.index,
                    !first,
                    block.next_block,
                    &bytes[offset..offset + len],
                )?;
                self.snapshot.update_state(existing.page_id)?;

                offset += len;
                let current = existing;
                existing = block.next_block;
                current
            } else {
                let len = remaining.min(MAX_DATA_BYTES_PER_PAGE);
                let current = self.append_block(true, &bytes[offset..offset + len])?;
                self.link(last, current)?;
                offset += len;
                current
            };

            last = current;
            if offset >= bytes.len() {
                break;
            }
        }

        if !existing.is_empty() {
            self.link(last, RowAddress::EMPTY)?;
            self.delete_chain(existing)?;
        }
        Ok(())
    }

    /// Delete a document. Returns the number of blocks removed.
    pub fn delete(&mut self, address: RowAddress) -> Result<usize> {
        self.delete_chain(address)
    }

    fn delete_chain(&mut self, address: RowAddress) -> Result<usize> {
        let mut current = address;
        let mut blocks = 0;
        while !current.is_empty() {
            blocks += 1;
            if blocks > MAX_BLOCKS {
                return Err(StorageError::bad_record(address, "data block chain does not end"));
            }
            let page = self.snapshot.page_mut(current.page_id)?;
            let block = DataBlock::read(page, current.index)?;
            page.delete(current.index)?;
            self.snapshot.update_state(current.page_id)?;
            current = block.next_block;
        }
        Ok(blocks)
    }

    fn append_block(&mut self, extend: bool, fragment: &[u8]) -> Result<RowAddress> {
        let size = DATA_BLOCK_FIXED_SIZE + fragment.len();
        let page_id = self
            .snapshot
            .free_page(self.col, PageType::Data, size + SLOT_SIZE)?;
        let page = self.snapshot.page_mut(page_id)?;
        let index = page.insert(size)?;
        DataBlock::write(page, index, extend, RowAddress::EMPTY, fragment)?;
        self.snapshot.update_state(page_id)?;
        Ok(RowAddress::new(page_id, index))
    }

    fn link(&mut self, block: RowAddress, next: RowAddress) -> Result<()> {
        let page = self.snapshot.page_mut(block.page_id)?;
        DataBlock::set_next(page, block.index, next)
    }

    fn read_block(
        &self,
        page: &crate::page::SlottedPage,
        address: RowAddress,
        first: bool,
    ) -> Result<DataBlock> {
        if page.page_type() != PageType::Data || page.col_id() != self.col {
            return Err(StorageError::bad_record(
                address,
                format!("not a data page of collection {}", self.col),
            ));
        }
        let block = DataBlock::read(page, address.index)?;
        if block.extend == first {
            return Err(StorageError::bad_record(address, "unexpected extend flag"));
        }
        Ok(block)
    }
}

fn check_size(bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_DOCUMENT_SIZE {
        return Err(StorageError::DocumentTooLarge {
            size: bytes.len(),
            max: MAX_DOCUMENT_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PageState;
    use crate::txn::PageStore;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn snapshot() -> Snapshot {
        let mut snapshot = Snapshot::new(PageStore::in_memory(), 1, 0, usize::MAX);
        snapshot.allow_writes(1);
        snapshot
    }

    fn document(rng: &mut StdRng, len: usize) -> Vec<u8> {
        (0..len).map(|_| rng.gen()).collect()
    }

    fn chain_len(data: &DataService<'_>, address: RowAddress) -> Result<usize> {
        let mut blocks = 0;
        let mut current = address;
        while !current.is_empty() {
            let page = data.snapshot.page(current.page_id)?;
            current = DataBlock::read(&page, current.index)?.next_block;
            blocks += 1;
        }
        Ok(blocks)
    }

    #[test]
    fn test_small_and_empty_documents() -> Result<()> {
        let mut snapshot = snapshot();
        let mut data = DataService::new(&mut snapshot, 1);

        let a = data.insert(b"hello")?;
        let empty = data.insert(b"")?;
        assert_eq!(a.page_id, empty.page_id);
        assert_eq!(data.read(a)?, b"hello");
        assert!(data.read(empty)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_large_document_spans_pages() -> Result<()> {
        let mut snapshot = snapshot();
        let mut data = DataService::new(&mut snapshot, 1);
        let mut rng = StdRng::seed_from_u64(9);

        let doc = document(&mut rng, 3 * MAX_DATA_BYTES_PER_PAGE + 17);
        let address = data.insert(&doc)?;
        assert_eq!(chain_len(&data, address)?, 4);
        assert_eq!(data.read(address)?, doc);
        Ok(())
    }

    #[test]
    fn test_update_keeps_address() -> Result<()> {
        let mut snapshot = snapshot();
        let mut data = DataService::new(&mut snapshot, 1);
        let mut rng = StdRng::seed_from_u64(4);

        let address = data.insert(b"small")?;
        let neighbour = data.insert(b"neighbour")?;

        let grown = document(&mut rng, 20_000);
        data.update(address, &grown)?;
        assert_eq!(data.read(address)?, grown);
        assert!(chain_len(&data, address)? >= 3);

        data.update(address, b"tiny again")?;
        assert_eq!(data.read(address)?, b"tiny again");
        assert_eq!(chain_len(&data, address)?, 1);
        assert_eq!(data.read(neighbour)?, b"neighbour");
        Ok(())
    }

    #[test]
    fn test_delete_empties_pages() -> Result<()> {
        let mut snapshot = snapshot();
        let mut data = DataService::new(&mut snapshot, 1);
        let mut rng = StdRng::seed_from_u64(5);

        let doc = document(&mut rng, 2 * MAX_DATA_BYTES_PER_PAGE);
        let address = data.insert(&doc)?;
        assert_eq!(data.delete(address)?, 2);
        assert!(data.read(address).is_err());

        let store = std::sync::Arc::clone(snapshot.store());
        let parts = snapshot.take_parts();
        assert!(parts.alloc.pages().all(|(_, state)| state == PageState::Empty));
        store.alloc.rollback(parts.alloc);
        Ok(())
    }

    #[test]
    fn test_six_page_document_lifecycle() -> Result<()> {
        let mut snapshot = snapshot();
        let mut data = DataService::new(&mut snapshot, 1);
        let mut rng = StdRng::seed_from_u64(6);

        let doc = document(&mut rng, 5 * MAX_DATA_BYTES_PER_PAGE + 1);
        let address = data.insert(&doc)?;
        assert_eq!(chain_len(&data, address)?, 6);
        assert_eq!(data.read(address)?, doc);

        let small = document(&mut rng, 100);
        data.update(address, &small)?;
        assert_eq!(chain_len(&data, address)?, 1);
        assert_eq!(data.read(address)?, small);

        let regrown = document(&mut rng, 5 * MAX_DATA_BYTES_PER_PAGE + 1);
        data.update(address, &regrown)?;
        assert_eq!(chain_len(&data, address)?, 6);
        assert_eq!(data.read(address)?, regrown);

        assert_eq!(data.delete(address)?, 6);
        assert!(data.read(address).is_err());

        let store = std::sync::Arc::clone(snapshot.store());
        let parts = snapshot.take_parts();
        assert!(parts.alloc.pages().count() >= 6);
        assert!(parts.alloc.pages().all(|(_, state)| state == PageState::Empty));
        store.alloc.rollback(parts.alloc);
        Ok(())
    }

    #[test]
    fn test_oversized_document_rejected() {
        let mut snapshot = snapshot();
        let mut data = DataService::new(&mut snapshot, 1);
        let doc = vec![0u8; MAX_DOCUMENT_SIZE + 1];
        assert!(matches!(
            data.insert(&doc),
            Err(StorageError::DocumentTooLarge { .. })
        ));
    }
}
