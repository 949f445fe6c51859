//! Data block record layout.
//!
//! ```text
//! Offset  Size  Description
//! 0       1     Format tag (0 = raw bytes)
//! 1       1     Extend flag (set on every block after the first)
//! 2       6     Next block row address (empty on the last block)
//! 8       ..    Document fragment
//! ```

use crate::error::{Result, StorageError};
use crate::page::SlottedPage;
use crate::types::{RowAddress, DATA_BLOCK_FIXED_SIZE};

/// Format tag of uncompressed fragments
pub const FORMAT_RAW: u8 = 0;

const P_FORMAT: usize = 0;
const P_EXTEND: usize = 1;
const P_NEXT_BLOCK: usize = 2;
const P_BUFFER: usize = DATA_BLOCK_FIXED_SIZE;

/// Decoded header of a data block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlock {
    pub address: RowAddress,
    pub extend: bool,
    pub next_block: RowAddress,
    pub fragment_len: usize,
}

impl DataBlock {
    /// Read the block header stored in `page` at `index`
    pub fn read(page: &SlottedPage, index: u16) -> Result<Self> {
        let address = RowAddress::new(page.page_id(), index);
        let bytes = page.get(index)?;
        if bytes.len() < DATA_BLOCK_FIXED_SIZE {
            return Err(StorageError::bad_record(address, "data block shorter than header"));
        }
        if bytes[P_FORMAT] != FORMAT_RAW {
            return Err(StorageError::bad_record(
                address,
                format!("unknown data block format {}", bytes[P_FORMAT]),
            ));
        }
        Ok(Self {
            address,
            extend: bytes[P_EXTEND] != 0,
            next_block: RowAddress::read(&bytes[P_NEXT_BLOCK..P_BUFFER]),
            fragment_len: bytes.len() - DATA_BLOCK_FIXED_SIZE,
        })
    }

    /// The document bytes carried by a block
    pub fn fragment(page: &SlottedPage, index: u16) -> Result<&[u8]> {
        let bytes = page.get(index)?;
        bytes
            .get(P_BUFFER..)
            .ok_or_else(|| StorageError::bad_record(RowAddress::new(page.page_id(), index), "truncated data block"))
    }

    /// Write header and fragment into an already sized record
    pub fn write(
        page: &mut SlottedPage,
        index: u16,
        extend: bool,
        next_block: RowAddress,
        fragment: &[u8],
    ) -> Result<()> {
        let bytes = page.get_mut(index)?;
        if bytes.len() != DATA_BLOCK_FIXED_SIZE + fragment.len() {
            return Err(StorageError::corruption(format!(
                "data block record is {} bytes, fragment needs {}",
                bytes.len(),
                DATA_BLOCK_FIXED_SIZE + fragment.len()
            )));
        }
        bytes[P_FORMAT] = FORMAT_RAW;
        bytes[P_EXTEND] = extend as u8;
        next_block.write(&mut bytes[P_NEXT_BLOCK..P_BUFFER]);
        bytes[P_BUFFER..].copy_from_slice(fragment);
        Ok(())
    }

    /// Re-point a block's next pointer
    pub fn set_next(page: &mut SlottedPage, index: u16, next_block: RowAddress) -> Result<()> {
        let bytes = page.get_mut(index)?;
        next_block.write(&mut bytes[P_NEXT_BLOCK..P_BUFFER]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PageId, PageType};

    #[test]
    fn test_block_layout() -> Result<()> {
        let mut page = SlottedPage::new(PageId::new(5), PageType::Data, 1);
        let index = page.insert(DATA_BLOCK_FIXED_SIZE + 3)?;
        let next = RowAddress::new(PageId::new(9), 2);
        DataBlock::write(&mut page, index, true, next, b"xyz")?;

        let block = DataBlock::read(&page, index)?;
        assert!(block.extend);
        assert_eq!(block.next_block, next);
        assert_eq!(block.fragment_len, 3);
        assert_eq!(DataBlock::fragment(&page, index)?, b"xyz");

        DataBlock::set_next(&mut page, index, RowAddress::EMPTY)?;
        assert!(DataBlock::read(&page, index)?.next_block.is_empty());
        Ok(())
    }

    #[test]
    fn test_size_mismatch_rejected() -> Result<()> {
        let mut page = SlottedPage::new(PageId::new(5), PageType::Data, 1);
        let index = page.insert(DATA_BLOCK_FIXED_SIZE + 3)?;
        assert!(DataBlock::write(&mut page, index, false, RowAddress::EMPTY, b"toolong").is_err());
        Ok(())
    }
}
