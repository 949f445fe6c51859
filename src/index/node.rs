//! Skip-list node record layout.
//!
//! ```text
//! Offset          Size        Description
//! 0               1           Index slot (which index of the collection)
//! 1               1           Level count L (1..=32)
//! 2               6           Data block row address
//! 8               6           Next node of the same document
//! 14              L * 12      (prev, next) row addresses per level
//! 14 + L * 12     ..          Encoded key
//! ```
//!
//! Nodes are decoded into owned [`IndexNode`] values; pointer updates are
//! written straight into the page bytes at fixed offsets.

use crate::error::{Result, StorageError};
use crate::index::{IndexKey, Order};
use crate::page::SlottedPage;
use crate::types::{RowAddress, INDEX_NODE_FIXED_SIZE, MAX_LEVEL, ROW_ADDRESS_SIZE};

const P_SLOT: usize = 0;
const P_LEVELS: usize = 1;
const P_DATA_BLOCK: usize = 2;
const P_NEXT_NODE: usize = 8;
const P_PREV_NEXT: usize = INDEX_NODE_FIXED_SIZE;

fn prev_offset(level: u8) -> usize {
    P_PREV_NEXT + level as usize * ROW_ADDRESS_SIZE * 2
}

fn next_offset(level: u8) -> usize {
    prev_offset(level) + ROW_ADDRESS_SIZE
}

fn key_offset(levels: u8) -> usize {
    prev_offset(levels)
}

/// A decoded skip-list node
#[derive(Debug, Clone, PartialEq)]
pub struct IndexNode {
    pub address: RowAddress,
    pub slot: u8,
    pub levels: u8,
    pub data_block: RowAddress,
    pub next_node: RowAddress,
    pub prev: Vec<RowAddress>,
    pub next: Vec<RowAddress>,
    pub key: IndexKey,
}

impl IndexNode {
    /// Record size of a node with `levels` levels and `key`
    pub fn size(levels: u8, key: &IndexKey) -> usize {
        key_offset(levels) + key.encoded_len()
    }

    /// Decode the node stored at `index`
    pub fn read(page: &SlottedPage, index: u16) -> Result<Self> {
        let address = RowAddress::new(page.page_id(), index);
        let bytes = page.get(index)?;
        if bytes.len() < P_PREV_NEXT {
            return Err(StorageError::bad_record(address, "index node shorter than header"));
        }

        let levels = bytes[P_LEVELS];
        if levels == 0 || levels > MAX_LEVEL || bytes.len() <= key_offset(levels) {
            return Err(StorageError::bad_record(
                address,
                format!("invalid index node with {} levels", levels),
            ));
        }

        let prev = (0..levels)
            .map(|l| RowAddress::read(&bytes[prev_offset(l)..]))
            .collect();
        let next = (0..levels)
            .map(|l| RowAddress::read(&bytes[next_offset(l)..]))
            .collect();

        Ok(Self {
            address,
            slot: bytes[P_SLOT],
            levels,
            data_block: RowAddress::read(&bytes[P_DATA_BLOCK..]),
            next_node: RowAddress::read(&bytes[P_NEXT_NODE..]),
            prev,
            next,
            key: IndexKey::decode(&bytes[key_offset(levels)..])?,
        })
    }

    /// Initialize a freshly inserted record with unlinked pointers
    pub fn write_new(
        page: &mut SlottedPage,
        index: u16,
        slot: u8,
        levels: u8,
        data_block: RowAddress,
        key: &IndexKey,
    ) -> Result<()> {
        let mut encoded = Vec::with_capacity(key.encoded_len());
        key.encode(&mut encoded)?;

        let bytes = page.get_mut(index)?;
        if bytes.len() != key_offset(levels) + encoded.len() {
            return Err(StorageError::corruption(format!(
                "index node record is {} bytes, expected {}",
                bytes.len(),
                key_offset(levels) + encoded.len()
            )));
        }

        bytes[P_SLOT] = slot;
        bytes[P_LEVELS] = levels;
        data_block.write(&mut bytes[P_DATA_BLOCK..]);
        RowAddress::EMPTY.write(&mut bytes[P_NEXT_NODE..]);
        for level in 0..levels {
            RowAddress::EMPTY.write(&mut bytes[prev_offset(level)..]);
            RowAddress::EMPTY.write(&mut bytes[next_offset(level)..]);
        }
        bytes[key_offset(levels)..].copy_from_slice(&encoded);
        Ok(())
    }

    pub fn set_prev(page: &mut SlottedPage, index: u16, level: u8, value: RowAddress) -> Result<()> {
        let bytes = Self::checked_mut(page, index, level)?;
        value.write(&mut bytes[prev_offset(level)..]);
        Ok(())
    }

    pub fn set_next(page: &mut SlottedPage, index: u16, level: u8, value: RowAddress) -> Result<()> {
        let bytes = Self::checked_mut(page, index, level)?;
        value.write(&mut bytes[next_offset(level)..]);
        Ok(())
    }

    pub fn set_next_node(page: &mut SlottedPage, index: u16, value: RowAddress) -> Result<()> {
        let bytes = page.get_mut(index)?;
        value.write(&mut bytes[P_NEXT_NODE..]);
        Ok(())
    }

    fn checked_mut(page: &mut SlottedPage, index: u16, level: u8) -> Result<&mut [u8]> {
        let address = RowAddress::new(page.page_id(), index);
        let bytes = page.get_mut(index)?;
        if bytes.len() < P_PREV_NEXT || level >= bytes[P_LEVELS] {
            return Err(StorageError::bad_record(
                address,
                format!("index node has no level {}", level),
            ));
        }
        Ok(bytes)
    }

    /// Neighbour at `level` in the direction of `order`
    pub fn next_prev(&self, level: u8, order: Order) -> RowAddress {
        match order {
            Order::Ascending => self.next[level as usize],
            Order::Descending => self.prev[level as usize],
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.key.is_sentinel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PageId, PageType};

    #[test]
    fn test_node_layout() -> Result<()> {
        let mut page = SlottedPage::new(PageId::new(2), PageType::Index, 1);
        let key = IndexKey::from("abc");
        let index = page.insert(IndexNode::size(3, &key))?;
        let data = RowAddress::new(PageId::new(7), 1);
        IndexNode::write_new(&mut page, index, 4, 3, data, &key)?;

        let node = IndexNode::read(&page, index)?;
        assert_eq!(node.slot, 4);
        assert_eq!(node.levels, 3);
        assert_eq!(node.data_block, data);
        assert!(node.next_node.is_empty());
        assert!(node.prev.iter().chain(node.next.iter()).all(RowAddress::is_empty));
        assert_eq!(node.key, key);

        let other = RowAddress::new(PageId::new(9), 3);
        IndexNode::set_next(&mut page, index, 2, other)?;
        IndexNode::set_prev(&mut page, index, 0, other)?;
        IndexNode::set_next_node(&mut page, index, other)?;

        let node = IndexNode::read(&page, index)?;
        assert_eq!(node.next_prev(2, Order::Ascending), other);
        assert_eq!(node.next_prev(0, Order::Descending), other);
        assert_eq!(node.next_node, other);
        assert_eq!(node.key, key);

        assert!(IndexNode::set_next(&mut page, index, 3, other).is_err());
        Ok(())
    }
}
