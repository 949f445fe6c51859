//! Skip-list operations over a transaction snapshot.

use crate::catalog::IndexMeta;
use crate::error::{Result, StorageError};
use crate::index::{Collation, IndexKey, IndexNode, Order};
use crate::txn::Snapshot;
use crate::types::{PageType, RowAddress, MAX_INDEX_KEY_LENGTH, MAX_LEVEL, SLOT_SIZE};
use rand::Rng;
use std::cmp::Ordering;
use std::collections::HashSet;

/// Index store of one collection
pub struct IndexService<'a> {
    snapshot: &'a mut Snapshot,
    collation: &'a Collation,
    col: u8,
}

impl<'a> IndexService<'a> {
    pub fn new(snapshot: &'a mut Snapshot, collation: &'a Collation, col: u8) -> Self {
        Self {
            snapshot,
            collation,
            col,
        }
    }

    pub fn collation(&self) -> &Collation {
        self.collation
    }

    /// Write the head and tail sentinels of a new index, linked at every
    /// level. Returns (head, tail).
    pub fn create_index(&mut self, slot: u8) -> Result<(RowAddress, RowAddress)> {
        let head = self.insert_node(slot, MAX_LEVEL, RowAddress::EMPTY, &IndexKey::MinValue)?;
        let tail = self.insert_node(slot, MAX_LEVEL, RowAddress::EMPTY, &IndexKey::MaxValue)?;
        for level in 0..MAX_LEVEL {
            self.set_next(head, level, tail)?;
            self.set_prev(tail, level, head)?;
        }
        Ok((head, tail))
    }

    pub fn get_node(&self, address: RowAddress) -> Result<IndexNode> {
        let page = self.snapshot.page(address.page_id)?;
        if page.page_type() != PageType::Index {
            return Err(StorageError::bad_record(address, "not on an index page"));
        }
        IndexNode::read(&page, address.index)
    }

    /// Locate `key`. Without `sibling` only an equal node is returned; with
    /// it a missed search yields the first node past `key` in `order`.
    pub fn find(
        &self,
        index: &IndexMeta,
        key: &IndexKey,
        sibling: bool,
        order: Order,
    ) -> Result<Option<IndexNode>> {
        let (start, end) = match order {
            Order::Ascending => (index.head, index.tail),
            Order::Descending => (index.tail, index.head),
        };
        let forward = order.forward();

        let mut cur = self.get_node(start)?;
        for level in (0..MAX_LEVEL).rev() {
            loop {
                let next_address = cur.next_prev(level, order);
                // the opposite sentinel compares past every key
                if next_address.is_empty() || next_address == end {
                    break;
                }
                let next = self.get_node(next_address)?;
                match next.key.compare(key, self.collation) {
                    Ordering::Equal => return Ok(Some(next)),
                    diff if diff == forward => {
                        if level == 0 && sibling {
                            return Ok(Some(next));
                        }
                        break;
                    }
                    _ => cur = next,
                }
            }
        }
        Ok(None)
    }

    /// Insert a node for `key` pointing at `data_block`, appended to the
    /// document chain after `last`. Nothing is written when the key is
    /// rejected.
    pub fn add_node<R: Rng>(
        &mut self,
        rng: &mut R,
        index: &IndexMeta,
        key: IndexKey,
        data_block: RowAddress,
        last: Option<RowAddress>,
    ) -> Result<RowAddress> {
        Self::check_key(&key)?;
        let levels = random_level(rng);

        let mut lefts = Vec::with_capacity(levels as usize);
        let mut rights = Vec::with_capacity(levels as usize);
        let mut cur = self.get_node(index.head)?;
        for level in (0..MAX_LEVEL).rev() {
            loop {
                let next_address = cur.next[level as usize];
                if next_address.is_empty() {
                    return Err(StorageError::bad_record(
                        cur.address,
                        format!("skip list broken at level {}", level),
                    ));
                }
                if next_address == index.tail {
                    break;
                }
                let next = self.get_node(next_address)?;
                match next.key.compare(&key, self.collation) {
                    Ordering::Equal if index.unique => {
                        return Err(StorageError::DuplicateKey {
                            index: index.name.clone(),
                            key: key.to_string(),
                        });
                    }
                    Ordering::Greater => break,
                    _ => cur = next,
                }
            }
            if level < levels {
                lefts.push(cur.address);
                rights.push(cur.next[level as usize]);
            }
        }
        // collected top-down
        lefts.reverse();
        rights.reverse();

        let address = self.insert_node(index.slot, levels, data_block, &key)?;
        for level in 0..levels {
            let (left, right) = (lefts[level as usize], rights[level as usize]);
            self.set_prev(address, level, left)?;
            self.set_next(address, level, right)?;
            self.set_next(left, level, address)?;
            self.set_prev(right, level, address)?;
        }

        if let Some(last) = last {
            self.set_next_node(last, address)?;
        }
        Ok(address)
    }

    pub fn check_key(key: &IndexKey) -> Result<()> {
        if key.is_sentinel() {
            return Err(StorageError::invalid_operation(format!(
                "{} cannot be stored in an index",
                key
            )));
        }
        let size = key.encoded_len();
        if size > MAX_INDEX_KEY_LENGTH {
            return Err(StorageError::IndexKeyTooLong {
                size,
                max: MAX_INDEX_KEY_LENGTH,
            });
        }
        Ok(())
    }

    /// Unlink a node from every level and delete it. The document chain is
    /// left to the caller.
    pub fn delete_single(&mut self, address: RowAddress) -> Result<IndexNode> {
        let node = self.get_node(address)?;
        for level in 0..node.levels {
            let (prev, next) = (node.prev[level as usize], node.next[level as usize]);
            if !prev.is_empty() {
                self.set_next(prev, level, next)?;
            }
            if !next.is_empty() {
                self.set_prev(next, level, prev)?;
            }
        }
        self.delete_record(address)?;
        Ok(node)
    }

    /// Delete a document's whole node chain starting at `first`
    pub fn delete_all(&mut self, first: RowAddress) -> Result<usize> {
        let mut address = first;
        let mut deleted = 0;
        while !address.is_empty() {
            let node = self.delete_single(address)?;
            address = node.next_node;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Delete the chain nodes in `targets`, relinking the survivors. Returns
    /// the first surviving node.
    pub fn delete_list(
        &mut self,
        first: RowAddress,
        targets: &HashSet<RowAddress>,
    ) -> Result<RowAddress> {
        let mut head = RowAddress::EMPTY;
        // (address, its stored next_node)
        let mut last: Option<(RowAddress, RowAddress)> = None;
        let mut address = first;

        while !address.is_empty() {
            let node = self.get_node(address)?;
            if targets.contains(&address) {
                self.delete_single(address)?;
            } else {
                match last {
                    Some((last, stored)) if stored != address => self.set_next_node(last, address)?,
                    Some(_) => {}
                    None => head = address,
                }
                last = Some((address, node.next_node));
            }
            address = node.next_node;
        }

        if let Some((last, stored)) = last {
            if !stored.is_empty() {
                self.set_next_node(last, RowAddress::EMPTY)?;
            }
        }
        Ok(head)
    }

    /// Nodes of a document chain, in chain order
    pub fn document_nodes(&self, first: RowAddress) -> Result<Vec<IndexNode>> {
        let mut nodes = Vec::new();
        let mut address = first;
        while !address.is_empty() {
            let node = self.get_node(address)?;
            address = node.next_node;
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Delete every node of an index, sentinels included. Document chains
    /// must no longer reference its nodes.
    pub fn drop_index(&mut self, index: &IndexMeta) -> Result<usize> {
        let head = self.get_node(index.head)?;
        let mut address = head.next[0];
        let mut deleted = 0;
        while address != index.tail {
            if address.is_empty() {
                return Err(StorageError::corruption(format!(
                    "index '{}' has no path to its tail",
                    index.name
                )));
            }
            let node = self.get_node(address)?;
            self.delete_record(address)?;
            address = node.next[0];
            deleted += 1;
        }
        self.delete_record(index.head)?;
        self.delete_record(index.tail)?;
        Ok(deleted)
    }

    fn insert_node(
        &mut self,
        slot: u8,
        levels: u8,
        data_block: RowAddress,
        key: &IndexKey,
    ) -> Result<RowAddress> {
        let size = IndexNode::size(levels, key);
        let page_id = self
            .snapshot
            .free_page(self.col, PageType::Index, size + SLOT_SIZE)?;
        let page = self.snapshot.page_mut(page_id)?;
        let index = page.insert(size)?;
        IndexNode::write_new(page, index, slot, levels, data_block, key)?;
        self.snapshot.update_state(page_id)?;
        Ok(RowAddress::new(page_id, index))
    }

    fn delete_record(&mut self, address: RowAddress) -> Result<()> {
        self.snapshot.page_mut(address.page_id)?.delete(address.index)?;
        self.snapshot.update_state(address.page_id)
    }

    fn set_next(&mut self, node: RowAddress, level: u8, value: RowAddress) -> Result<()> {
        let page = self.snapshot.page_mut(node.page_id)?;
        IndexNode::set_next(page, node.index, level, value)
    }

    fn set_prev(&mut self, node: RowAddress, level: u8, value: RowAddress) -> Result<()> {
        let page = self.snapshot.page_mut(node.page_id)?;
        IndexNode::set_prev(page, node.index, level, value)
    }

    fn set_next_node(&mut self, node: RowAddress, value: RowAddress) -> Result<()> {
        let page = self.snapshot.page_mut(node.page_id)?;
        IndexNode::set_next_node(page, node.index, value)
    }
}

/// Level count from fair coin flips: P(levels = k) = 2^-k, capped
fn random_level<R: Rng>(rng: &mut R) -> u8 {
    let mut levels = 1;
    while levels < MAX_LEVEL && rng.gen::<bool>() {
        levels += 1;
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PageState;
    use crate::txn::PageStore;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    const COL: u8 = 1;

    fn snapshot() -> Snapshot {
        let mut snapshot = Snapshot::new(PageStore::in_memory(), 1, 0, usize::MAX);
        snapshot.allow_writes(COL);
        snapshot
    }

    fn meta(svc: &mut IndexService<'_>, unique: bool) -> Result<IndexMeta> {
        let (head, tail) = svc.create_index(0)?;
        Ok(IndexMeta {
            name: "test".to_string(),
            slot: 0,
            expression: "$.test".to_string(),
            unique,
            head,
            tail,
        })
    }

    fn data(i: u32) -> RowAddress {
        RowAddress::new(crate::types::PageId::new(100 + i), 0)
    }

    /// Keys along level 0 in `order`, checking the back links on the way
    fn walk(svc: &IndexService<'_>, index: &IndexMeta, order: Order) -> Result<Vec<IndexKey>> {
        let start = if order == Order::Ascending { index.head } else { index.tail };
        let mut keys = Vec::new();
        let mut cur = svc.get_node(start)?;
        loop {
            let next = svc.get_node(cur.next_prev(0, order))?;
            assert_eq!(next.next_prev(0, order.reverse()), cur.address);
            if next.is_sentinel() {
                return Ok(keys);
            }
            keys.push(next.key.clone());
            cur = next;
        }
    }

    #[test]
    fn test_nodes_stay_sorted() -> Result<()> {
        let collation = Collation::default();
        let mut snapshot = snapshot();
        let mut svc = IndexService::new(&mut snapshot, &collation, COL);
        let index = meta(&mut svc, true)?;
        let mut rng = StdRng::seed_from_u64(7);

        let mut values: Vec<i32> = (0..500).collect();
        values.shuffle(&mut rng);
        for &v in &values {
            svc.add_node(&mut rng, &index, IndexKey::Int32(v * 2), data(v as u32), None)?;
        }

        let ascending = walk(&svc, &index, Order::Ascending)?;
        let expected: Vec<IndexKey> = (0..500).map(|v| IndexKey::Int32(v * 2)).collect();
        assert_eq!(ascending, expected);
        let mut descending = walk(&svc, &index, Order::Descending)?;
        descending.reverse();
        assert_eq!(descending, expected);

        let found = svc.find(&index, &IndexKey::Int64(84), false, Order::Ascending)?;
        assert_eq!(found.map(|n| n.data_block), Some(data(42)));
        assert!(svc.find(&index, &IndexKey::Int32(85), false, Order::Ascending)?.is_none());

        let after = svc.find(&index, &IndexKey::Int32(85), true, Order::Ascending)?;
        assert_eq!(after.map(|n| n.key), Some(IndexKey::Int32(86)));
        let before = svc.find(&index, &IndexKey::Int32(85), true, Order::Descending)?;
        assert_eq!(before.map(|n| n.key), Some(IndexKey::Int32(84)));
        assert!(svc.find(&index, &IndexKey::Int32(999), true, Order::Ascending)?.is_none());

        let last = svc.find(&index, &IndexKey::Double(f64::INFINITY), true, Order::Descending)?;
        assert_eq!(last.map(|n| n.key), Some(IndexKey::Int32(998)));
        Ok(())
    }

    #[test]
    fn test_duplicate_leaves_index_untouched() -> Result<()> {
        let collation = Collation::default();
        let mut snapshot = snapshot();
        let mut svc = IndexService::new(&mut snapshot, &collation, COL);
        let index = meta(&mut svc, true)?;
        let mut rng = StdRng::seed_from_u64(1);

        svc.add_node(&mut rng, &index, IndexKey::from("Alice"), data(1), None)?;
        svc.add_node(&mut rng, &index, IndexKey::from("bob"), data(2), None)?;
        let before = svc.snapshot.page(index.head.page_id)?.as_bytes().to_vec();

        let err = svc.add_node(&mut rng, &index, IndexKey::from("ALICE"), data(3), None);
        assert!(matches!(err, Err(StorageError::DuplicateKey { .. })));
        assert_eq!(svc.snapshot.page(index.head.page_id)?.as_bytes(), &before[..]);
        assert_eq!(walk(&svc, &index, Order::Ascending)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_keys() -> Result<()> {
        let collation = Collation::default();
        let mut snapshot = snapshot();
        let mut svc = IndexService::new(&mut snapshot, &collation, COL);
        let index = meta(&mut svc, false)?;
        let mut rng = StdRng::seed_from_u64(1);

        let long = IndexKey::String("k".repeat(MAX_INDEX_KEY_LENGTH));
        assert!(matches!(
            svc.add_node(&mut rng, &index, long, data(1), None),
            Err(StorageError::IndexKeyTooLong { .. })
        ));
        assert!(svc.add_node(&mut rng, &index, IndexKey::MaxValue, data(1), None).is_err());
        Ok(())
    }

    #[test]
    fn test_document_chain_deletes() -> Result<()> {
        let collation = Collation::default();
        let mut snapshot = snapshot();
        let mut svc = IndexService::new(&mut snapshot, &collation, COL);
        let pk = meta(&mut svc, true)?;
        let (head, tail) = svc.create_index(1)?;
        let tags = IndexMeta {
            name: "tags".to_string(),
            slot: 1,
            expression: "$.tags".to_string(),
            unique: false,
            head,
            tail,
        };
        let mut rng = StdRng::seed_from_u64(3);

        let first = svc.add_node(&mut rng, &pk, IndexKey::Int32(1), data(1), None)?;
        let a = svc.add_node(&mut rng, &tags, IndexKey::from("a"), data(1), Some(first))?;
        let b = svc.add_node(&mut rng, &tags, IndexKey::from("b"), data(1), Some(a))?;
        let c = svc.add_node(&mut rng, &tags, IndexKey::from("c"), data(1), Some(b))?;
        let other = svc.add_node(&mut rng, &pk, IndexKey::Int32(2), data(2), None)?;
        svc.add_node(&mut rng, &tags, IndexKey::from("b"), data(2), Some(other))?;

        let chain: Vec<RowAddress> = svc.document_nodes(first)?.iter().map(|n| n.address).collect();
        assert_eq!(chain, vec![first, a, b, c]);

        let targets: HashSet<RowAddress> = [b].into_iter().collect();
        assert_eq!(svc.delete_list(first, &targets)?, first);
        let chain: Vec<RowAddress> = svc.document_nodes(first)?.iter().map(|n| n.address).collect();
        assert_eq!(chain, vec![first, a, c]);
        assert_eq!(
            walk(&svc, &tags, Order::Ascending)?,
            vec![IndexKey::from("a"), IndexKey::from("b"), IndexKey::from("c")]
        );

        assert_eq!(svc.delete_all(first)?, 3);
        assert_eq!(walk(&svc, &pk, Order::Ascending)?, vec![IndexKey::Int32(2)]);
        assert_eq!(walk(&svc, &tags, Order::Ascending)?, vec![IndexKey::from("b")]);
        Ok(())
    }

    #[test]
    fn test_drop_index_frees_pages() -> Result<()> {
        let collation = Collation::default();
        let mut snapshot = snapshot();
        let mut svc = IndexService::new(&mut snapshot, &collation, COL);
        let index = meta(&mut svc, false)?;
        let mut rng = StdRng::seed_from_u64(5);
        for i in 0..300 {
            svc.add_node(&mut rng, &index, IndexKey::String(format!("key-{:04}", i)), data(i), None)?;
        }

        assert_eq!(svc.drop_index(&index)?, 300);
        let page = svc.snapshot.page(index.head.page_id)?;
        assert_eq!(page.items_count(), 0);
        assert_eq!(PageState::for_page(&page), PageState::Empty);
        Ok(())
    }
}
