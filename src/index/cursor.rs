//! Index traversal.
//!
//! A cursor remembers the next node to visit by row address only, so it
//! can be resumed over a fresh snapshot as long as the read version stays
//! the same.

use crate::catalog::IndexMeta;
use crate::error::Result;
use crate::index::{Collation, IndexKey, IndexNode, IndexService, Order};
use crate::types::RowAddress;
use std::cmp::Ordering;

/// What part of an index to visit
#[derive(Debug, Clone, PartialEq)]
pub enum IndexQuery {
    /// Every node
    All(Order),
    /// Every node with an equal key
    Equals(IndexKey),
    /// Nodes between two optional bounds
    Range {
        start: Option<IndexKey>,
        end: Option<IndexKey>,
        start_inclusive: bool,
        end_inclusive: bool,
        order: Order,
    },
    /// String keys starting with a prefix, under the index collation
    StartsWith(String),
}

impl IndexQuery {
    /// Inclusive range, ascending
    pub fn between(start: impl Into<IndexKey>, end: impl Into<IndexKey>) -> Self {
        Self::Range {
            start: Some(start.into()),
            end: Some(end.into()),
            start_inclusive: true,
            end_inclusive: true,
            order: Order::Ascending,
        }
    }

    pub fn greater_than(key: impl Into<IndexKey>, inclusive: bool) -> Self {
        Self::Range {
            start: Some(key.into()),
            end: None,
            start_inclusive: inclusive,
            end_inclusive: false,
            order: Order::Ascending,
        }
    }

    pub fn less_than(key: impl Into<IndexKey>, inclusive: bool) -> Self {
        Self::Range {
            start: None,
            end: Some(key.into()),
            start_inclusive: false,
            end_inclusive: inclusive,
            order: Order::Ascending,
        }
    }

    pub fn order(&self) -> Order {
        match self {
            Self::All(order) | Self::Range { order, .. } => *order,
            Self::Equals(_) | Self::StartsWith(_) => Order::Ascending,
        }
    }
}

/// One visited node
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub node: RowAddress,
    pub key: IndexKey,
    pub data_block: RowAddress,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CursorState {
    Start,
    Next(RowAddress),
    Done,
}

#[derive(Debug, Clone)]
pub struct IndexCursor {
    index: IndexMeta,
    query: IndexQuery,
    state: CursorState,
}

impl IndexCursor {
    pub fn new(index: IndexMeta, query: IndexQuery) -> Self {
        Self {
            index,
            query,
            state: CursorState::Start,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == CursorState::Done
    }

    /// Visit up to `max` more nodes
    pub fn next_batch(&mut self, svc: &IndexService<'_>, max: usize) -> Result<Vec<IndexEntry>> {
        let order = self.query.order();
        let mut address = match self.state {
            CursorState::Start => self.seek(svc)?,
            CursorState::Next(address) => Some(address),
            CursorState::Done => None,
        };

        let mut entries = Vec::new();
        while let Some(current) = address {
            if entries.len() >= max.max(1) {
                self.state = CursorState::Next(current);
                return Ok(entries);
            }
            let node = svc.get_node(current)?;
            if node.is_sentinel() || !self.accepts(&node.key, svc.collation()) {
                break;
            }
            address = Some(node.next_prev(0, order));
            entries.push(IndexEntry {
                node: node.address,
                key: node.key,
                data_block: node.data_block,
            });
        }

        self.state = CursorState::Done;
        Ok(entries)
    }

    /// Whether the traversal continues through a node with `key`
    fn accepts(&self, key: &IndexKey, collation: &Collation) -> bool {
        match &self.query {
            IndexQuery::All(_) => true,
            IndexQuery::Equals(value) => key.compare(value, collation) == Ordering::Equal,
            IndexQuery::Range {
                start,
                end,
                start_inclusive,
                end_inclusive,
                order,
            } => {
                let (bound, inclusive, past) = match order {
                    Order::Ascending => (end, *end_inclusive, Ordering::Greater),
                    Order::Descending => (start, *start_inclusive, Ordering::Less),
                };
                match bound {
                    None => true,
                    Some(bound) => match key.compare(bound, collation) {
                        Ordering::Equal => inclusive,
                        diff => diff != past,
                    },
                }
            }
            IndexQuery::StartsWith(prefix) => match key {
                IndexKey::String(value) => collation.starts_with(value, prefix),
                _ => false,
            },
        }
    }

    /// First node to visit
    fn seek(&self, svc: &IndexService<'_>) -> Result<Option<RowAddress>> {
        let first_of = |order: Order| -> Result<Option<RowAddress>> {
            let sentinel = match order {
                Order::Ascending => self.index.head,
                Order::Descending => self.index.tail,
            };
            Ok(Some(svc.get_node(sentinel)?.next_prev(0, order)))
        };

        match &self.query {
            IndexQuery::All(order) => first_of(*order),
            IndexQuery::Equals(key) => {
                match svc.find(&self.index, key, false, Order::Ascending)? {
                    Some(node) => Ok(Some(rewind(svc, node, key, Order::Ascending)?.address)),
                    None => Ok(None),
                }
            }
            IndexQuery::StartsWith(prefix) => {
                let key = IndexKey::String(prefix.clone());
                match svc.find(&self.index, &key, true, Order::Ascending)? {
                    Some(node) => Ok(Some(rewind(svc, node, &key, Order::Ascending)?.address)),
                    None => Ok(None),
                }
            }
            IndexQuery::Range {
                start,
                end,
                start_inclusive,
                end_inclusive,
                order,
            } => {
                let (bound, inclusive) = match order {
                    Order::Ascending => (start, *start_inclusive),
                    Order::Descending => (end, *end_inclusive),
                };
                let Some(bound) = bound else {
                    return first_of(*order);
                };
                let Some(node) = svc.find(&self.index, bound, true, *order)? else {
                    return Ok(None);
                };
                if node.key.compare(bound, svc.collation()) != Ordering::Equal {
                    return Ok(Some(node.address));
                }
                let node = rewind(svc, node, bound, *order)?;
                if inclusive {
                    Ok(Some(node.address))
                } else {
                    skip_equal(svc, node, bound, *order).map(Some)
                }
            }
        }
    }
}

/// Step back against `order` to the first node equal to `key`
fn rewind(svc: &IndexService<'_>, mut node: IndexNode, key: &IndexKey, order: Order) -> Result<IndexNode> {
    loop {
        let prev = svc.get_node(node.next_prev(0, order.reverse()))?;
        if prev.is_sentinel() || prev.key.compare(key, svc.collation()) != Ordering::Equal {
            return Ok(node);
        }
        node = prev;
    }
}

/// First node after the run of nodes equal to `key`
fn skip_equal(svc: &IndexService<'_>, mut node: IndexNode, key: &IndexKey, order: Order) -> Result<RowAddress> {
    loop {
        if node.is_sentinel() || node.key.compare(key, svc.collation()) != Ordering::Equal {
            return Ok(node.address);
        }
        node = svc.get_node(node.next_prev(0, order))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::{PageStore, Snapshot};
    use crate::types::PageId;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn keys(entries: &[IndexEntry]) -> Vec<IndexKey> {
        entries.iter().map(|e| e.key.clone()).collect()
    }

    fn ints(values: &[i32]) -> Vec<IndexKey> {
        values.iter().map(|&v| IndexKey::Int32(v)).collect()
    }

    /// Index over 1..=10 where every even value appears twice
    fn build(svc: &mut IndexService<'_>) -> Result<IndexMeta> {
        let (head, tail) = svc.create_index(1)?;
        let index = IndexMeta {
            name: "n".to_string(),
            slot: 1,
            expression: "$.n".to_string(),
            unique: false,
            head,
            tail,
        };
        let mut rng = StdRng::seed_from_u64(11);
        let mut doc = 0u32;
        for v in (1..=10).rev() {
            let copies = if v % 2 == 0 { 2 } else { 1 };
            for _ in 0..copies {
                doc += 1;
                let data = RowAddress::new(PageId::new(1000 + doc), 0);
                svc.add_node(&mut rng, &index, IndexKey::Int32(v), data, None)?;
            }
        }
        Ok(index)
    }

    fn run(svc: &IndexService<'_>, index: &IndexMeta, query: IndexQuery) -> Result<Vec<IndexKey>> {
        let mut cursor = IndexCursor::new(index.clone(), query);
        Ok(keys(&cursor.next_batch(svc, usize::MAX)?))
    }

    #[test]
    fn test_queries() -> Result<()> {
        let collation = Collation::default();
        let mut snapshot = Snapshot::new(PageStore::in_memory(), 1, 0, usize::MAX);
        snapshot.allow_writes(1);
        let mut svc = IndexService::new(&mut snapshot, &collation, 1);
        let index = build(&mut svc)?;

        assert_eq!(run(&svc, &index, IndexQuery::All(Order::Ascending))?.len(), 15);
        assert_eq!(run(&svc, &index, IndexQuery::Equals(IndexKey::Int32(4)))?, ints(&[4, 4]));
        assert_eq!(run(&svc, &index, IndexQuery::Equals(IndexKey::Int64(5)))?, ints(&[5]));
        assert!(run(&svc, &index, IndexQuery::Equals(IndexKey::Int32(11)))?.is_empty());

        assert_eq!(run(&svc, &index, IndexQuery::between(3, 6))?, ints(&[3, 4, 4, 5, 6, 6]));
        let open = IndexQuery::Range {
            start: Some(IndexKey::Int32(4)),
            end: Some(IndexKey::Int32(8)),
            start_inclusive: false,
            end_inclusive: false,
            order: Order::Ascending,
        };
        assert_eq!(run(&svc, &index, open)?, ints(&[5, 6, 6, 7]));
        let descending = IndexQuery::Range {
            start: Some(IndexKey::Int32(4)),
            end: Some(IndexKey::Int32(8)),
            start_inclusive: true,
            end_inclusive: false,
            order: Order::Descending,
        };
        assert_eq!(run(&svc, &index, descending)?, ints(&[7, 6, 6, 5, 4, 4]));

        assert_eq!(run(&svc, &index, IndexQuery::greater_than(8, false))?, ints(&[9, 10, 10]));
        assert_eq!(run(&svc, &index, IndexQuery::less_than(2, true))?, ints(&[1, 2, 2]));
        assert_eq!(run(&svc, &index, IndexQuery::greater_than(8.5, true))?, ints(&[9, 10, 10]));
        Ok(())
    }

    #[test]
    fn test_prefix_and_batches() -> Result<()> {
        let collation = Collation::default();
        let mut snapshot = Snapshot::new(PageStore::in_memory(), 1, 0, usize::MAX);
        snapshot.allow_writes(1);
        let mut svc = IndexService::new(&mut snapshot, &collation, 1);
        let (head, tail) = svc.create_index(1)?;
        let index = IndexMeta {
            name: "name".to_string(),
            slot: 1,
            expression: "$.name".to_string(),
            unique: false,
            head,
            tail,
        };
        let mut rng = StdRng::seed_from_u64(2);
        for (i, name) in ["alpha", "Alpine", "alps", "beta", "Al", "zeta"].iter().enumerate() {
            let data = RowAddress::new(PageId::new(500 + i as u32), 0);
            svc.add_node(&mut rng, &index, IndexKey::from(*name), data, None)?;
        }
        svc.add_node(&mut rng, &index, IndexKey::Int32(3), RowAddress::new(PageId::new(600), 0), None)?;

        let found = run(&svc, &index, IndexQuery::StartsWith("al".to_string()))?;
        assert_eq!(
            found,
            ["Al", "alpha", "Alpine", "alps"].map(IndexKey::from).to_vec()
        );
        assert!(run(&svc, &index, IndexQuery::StartsWith("q".to_string()))?.is_empty());

        let mut cursor = IndexCursor::new(index.clone(), IndexQuery::All(Order::Descending));
        let mut seen = Vec::new();
        while !cursor.is_done() {
            let batch = cursor.next_batch(&svc, 3)?;
            assert!(batch.len() <= 3);
            seen.extend(keys(&batch));
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(seen.first(), Some(&IndexKey::from("zeta")));
        assert_eq!(seen.last(), Some(&IndexKey::Int32(3)));
        Ok(())
    }
}
