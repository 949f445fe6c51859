//! Skip-list indexes.
//!
//! Every index of a collection is a doubly linked skip list of
//! [`IndexNode`] records stored in the collection's index pages, bounded by
//! a `MinValue` head and a `MaxValue` tail sentinel. Nodes of one document
//! are additionally chained through `next_node`, starting at its primary
//! key node, so a document's entries can be removed without searching.

mod cursor;
mod key;
mod node;
mod service;

pub use cursor::{IndexCursor, IndexEntry, IndexQuery};
pub use key::{Collation, IndexKey};
pub use node::IndexNode;
pub use service::IndexService;

use std::cmp::Ordering;

/// Traversal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

impl Order {
    /// Comparison result of a key lying further along this direction
    pub fn forward(self) -> Ordering {
        match self {
            Self::Ascending => Ordering::Greater,
            Self::Descending => Ordering::Less,
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }
}
