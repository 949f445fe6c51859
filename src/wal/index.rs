//! Log position index.
//!
//! Maps each logical page to the log positions holding its confirmed
//! versions, tagged with the read version that published them. A reader at
//! version R sees the newest entry whose version is at most R; pages without
//! a visible entry are read from their home position.

use crate::error::{Result, StorageError};
use crate::types::PageId;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct IndexState {
    current_version: u64,
    oldest_valid_version: u64,
    /// Ascending by version
    pages: HashMap<PageId, Vec<(u64, u32)>>,
}

/// Versioned page-to-log-position index
#[derive(Debug, Default)]
pub struct WalIndex {
    state: RwLock<IndexState>,
}

impl WalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version a new transaction or cursor reads at
    pub fn current_version(&self) -> u64 {
        self.state.read().current_version
    }

    pub fn oldest_valid_version(&self) -> u64 {
        self.state.read().oldest_valid_version
    }

    /// Fail if a checkpoint has discarded the log entries `read_version`
    /// depends on
    pub fn check_read_version(&self, read_version: u64) -> Result<()> {
        let oldest = self.oldest_valid_version();
        if read_version < oldest {
            return Err(StorageError::ReadVersionExpired {
                read_version,
                oldest,
            });
        }
        Ok(())
    }

    /// Log position of the newest version of `page_id` visible at
    /// `read_version`
    pub fn get_position(&self, page_id: PageId, read_version: u64) -> Option<u32> {
        let state = self.state.read();
        state.pages.get(&page_id).and_then(|versions| {
            versions
                .iter()
                .rev()
                .find(|(version, _)| *version <= read_version)
                .map(|&(_, position)| position)
        })
    }

    /// Publish a committed transaction's pages under a new version
    pub fn publish<I>(&self, entries: I) -> u64
    where
        I: IntoIterator<Item = (PageId, u32)>,
    {
        let mut state = self.state.write();
        let version = state.current_version + 1;
        for (page_id, position) in entries {
            state.pages.entry(page_id).or_default().push((version, position));
        }
        state.current_version = version;
        version
    }

    /// Latest log position of every page, ascending by page id
    pub fn pending(&self) -> BTreeMap<PageId, u32> {
        let state = self.state.read();
        state
            .pages
            .iter()
            .filter_map(|(&page_id, versions)| versions.last().map(|&(_, pos)| (page_id, pos)))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.state.read().pages.len()
    }

    /// Forget every entry after a checkpoint; readers older than the
    /// current version expire
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.pages.clear();
        state.oldest_valid_version = state.current_version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_are_isolated() {
        let index = WalIndex::new();
        let page = PageId::new(5);
        assert_eq!(index.current_version(), 0);
        assert_eq!(index.get_position(page, 0), None);

        let v1 = index.publish([(page, 10)]);
        let v2 = index.publish([(page, 20), (PageId::new(6), 21)]);
        assert_eq!((v1, v2), (1, 2));

        assert_eq!(index.get_position(page, 0), None);
        assert_eq!(index.get_position(page, 1), Some(10));
        assert_eq!(index.get_position(page, 2), Some(20));
        assert_eq!(index.get_position(PageId::new(6), 1), None);

        let pending = index.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[&page], 20);
    }

    #[test]
    fn test_reset_expires_old_readers() {
        let index = WalIndex::new();
        index.publish([(PageId::new(1), 3)]);
        index.publish([(PageId::new(1), 4)]);
        index.reset();

        assert_eq!(index.pending_count(), 0);
        assert!(index.check_read_version(2).is_ok());
        assert!(matches!(
            index.check_read_version(1),
            Err(StorageError::ReadVersionExpired {
                read_version: 1,
                oldest: 2
            })
        ));

        // the version counter keeps growing after a reset
        assert_eq!(index.publish([(PageId::new(1), 1)]), 3);
    }
}
