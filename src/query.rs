//! Streaming index queries outside a transaction.
//!
//! A [`QueryCursor`] reads at the version current when it was opened. It
//! holds the checkpoint lock only while fetching a batch, so checkpoints can
//! run between batches; once one has discarded its version the cursor fails
//! with [`StorageError::ReadVersionExpired`].

use crate::data::DataService;
use crate::error::{Result, StorageError};
use crate::index::{IndexCursor, IndexService};
use crate::txn::{CancellationToken, Snapshot};
use crate::types::RowAddress;
use crate::EngineInner;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::trace;

pub struct QueryCursor {
    engine: Arc<EngineInner>,
    /// Collection id, `None` when the collection does not exist
    col: Option<u8>,
    cursor: Option<IndexCursor>,
    read_version: u64,
    token: CancellationToken,
    buffer: VecDeque<Vec<u8>>,
    seen: HashSet<RowAddress>,
    failed: bool,
    batches: usize,
}

impl QueryCursor {
    pub(crate) fn new(
        engine: Arc<EngineInner>,
        target: Option<(u8, IndexCursor)>,
        read_version: u64,
        token: CancellationToken,
    ) -> Self {
        let (col, cursor) = match target {
            Some((col, cursor)) => (Some(col), Some(cursor)),
            None => (None, None),
        };
        Self {
            engine,
            col,
            cursor,
            read_version,
            token,
            buffer: VecDeque::new(),
            seen: HashSet::new(),
            failed: false,
            batches: 0,
        }
    }

    pub fn read_version(&self) -> u64 {
        self.read_version
    }

    /// Batches fetched so far
    pub fn batches(&self) -> usize {
        self.batches
    }

    fn fetch(&mut self) -> Result<()> {
        let (Some(col), Some(cursor)) = (self.col, self.cursor.as_mut()) else {
            return Ok(());
        };
        let _shared = self.engine.monitor.enter()?;
        self.engine.store.wal.check_read_version(self.read_version)?;
        if self.token.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let mut snapshot = Snapshot::read_only(Arc::clone(&self.engine.store), self.read_version);
        let entries = {
            let svc = IndexService::new(&mut snapshot, &self.engine.collation, col);
            cursor.next_batch(&svc, self.engine.config.batch_size)?
        };
        let data = DataService::new(&mut snapshot, col);
        for entry in entries {
            if self.seen.insert(entry.data_block) {
                self.buffer.push_back(data.read(entry.data_block)?);
            }
        }

        self.batches += 1;
        trace!(
            batch = self.batches,
            buffered = self.buffer.len(),
            read_version = self.read_version,
            "fetched query batch"
        );
        Ok(())
    }

    fn exhausted(&self) -> bool {
        self.failed || self.cursor.as_ref().map_or(true, IndexCursor::is_done)
    }
}

impl Iterator for QueryCursor {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(document) = self.buffer.pop_front() {
                return Some(Ok(document));
            }
            if self.exhausted() {
                return None;
            }
            if let Err(err) = self.fetch() {
                self.failed = true;
                return Some(Err(err));
            }
        }
    }
}
