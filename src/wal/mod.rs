//! Write-ahead log.
//!
//! Committed pages never overwrite the data area directly. They are appended
//! to the log (the positions after the last data page), confirmed, and
//! published in the [`WalIndex`] under a new read version. A checkpoint later
//! copies the newest version of each page to its home position and empties
//! the log.

mod checkpoint;
mod index;
mod log;
mod recovery;

pub use index::WalIndex;
pub use log::LogWriter;
pub use recovery::{recover, Recovered};

use crate::error::{Result, StorageError};
use crate::storage::{DiskManager, FileHeader};
use crate::types::PageId;
use parking_lot::Mutex;
use std::sync::Arc;

/// Log index, log writer and the file header they share
pub struct Wal {
    disk: Arc<dyn DiskManager>,
    index: WalIndex,
    writer: LogWriter,
    header: Mutex<FileHeader>,
}

impl Wal {
    /// Wrap a file whose log was scanned by [`recover`]
    pub fn new(disk: Arc<dyn DiskManager>, header: FileHeader, recovered: Recovered) -> Self {
        let index = WalIndex::new();
        if !recovered.pages.is_empty() {
            index.publish(recovered.pages);
        }
        let writer = LogWriter::new(
            Arc::clone(&disk),
            recovered.next_position,
            recovered.log_pages,
            recovered.max_tx_id,
        );
        Self {
            disk,
            index,
            writer,
            header: Mutex::new(header),
        }
    }

    pub fn index(&self) -> &WalIndex {
        &self.index
    }

    pub fn writer(&self) -> &LogWriter {
        &self.writer
    }

    pub fn header(&self) -> FileHeader {
        self.header.lock().clone()
    }

    pub fn last_page_id(&self) -> PageId {
        self.header.lock().last_page_id
    }

    /// On-disk position of `page_id` as seen at `read_version`
    pub fn resolve(&self, page_id: PageId, read_version: u64) -> Result<u32> {
        if let Some(position) = self.index.get_position(page_id, read_version) {
            return Ok(position);
        }
        if page_id.is_valid() && page_id <= self.last_page_id() {
            return Ok(page_id.value());
        }
        Err(StorageError::PageNotFound(page_id))
    }

    pub fn current_version(&self) -> u64 {
        self.index.current_version()
    }

    pub fn check_read_version(&self, read_version: u64) -> Result<()> {
        self.index.check_read_version(read_version)
    }
}
