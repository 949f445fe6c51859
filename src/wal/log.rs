//! Log writer.
//!
//! Log pages are appended past the data area, stamped with their position,
//! the writing transaction and `confirmed = false`. Confirmation is a
//! separate pass that flips one byte per page once every page of the
//! transaction is durable.

use crate::error::Result;
use crate::page::header::CONFIRMED_OFFSET;
use crate::page::SlottedPage;
use crate::storage::DiskManager;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

pub struct LogWriter {
    disk: Arc<dyn DiskManager>,
    /// Next free log position
    next_position: Mutex<u32>,
    /// Pages appended since the last checkpoint
    log_pages: AtomicUsize,
    /// Highest transaction id present in the log
    max_tx_id: AtomicU32,
}

impl LogWriter {
    pub fn new(disk: Arc<dyn DiskManager>, next_position: u32, log_pages: usize, max_tx_id: u32) -> Self {
        Self {
            disk,
            next_position: Mutex::new(next_position),
            log_pages: AtomicUsize::new(log_pages),
            max_tx_id: AtomicU32::new(max_tx_id),
        }
    }

    pub fn next_position(&self) -> u32 {
        *self.next_position.lock()
    }

    pub fn log_pages(&self) -> usize {
        self.log_pages.load(Ordering::Acquire)
    }

    pub fn max_tx_id(&self) -> u32 {
        self.max_tx_id.load(Ordering::Acquire)
    }

    /// Append pages as unconfirmed log pages of `tx_id` and sync. Returns
    /// the position of each page, in order.
    pub fn append(&self, tx_id: u32, pages: &mut [SlottedPage]) -> Result<Vec<u32>> {
        if pages.is_empty() {
            return Ok(Vec::new());
        }

        let mut positions = Vec::with_capacity(pages.len());
        {
            let mut next = self.next_position.lock();
            for page in pages.iter_mut() {
                let position = *next;
                page.set_log_info(position, tx_id, false);
                page.seal();
                self.disk.write_page(position, page.as_bytes())?;
                trace!(position, page_id = %page.page_id(), tx_id, "appended log page");
                positions.push(position);
                *next += 1;
            }
        }

        self.log_pages.fetch_add(pages.len(), Ordering::AcqRel);
        self.max_tx_id.fetch_max(tx_id, Ordering::AcqRel);
        self.disk.sync()?;
        Ok(positions)
    }

    /// Mark log pages as belonging to a committed transaction and sync
    pub fn confirm(&self, positions: &[u32]) -> Result<()> {
        for &position in positions {
            self.disk.write_page_byte(position, CONFIRMED_OFFSET, 1)?;
        }
        self.disk.sync()
    }

    /// Restart the log right after the data area
    pub fn reset(&self, next_position: u32) {
        *self.next_position.lock() = next_position;
        self.log_pages.store(0, Ordering::Release);
    }

    /// Claim a position past every log and home page, for relocations
    pub fn reserve(&self, at_least: u32) -> u32 {
        let mut next = self.next_position.lock();
        let position = (*next).max(at_least);
        *next = position + 1;
        position
    }
}
