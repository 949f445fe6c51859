//! Checkpoint: fold the log back into the data area.
//!
//! The caller must hold the checkpoint lock exclusively; no transaction may
//! append while pages move. Steps:
//! 1. take the newest log position of every page, ascending by page id
//! 2. a pending copy whose position is the home of another page is
//!    relocated past both the log and the highest home, then synced
//! 3. every page is copied home with transaction id 0, then synced
//! 4. the header records the new last page id and the checkpointed
//!    transaction id, then the file is cut after the last data page
//! 5. the log index and the log writer restart empty

use super::Wal;
use crate::buffer::PageCache;
use crate::error::Result;
use crate::page::SlottedPage;
use std::collections::BTreeSet;
use tracing::{debug, info};

impl Wal {
    /// Copy every committed log page home. Returns the number of pages moved.
    pub fn checkpoint(&self, cache: &PageCache) -> Result<usize> {
        let mut sources = self.index.pending();
        if sources.is_empty() {
            return Ok(0);
        }

        let targets: BTreeSet<u32> = sources.keys().map(|p| p.value()).collect();
        let max_target = targets.iter().next_back().copied().unwrap_or(0);

        let mut relocated = 0usize;
        for (page_id, position) in sources.iter_mut() {
            if *position != page_id.value() && targets.contains(position) {
                let mut page = SlottedPage::load(self.disk.read_page(*position)?)?;
                let overflow = self.writer.reserve(max_target + 1);
                let tx_id = page.header().transaction_id;
                page.set_log_info(overflow, tx_id, true);
                page.seal();
                self.disk.write_page(overflow, page.as_bytes())?;
                debug!(page_id = %page_id, from = *position, to = overflow, "relocated log page");
                *position = overflow;
                relocated += 1;
            }
        }
        if relocated > 0 {
            self.disk.sync()?;
        }

        let mut homed = Vec::with_capacity(sources.len());
        for (&page_id, &position) in &sources {
            let mut page = SlottedPage::load(self.disk.read_page(position)?)?;
            page.set_log_info(page_id.value(), 0, false);
            page.seal();
            self.disk.write_page(page_id.value(), page.as_bytes())?;
            homed.push(page);
        }
        self.disk.sync()?;

        let header = {
            let mut header = self.header.lock();
            header.last_page_id = header.last_page_id.max(crate::types::PageId::new(max_target));
            header.checkpoint_tx_id = header.checkpoint_tx_id.max(self.writer.max_tx_id());
            header.clone()
        };
        self.disk.write_header(&header)?;
        self.disk.sync()?;
        self.disk.truncate(header.last_page_id.value() + 1)?;

        let moved = homed.len();
        self.index.reset();
        self.writer.reset(header.last_page_id.value() + 1);

        cache.clear();
        for page in homed {
            cache.insert(page.page_id().value(), page);
        }

        info!(
            pages = moved,
            relocated,
            last_page_id = %header.last_page_id,
            "checkpoint complete"
        );
        Ok(moved)
    }
}
