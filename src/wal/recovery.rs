//! Log recovery.
//!
//! Rebuilds the log index from the pages after the data area:
//! - a transaction is committed when any of its log pages carries the
//!   confirmed flag; pages missing the flag are repaired
//! - pages of unconfirmed transactions are ignored, torn or not
//! - per page, the committed copy at the highest position wins
//! - pages with transaction id 0 are home copies left by an interrupted
//!   checkpoint and are skipped
//! - pages of transactions at or below the header's checkpoint id were
//!   already folded into the data area

use crate::error::{Result, StorageError};
use crate::page::header::CONFIRMED_OFFSET;
use crate::page::{PageHeader, SlottedPage};
use crate::storage::{DiskManager, FileHeader};
use crate::types::PageId;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

/// Outcome of a recovery scan
#[derive(Debug, Default)]
pub struct Recovered {
    /// Latest committed log position per page
    pub pages: BTreeMap<PageId, u32>,
    /// First free log position
    pub next_position: u32,
    /// Log pages found after the data area
    pub log_pages: usize,
    /// Highest transaction id seen in the log or the header
    pub max_tx_id: u32,
}

#[derive(Debug, Default)]
struct TxPages {
    /// (position, page id, confirmed) of intact pages
    intact: Vec<(u32, PageId, bool)>,
    /// Page ids of pages failing their checksum
    torn: Vec<(u32, PageId)>,
}

/// Scan the log area and rebuild the committed page map
pub fn recover(disk: &dyn DiskManager, header: &FileHeader) -> Result<Recovered> {
    let page_count = disk.page_count()?;
    let first = header.last_page_id.value() + 1;

    let mut transactions: BTreeMap<u32, TxPages> = BTreeMap::new();
    let mut max_tx_id = header.checkpoint_tx_id;
    let mut log_pages = 0usize;

    for position in first..page_count {
        let buf = disk.read_page(position)?;
        let Some(page_header) = PageHeader::read(&buf) else {
            continue;
        };
        let tx_id = page_header.transaction_id;
        if tx_id == 0 || tx_id <= header.checkpoint_tx_id {
            continue;
        }
        max_tx_id = max_tx_id.max(tx_id);
        log_pages += 1;

        let entry = transactions.entry(tx_id).or_default();
        match SlottedPage::load(buf) {
            Ok(page) if page.header().position == position => {
                entry
                    .intact
                    .push((position, page.page_id(), page.header().confirmed));
            }
            Ok(_) => {
                debug!(position, tx_id, "skipping log page written for another position");
            }
            Err(_) => entry.torn.push((position, page_header.page_id)),
        }
    }

    let committed: HashSet<u32> = transactions
        .iter()
        .filter(|(_, tx)| tx.intact.iter().any(|&(_, _, confirmed)| confirmed))
        .map(|(&tx_id, _)| tx_id)
        .collect();

    let mut pages: BTreeMap<PageId, u32> = BTreeMap::new();
    let mut repaired = 0usize;
    for (&tx_id, tx) in &transactions {
        if !committed.contains(&tx_id) {
            if !tx.torn.is_empty() {
                warn!(tx_id, torn = tx.torn.len(), "ignoring torn pages of unconfirmed transaction");
            }
            continue;
        }

        for &(position, page_id, confirmed) in &tx.intact {
            if !confirmed {
                disk.write_page_byte(position, CONFIRMED_OFFSET, 1)?;
                repaired += 1;
            }
            let latest = pages.entry(page_id).or_insert(position);
            *latest = (*latest).max(position);
        }
    }

    // A torn page of a committed transaction is tolerable only when it was
    // overwritten by a checkpoint, i.e. another committed copy exists.
    let mut torn_by_page: HashMap<PageId, u32> = HashMap::new();
    for &tx_id in &committed {
        for &(position, page_id) in &transactions[&tx_id].torn {
            torn_by_page.insert(page_id, position);
        }
    }
    for (page_id, position) in torn_by_page {
        if pages.contains_key(&page_id) {
            warn!(position, page_id = %page_id, "ignoring torn log page with a newer copy");
        } else {
            return Err(StorageError::corruption(format!(
                "committed log page {} at position {} is torn",
                page_id, position
            )));
        }
    }

    if repaired > 0 {
        disk.sync()?;
    }

    info!(
        log_pages,
        transactions = transactions.len(),
        committed = committed.len(),
        recovered_pages = pages.len(),
        repaired,
        "recovered log"
    );

    Ok(Recovered {
        pages,
        next_position: page_count.max(first),
        log_pages,
        max_tx_id,
    })
}
