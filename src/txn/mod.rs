//! Transactions: the monitor, page snapshots and the transaction handle.

mod monitor;
mod snapshot;
mod transaction;

pub use monitor::{CollectionGuard, ExclusiveGuard, SharedGuard, TransactionMonitor, MASTER_LOCK};
pub use snapshot::{PageStore, PageView, Snapshot};
pub use transaction::{Transaction, TransactionState};

pub(crate) use snapshot::CommitParts;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag that stops a transaction or cursor at its next operation
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
