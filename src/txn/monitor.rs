//! Transaction monitor: ids, the checkpoint lock and collection write locks.
//!
//! Every open transaction holds the checkpoint lock shared, so a checkpoint
//! (exclusive) only runs when no transaction is open. Writers additionally
//! hold one mutex per collection name they modify, for their whole lifetime.

use crate::error::{Result, StorageError};
use parking_lot::lock_api::{ArcMutexGuard, ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawMutex, RawRwLock, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Name of the lock guarding the master catalog
pub const MASTER_LOCK: &str = "$master";

pub type CollectionGuard = ArcMutexGuard<RawMutex, ()>;
pub type SharedGuard = ArcRwLockReadGuard<RawRwLock, ()>;
pub type ExclusiveGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

pub struct TransactionMonitor {
    checkpoint_lock: Arc<RwLock<()>>,
    collections: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_tx_id: AtomicU32,
    open: AtomicUsize,
    timeout: Duration,
}

impl TransactionMonitor {
    pub fn new(first_tx_id: u32, timeout: Duration) -> Self {
        Self {
            checkpoint_lock: Arc::new(RwLock::new(())),
            collections: Mutex::new(HashMap::new()),
            next_tx_id: AtomicU32::new(first_tx_id.max(1)),
            open: AtomicUsize::new(0),
            timeout,
        }
    }

    pub fn next_transaction_id(&self) -> u32 {
        self.next_tx_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Shared hold on the checkpoint lock
    pub fn enter(&self) -> Result<SharedGuard> {
        self.checkpoint_lock
            .try_read_arc_for(self.timeout)
            .ok_or_else(|| StorageError::LockTimeout("checkpoint".to_string()))
    }

    /// Exclusive hold on the checkpoint lock, waiting for open transactions
    pub fn exclusive(&self) -> Result<ExclusiveGuard> {
        self.checkpoint_lock
            .try_write_arc_for(self.timeout)
            .ok_or_else(|| StorageError::LockTimeout("checkpoint".to_string()))
    }

    /// Exclusive hold only if nobody holds the lock right now
    pub fn try_exclusive(&self) -> Option<ExclusiveGuard> {
        self.checkpoint_lock.try_write_arc()
    }

    /// Write lock of a collection (or of [`MASTER_LOCK`])
    pub fn lock_collection(&self, name: &str) -> Result<CollectionGuard> {
        let lock = {
            let mut collections = self.collections.lock();
            // an entry only the map refers to has no holder and no waiter
            collections.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(collections.entry(name.to_string()).or_default())
        };
        trace!(collection = name, "waiting for collection lock");
        lock.try_lock_arc_for(self.timeout)
            .ok_or_else(|| StorageError::LockTimeout(name.to_string()))
    }

    /// Collection lock entries currently tracked
    pub fn lock_entries(&self) -> usize {
        self.collections.lock().len()
    }

    pub fn transaction_opened(&self) {
        self.open.fetch_add(1, Ordering::AcqRel);
    }

    pub fn transaction_closed(&self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn open_transactions(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }
}
