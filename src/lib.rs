//! # Document Storage Engine
//!
//! An embedded, single-file document storage engine with skip-list indexes
//! and a write-ahead log.
//!
//! ## Architecture
//!
//! - **Page Layer** (`page`): 8 KB slotted pages with a backward-growing slot table
//! - **Storage Layer** (`storage`): disk I/O, the file header and the allocation map of extents
//! - **Page Cache** (`buffer`): shared, position-keyed pages with copy-on-write
//! - **Write-Ahead Log** (`wal`): log index by read version, recovery and checkpoint
//! - **Transactions** (`txn`): snapshots, collection locks and commit
//! - **Stores** (`data`, `index`): chained document blocks and skip-list indexes
//! - **Catalog** (`catalog`): the master document describing every collection
//!
//! ## Usage
//!
//! ```rust,ignore
//! use doc_storage::{Config, Engine, IndexKey, IndexQuery};
//!
//! let engine = Engine::open(Config::new("my_database.db"))?;
//!
//! let mut tx = engine.begin()?;
//! let id = tx.insert("users", br#"{"name": "Ann", "age": 31}"#)?;
//! tx.create_index("users", "age", "$.age", false)?;
//! tx.commit()?;
//!
//! for doc in engine.query("users", "age", IndexQuery::between(30, 40))? {
//!     println!("{}", String::from_utf8_lossy(&doc?));
//! }
//! engine.close()?;
//! ```

pub mod buffer;
pub mod catalog;
pub mod codec;
pub mod data;
pub mod error;
pub mod index;
pub mod page;
pub mod query;
pub mod storage;
pub mod txn;
pub mod types;
pub mod wal;

pub use catalog::{AutoId, Catalog, CollectionMeta, IndexMeta};
pub use codec::{DocumentCodec, JsonDocumentCodec};
pub use error::{Result, StorageError};
pub use index::{Collation, IndexKey, IndexQuery, Order};
pub use query::QueryCursor;
pub use storage::{DiskManager, DiskManagerImpl, MemoryDiskManager, PageState};
pub use txn::{CancellationToken, Transaction, TransactionState, MASTER_LOCK};
pub use types::{PageId, RowAddress, PAGE_SIZE};

use buffer::{CacheStats, PageCache};
use catalog::MASTER_ROW;
use data::DataService;
use index::IndexCursor;
use page::SlottedPage;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::{AllocationMap, FileHeader};
use tracing::{info, warn};
use txn::{PageStore, Snapshot, TransactionMonitor};
use types::SYSTEM_COLLECTION_ID;
use wal::{recover, Wal};

/// Database configuration
#[derive(Clone)]
pub struct Config {
    /// Path to the database file, `None` for an in-memory database
    pub path: Option<PathBuf>,
    /// Page cache size in number of pages (default: 1000)
    pub cache_capacity: usize,
    /// Whether commits and checkpoints fsync the file (default: true)
    pub sync_on_commit: bool,
    /// Dirty pages a transaction keeps in memory before a safepoint writes
    /// them to the log (default: 1000)
    pub max_transaction_pages: usize,
    /// Log size in pages that triggers a checkpoint after a commit; 0
    /// disables automatic checkpoints (default: 1000)
    pub checkpoint_pages: usize,
    /// Checkpoint a non-empty log when opening (default: true)
    pub checkpoint_on_open: bool,
    /// Checkpoint when closing (default: true)
    pub checkpoint_on_close: bool,
    /// String collation of a new file; an existing file keeps its own
    pub collation: Collation,
    /// Seed for skip-list levels, random when unset
    pub seed: Option<u64>,
    /// Index nodes visited per cursor batch (default: 100)
    pub batch_size: usize,
    /// How long to wait for a lock (default: 60s)
    pub lock_timeout: Duration,
    /// Codec that reads keys and ids out of documents
    pub codec: Arc<dyn DocumentCodec>,
}

impl Config {
    /// Create a new configuration with default settings
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self::with_path(Some(path.into()))
    }

    /// Configuration for a database that lives in memory only
    pub fn in_memory() -> Self {
        Self::with_path(None)
    }

    fn with_path(path: Option<PathBuf>) -> Self {
        Self {
            path,
            cache_capacity: 1000,
            sync_on_commit: true,
            max_transaction_pages: 1000,
            checkpoint_pages: 1000,
            checkpoint_on_open: true,
            checkpoint_on_close: true,
            collation: Collation::default(),
            seed: None,
            batch_size: 100,
            lock_timeout: Duration::from_secs(60),
            codec: Arc::new(JsonDocumentCodec::new()),
        }
    }

    /// Set page cache size
    pub fn cache_capacity(mut self, pages: usize) -> Self {
        self.cache_capacity = pages;
        self
    }

    pub fn sync_on_commit(mut self, enabled: bool) -> Self {
        self.sync_on_commit = enabled;
        self
    }

    pub fn max_transaction_pages(mut self, pages: usize) -> Self {
        self.max_transaction_pages = pages;
        self
    }

    pub fn checkpoint_pages(mut self, pages: usize) -> Self {
        self.checkpoint_pages = pages;
        self
    }

    pub fn checkpoint_on_open(mut self, enabled: bool) -> Self {
        self.checkpoint_on_open = enabled;
        self
    }

    pub fn checkpoint_on_close(mut self, enabled: bool) -> Self {
        self.checkpoint_on_close = enabled;
        self
    }

    pub fn collation(mut self, collation: Collation) -> Self {
        self.collation = collation;
        self
    }

    /// Make skip-list levels reproducible
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn batch_size(mut self, nodes: usize) -> Self {
        self.batch_size = nodes.max(1);
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn DocumentCodec>) -> Self {
        self.codec = codec;
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("cache_capacity", &self.cache_capacity)
            .field("sync_on_commit", &self.sync_on_commit)
            .field("max_transaction_pages", &self.max_transaction_pages)
            .field("checkpoint_pages", &self.checkpoint_pages)
            .field("checkpoint_on_open", &self.checkpoint_on_open)
            .field("checkpoint_on_close", &self.checkpoint_on_close)
            .field("collation", &self.collation)
            .field("seed", &self.seed)
            .field("batch_size", &self.batch_size)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

/// Latest committed catalog and the read version it belongs to
struct Committed {
    catalog: Arc<Catalog>,
    version: u64,
}

/// State shared by the engine handle, its transactions and cursors
pub(crate) struct EngineInner {
    pub(crate) config: Config,
    pub(crate) store: Arc<PageStore>,
    pub(crate) monitor: TransactionMonitor,
    pub(crate) collation: Collation,
    /// Serializes log appends and publication
    pub(crate) commit_lock: Mutex<()>,
    committed: RwLock<Committed>,
    /// Last automatic id per collection, loaded on first use
    pub(crate) sequences: Mutex<HashMap<String, i64>>,
    /// Seeds each transaction's own generator
    pub(crate) rng: Mutex<StdRng>,
    poisoned: AtomicBool,
}

impl EngineInner {
    pub(crate) fn committed(&self) -> (Arc<Catalog>, u64) {
        let committed = self.committed.read();
        (Arc::clone(&committed.catalog), committed.version)
    }

    pub(crate) fn publish(&self, catalog: Option<Arc<Catalog>>, version: u64) {
        let mut committed = self.committed.write();
        if let Some(catalog) = catalog {
            committed.catalog = catalog;
        }
        committed.version = version;
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(StorageError::invalid_operation(
                "a failed write left the engine unusable; reopen the database",
            ));
        }
        Ok(())
    }

    /// Refuse further work after a failure that may have left the file and
    /// the in-memory state apart. Reopening recovers from the log.
    pub(crate) fn poison(&self, err: &StorageError) {
        warn!(error = %err, "write failed, engine must be reopened");
        self.poisoned.store(true, Ordering::Release);
    }

    /// Checkpoint once the log has grown past the threshold, unless a
    /// transaction is open
    pub(crate) fn maybe_checkpoint(&self) {
        let threshold = self.config.checkpoint_pages;
        if threshold == 0 || self.store.wal.writer().log_pages() < threshold {
            return;
        }
        let Some(_exclusive) = self.monitor.try_exclusive() else {
            return;
        };
        if let Err(err) = self.run_checkpoint() {
            warn!(error = %err, "automatic checkpoint failed");
        }
    }

    /// Caller holds the checkpoint lock exclusively
    fn run_checkpoint(&self) -> Result<usize> {
        self.check_usable()?;
        self.store
            .wal
            .checkpoint(&self.store.cache)
            .map_err(|err| {
                self.poison(&err);
                err
            })
    }
}

/// Main database handle
///
/// Cloning the handle is cheap; all clones share one engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Open or create a database
    pub fn open(config: Config) -> Result<Self> {
        let disk: Arc<dyn DiskManager> = match &config.path {
            Some(path) => Arc::new(DiskManagerImpl::open(path, config.sync_on_commit)?),
            None => Arc::new(MemoryDiskManager::new()),
        };
        Self::open_with_disk(config, disk)
    }

    /// Open or create a database on a given disk manager; `config.path` is
    /// ignored
    pub fn open_with_disk(config: Config, disk: Arc<dyn DiskManager>) -> Result<Self> {
        let header = match disk.read_header()? {
            Some(header) => header,
            None => {
                let header = FileHeader::new(config.collation.clone());
                disk.write_header(&header)?;
                info!(collation = ?header.collation, "created database file");
                header
            }
        };
        if header.encrypted {
            return Err(StorageError::invalid_db("encrypted files are not supported"));
        }
        if disk.page_count()? == 0 {
            let mut map = AllocationMap::empty_map_page(0);
            map.seal();
            disk.write_page(0, map.as_bytes())?;
            disk.sync()?;
        }

        let recovered = recover(disk.as_ref(), &header)?;
        let collation = header.collation.clone();
        let wal = Wal::new(Arc::clone(&disk), header, recovered);
        let version = wal.current_version();
        let alloc = load_allocation_map(disk.as_ref(), &wal, version)?;
        let store = Arc::new(PageStore {
            disk,
            wal,
            cache: PageCache::new(config.cache_capacity),
            alloc,
        });

        let fresh = matches!(
            store.wal.resolve(MASTER_ROW.page_id, version),
            Err(StorageError::PageNotFound(_))
        );
        let catalog = if fresh {
            Catalog::new()
        } else {
            let mut snapshot = Snapshot::read_only(Arc::clone(&store), version);
            Catalog::from_bytes(
                &DataService::new(&mut snapshot, SYSTEM_COLLECTION_ID).read(MASTER_ROW)?,
            )?
        };

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let first_tx_id = store.wal.writer().max_tx_id().saturating_add(1);
        let log_pages = store.wal.writer().log_pages();
        let collections = catalog.collections.len();
        let inner = EngineInner {
            monitor: TransactionMonitor::new(first_tx_id, config.lock_timeout),
            collation,
            store,
            commit_lock: Mutex::new(()),
            committed: RwLock::new(Committed {
                catalog: Arc::new(catalog),
                version,
            }),
            sequences: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            poisoned: AtomicBool::new(false),
            config,
        };
        let engine = Self {
            inner: Arc::new(inner),
        };

        if fresh {
            engine.bootstrap()?;
        } else if engine.inner.config.checkpoint_on_open && log_pages > 0 {
            engine.checkpoint()?;
        }
        info!(collections, log_pages, fresh, "database opened");
        Ok(engine)
    }

    /// Store the empty catalog of a new file
    fn bootstrap(&self) -> Result<()> {
        let mut tx = self.begin()?;
        tx.write_initial_catalog()?;
        tx.commit()?;
        self.checkpoint()?;
        Ok(())
    }

    pub fn begin(&self) -> Result<Transaction> {
        self.begin_with_token(CancellationToken::new())
    }

    /// Begin a transaction that stops at its next operation once `token`
    /// is cancelled
    pub fn begin_with_token(&self, token: CancellationToken) -> Result<Transaction> {
        Transaction::begin(Arc::clone(&self.inner), token)
    }

    /// Begin a transaction that writes only to `collections`. Their locks
    /// are taken now, in sorted order, so declared writers never deadlock;
    /// include [`MASTER_LOCK`] to also create or drop indexes or collections.
    pub fn begin_write(&self, collections: &[&str]) -> Result<Transaction> {
        self.begin_write_with_token(collections, CancellationToken::new())
    }

    pub fn begin_write_with_token(
        &self,
        collections: &[&str],
        token: CancellationToken,
    ) -> Result<Transaction> {
        Transaction::begin_write(Arc::clone(&self.inner), token, collections)
    }

    /// Stream the documents matched by `query` on an index, read at the
    /// latest committed version. A missing collection yields nothing.
    pub fn query(&self, collection: &str, index: &str, query: IndexQuery) -> Result<QueryCursor> {
        self.query_with_token(collection, index, query, CancellationToken::new())
    }

    pub fn query_with_token(
        &self,
        collection: &str,
        index: &str,
        query: IndexQuery,
        token: CancellationToken,
    ) -> Result<QueryCursor> {
        self.inner.check_usable()?;
        let (catalog, version) = self.inner.committed();
        let target = match catalog.get(collection) {
            Some(meta) => Some((meta.id, IndexCursor::new(meta.index(index)?.clone(), query))),
            None => None,
        };
        Ok(QueryCursor::new(
            Arc::clone(&self.inner),
            target,
            version,
            token,
        ))
    }

    /// Copy the log into the data area, waiting for open transactions to
    /// finish. Returns the number of pages moved.
    pub fn checkpoint(&self) -> Result<usize> {
        self.inner.check_usable()?;
        let _exclusive = self.inner.monitor.exclusive()?;
        self.inner.run_checkpoint()
    }

    /// Committed collection names
    pub fn collections(&self) -> Vec<String> {
        self.inner.committed().0.names()
    }

    /// Committed pages of a collection per allocation bucket
    pub fn bucket_counts(&self, collection: &str) -> Result<BTreeMap<PageState, usize>> {
        let (catalog, _) = self.inner.committed();
        let id = catalog.collection(collection)?.id;
        Ok(self.inner.store.alloc.bucket_counts(id))
    }

    /// Get statistics about the database
    pub fn stats(&self) -> Result<EngineStats> {
        let store = &self.inner.store;
        let (catalog, version) = self.inner.committed();
        Ok(EngineStats {
            page_count: store.disk.page_count()?,
            last_page_id: store.wal.last_page_id(),
            log_pages: store.wal.writer().log_pages(),
            read_version: version,
            extents: store.alloc.extent_count(),
            collections: catalog.collections.len(),
            open_transactions: self.inner.monitor.open_transactions(),
            cache: store.cache.stats(),
        })
    }

    /// Checkpoint (when configured) and sync the file
    pub fn close(self) -> Result<()> {
        if self.inner.config.checkpoint_on_close {
            self.checkpoint()?;
        }
        self.inner.store.disk.sync()?;
        info!("database closed");
        Ok(())
    }
}

/// Read every allocation map page, following the log
fn load_allocation_map(disk: &dyn DiskManager, wal: &Wal, version: u64) -> Result<AllocationMap> {
    let mut pages = Vec::new();
    loop {
        let page_id = PageId::map_page(pages.len() as u32);
        let position = match wal.resolve(page_id, version) {
            Ok(position) => position,
            Err(StorageError::PageNotFound(_)) => break,
            Err(err) => return Err(err),
        };
        pages.push(SlottedPage::load(disk.read_page(position)?)?);
    }
    AllocationMap::load(&pages)
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Pages in the file, log included
    pub page_count: u32,
    /// Highest page id in the data area
    pub last_page_id: PageId,
    /// Pages written to the log since the last checkpoint
    pub log_pages: usize,
    pub read_version: u64,
    /// Extents owned by some collection
    pub extents: usize,
    pub collections: usize,
    pub open_transactions: usize,
    pub cache: CacheStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn names(docs: &[Vec<u8>]) -> Result<Vec<String>> {
        docs.iter()
            .map(|doc| -> Result<String> {
                let value: serde_json::Value = serde_json::from_slice(doc)?;
                Ok(value["name"].as_str().unwrap_or_default().to_string())
            })
            .collect()
    }

    #[test]
    fn test_basic_operations() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let engine = Engine::open(Config::new(&path).seed(1))?;

        let mut tx = engine.begin()?;
        let id = tx.insert("users", br#"{"name": "Ann"}"#)?;
        assert_eq!(id, IndexKey::Int32(1));
        tx.insert("users", br#"{"_id": "k2", "name": "Bob"}"#)?;
        tx.commit()?;

        // update
        let mut tx = engine.begin()?;
        assert!(tx.update("users", br#"{"_id": 1, "name": "Anna"}"#)?);
        assert!(!tx.update("users", br#"{"_id": 99, "name": "Nobody"}"#)?);
        let doc = tx.find_by_id("users", &IndexKey::Int32(1))?.unwrap();
        assert_eq!(names(&[doc])?, vec!["Anna"]);

        // delete
        assert!(tx.delete("users", &IndexKey::from("k2"))?);
        assert!(!tx.delete("users", &IndexKey::from("k2"))?);
        assert!(tx.find_by_id("users", &IndexKey::from("k2"))?.is_none());
        assert!(tx.find_by_id("missing", &IndexKey::Int32(1))?.is_none());
        tx.commit()?;
        engine.close()?;

        let engine = Engine::open(Config::new(&path))?;
        assert_eq!(engine.collections(), vec!["users".to_string()]);
        let mut tx = engine.begin()?;
        let doc = tx.find_by_id("users", &IndexKey::Int32(1))?.unwrap();
        assert_eq!(names(&[doc])?, vec!["Anna"]);
        assert_eq!(tx.insert("users", br#"{"name": "Cid"}"#)?, IndexKey::Int32(2));
        tx.commit()?;
        Ok(())
    }

    #[test]
    fn test_range_query() -> Result<()> {
        let engine = Engine::open(Config::in_memory().seed(2).batch_size(3))?;

        let mut tx = engine.begin()?;
        for (name, age) in [("apple", 30), ("banana", 25), ("cherry", 41), ("date", 35)] {
            tx.insert("fruit", format!(r#"{{"name": "{}", "age": {}}}"#, name, age).as_bytes())?;
        }
        assert!(tx.create_index("fruit", "age", "$.age", false)?);
        assert!(!tx.create_index("fruit", "age", "$.age", false)?);
        assert!(tx.create_index("fruit", "age", "$.name", false).is_err());

        let docs = tx.query("fruit", "age", IndexQuery::between(30, 40))?;
        assert_eq!(names(&docs)?, vec!["apple", "date"]);
        assert_eq!(tx.count("fruit", "age", IndexQuery::All(Order::Descending))?, 4);
        tx.commit()?;

        let docs = engine
            .query("fruit", "age", IndexQuery::greater_than(30, false))?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(names(&docs)?, vec!["date", "cherry"]);
        assert!(matches!(
            engine.query("fruit", "weight", IndexQuery::All(Order::Ascending)),
            Err(StorageError::IndexNotFound(_))
        ));
        assert_eq!(
            engine
                .query("nothing", "_id", IndexQuery::All(Order::Ascending))?
                .count(),
            0
        );
        Ok(())
    }

    #[test]
    fn test_rollback_discards_changes() -> Result<()> {
        let engine = Engine::open(Config::in_memory().seed(3))?;

        let mut tx = engine.begin()?;
        tx.insert("users", br#"{"name": "Ann"}"#)?;
        tx.rollback()?;
        assert!(engine.collections().is_empty());

        let mut tx = engine.begin()?;
        tx.insert("users", br#"{"name": "Bob"}"#)?;
        drop(tx);
        assert!(engine.collections().is_empty());
        assert_eq!(engine.stats()?.open_transactions, 0);
        Ok(())
    }

    #[test]
    fn test_unique_index_keeps_transaction_usable() -> Result<()> {
        let engine = Engine::open(Config::in_memory().seed(4))?;

        let mut tx = engine.begin()?;
        tx.create_index("users", "email", "$.email", true)?;
        tx.insert("users", br#"{"email": "a@x", "name": "Ann"}"#)?;
        let err = tx.insert("users", br#"{"email": "A@X", "name": "Imposter"}"#);
        assert!(matches!(err, Err(StorageError::DuplicateKey { .. })));
        assert_eq!(tx.state(), TransactionState::Active);

        // a document may keep its own key
        assert!(tx.update("users", br#"{"_id": 1, "email": "a@x", "name": "Ann B"}"#)?);
        tx.insert("users", br#"{"email": "b@x", "name": "Bob"}"#)?;
        tx.commit()?;

        let mut tx = engine.begin()?;
        assert_eq!(tx.count("users", "email", IndexQuery::All(Order::Ascending))?, 2);
        Ok(())
    }

    #[test]
    fn test_update_moves_index_keys() -> Result<()> {
        let engine = Engine::open(Config::in_memory().seed(5))?;

        let mut tx = engine.begin()?;
        tx.create_index("posts", "tags", "$.tags", false)?;
        tx.insert("posts", br#"{"_id": 1, "name": "p1", "tags": ["rust", "db"]}"#)?;
        tx.insert("posts", br#"{"_id": 2, "name": "p2", "tags": ["db"]}"#)?;
        assert!(tx.update("posts", br#"{"_id": 1, "name": "p1", "tags": ["db", "wal"]}"#)?);

        let rust = tx.query("posts", "tags", IndexQuery::Equals(IndexKey::from("rust")))?;
        assert!(rust.is_empty());
        let db = tx.query("posts", "tags", IndexQuery::Equals(IndexKey::from("db")))?;
        assert_eq!(names(&db)?.len(), 2);
        let wal = tx.query("posts", "tags", IndexQuery::StartsWith("wa".to_string()))?;
        assert_eq!(names(&wal)?, vec!["p1"]);

        // both documents match twice through "db" and "wal" but come back once
        assert_eq!(tx.count("posts", "tags", IndexQuery::All(Order::Ascending))?, 2);

        assert!(tx.drop_index("posts", "tags")?);
        assert!(!tx.drop_index("posts", "tags")?);
        assert!(tx.drop_index("posts", "_id").is_err());
        assert!(tx.find_by_id("posts", &IndexKey::Int32(1))?.is_some());
        tx.commit()?;
        Ok(())
    }

    #[test]
    fn test_drop_collection_releases_pages() -> Result<()> {
        let engine = Engine::open(Config::in_memory().seed(6))?;

        let mut tx = engine.begin()?;
        for i in 0..200 {
            tx.insert("logs", format!(r#"{{"line": {}, "pad": "{}"}}"#, i, "x".repeat(300)).as_bytes())?;
        }
        assert!(tx.create_collection("empty", AutoId::Int64)?);
        assert!(!tx.create_collection("empty", AutoId::Int64)?);
        tx.commit()?;
        let extents = engine.stats()?.extents;

        let mut tx = engine.begin()?;
        assert!(tx.drop_collection("logs")?);
        assert!(!tx.drop_collection("logs")?);
        tx.commit()?;

        assert_eq!(engine.collections(), vec!["empty".to_string()]);
        assert!(engine.stats()?.extents < extents);
        assert!(matches!(
            engine.bucket_counts("logs"),
            Err(StorageError::CollectionNotFound(_))
        ));

        let mut tx = engine.begin()?;
        assert_eq!(tx.insert("empty", b"{}")?, IndexKey::Int64(1));
        assert_eq!(tx.insert("logs", b"{}")?, IndexKey::Int32(1));
        tx.commit()?;
        Ok(())
    }

    #[test]
    fn test_cancelled_transaction_rolls_back() -> Result<()> {
        let engine = Engine::open(Config::in_memory().seed(7))?;
        let token = CancellationToken::new();

        let mut tx = engine.begin_with_token(token.clone())?;
        tx.insert("users", br#"{"name": "Ann"}"#)?;
        token.cancel();
        assert!(matches!(
            tx.insert("users", br#"{"name": "Bob"}"#),
            Err(StorageError::Cancelled)
        ));
        assert_eq!(tx.state(), TransactionState::Aborted);
        assert!(matches!(tx.commit(), Err(StorageError::TransactionClosed)));
        assert!(engine.collections().is_empty());
        Ok(())
    }

    #[test]
    fn test_invalid_names_are_rejected() -> Result<()> {
        let engine = Engine::open(Config::in_memory())?;
        let mut tx = engine.begin()?;
        assert!(tx.insert("$master", b"{}").is_err());
        assert!(tx.insert("bad name", b"{}").is_err());
        assert!(tx.create_index("users", "", "$.x", false).is_err());
        assert!(tx.update("users", br#"{"name": "no id"}"#).is_err());
        assert_eq!(tx.state(), TransactionState::Active);
        Ok(())
    }
}
