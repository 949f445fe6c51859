//! Transaction handle.
//!
//! A transaction holds the checkpoint lock shared from begin to end.
//!
//! A transaction opened with [`crate::Engine::begin_write`] declares the
//! collections it will write. Their locks are taken at begin in sorted
//! order, with [`MASTER_LOCK`] first whenever the catalog may change, and
//! writes outside the declaration are rejected. Declared writers therefore
//! never wait on each other in a cycle.
//!
//! A transaction opened with [`crate::Engine::begin`] takes the write lock of
//! a collection the first time it writes to it; catalog changes
//! additionally take [`MASTER_LOCK`]. Locks taken this way follow the order
//! of the writes, so two such writers can wait on each other; every wait is
//! bounded by the lock timeout and [`StorageError::LockTimeout`] is the only
//! way out of such a cycle.
//!
//! Locks are kept until commit or rollback. Whenever a new lock is granted
//! the read version moves to the latest commit, so pages of locked
//! collections are always read at their newest committed state.
//!
//! Validation failures (bad names, duplicate keys, oversized documents)
//! leave the transaction usable. A failure while pages are being changed,
//! or a cancelled token, rolls the whole transaction back.

use super::{CancellationToken, CollectionGuard, CommitParts, SharedGuard, Snapshot, MASTER_LOCK};
use crate::catalog::{
    AutoId, Catalog, CollectionMeta, IndexMeta, MASTER_ROW, PK_EXPRESSION, PK_INDEX,
};
use crate::data::DataService;
use crate::error::{Result, StorageError};
use crate::index::{IndexCursor, IndexEntry, IndexKey, IndexNode, IndexQuery, IndexService, Order};
use crate::page::SlottedPage;
use crate::types::{PageId, RowAddress, SYSTEM_COLLECTION_ID};
use crate::EngineInner;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

/// Index keys of one document, per index
type DocumentKeys = Vec<(IndexMeta, Vec<IndexKey>)>;

pub struct Transaction {
    engine: Arc<EngineInner>,
    id: u32,
    snapshot: Snapshot,
    state: TransactionState,
    token: CancellationToken,
    locks: BTreeMap<String, CollectionGuard>,
    /// Collections declared at begin; no other lock may be taken when set
    declared: Option<BTreeSet<String>>,
    /// Working copy of the catalog; authoritative once `$master` is locked
    catalog: Catalog,
    catalog_dirty: bool,
    master_locked: bool,
    rng: StdRng,
    shared: Option<SharedGuard>,
}

impl Transaction {
    pub(crate) fn begin(engine: Arc<EngineInner>, token: CancellationToken) -> Result<Self> {
        engine.check_usable()?;
        let shared = engine.monitor.enter()?;
        let id = engine.monitor.next_transaction_id();
        let (catalog, version) = engine.committed();
        let snapshot = Snapshot::new(
            Arc::clone(&engine.store),
            id,
            version,
            engine.config.max_transaction_pages,
        );
        let rng = StdRng::seed_from_u64(engine.rng.lock().gen());
        engine.monitor.transaction_opened();
        debug!(tx_id = id, read_version = version, "transaction started");

        Ok(Self {
            engine,
            id,
            snapshot,
            state: TransactionState::Active,
            token,
            locks: BTreeMap::new(),
            declared: None,
            catalog: (*catalog).clone(),
            catalog_dirty: false,
            master_locked: false,
            rng,
            shared: Some(shared),
        })
    }

    /// Begin a transaction that writes only to `collections`, locking them
    /// up front in sorted order. [`MASTER_LOCK`] in the list declares
    /// catalog changes (indexes, drops); it is taken implicitly when a
    /// declared collection does not exist yet.
    pub(crate) fn begin_write(
        engine: Arc<EngineInner>,
        token: CancellationToken,
        collections: &[&str],
    ) -> Result<Self> {
        let mut names = BTreeSet::new();
        let mut catalog_changes = false;
        for &name in collections {
            if name == MASTER_LOCK {
                catalog_changes = true;
            } else {
                Catalog::validate_name(name)?;
                names.insert(name.to_string());
            }
        }

        let mut tx = Self::begin(engine, token)?;
        loop {
            let missing = names.iter().any(|name| tx.catalog.get(name).is_none());
            // `$master` sorts before every valid collection name
            if catalog_changes || missing {
                tx.lock_master()?;
            }
            for name in &names {
                tx.lock(name)?;
            }
            if tx.master_locked || names.iter().all(|name| tx.catalog.get(name).is_some()) {
                break;
            }
            // a declared collection was dropped while we waited
            tx.locks.clear();
        }
        debug!(tx_id = tx.id, collections = ?names, catalog = tx.master_locked, "write locks taken");
        tx.declared = Some(names);
        Ok(tx)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn read_version(&self) -> u64 {
        self.snapshot.read_version()
    }

    /// Collection names as this transaction sees them
    pub fn collections(&self) -> Vec<String> {
        self.catalog.names()
    }

    /// Insert a document, creating the collection if needed. A document
    /// without an id gets the collection's next automatic id. Returns the id.
    pub fn insert(&mut self, collection: &str, document: &[u8]) -> Result<IndexKey> {
        self.begin_op()?;
        let meta = self.writable(collection, true)?.ok_or_else(|| {
            StorageError::CollectionNotFound(collection.to_string())
        })?;

        let codec = Arc::clone(&self.engine.config.codec);
        let (id, bytes) = match codec.get_id(document)? {
            Some(id) => {
                self.observe_id(&meta, &id);
                (id, document.to_vec())
            }
            None => {
                let id = self.next_id(&meta)?;
                let bytes = codec.with_id(document, &id)?;
                (id, bytes)
            }
        };

        let keys = self.document_keys(&meta, &id, &bytes)?;
        self.check_unique(&meta, &keys, None)?;
        self.mutate(|tx| tx.insert_document(&meta, &bytes, keys))?;
        Ok(id)
    }

    /// Replace the document with the same id. Returns `false` when no such
    /// document exists.
    pub fn update(&mut self, collection: &str, document: &[u8]) -> Result<bool> {
        self.begin_op()?;
        let id = self
            .engine
            .config
            .codec
            .get_id(document)?
            .ok_or_else(|| StorageError::invalid_operation("document to update has no _id"))?;
        let Some(meta) = self.writable(collection, false)? else {
            return Ok(false);
        };
        let Some(pk) = self.find_pk(&meta, &id)? else {
            return Ok(false);
        };

        let keys = self.document_keys(&meta, &id, document)?;
        self.check_unique(&meta, &keys, Some(pk.data_block))?;
        self.mutate(|tx| tx.update_document(&meta, &pk, document, keys))?;
        Ok(true)
    }

    /// Delete a document by id. Returns `false` when it does not exist.
    pub fn delete(&mut self, collection: &str, id: &IndexKey) -> Result<bool> {
        self.begin_op()?;
        let Some(meta) = self.writable(collection, false)? else {
            return Ok(false);
        };
        let Some(pk) = self.find_pk(&meta, id)? else {
            return Ok(false);
        };

        self.mutate(|tx| {
            let engine = Arc::clone(&tx.engine);
            // index nodes first, then the blocks they point at
            let nodes = IndexService::new(&mut tx.snapshot, &engine.collation, meta.id)
                .delete_all(pk.address)?;
            let blocks = DataService::new(&mut tx.snapshot, meta.id).delete(pk.data_block)?;
            tx.snapshot.safepoint()?;
            debug!(tx_id = tx.id, collection = %meta.name, nodes, blocks, "deleted document");
            Ok(())
        })?;
        Ok(true)
    }

    pub fn find_by_id(&mut self, collection: &str, id: &IndexKey) -> Result<Option<Vec<u8>>> {
        self.begin_op()?;
        let Some(meta) = self.catalog.get(collection).cloned() else {
            return Ok(None);
        };
        let Some(pk) = self.find_pk(&meta, id)? else {
            return Ok(None);
        };
        DataService::new(&mut self.snapshot, meta.id)
            .read(pk.data_block)
            .map(Some)
    }

    /// Row address of a document's first data block
    pub fn address_of(&mut self, collection: &str, id: &IndexKey) -> Result<Option<RowAddress>> {
        self.begin_op()?;
        let Some(meta) = self.catalog.get(collection).cloned() else {
            return Ok(None);
        };
        Ok(self.find_pk(&meta, id)?.map(|pk| pk.data_block))
    }

    /// Documents matched by `query` on index `index`, in index order. A
    /// document matching through several keys is returned once.
    pub fn query(
        &mut self,
        collection: &str,
        index: &str,
        query: IndexQuery,
    ) -> Result<Vec<Vec<u8>>> {
        self.begin_op()?;
        let Some(meta) = self.catalog.get(collection).cloned() else {
            return Ok(Vec::new());
        };
        let entries = self.scan(&meta, index, query)?;
        let data = DataService::new(&mut self.snapshot, meta.id);
        entries
            .iter()
            .map(|entry| data.read(entry.data_block))
            .collect()
    }

    /// Number of documents matched by `query` on index `index`
    pub fn count(&mut self, collection: &str, index: &str, query: IndexQuery) -> Result<usize> {
        self.begin_op()?;
        let Some(meta) = self.catalog.get(collection).cloned() else {
            return Ok(0);
        };
        Ok(self.scan(&meta, index, query)?.len())
    }

    /// Create an empty collection. Returns `false` if it already exists.
    pub fn create_collection(&mut self, name: &str, auto_id: AutoId) -> Result<bool> {
        self.begin_op()?;
        Catalog::validate_name(name)?;
        self.lock(name)?;
        self.lock_master()?;
        if self.catalog.get(name).is_some() {
            return Ok(false);
        }
        self.mutate(|tx| tx.add_collection(name, auto_id).map(|_| ()))?;
        Ok(true)
    }

    /// Drop a collection with its documents and indexes. Returns `false` if
    /// it does not exist.
    pub fn drop_collection(&mut self, name: &str) -> Result<bool> {
        self.begin_op()?;
        let Some(meta) = self.writable(name, false)? else {
            return Ok(false);
        };
        self.lock_master()?;

        self.mutate(|tx| {
            let pages = tx.snapshot.collection_pages(meta.id);
            for &page_id in &pages {
                tx.snapshot.release_page(meta.id, page_id)?;
            }
            tx.catalog.remove(name);
            tx.catalog_dirty = true;
            tx.engine.sequences.lock().remove(name);
            info!(collection = name, id = meta.id, pages = pages.len(), "dropped collection");
            Ok(())
        })?;
        Ok(true)
    }

    /// Create an index over `expression` and fill it from the existing
    /// documents. Returns `false` if an identical index already exists.
    pub fn create_index(
        &mut self,
        collection: &str,
        name: &str,
        expression: &str,
        unique: bool,
    ) -> Result<bool> {
        self.begin_op()?;
        Catalog::validate_name(name)?;
        if expression.trim().is_empty() {
            return Err(StorageError::invalid_operation("index expression is empty"));
        }
        self.writable(collection, true)?;
        self.lock_master()?;

        let meta = self.catalog.collection(collection)?.clone();
        if let Some(existing) = meta.indexes.get(name) {
            if existing.expression == expression && existing.unique == unique {
                return Ok(false);
            }
            return Err(StorageError::invalid_operation(format!(
                "index '{}' already exists on '{}' with another definition",
                name, collection
            )));
        }
        let slot = meta.next_slot()?;

        self.mutate(|tx| tx.build_index(&meta, name, expression, unique, slot))?;
        Ok(true)
    }

    /// Drop a secondary index. Returns `false` if it does not exist.
    pub fn drop_index(&mut self, collection: &str, name: &str) -> Result<bool> {
        self.begin_op()?;
        if name == PK_INDEX {
            return Err(StorageError::invalid_operation(
                "the primary key index cannot be dropped",
            ));
        }
        let Some(_) = self.writable(collection, false)? else {
            return Ok(false);
        };
        self.lock_master()?;

        let meta = self.catalog.collection(collection)?.clone();
        let Some(index) = meta.indexes.get(name).cloned() else {
            return Ok(false);
        };

        self.mutate(|tx| tx.remove_index(&meta, &index))?;
        Ok(true)
    }

    /// Make every change durable and visible to later transactions
    pub fn commit(mut self) -> Result<()> {
        self.begin_op()?;
        let engine = Arc::clone(&self.engine);
        if let Err(err) = self.write_commit(&engine) {
            self.abort();
            return Err(err);
        }
        self.state = TransactionState::Committed;
        self.release();
        engine.maybe_checkpoint();
        Ok(())
    }

    /// Discard every change
    pub fn rollback(mut self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(StorageError::TransactionClosed);
        }
        self.abort();
        Ok(())
    }

    /// Insert the catalog document of a new file at [`MASTER_ROW`]
    pub(crate) fn write_initial_catalog(&mut self) -> Result<()> {
        self.begin_op()?;
        self.lock_master()?;
        let bytes = self.catalog.to_bytes()?;
        let address = self.mutate(|tx| {
            DataService::new(&mut tx.snapshot, SYSTEM_COLLECTION_ID).insert(&bytes)
        })?;
        if address != MASTER_ROW {
            self.abort();
            return Err(StorageError::corruption(format!(
                "catalog stored at {} instead of {}",
                address, MASTER_ROW
            )));
        }
        Ok(())
    }

    fn write_commit(&mut self, engine: &EngineInner) -> Result<()> {
        let _commit = engine.commit_lock.lock();
        if self.catalog_dirty {
            let bytes = self.catalog.to_bytes()?;
            DataService::new(&mut self.snapshot, SYSTEM_COLLECTION_ID).update(MASTER_ROW, &bytes)?;
        }
        if !self.snapshot.has_changes() {
            return Ok(());
        }

        let CommitParts {
            mut dirty,
            flushed,
            flushed_positions,
            alloc,
        } = self.snapshot.take_parts();
        dirty.extend(engine.store.alloc.prepare(&alloc));

        let (version, positions) =
            match self.write_log(engine, &mut dirty, flushed, flushed_positions) {
                Ok(published) => published,
                Err(err) => {
                    engine.store.alloc.rollback(alloc);
                    engine.poison(&err);
                    return Err(err);
                }
            };

        engine.store.alloc.apply(alloc);
        let catalog = self.catalog_dirty.then(|| Arc::new(self.catalog.clone()));
        engine.publish(catalog, version);

        let pages = dirty.len();
        for (page, position) in dirty.into_iter().zip(positions) {
            engine.store.cache.insert(position, page);
        }
        debug!(tx_id = self.id, pages, version, "transaction committed");
        Ok(())
    }

    /// Append, confirm and publish. Returns the new read version and the log
    /// position of each page.
    fn write_log(
        &self,
        engine: &EngineInner,
        pages: &mut [SlottedPage],
        flushed: HashMap<PageId, u32>,
        mut confirm: Vec<u32>,
    ) -> Result<(u64, Vec<u32>)> {
        let writer = engine.store.wal.writer();
        let positions = writer.append(self.id, pages)?;
        confirm.extend_from_slice(&positions);
        writer.confirm(&confirm)?;

        let mut entries: BTreeMap<PageId, u32> = flushed.into_iter().collect();
        entries.extend(
            pages
                .iter()
                .map(|page| page.page_id())
                .zip(positions.iter().copied()),
        );
        let version = engine.store.wal.index().publish(entries);
        Ok((version, positions))
    }

    fn insert_document(
        &mut self,
        meta: &CollectionMeta,
        bytes: &[u8],
        keys: DocumentKeys,
    ) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        let data_block = DataService::new(&mut self.snapshot, meta.id).insert(bytes)?;

        // the primary key comes first, so its node heads the document chain
        let mut svc = IndexService::new(&mut self.snapshot, &engine.collation, meta.id);
        let mut last = None;
        for (index, values) in keys {
            for key in values {
                last = Some(svc.add_node(&mut self.rng, &index, key, data_block, last)?);
            }
        }
        self.snapshot.safepoint()?;
        Ok(())
    }

    fn update_document(
        &mut self,
        meta: &CollectionMeta,
        pk: &IndexNode,
        bytes: &[u8],
        keys: DocumentKeys,
    ) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        DataService::new(&mut self.snapshot, meta.id).update(pk.data_block, bytes)?;

        let mut svc = IndexService::new(&mut self.snapshot, &engine.collation, meta.id);
        let mut wanted: BTreeMap<u8, (IndexMeta, Vec<(IndexKey, bool)>)> = keys
            .into_iter()
            .map(|(index, values)| {
                let values = values.into_iter().map(|key| (key, false)).collect();
                (index.slot, (index, values))
            })
            .collect();

        let mut stale = HashSet::new();
        for node in svc.document_nodes(pk.address)? {
            let kept = wanted.get_mut(&node.slot).and_then(|(_, values)| {
                values.iter_mut().find(|(key, seen)| {
                    !*seen && key.compare(&node.key, &engine.collation) == Ordering::Equal
                })
            });
            match kept {
                Some((_, seen)) => *seen = true,
                None => {
                    stale.insert(node.address);
                }
            }
        }

        let first = svc.delete_list(pk.address, &stale)?;
        let mut last = svc.document_nodes(first)?.last().map(|node| node.address);
        let mut added = 0;
        for (index, values) in wanted.into_values() {
            for (key, seen) in values {
                if !seen {
                    last = Some(svc.add_node(&mut self.rng, &index, key, pk.data_block, last)?);
                    added += 1;
                }
            }
        }
        debug!(tx_id = self.id, removed = stale.len(), added, "updated document keys");
        self.snapshot.safepoint()?;
        Ok(())
    }

    fn add_collection(&mut self, name: &str, auto_id: AutoId) -> Result<CollectionMeta> {
        let engine = Arc::clone(&self.engine);
        let id = self.catalog.next_collection_id()?;
        self.snapshot.allow_writes(id);
        let (head, tail) =
            IndexService::new(&mut self.snapshot, &engine.collation, id).create_index(0)?;

        let mut meta = CollectionMeta::new(id, name, auto_id);
        meta.indexes.insert(
            PK_INDEX.to_string(),
            IndexMeta {
                name: PK_INDEX.to_string(),
                slot: 0,
                expression: PK_EXPRESSION.to_string(),
                unique: true,
                head,
                tail,
            },
        );
        self.catalog.add(meta.clone());
        self.catalog_dirty = true;
        info!(collection = name, id, "created collection");
        Ok(meta)
    }

    fn build_index(
        &mut self,
        meta: &CollectionMeta,
        name: &str,
        expression: &str,
        unique: bool,
        slot: u8,
    ) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        let (head, tail) =
            IndexService::new(&mut self.snapshot, &engine.collation, meta.id).create_index(slot)?;
        let index = IndexMeta {
            name: name.to_string(),
            slot,
            expression: expression.to_string(),
            unique,
            head,
            tail,
        };

        let mut cursor = IndexCursor::new(meta.pk()?.clone(), IndexQuery::All(Order::Ascending));
        let mut documents = 0;
        while !cursor.is_done() {
            self.check_cancelled()?;
            let entries = {
                let svc = IndexService::new(&mut self.snapshot, &engine.collation, meta.id);
                cursor.next_batch(&svc, engine.config.batch_size)?
            };
            for entry in entries {
                let bytes = DataService::new(&mut self.snapshot, meta.id).read(entry.data_block)?;
                let keys = distinct_keys(
                    engine.config.codec.extract_keys(&bytes, expression)?,
                    &engine,
                )?;

                let mut svc = IndexService::new(&mut self.snapshot, &engine.collation, meta.id);
                let mut last = svc.document_nodes(entry.node)?.last().map(|node| node.address);
                for key in keys {
                    last = Some(svc.add_node(&mut self.rng, &index, key, entry.data_block, last)?);
                }
                documents += 1;
            }
            self.snapshot.safepoint()?;
        }

        self.catalog
            .collection_mut(&meta.name)?
            .indexes
            .insert(name.to_string(), index);
        self.catalog_dirty = true;
        info!(collection = %meta.name, index = name, expression, documents, "created index");
        Ok(())
    }

    fn remove_index(&mut self, meta: &CollectionMeta, index: &IndexMeta) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        let mut cursor = IndexCursor::new(meta.pk()?.clone(), IndexQuery::All(Order::Ascending));
        while !cursor.is_done() {
            self.check_cancelled()?;
            let mut svc = IndexService::new(&mut self.snapshot, &engine.collation, meta.id);
            for entry in cursor.next_batch(&svc, engine.config.batch_size)? {
                let targets: HashSet<RowAddress> = svc
                    .document_nodes(entry.node)?
                    .into_iter()
                    .filter(|node| node.slot == index.slot)
                    .map(|node| node.address)
                    .collect();
                if !targets.is_empty() {
                    svc.delete_list(entry.node, &targets)?;
                }
            }
            self.snapshot.safepoint()?;
        }

        let nodes = IndexService::new(&mut self.snapshot, &engine.collation, meta.id)
            .drop_index(index)?;
        self.catalog.collection_mut(&meta.name)?.indexes.remove(&index.name);
        self.catalog_dirty = true;
        info!(collection = %meta.name, index = %index.name, nodes, "dropped index");
        Ok(())
    }

    fn find_pk(&mut self, meta: &CollectionMeta, id: &IndexKey) -> Result<Option<IndexNode>> {
        let engine = Arc::clone(&self.engine);
        let svc = IndexService::new(&mut self.snapshot, &engine.collation, meta.id);
        svc.find(meta.pk()?, id, false, Order::Ascending)
    }

    /// Index entries of a query, one per document
    fn scan(
        &mut self,
        meta: &CollectionMeta,
        index: &str,
        query: IndexQuery,
    ) -> Result<Vec<IndexEntry>> {
        let engine = Arc::clone(&self.engine);
        let mut cursor = IndexCursor::new(meta.index(index)?.clone(), query);
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        while !cursor.is_done() {
            if let Err(err) = self.check_cancelled() {
                self.abort();
                return Err(err);
            }
            let svc = IndexService::new(&mut self.snapshot, &engine.collation, meta.id);
            entries.extend(
                cursor
                    .next_batch(&svc, engine.config.batch_size)?
                    .into_iter()
                    .filter(|entry| seen.insert(entry.data_block)),
            );
        }
        Ok(entries)
    }

    /// Keys of a document for every index of its collection
    fn document_keys(
        &self,
        meta: &CollectionMeta,
        id: &IndexKey,
        bytes: &[u8],
    ) -> Result<DocumentKeys> {
        meta.indexes_by_slot()
            .into_iter()
            .map(|index| -> Result<(IndexMeta, Vec<IndexKey>)> {
                let values = if index.name == PK_INDEX {
                    vec![id.clone()]
                } else {
                    self.engine.config.codec.extract_keys(bytes, &index.expression)?
                };
                Ok((index.clone(), distinct_keys(values, &self.engine)?))
            })
            .collect()
    }

    /// Fail if a unique index already maps one of `keys` to a document
    /// other than `owner`
    fn check_unique(
        &mut self,
        meta: &CollectionMeta,
        keys: &DocumentKeys,
        owner: Option<RowAddress>,
    ) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        let svc = IndexService::new(&mut self.snapshot, &engine.collation, meta.id);
        for (index, values) in keys.iter().filter(|(index, _)| index.unique) {
            for key in values {
                if let Some(node) = svc.find(index, key, false, Order::Ascending)? {
                    if Some(node.data_block) != owner {
                        return Err(StorageError::DuplicateKey {
                            index: format!("{}.{}", meta.name, index.name),
                            key: key.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Next automatic id of a collection
    fn next_id(&mut self, meta: &CollectionMeta) -> Result<IndexKey> {
        let engine = Arc::clone(&self.engine);
        let mut sequences = engine.sequences.lock();
        let current = match sequences.get(&meta.name) {
            Some(&current) => current,
            None => self.max_numeric_id(meta)?,
        };

        let exhausted =
            || StorageError::invalid_operation(format!("collection '{}' ran out of ids", meta.name));
        let next = current.checked_add(1).ok_or_else(|| exhausted())?;
        let id = match meta.auto_id {
            AutoId::Int32 => IndexKey::Int32(i32::try_from(next).map_err(|_| exhausted())?),
            AutoId::Int64 => IndexKey::Int64(next),
        };
        sequences.insert(meta.name.clone(), next);
        Ok(id)
    }

    /// Keep the sequence ahead of user supplied numeric ids
    fn observe_id(&self, meta: &CollectionMeta, id: &IndexKey) {
        let value = match id {
            IndexKey::Int32(v) => i64::from(*v),
            IndexKey::Int64(v) => *v,
            _ => return,
        };
        if let Some(current) = self.engine.sequences.lock().get_mut(&meta.name) {
            *current = (*current).max(value);
        }
    }

    /// Highest numeric primary key, 0 when there is none
    fn max_numeric_id(&mut self, meta: &CollectionMeta) -> Result<i64> {
        let engine = Arc::clone(&self.engine);
        let svc = IndexService::new(&mut self.snapshot, &engine.collation, meta.id);
        let last = svc.find(
            meta.pk()?,
            &IndexKey::Double(f64::INFINITY),
            true,
            Order::Descending,
        )?;
        Ok(match last.map(|node| node.key) {
            Some(IndexKey::Int32(v)) => i64::from(v),
            Some(IndexKey::Int64(v)) => v,
            Some(IndexKey::Double(v)) if v.is_finite() => v.floor() as i64,
            _ => 0,
        })
    }

    /// Lock a collection for writing and return its metadata, creating it
    /// when `create` is set. `None` when it does not exist.
    fn writable(&mut self, name: &str, create: bool) -> Result<Option<CollectionMeta>> {
        Catalog::validate_name(name)?;
        self.lock(name)?;
        if self.catalog.get(name).is_none() {
            if !create {
                return Ok(None);
            }
            self.lock_master()?;
            if self.catalog.get(name).is_none() {
                self.mutate(|tx| tx.add_collection(name, AutoId::default()).map(|_| ()))?;
            }
        }
        let meta = self.catalog.collection(name)?.clone();
        self.snapshot.allow_writes(meta.id);
        Ok(Some(meta))
    }

    fn lock(&mut self, name: &str) -> Result<()> {
        if self.locks.contains_key(name) {
            return Ok(());
        }
        if self.declared.is_some() {
            return Err(StorageError::invalid_operation(format!(
                "'{}' was not declared for writing",
                name
            )));
        }
        let guard = self.engine.monitor.lock_collection(name)?;
        self.locks.insert(name.to_string(), guard);
        self.refresh();
        Ok(())
    }

    fn lock_master(&mut self) -> Result<()> {
        if self.master_locked {
            return Ok(());
        }
        self.lock(MASTER_LOCK)?;
        self.master_locked = true;
        self.snapshot.allow_writes(SYSTEM_COLLECTION_ID);
        Ok(())
    }

    /// Move to the latest committed state after a lock was granted
    fn refresh(&mut self) {
        let (catalog, version) = self.engine.committed();
        self.snapshot.set_read_version(version);
        // with `$master` held nobody else can change the catalog, and the
        // working copy may already carry this transaction's changes
        if !self.master_locked {
            self.catalog = (*catalog).clone();
        }
    }

    fn begin_op(&mut self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(StorageError::TransactionClosed);
        }
        if let Err(err) = self.check_cancelled() {
            self.abort();
            return Err(err);
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(())
    }

    /// Run a step that changes pages; any failure rolls the transaction back
    fn mutate<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        match op(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                if self.state == TransactionState::Active {
                    warn!(tx_id = self.id, error = %err, "rolling back after failed write");
                }
                self.abort();
                Err(err)
            }
        }
    }

    fn abort(&mut self) {
        if self.state != TransactionState::Active {
            return;
        }
        let parts = self.snapshot.take_parts();
        let discarded = parts.dirty.len() + parts.flushed.len();
        self.engine.store.alloc.rollback(parts.alloc);
        self.state = TransactionState::Aborted;
        self.release();
        debug!(tx_id = self.id, discarded, "transaction rolled back");
    }

    fn release(&mut self) {
        self.locks.clear();
        self.master_locked = false;
        self.shared.take();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            self.abort();
        }
        self.engine.monitor.transaction_closed();
    }
}

/// Keys with duplicates (under the collation) removed, each checked
fn distinct_keys(keys: Vec<IndexKey>, engine: &EngineInner) -> Result<Vec<IndexKey>> {
    let mut distinct: Vec<IndexKey> = Vec::with_capacity(keys.len());
    for key in keys {
        IndexService::check_key(&key)?;
        if !distinct
            .iter()
            .any(|k| k.compare(&key, &engine.collation) == Ordering::Equal)
        {
            distinct.push(key);
        }
    }
    Ok(distinct)
}
