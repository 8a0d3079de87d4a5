//! L8 engine facade: opens one database file, owns the full storage/
//! transaction stack, and dispatches collection CRUD and query operations
//! against it.

use crate::catalog::{CollectionDirectory, IndexDescriptor};
use crate::document::{Document, DocValue, IndexKey, ObjectId};
use crate::error::{DbError, Result};
use crate::index::{location_to_pseudo_id, pseudo_id_to_location, BTreeIndex};
use crate::storage::data::DataLayout;
use crate::storage::page::{Page, PageId};
use crate::storage::pager::PageManager;
use crate::storage::wal::{decode_page_image, RecordKind, WalManager};
pub use crate::storage::flush::WriteConcern;
use crate::storage::flush::FlushScheduler;
use crate::transaction::{
    DeadlockDetector, LockManager, LockMode, Operation, Resource, TransactionManager,
    TxnId, VictimSelectionPolicy,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, instrument};

/// A txn id used for schema and ad-hoc locking that isn't tied to a
/// transaction the caller opened — no `begin()` ever returns this id.
const SYSTEM_TXN_ID: TxnId = 0;
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(250);

/// Builder-style configuration for [`Engine::open`], matching the documented
/// defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineOptions {
    pub page_size: u32,
    pub cache_size: usize,
    pub enable_journaling: bool,
    pub write_concern: WriteConcern,
    pub journal_flush_delay_ms: u32,
    pub background_flush_interval_ms: u32,
    pub transaction_timeout_sec: u32,
    pub max_transactions: u32,
    pub read_only: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            page_size: 8192,
            cache_size: 1000,
            enable_journaling: true,
            write_concern: WriteConcern::Journaled,
            journal_flush_delay_ms: 10,
            background_flush_interval_ms: 100,
            transaction_timeout_sec: 300,
            max_transactions: 128,
            read_only: false,
        }
    }
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_size(mut self, v: u32) -> Self {
        self.page_size = v;
        self
    }

    pub fn cache_size(mut self, v: usize) -> Self {
        self.cache_size = v;
        self
    }

    pub fn enable_journaling(mut self, v: bool) -> Self {
        self.enable_journaling = v;
        self
    }

    pub fn write_concern(mut self, v: WriteConcern) -> Self {
        self.write_concern = v;
        self
    }

    pub fn journal_flush_delay_ms(mut self, v: u32) -> Self {
        self.journal_flush_delay_ms = v;
        self
    }

    pub fn background_flush_interval_ms(mut self, v: u32) -> Self {
        self.background_flush_interval_ms = v;
        self
    }

    pub fn transaction_timeout_sec(mut self, v: u32) -> Self {
        self.transaction_timeout_sec = v;
        self
    }

    pub fn max_transactions(mut self, v: u32) -> Self {
        self.max_transactions = v;
        self
    }

    pub fn read_only(mut self, v: bool) -> Self {
        self.read_only = v;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || !(512..=65536).contains(&self.page_size) {
            return Err(DbError::InvalidArgument(format!(
                "page_size {} must be a power of two in [512, 65536]",
                self.page_size
            )));
        }
        if self.cache_size == 0 {
            return Err(DbError::InvalidArgument("cache_size must be > 0".into()));
        }
        Ok(())
    }
}

/// A small equality/range filter over one document field, resolved against a
/// matching secondary index when one exists, falling back to a full
/// collection scan otherwise.
#[derive(Debug, Clone)]
pub enum DocFilter {
    Eq { field: String, value: DocValue },
    Range { field: String, lo: IndexKey, hi: IndexKey, include_lo: bool, include_hi: bool },
}

impl DocFilter {
    pub fn eq(field: impl Into<String>, value: DocValue) -> Self {
        DocFilter::Eq { field: field.into(), value }
    }

    pub fn range(field: impl Into<String>, lo: IndexKey, hi: IndexKey, include_lo: bool, include_hi: bool) -> Self {
        DocFilter::Range { field: field.into(), lo, hi, include_lo, include_hi }
    }

    fn field(&self) -> &str {
        match self {
            DocFilter::Eq { field, .. } => field,
            DocFilter::Range { field, .. } => field,
        }
    }

    fn matches(&self, doc: &Document) -> bool {
        match self {
            DocFilter::Eq { field, value } => doc.get(field) == Some(value),
            DocFilter::Range { field, lo, hi, include_lo, include_hi } => match doc.get(field) {
                Some(v) => {
                    let key = IndexKey::single(v.clone());
                    let above = if *include_lo { key >= *lo } else { key > *lo };
                    let below = if *include_hi { key <= *hi } else { key < *hi };
                    above && below
                }
                None => false,
            },
        }
    }
}

/// Snapshot of L1–L7 counters, for monitoring and the six §8 test scenarios.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStatistics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub total_pages: u32,
    pub cached_pages: usize,
    pub last_lsn: u64,
    pub flushed_lsn: u64,
    pub active_transactions: usize,
}

/// Background thread pairing deadlock detection with the idle-transaction
/// watchdog; both need the same periodic tick over the same live state.
struct Watchdog {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl Watchdog {
    fn spawn(
        pager: Arc<PageManager>,
        directory: Arc<CollectionDirectory>,
        transactions: Arc<TransactionManager>,
        locks: Arc<LockManager>,
        detector: Arc<DeadlockDetector>,
        interval: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let bg_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("embeddb-watchdog".into())
            .spawn(move || {
                while !bg_stop.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    if bg_stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let starts = transactions.start_times_snapshot();
                    if let Some(victim) = detector.detect(&locks, &starts) {
                        info!(victim, "background sweep aborted a deadlocked transaction");
                    }
                    let indexes = index_root_snapshot(&pager, &directory);
                    match transactions.sweep_idle(&indexes) {
                        Ok(rolled_back) if !rolled_back.is_empty() => {
                            info!(count = rolled_back.len(), "idle transactions rolled back");
                        }
                        Err(err) => tracing::warn!(?err, "idle transaction sweep failed"),
                        _ => {}
                    }
                }
            })
            .expect("spawning watchdog thread");
        Self { handle: Some(handle), stop }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn index_root_snapshot(pager: &PageManager, directory: &CollectionDirectory) -> HashMap<String, PageId> {
    let mut map = HashMap::new();
    for name in directory.names() {
        let Some(meta_page) = directory.meta_page(&name) else { continue };
        let Ok(meta) = directory.read_meta(pager, meta_page) else { continue };
        map.insert(primary_index_name(&name), meta.primary_index_root);
        for descriptor in &meta.indexes {
            map.insert(secondary_index_name(&name, &descriptor.field), descriptor.root_page);
        }
    }
    map
}

fn primary_index_name(collection: &str) -> String {
    format!("{collection}:_id")
}

fn secondary_index_name(collection: &str, field: &str) -> String {
    format!("{collection}:{field}")
}

/// Owns the full storage/transaction stack for one open database file.
pub struct Engine {
    pager: Arc<PageManager>,
    wal: Arc<WalManager>,
    locks: Arc<LockManager>,
    transactions: Arc<TransactionManager>,
    flush: Arc<FlushScheduler>,
    directory: Arc<CollectionDirectory>,
    options: EngineOptions,
    _watchdog: Watchdog,
}

impl Engine {
    #[instrument(skip(path, options))]
    pub fn open(path: impl AsRef<Path>, options: EngineOptions) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref();
        let pager = Arc::new(PageManager::open(path, options.page_size, options.cache_size)?);
        let wal_path = WalManager::companion_path(path);
        let wal = Arc::new(WalManager::open(&wal_path)?);

        // A missing companion WAL is a clean shutdown; a present one is
        // replayed here to restore the LSN counters from its surviving
        // prefix and to redo any committed transaction's page writes that
        // never made it past the cache before the process died. A txn_id
        // that never reaches a Commit/Rollback record in the surviving log
        // was itself lost mid-flight, so none of its page images are
        // applied — there is nothing durable to redo it from in the first
        // place. This does not redo/undo uncommitted transactions at the
        // page level beyond that; see DESIGN.md for the scope this leaves
        // open.
        let mut records = Vec::new();
        wal.replay(|record| records.push(record))?;
        let terminal: HashSet<u64> =
            records.iter().filter(|r| matches!(r.kind, RecordKind::Commit | RecordKind::Rollback)).map(|r| r.txn_id).collect();
        let mut redone = false;
        for record in &records {
            if record.kind != RecordKind::PagePostImage || !terminal.contains(&record.txn_id) {
                continue;
            }
            let (page_id, bytes) = decode_page_image(&record.payload)?;
            let mut page = Page::from_bytes(bytes.to_vec());
            page.is_dirty = true;
            pager.write(page_id, page)?;
            redone = true;
        }
        if redone {
            pager.flush_all_dirty()?;
        }

        let root = pager.header().collection_directory_root;
        let directory = Arc::new(CollectionDirectory::open(&pager, root)?);
        let locks = Arc::new(LockManager::new());
        let idle_timeout = Duration::from_secs(options.transaction_timeout_sec as u64);
        let transactions = Arc::new(TransactionManager::new(pager.clone(), wal.clone(), locks.clone(), idle_timeout));
        let flush = Arc::new(FlushScheduler::new(
            pager.clone(),
            wal.clone(),
            Duration::from_millis(options.journal_flush_delay_ms as u64),
            Duration::from_millis(options.background_flush_interval_ms as u64),
        ));
        let deadlock = Arc::new(DeadlockDetector::new(VictimSelectionPolicy::Youngest, Duration::from_millis(50)));
        let watchdog = Watchdog::spawn(
            pager.clone(),
            directory.clone(),
            transactions.clone(),
            locks.clone(),
            deadlock,
            WATCHDOG_INTERVAL,
        );

        Ok(Self {
            pager,
            wal,
            locks,
            transactions,
            flush,
            directory,
            options,
            _watchdog: watchdog,
        })
    }

    pub fn close(self) -> Result<()> {
        self.pager.flush_all_dirty()?;
        self.pager.sync()
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    pub fn exists(&self, name: &str) -> bool {
        self.directory.exists(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.directory.names()
    }

    #[instrument(skip(self))]
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        if self.options.read_only {
            return Err(DbError::ReadOnly);
        }
        let lock = self.locks.acquire(Resource::Collection(name.to_string()), LockMode::Exclusive, SYSTEM_TXN_ID, LOCK_TIMEOUT)?;
        let result = self.directory.drop_collection(&self.pager, name);
        self.locks.release(lock);
        result
    }

    /// Returns the collection's metadata page, creating the collection if
    /// it doesn't exist yet. Creation itself is not part of any caller's
    /// transaction journal: it is idempotent and, on conflict, the loser
    /// simply finds the metadata the winner created.
    fn ensure_collection(&self, name: &str) -> Result<PageId> {
        if let Some(page) = self.directory.meta_page(name) {
            return Ok(page);
        }
        match self.directory.create(&self.pager, name) {
            Ok(page) => Ok(page),
            Err(DbError::AlreadyExists(_)) => self
                .directory
                .meta_page(name)
                .ok_or_else(|| DbError::Internal("collection vanished after AlreadyExists".into())),
            Err(other) => Err(other),
        }
    }

    pub fn begin_transaction(&self) -> Result<TxnId> {
        if self.transactions.active_count() >= self.options.max_transactions as usize {
            return Err(DbError::Transaction("max_transactions exceeded".into()));
        }
        self.transactions.begin()
    }

    #[instrument(skip(self))]
    pub fn commit(&self, txn_id: TxnId) -> Result<()> {
        let pager = self.pager.clone();
        let flush = self.flush.clone();
        let concern = self.options.write_concern;
        let indexes = HashMap::new();
        self.transactions.commit(
            txn_id,
            move |lsn| {
                let dirty = pager.dirty_page_ids();
                flush.commit(concern, lsn, &dirty)
            },
            &indexes,
        )
    }

    #[instrument(skip(self))]
    pub fn rollback(&self, txn_id: TxnId) -> Result<()> {
        let indexes = index_root_snapshot(&self.pager, &self.directory);
        self.transactions.rollback(txn_id, &indexes)
    }

    pub fn create_savepoint(&self, txn_id: TxnId, name: impl Into<String>) -> Result<usize> {
        self.transactions.create_savepoint(txn_id, name)
    }

    pub fn rollback_to_savepoint(&self, txn_id: TxnId, mark: usize) -> Result<()> {
        let indexes = index_root_snapshot(&self.pager, &self.directory);
        self.transactions.rollback_to(txn_id, mark, &indexes)
    }

    /// Inserts `doc` in its own auto-committed transaction.
    pub fn insert(&self, collection: &str, doc: Document) -> Result<ObjectId> {
        let txn_id = self.begin_transaction()?;
        match self.insert_in(txn_id, collection, doc) {
            Ok(id) => {
                self.commit(txn_id)?;
                Ok(id)
            }
            Err(err) => {
                let _ = self.rollback(txn_id);
                Err(err)
            }
        }
    }

    #[instrument(skip(self, doc))]
    pub fn insert_in(&self, txn_id: TxnId, collection: &str, doc: Document) -> Result<ObjectId> {
        if self.options.read_only {
            return Err(DbError::ReadOnly);
        }
        let lock = self.locks.acquire(Resource::Collection(collection.to_string()), LockMode::IntentExclusive, txn_id, LOCK_TIMEOUT)?;
        self.transactions.hold_lock(txn_id, lock)?;

        let meta_page = self.ensure_collection(collection)?;
        let mut meta = self.directory.read_meta(&self.pager, meta_page)?;
        let layout = DataLayout::new(&self.pager);

        let bytes = doc.to_bytes();
        let (loc, new_head) = layout.insert(meta.first_data_page, &bytes)?;
        self.transactions.record(txn_id, Operation::Insert { loc })?;
        meta.first_data_page = new_head;

        let primary = BTreeIndex::new(&self.pager, true).named(primary_index_name(collection));
        let primary_key = IndexKey::single(DocValue::ObjectId(doc.id));
        let pseudo = location_to_pseudo_id(loc);
        let (_inserted, new_primary_root) = primary.insert(meta.primary_index_root, primary_key.clone(), pseudo)?;
        self.transactions.record(
            txn_id,
            Operation::IndexInsert { index: primary_index_name(collection), key: primary_key, doc_id: pseudo },
        )?;
        meta.primary_index_root = new_primary_root;

        for descriptor in meta.indexes.clone() {
            if let Some(value) = doc.get(&descriptor.field) {
                let idx = BTreeIndex::new(&self.pager, descriptor.unique).named(secondary_index_name(collection, &descriptor.field));
                let key = IndexKey::single(value.clone());
                let (_inserted, new_root) = idx.insert(descriptor.root_page, key.clone(), doc.id)?;
                self.transactions.record(
                    txn_id,
                    Operation::IndexInsert { index: secondary_index_name(collection, &descriptor.field), key, doc_id: doc.id },
                )?;
                if let Some(d) = meta.indexes.iter_mut().find(|d| d.field == descriptor.field) {
                    d.root_page = new_root;
                }
            }
        }

        self.directory.write_meta(&self.pager, meta_page, &meta)?;
        Ok(doc.id)
    }

    pub fn find_by_id(&self, collection: &str, id: ObjectId) -> Result<Option<Document>> {
        let Some(meta_page) = self.directory.meta_page(collection) else { return Ok(None) };
        let meta = self.directory.read_meta(&self.pager, meta_page)?;
        let primary = BTreeIndex::new(&self.pager, true).named(primary_index_name(collection));
        let key = IndexKey::single(DocValue::ObjectId(id));
        let Some(pseudo) = primary.find(meta.primary_index_root, &key)?.into_iter().next() else {
            return Ok(None);
        };
        let loc = pseudo_id_to_location(pseudo);
        let layout = DataLayout::new(&self.pager);
        match layout.get(loc)? {
            Some(bytes) => Ok(Some(Document::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn find_all(&self, collection: &str) -> Result<Vec<Document>> {
        let Some(meta_page) = self.directory.meta_page(collection) else { return Ok(Vec::new()) };
        let meta = self.directory.read_meta(&self.pager, meta_page)?;
        let layout = DataLayout::new(&self.pager);
        layout
            .scan(meta.first_data_page)?
            .into_iter()
            .map(|(_loc, bytes)| Document::from_bytes(&bytes))
            .collect()
    }

    /// Updates the document identified by `id` in its own auto-committed
    /// transaction, applying `mutate` to a copy of the stored document.
    /// Returns `false` if no such document exists.
    pub fn update(&self, collection: &str, id: ObjectId, mutate: impl FnOnce(&mut Document)) -> Result<bool> {
        let txn_id = self.begin_transaction()?;
        match self.update_in(txn_id, collection, id, mutate) {
            Ok(found) => {
                self.commit(txn_id)?;
                Ok(found)
            }
            Err(err) => {
                let _ = self.rollback(txn_id);
                Err(err)
            }
        }
    }

    #[instrument(skip(self, mutate))]
    pub fn update_in(&self, txn_id: TxnId, collection: &str, id: ObjectId, mutate: impl FnOnce(&mut Document)) -> Result<bool> {
        if self.options.read_only {
            return Err(DbError::ReadOnly);
        }
        let lock = self.locks.acquire(Resource::Collection(collection.to_string()), LockMode::IntentExclusive, txn_id, LOCK_TIMEOUT)?;
        self.transactions.hold_lock(txn_id, lock)?;

        let Some(meta_page) = self.directory.meta_page(collection) else { return Ok(false) };
        let mut meta = self.directory.read_meta(&self.pager, meta_page)?;
        let primary = BTreeIndex::new(&self.pager, true).named(primary_index_name(collection));
        let primary_key = IndexKey::single(DocValue::ObjectId(id));
        let Some(pseudo) = primary.find(meta.primary_index_root, &primary_key)?.into_iter().next() else {
            return Ok(false);
        };
        let loc = pseudo_id_to_location(pseudo);
        let layout = DataLayout::new(&self.pager);
        let Some(old_bytes) = layout.get(loc)? else { return Ok(false) };
        let old_doc = Document::from_bytes(&old_bytes)?;
        let mut doc = old_doc.clone();
        mutate(&mut doc);
        doc.id = id;
        let new_bytes = doc.to_bytes();

        for descriptor in meta.indexes.clone() {
            let old_val = old_doc.get(&descriptor.field).cloned();
            let new_val = doc.get(&descriptor.field).cloned();
            if old_val == new_val {
                continue;
            }
            let idx = BTreeIndex::new(&self.pager, descriptor.unique).named(secondary_index_name(collection, &descriptor.field));
            let mut root = descriptor.root_page;
            if let Some(v) = old_val {
                let key = IndexKey::single(v);
                let (_removed, new_root) = idx.delete(root, &key, id)?;
                self.transactions.record(
                    txn_id,
                    Operation::IndexDelete { index: secondary_index_name(collection, &descriptor.field), key, doc_id: id },
                )?;
                root = new_root;
            }
            if let Some(v) = new_val {
                let key = IndexKey::single(v);
                let (_inserted, new_root) = idx.insert(root, key.clone(), id)?;
                self.transactions.record(
                    txn_id,
                    Operation::IndexInsert { index: secondary_index_name(collection, &descriptor.field), key, doc_id: id },
                )?;
                root = new_root;
            }
            if let Some(d) = meta.indexes.iter_mut().find(|d| d.field == descriptor.field) {
                d.root_page = root;
            }
        }

        // `DataLayout::update` rewrites in place when the new length fits
        // the old slot, otherwise tombstones it and reinserts; both halves
        // of a relocation are journaled as the Delete+Insert pair the
        // operation log expects, matching the in-place update rule.
        let (new_loc, new_head) = layout.update(meta.first_data_page, loc, &new_bytes)?;
        if new_loc == loc {
            self.transactions.record(txn_id, Operation::Update { loc, pre_image: old_bytes })?;
        } else {
            self.transactions.record(txn_id, Operation::Delete { loc, pre_image: old_bytes })?;
            self.transactions.record(txn_id, Operation::Insert { loc: new_loc })?;
            meta.first_data_page = new_head;

            let (_removed, root_after_delete) = primary.delete(meta.primary_index_root, &primary_key, pseudo)?;
            self.transactions.record(
                txn_id,
                Operation::IndexDelete { index: primary_index_name(collection), key: primary_key.clone(), doc_id: pseudo },
            )?;
            let new_pseudo = location_to_pseudo_id(new_loc);
            let (_inserted, root_after_insert) = primary.insert(root_after_delete, primary_key.clone(), new_pseudo)?;
            self.transactions.record(
                txn_id,
                Operation::IndexInsert { index: primary_index_name(collection), key: primary_key, doc_id: new_pseudo },
            )?;
            meta.primary_index_root = root_after_insert;
        }

        self.directory.write_meta(&self.pager, meta_page, &meta)?;
        Ok(true)
    }

    /// Deletes the document identified by `id` in its own auto-committed
    /// transaction. Returns `false` if no such document exists.
    pub fn delete(&self, collection: &str, id: ObjectId) -> Result<bool> {
        let txn_id = self.begin_transaction()?;
        match self.delete_in(txn_id, collection, id) {
            Ok(found) => {
                self.commit(txn_id)?;
                Ok(found)
            }
            Err(err) => {
                let _ = self.rollback(txn_id);
                Err(err)
            }
        }
    }

    #[instrument(skip(self))]
    pub fn delete_in(&self, txn_id: TxnId, collection: &str, id: ObjectId) -> Result<bool> {
        if self.options.read_only {
            return Err(DbError::ReadOnly);
        }
        let lock = self.locks.acquire(Resource::Collection(collection.to_string()), LockMode::IntentExclusive, txn_id, LOCK_TIMEOUT)?;
        self.transactions.hold_lock(txn_id, lock)?;

        let Some(meta_page) = self.directory.meta_page(collection) else { return Ok(false) };
        let mut meta = self.directory.read_meta(&self.pager, meta_page)?;
        let primary = BTreeIndex::new(&self.pager, true).named(primary_index_name(collection));
        let primary_key = IndexKey::single(DocValue::ObjectId(id));
        let Some(pseudo) = primary.find(meta.primary_index_root, &primary_key)?.into_iter().next() else {
            return Ok(false);
        };
        let loc = pseudo_id_to_location(pseudo);
        let layout = DataLayout::new(&self.pager);
        let Some(old_bytes) = layout.delete(loc)? else { return Ok(false) };
        self.transactions.record(txn_id, Operation::Delete { loc, pre_image: old_bytes.clone() })?;

        let (_removed, new_primary_root) = primary.delete(meta.primary_index_root, &primary_key, pseudo)?;
        self.transactions.record(
            txn_id,
            Operation::IndexDelete { index: primary_index_name(collection), key: primary_key, doc_id: pseudo },
        )?;
        meta.primary_index_root = new_primary_root;

        let doc = Document::from_bytes(&old_bytes)?;
        for descriptor in meta.indexes.clone() {
            if let Some(value) = doc.get(&descriptor.field) {
                let idx = BTreeIndex::new(&self.pager, descriptor.unique).named(secondary_index_name(collection, &descriptor.field));
                let key = IndexKey::single(value.clone());
                let (_removed, new_root) = idx.delete(descriptor.root_page, &key, doc.id)?;
                self.transactions.record(
                    txn_id,
                    Operation::IndexDelete { index: secondary_index_name(collection, &descriptor.field), key, doc_id: doc.id },
                )?;
                if let Some(d) = meta.indexes.iter_mut().find(|d| d.field == descriptor.field) {
                    d.root_page = new_root;
                }
            }
        }

        self.directory.write_meta(&self.pager, meta_page, &meta)?;
        Ok(true)
    }

    pub fn find_one(&self, collection: &str, filter: &DocFilter) -> Result<Option<Document>> {
        Ok(self.find_many(collection, filter)?.into_iter().next())
    }

    pub fn find_many(&self, collection: &str, filter: &DocFilter) -> Result<Vec<Document>> {
        let Some(meta_page) = self.directory.meta_page(collection) else { return Ok(Vec::new()) };
        let meta = self.directory.read_meta(&self.pager, meta_page)?;
        if let Some(descriptor) = meta.indexes.iter().find(|d| d.field == filter.field()) {
            let idx = BTreeIndex::new(&self.pager, descriptor.unique).named(secondary_index_name(collection, &descriptor.field));
            let doc_ids = match filter {
                DocFilter::Eq { value, .. } => idx.find(descriptor.root_page, &IndexKey::single(value.clone()))?,
                DocFilter::Range { lo, hi, include_lo, include_hi, .. } => {
                    idx.find_range(descriptor.root_page, lo, hi, *include_lo, *include_hi)?
                }
            };
            let mut out = Vec::with_capacity(doc_ids.len());
            for doc_id in doc_ids {
                if let Some(doc) = self.find_by_id(collection, doc_id)? {
                    out.push(doc);
                }
            }
            return Ok(out);
        }
        Ok(self.find_all(collection)?.into_iter().filter(|doc| filter.matches(doc)).collect())
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        let Some(meta_page) = self.directory.meta_page(collection) else { return Ok(0) };
        let meta = self.directory.read_meta(&self.pager, meta_page)?;
        let layout = DataLayout::new(&self.pager);
        Ok(layout.scan(meta.first_data_page)?.len())
    }

    pub fn count_filtered(&self, collection: &str, filter: &DocFilter) -> Result<usize> {
        Ok(self.find_many(collection, filter)?.len())
    }

    pub fn list_indexes(&self, collection: &str) -> Result<Vec<IndexDescriptor>> {
        let meta_page = self.directory.meta_page(collection).ok_or_else(|| DbError::NotFound(collection.to_string()))?;
        Ok(self.directory.read_meta(&self.pager, meta_page)?.indexes)
    }

    pub fn create_index(&self, collection: &str, field: &str, unique: bool) -> Result<()> {
        if self.options.read_only {
            return Err(DbError::ReadOnly);
        }
        let lock = self.locks.acquire(Resource::Collection(collection.to_string()), LockMode::Exclusive, SYSTEM_TXN_ID, LOCK_TIMEOUT)?;
        let result = self.create_index_locked(collection, field, unique);
        self.locks.release(lock);
        result
    }

    fn create_index_locked(&self, collection: &str, field: &str, unique: bool) -> Result<()> {
        let meta_page = self.directory.meta_page(collection).ok_or_else(|| DbError::NotFound(collection.to_string()))?;
        let mut meta = self.directory.read_meta(&self.pager, meta_page)?;
        if meta.indexes.iter().any(|d| d.field == field) {
            return Err(DbError::AlreadyExists(format!("index on {field}")));
        }
        let idx = BTreeIndex::new(&self.pager, unique).named(secondary_index_name(collection, field));
        let layout = DataLayout::new(&self.pager);
        let mut root = 0;
        for (_loc, bytes) in layout.scan(meta.first_data_page)? {
            let doc = Document::from_bytes(&bytes)?;
            if let Some(value) = doc.get(field) {
                let (_inserted, new_root) = idx.insert(root, IndexKey::single(value.clone()), doc.id)?;
                root = new_root;
            }
        }
        meta.indexes.push(IndexDescriptor { field: field.to_string(), unique, root_page: root });
        self.directory.write_meta(&self.pager, meta_page, &meta)
    }

    pub fn drop_index(&self, collection: &str, field: &str) -> Result<()> {
        if self.options.read_only {
            return Err(DbError::ReadOnly);
        }
        let lock = self.locks.acquire(Resource::Collection(collection.to_string()), LockMode::Exclusive, SYSTEM_TXN_ID, LOCK_TIMEOUT)?;
        let result = self.drop_index_locked(collection, field);
        self.locks.release(lock);
        result
    }

    fn drop_index_locked(&self, collection: &str, field: &str) -> Result<()> {
        let meta_page = self.directory.meta_page(collection).ok_or_else(|| DbError::NotFound(collection.to_string()))?;
        let mut meta = self.directory.read_meta(&self.pager, meta_page)?;
        let pos = meta
            .indexes
            .iter()
            .position(|d| d.field == field)
            .ok_or_else(|| DbError::NotFound(format!("index on {field}")))?;
        let descriptor = meta.indexes.remove(pos);
        BTreeIndex::new(&self.pager, descriptor.unique).named(secondary_index_name(collection, field)).clear(descriptor.root_page)?;
        self.directory.write_meta(&self.pager, meta_page, &meta)
    }

    pub fn statistics(&self) -> EngineStatistics {
        let page_stats = self.pager.statistics();
        EngineStatistics {
            cache_hits: page_stats.cache_hits,
            cache_misses: page_stats.cache_misses,
            total_pages: page_stats.total_pages,
            cached_pages: page_stats.cached_pages,
            last_lsn: self.wal.last_lsn(),
            flushed_lsn: self.wal.flushed_lsn(),
            active_transactions: self.transactions.active_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &std::path::Path) -> Engine {
        Engine::open(dir.join("data.tinydb"), EngineOptions::new().background_flush_interval_ms(50)).unwrap()
    }

    #[test]
    fn insert_then_find_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let doc = Document::new(ObjectId::new(), "users")
            .with_field("name", DocValue::Str("Alice".into()))
            .with_field("age", DocValue::Int64(30));
        let id = engine.insert("users", doc.clone()).unwrap();
        let found = engine.find_by_id("users", id).unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&DocValue::Str("Alice".into())));
        assert_eq!(engine.count("users").unwrap(), 1);
    }

    #[test]
    fn unique_index_rejects_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.create_index("users", "email", true).unwrap();
        let a = Document::new(ObjectId::new(), "users").with_field("email", DocValue::Str("x@y".into()));
        let b = Document::new(ObjectId::new(), "users").with_field("email", DocValue::Str("x@y".into()));
        engine.insert("users", a).unwrap();
        let result = engine.insert("users", b);
        assert!(matches!(result, Err(DbError::UniqueViolation { .. })));
        assert_eq!(engine.count("users").unwrap(), 1);
    }

    #[test]
    fn update_grows_then_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let id = engine
            .insert("things", Document::new(ObjectId::new(), "things").with_field("blob", DocValue::Str("x".repeat(100))))
            .unwrap();
        engine.update("things", id, |doc| doc.set("blob", DocValue::Str("y".repeat(200)))).unwrap();
        engine.update("things", id, |doc| doc.set("blob", DocValue::Str("z".repeat(50)))).unwrap();
        let found = engine.find_by_id("things", id).unwrap().unwrap();
        assert_eq!(found.get("blob"), Some(&DocValue::Str("z".repeat(50))));
        assert_eq!(engine.count("things").unwrap(), 1);
    }

    #[test]
    fn rollback_restores_pre_transaction_state() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let existing_id = engine
            .insert("people", Document::new(ObjectId::new(), "people").with_field("age", DocValue::Int64(50)))
            .unwrap();

        let txn_id = engine.begin_transaction().unwrap();
        for _ in 0..3 {
            engine.insert_in(txn_id, "people", Document::new(ObjectId::new(), "people")).unwrap();
        }
        engine.update_in(txn_id, "people", existing_id, |doc| doc.set("age", DocValue::Int64(999))).unwrap();
        engine.rollback(txn_id).unwrap();

        assert_eq!(engine.count("people").unwrap(), 1);
        let found = engine.find_by_id("people", existing_id).unwrap().unwrap();
        assert_eq!(found.get("age"), Some(&DocValue::Int64(50)));
    }

    #[test]
    fn find_many_uses_index_and_scan_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        for n in 0..5i64 {
            engine
                .insert("nums", Document::new(ObjectId::new(), "nums").with_field("n", DocValue::Int64(n)))
                .unwrap();
        }
        let unindexed = engine.find_many("nums", &DocFilter::eq("n", DocValue::Int64(3))).unwrap();
        assert_eq!(unindexed.len(), 1);

        engine.create_index("nums", "n", false).unwrap();
        let indexed = engine.find_many("nums", &DocFilter::eq("n", DocValue::Int64(3))).unwrap();
        assert_eq!(indexed.len(), 1);
        assert_eq!(engine.count_filtered("nums", &DocFilter::eq("n", DocValue::Int64(3))).unwrap(), 1);
    }

    #[test]
    fn reopen_after_commit_preserves_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.tinydb");
        let id = {
            let engine = Engine::open(&path, EngineOptions::new()).unwrap();
            let id = engine
                .insert("users", Document::new(ObjectId::new(), "users").with_field("name", DocValue::Str("Bob".into())))
                .unwrap();
            engine.close().unwrap();
            id
        };
        let engine = Engine::open(&path, EngineOptions::new()).unwrap();
        let found = engine.find_by_id("users", id).unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&DocValue::Str("Bob".into())));
    }

    #[test]
    fn invalid_page_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = Engine::open(dir.path().join("bad.tinydb"), EngineOptions::new().page_size(100));
        assert!(matches!(result, Err(DbError::InvalidArgument(_))));
    }
}
