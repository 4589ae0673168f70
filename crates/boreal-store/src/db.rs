//! The database handle.
//!
//! `Database::open` wires the page array, allocator, node cache, lock
//! manager, redo log, registry, and trash together, recovering from the
//! durable header when one exists. Indexes are B-trees named in the
//! registry (index id 0); ids are random non-zero values, with id 1
//! reserved for the fragmented trash. Temporary trees are created
//! pre-trashed and skip the redo log; recovery reclaims them.
//!
//! Registry entries: key 0x00 followed by the big-endian index id maps to
//! (root page id, flags, name); key 0x01 followed by the name maps to the
//! id. Both live in the registry tree and ride the normal checkpoint.

use boreal_common::config::DbConfig;
use boreal_common::error::{BorealError, Result};
use boreal_common::types::{DurabilityMode, IndexId, LockMode, PageId, TxnId};
use boreal_redo::op::RedoOp;
use boreal_redo::writer::RedoWriter;
use boreal_sync::latch::Latch;
use boreal_sync::scheduler::Scheduler;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{error, info};

use crate::alloc::PageAllocator;
use crate::cache::NodeCache;
use crate::checkpoint;
use crate::cursor::Cursor;
use crate::header::DbHeader;
use crate::lock::LockManager;
use crate::pagearray::{self, FilePageArray, MemPageArray, PageArray, SnapshotPageArray};
use crate::pending::PendingQueue;
use crate::recover::{self, RecoverCtx};
use crate::snapshot;
use crate::store::PageStore;
use crate::trash::FragmentedTrash;
use crate::tree::{NewValue, StoredValue, Tree};
use crate::txn::{Transaction, UndoContext};
use crate::undo::UndoLog;

/// Reserved id of the fragmented trash tree.
pub(crate) const TRASH_ID: IndexId = IndexId(1);

/// Registry flag: the tree is temporary and reclaimed at recovery.
pub(crate) const FLAG_TEMPORARY: u8 = 1;

pub(crate) fn registry_id_key(id: IndexId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(0x00);
    key.extend_from_slice(&id.0.to_be_bytes());
    key
}

pub(crate) fn registry_name_key(name: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(0x01);
    key.extend_from_slice(name);
    key
}

pub(crate) fn encode_tree_entry(root: PageId, flags: u8, name: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + name.len());
    out.extend_from_slice(&root.0.to_le_bytes());
    out.push(flags);
    out.extend_from_slice(name);
    out
}

pub(crate) fn decode_tree_entry(buf: &[u8]) -> Result<(PageId, u8, Vec<u8>)> {
    if buf.len() < 9 {
        return Err(BorealError::Corrupt("registry entry too short".to_string()));
    }
    let root = PageId(u64::from_le_bytes(buf[0..8].try_into().expect("len")));
    Ok((root, buf[8], buf[9..].to_vec()))
}

/// Resolves a tree by id through the registry, creating an empty entry
/// when none exists yet.
pub(crate) fn resolve_tree(
    store: &PageStore,
    registry: &Arc<Tree>,
    cache: &Mutex<HashMap<u64, Arc<Tree>>>,
    id: IndexId,
) -> Result<Arc<Tree>> {
    if id == IndexId::REGISTRY {
        return Ok(registry.clone());
    }
    if let Some(tree) = cache.lock().get(&id.0) {
        return Ok(tree.clone());
    }
    let key = registry_id_key(id);
    let tree = match registry.load(store, &key)? {
        Some(StoredValue::Inline(entry)) => {
            let (root, flags, _name) = decode_tree_entry(&entry)?;
            Arc::new(Tree::new(id, root, flags & FLAG_TEMPORARY != 0))
        }
        Some(_) => {
            return Err(BorealError::Corrupt("registry entry not inline".to_string()))
        }
        None => {
            let entry = encode_tree_entry(PageId::NONE, 0, &[]);
            registry.store(store, &key, NewValue::Bytes(&entry))?;
            Arc::new(Tree::new(id, PageId::NONE, false))
        }
    };
    cache.lock().insert(id.0, tree.clone());
    Ok(tree)
}

/// Writes a tree's current root into its registry entry, preserving flags
/// and name.
pub(crate) fn store_registry_root(
    store: &PageStore,
    registry: &Arc<Tree>,
    tree: &Tree,
) -> Result<()> {
    let key = registry_id_key(tree.id);
    let (flags, name) = match registry.load(store, &key)? {
        Some(StoredValue::Inline(entry)) => {
            let (_, flags, name) = decode_tree_entry(&entry)?;
            (flags, name)
        }
        _ => (if tree.temporary { FLAG_TEMPORARY } else { 0 }, Vec::new()),
    };
    let value = encode_tree_entry(tree.root_id(), flags, &name);
    registry.store(store, &key, NewValue::Bytes(&value))?;
    Ok(())
}

pub(crate) struct LifeState {
    pub closed: Option<String>,
    pub panicked: Option<String>,
}

pub(crate) struct HeaderMeta {
    pub counter: u64,
    pub oldest_redo_file: u64,
    pub last_checkpoint_pos: u64,
}

/// Shared engine state behind the public handles.
pub(crate) struct DbInner {
    pub(crate) config: DbConfig,
    pub(crate) store: PageStore,
    pub(crate) locks: LockManager,
    pub(crate) redo: RedoWriter,
    pub(crate) commit_latch: Latch,
    pub(crate) registry: Arc<Tree>,
    pub(crate) trash: FragmentedTrash,
    pub(crate) open_trees: Mutex<HashMap<u64, Arc<Tree>>>,
    pub(crate) names: Mutex<HashMap<Vec<u8>, IndexId>>,
    pub(crate) active_txns: Mutex<HashMap<u64, Arc<Mutex<UndoLog>>>>,
    pub(crate) pending: PendingQueue,
    pub(crate) next_txn_id: AtomicU64,
    pub(crate) next_cursor_id: AtomicU64,
    pub(crate) header_meta: Mutex<HeaderMeta>,
    pub(crate) checkpoint_mutex: Mutex<()>,
    pub(crate) life: Mutex<LifeState>,
}

impl DbInner {
    pub(crate) fn check_open(&self) -> Result<()> {
        let life = self.life.lock();
        if let Some(reason) = &life.panicked {
            return Err(BorealError::Panicked(reason.clone()));
        }
        if let Some(reason) = &life.closed {
            return Err(BorealError::ClosedCause(reason.clone()));
        }
        Ok(())
    }

    pub(crate) fn panic(&self, reason: String) {
        error!(reason, "database panicked");
        self.life.lock().panicked = Some(reason);
    }

    pub(crate) fn assign_txn_id(&self) -> TxnId {
        TxnId(self.next_txn_id.fetch_add(1, Ordering::AcqRel))
    }

    pub(crate) fn assign_cursor_id(&self) -> u64 {
        self.next_cursor_id.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn register_txn(&self, id: TxnId, undo: Arc<Mutex<UndoLog>>) {
        self.active_txns.lock().insert(id.0, undo);
    }

    pub(crate) fn deregister_txn(&self, id: TxnId) {
        if id.is_assigned() {
            self.active_txns.lock().remove(&id.0);
        }
    }

    pub(crate) fn tree_by_id(&self, id: IndexId) -> Result<Arc<Tree>> {
        resolve_tree(&self.store, &self.registry, &self.open_trees, id)
    }

    pub(crate) fn update_registry_root(&self, tree: &Arc<Tree>) -> Result<()> {
        store_registry_root(&self.store, &self.registry, tree)
    }

    /// Physically removes a ghost tombstone after its lock released.
    pub(crate) fn delete_ghost(&self, index: IndexId, key: &[u8]) -> Result<()> {
        let tree = self.tree_by_id(index)?;
        let _c = self.commit_latch.shared();
        tree.delete_ghost(&self.store, key)
    }

    pub(crate) fn remove_index_entry_inner(&self, id: IndexId) -> Result<()> {
        recover::remove_registry_entry(&self.store, &self.registry, id)?;
        self.open_trees.lock().remove(&id.0);
        self.names.lock().retain(|_, v| *v != id);
        Ok(())
    }

    /// Releases pending commits whose redo records are durable.
    pub(crate) fn release_pending(&self) -> Result<()> {
        let synced = self.redo.synced_pos();
        for pending in self.pending.take_ready(synced) {
            for (index, key) in &pending.locks {
                let ghost = self.locks.unlock(&pending.owner, *index, key);
                if ghost {
                    self.delete_ghost(*index, key)?;
                }
            }
            pending.undo.lock().truncate(&self.store);
            if pending.has_trash {
                self.trash.empty(&self.store, pending.txn_id)?;
            }
            self.deregister_txn(pending.txn_id);
        }
        Ok(())
    }

    fn random_index_id(&self) -> Result<IndexId> {
        use std::hash::{BuildHasher, Hasher};
        loop {
            let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
            hasher.write_u64(self.next_cursor_id.fetch_add(1, Ordering::Relaxed));
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            hasher.write_u128(now.as_nanos());
            let id = hasher.finish();
            if id <= TRASH_ID.0 {
                continue;
            }
            let key = registry_id_key(IndexId(id));
            if self.registry.load(&self.store, &key)?.is_none() {
                return Ok(IndexId(id));
            }
        }
    }
}

impl UndoContext for DbInner {
    fn store(&self) -> &PageStore {
        &self.store
    }

    fn trash(&self) -> &FragmentedTrash {
        &self.trash
    }

    fn tree_by_id(&self, id: IndexId) -> Result<Arc<Tree>> {
        DbInner::tree_by_id(self, id)
    }

    fn remove_index_entry(&self, id: IndexId) -> Result<()> {
        self.remove_index_entry_inner(id)
    }
}

/// An embedded, transactional, ordered key/value database.
pub struct Database {
    inner: Arc<DbInner>,
    scheduler: Arc<Scheduler>,
    bogus: OnceLock<Transaction>,
}

impl Database {
    /// Opens or creates a database, recovering as needed.
    pub fn open(config: DbConfig) -> Result<Database> {
        config.validate()?;

        let inner_pages: Arc<dyn PageArray> = match config.data_file() {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Arc::new(FilePageArray::open(&path, config.page_size, config.fsync_enabled)?)
            }
            None => Arc::new(MemPageArray::new(config.page_size)),
        };
        let pages = Arc::new(SnapshotPageArray::new(inner_pages));
        let durable = config.base_file.is_some();
        let fresh = pages.page_count() == 0;

        let header = if fresh {
            pages.set_page_count(2)?;
            let header = DbHeader::initial(config.page_size);
            if durable {
                header.write(&*pages)?;
            }
            header
        } else {
            let header = DbHeader::read(&*pages)?;
            if header.page_size != config.page_size {
                return Err(BorealError::IllegalPageSize(config.page_size));
            }
            header
        };

        let allocator = if fresh {
            PageAllocator::new(2)
        } else {
            PageAllocator::load(&*pages, header.allocator_root, header.page_count)?
        };
        let cache = NodeCache::with_bounds(config.min_cache_nodes, config.max_cache_nodes);
        let store = PageStore::new(pages, allocator, cache)
            .with_max_key_size(config.max_key_size);

        let registry = Arc::new(Tree::new(IndexId::REGISTRY, header.registry_root, false));
        let trash_tree = {
            let cache_map = Mutex::new(HashMap::new());
            resolve_tree(&store, &registry, &cache_map, TRASH_ID)?
        };
        let trash = FragmentedTrash::new(trash_tree.clone());

        let mut max_txn_id = header.highest_txn_id.0;
        let mut next_redo_file = header.redo_file_num;
        let mut replayed_to = header.redo_position;
        let mut recovered_trees: HashMap<u64, Arc<Tree>> = HashMap::new();

        if durable && !fresh {
            let ctx = RecoverCtx {
                store: &store,
                registry: &registry,
                trash: &trash,
                trees: Mutex::new(HashMap::new()),
            };
            let path_of = {
                let config = config.clone();
                move |n: u64| config.redo_file(n).expect("durable database has redo paths")
            };
            let outcome = recover::recover(&ctx, &header, path_of)?;
            max_txn_id = outcome.max_txn_id;
            next_redo_file = outcome.next_redo_file;
            replayed_to = outcome.replayed_to;

            // Recovered tree roots must land in the registry before the
            // post-recovery checkpoint captures it.
            recovered_trees = ctx.trees.into_inner();
            for tree in recovered_trees.values() {
                store_registry_root(&store, &registry, tree)?;
            }
            store_registry_root(&store, &registry, &trash_tree)?;
        }

        let redo = if durable {
            let path = config
                .redo_file(next_redo_file)
                .expect("durable database has redo paths");
            RedoWriter::create(path, next_redo_file, replayed_to, config.fsync_enabled)?
        } else {
            RedoWriter::disabled()
        };

        let mut open_trees = recovered_trees;
        open_trees.insert(TRASH_ID.0, trash_tree);

        let inner = Arc::new(DbInner {
            store,
            locks: LockManager::new(),
            redo,
            commit_latch: Latch::new(),
            registry,
            trash,
            open_trees: Mutex::new(open_trees),
            names: Mutex::new(HashMap::new()),
            active_txns: Mutex::new(HashMap::new()),
            pending: PendingQueue::new(),
            next_txn_id: AtomicU64::new(max_txn_id + 1),
            next_cursor_id: AtomicU64::new(1),
            header_meta: Mutex::new(HeaderMeta {
                counter: header.counter,
                oldest_redo_file: header.redo_file_num,
                last_checkpoint_pos: replayed_to,
            }),
            checkpoint_mutex: Mutex::new(()),
            life: Mutex::new(LifeState { closed: None, panicked: None }),
            config,
        });

        if durable && !fresh {
            // Persist the recovered state and truncate the replayed redo.
            checkpoint::checkpoint(&inner)?;
        }

        let scheduler = Arc::new(Scheduler::new(2));
        if durable {
            schedule_flusher(&scheduler, Arc::downgrade(&inner));
        }
        if let Some(interval) = inner.config.checkpoint_interval {
            if durable {
                schedule_checkpointer(&scheduler, Arc::downgrade(&inner), interval);
            }
        }

        info!(
            fresh,
            durable,
            next_txn = max_txn_id + 1,
            "database open"
        );
        Ok(Database { inner, scheduler, bogus: OnceLock::new() })
    }

    /// Opens or creates a named index.
    pub fn open_index(&self, name: &str) -> Result<Index> {
        self.inner.check_open()?;
        let name_bytes = name.as_bytes();
        if let Some(id) = self.inner.names.lock().get(name_bytes).copied() {
            let tree = self.inner.tree_by_id(id)?;
            return Ok(Index { db: self.inner.clone(), tree });
        }

        let name_key = registry_name_key(name_bytes);
        if let Some(StoredValue::Inline(v)) =
            self.inner.registry.load(&self.inner.store, &name_key)?
        {
            if v.len() != 8 {
                return Err(BorealError::Corrupt("registry name entry malformed".into()));
            }
            let id = IndexId(u64::from_le_bytes(v[..].try_into().expect("len")));
            let tree = self.inner.tree_by_id(id)?;
            self.inner.names.lock().insert(name_bytes.to_vec(), id);
            return Ok(Index { db: self.inner.clone(), tree });
        }

        // Create it.
        let id = self.inner.random_index_id()?;
        let tree = Arc::new(Tree::new(id, PageId::NONE, false));
        {
            let _c = self.inner.commit_latch.shared();
            let entry = encode_tree_entry(PageId::NONE, 0, name_bytes);
            self.inner.registry.store(
                &self.inner.store,
                &registry_id_key(id),
                NewValue::Bytes(&entry),
            )?;
            self.inner.registry.store(
                &self.inner.store,
                &name_key,
                NewValue::Bytes(&id.0.to_le_bytes()),
            )?;
            if self.inner.redo.is_enabled() {
                self.inner.redo.append(&RedoOp::Store {
                    index: IndexId::REGISTRY,
                    key: registry_id_key(id),
                    value: Some(entry),
                });
                self.inner.redo.append(&RedoOp::Store {
                    index: IndexId::REGISTRY,
                    key: name_key,
                    value: Some(id.0.to_le_bytes().to_vec()),
                });
            }
        }
        self.inner.open_trees.lock().insert(id.0, tree.clone());
        self.inner.names.lock().insert(name_bytes.to_vec(), id);
        Ok(Index { db: self.inner.clone(), tree })
    }

    /// Creates an unnamed temporary tree: no redo, reclaimed at recovery.
    pub fn new_temp_tree(&self) -> Result<Index> {
        self.inner.check_open()?;
        let id = self.inner.random_index_id()?;
        let tree = Arc::new(Tree::new(id, PageId::NONE, true));
        {
            let _c = self.inner.commit_latch.shared();
            let entry = encode_tree_entry(PageId::NONE, FLAG_TEMPORARY, &[]);
            self.inner.registry.store(
                &self.inner.store,
                &registry_id_key(id),
                NewValue::Bytes(&entry),
            )?;
        }
        self.inner.open_trees.lock().insert(id.0, tree.clone());
        Ok(Index { db: self.inner.clone(), tree })
    }

    /// Renames an index.
    pub fn rename_index(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.inner.check_open()?;
        let old_key = registry_name_key(old_name.as_bytes());
        let id = match self.inner.registry.load(&self.inner.store, &old_key)? {
            Some(StoredValue::Inline(v)) if v.len() == 8 => {
                IndexId(u64::from_le_bytes(v[..].try_into().expect("len")))
            }
            _ => return Err(BorealError::IndexNotFound(old_name.to_string())),
        };
        {
            let _c = self.inner.commit_latch.shared();
            let id_key = registry_id_key(id);
            let (root, flags) = match self.inner.registry.load(&self.inner.store, &id_key)? {
                Some(StoredValue::Inline(e)) => {
                    let (root, flags, _) = decode_tree_entry(&e)?;
                    (root, flags)
                }
                _ => (PageId::NONE, 0),
            };
            let entry = encode_tree_entry(root, flags, new_name.as_bytes());
            self.inner
                .registry
                .store(&self.inner.store, &id_key, NewValue::Bytes(&entry))?;
            self.inner
                .registry
                .store(&self.inner.store, &old_key, NewValue::Remove)?;
            self.inner.registry.store(
                &self.inner.store,
                &registry_name_key(new_name.as_bytes()),
                NewValue::Bytes(&id.0.to_le_bytes()),
            )?;
            if self.inner.redo.is_enabled() {
                self.inner.redo.append(&RedoOp::RenameIndex {
                    index: id,
                    new_name: new_name.as_bytes().to_vec(),
                });
            }
        }
        let mut names = self.inner.names.lock();
        names.remove(old_name.as_bytes());
        names.insert(new_name.as_bytes().to_vec(), id);
        Ok(())
    }

    /// Deletes an index and frees all its pages.
    pub fn delete_index(&self, name: &str) -> Result<()> {
        self.inner.check_open()?;
        let name_key = registry_name_key(name.as_bytes());
        let id = match self.inner.registry.load(&self.inner.store, &name_key)? {
            Some(StoredValue::Inline(v)) if v.len() == 8 => {
                IndexId(u64::from_le_bytes(v[..].try_into().expect("len")))
            }
            _ => return Err(BorealError::IndexNotFound(name.to_string())),
        };
        let tree = self.inner.tree_by_id(id)?;
        {
            let _c = self.inner.commit_latch.shared();
            if self.inner.redo.is_enabled() {
                self.inner
                    .redo
                    .append(&RedoOp::DeleteIndex { txn: TxnId::UNASSIGNED, index: id });
            }
            tree.delete_all(&self.inner.store)?;
        }
        self.inner.remove_index_entry_inner(id)?;
        Ok(())
    }

    /// Begins a transaction with the configured defaults.
    pub fn begin_txn(&self) -> Transaction {
        Transaction::new(
            self.inner.clone(),
            self.inner.config.durability_mode,
            LockMode::default(),
            self.inner.config.lock_timeout.as_nanos() as i64,
        )
    }

    /// Begins a transaction with explicit modes.
    pub fn begin_txn_with(&self, durability: DurabilityMode, lock_mode: LockMode) -> Transaction {
        Transaction::new(
            self.inner.clone(),
            durability,
            lock_mode,
            self.inner.config.lock_timeout.as_nanos() as i64,
        )
    }

    /// The shared "no transaction" instance: no locks, no undo, no redo.
    pub fn bogus(&self) -> &Transaction {
        self.bogus
            .get_or_init(|| Transaction::new_bogus(self.inner.clone()))
    }

    /// Runs a checkpoint now.
    pub fn checkpoint(&self) -> Result<()> {
        checkpoint::checkpoint(&self.inner)
    }

    /// Streams a consistent snapshot into `sink` without blocking writers.
    /// Returns the number of pages written.
    pub fn begin_snapshot(&self, sink: &mut dyn Write) -> Result<u64> {
        self.inner.check_open()?;
        snapshot::write_snapshot(&self.inner, sink)
    }

    /// Restores a snapshot stream into a fresh database location and opens
    /// it.
    pub fn restore_from_snapshot(config: DbConfig, stream: &mut dyn Read) -> Result<Database> {
        let path = config
            .data_file()
            .ok_or_else(|| BorealError::InvalidArgument("restore requires a base file".into()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let target = FilePageArray::open(&path, config.page_size, config.fsync_enabled)?;
        pagearray::restore_from_snapshot(&target, stream)?;
        target.sync(true)?;
        drop(target);
        Database::open(config)
    }

    /// True once a critical write failure has panicked the database.
    pub fn is_panicked(&self) -> bool {
        self.inner.life.lock().panicked.is_some()
    }

    /// Closes cleanly: pending commits release, a final checkpoint runs,
    /// and blocked operations observe a closed failure.
    pub fn close(&self) -> Result<()> {
        if self.inner.life.lock().closed.is_some() {
            return Ok(());
        }
        self.scheduler.shutdown();
        let _ = self.inner.redo.sync();
        self.inner.release_pending()?;
        let result = checkpoint::checkpoint(&self.inner);
        self.inner.life.lock().closed = Some("database closed".to_string());
        let _ = self.inner.redo.close();
        self.inner.locks.interrupt_all();
        result
    }

    /// Stops background work without checkpointing or flushing, leaving
    /// the files exactly as a crash would. For recovery testing.
    pub fn close_abruptly(&self) {
        self.scheduler.shutdown();
        self.inner.life.lock().closed = Some("simulated crash".to_string());
        self.inner.locks.interrupt_all();
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn schedule_flusher(scheduler: &Arc<Scheduler>, weak: Weak<DbInner>) {
    let sched = scheduler.clone();
    scheduler.schedule(Duration::from_millis(100), move || {
        if let Some(db) = weak.upgrade() {
            if db.life.lock().closed.is_none() {
                let _ = db.redo.sync();
                let _ = db.release_pending();
                // An oversized redo tail forces an early checkpoint.
                let behind = {
                    let meta = db.header_meta.lock();
                    db.redo.end_pos().saturating_sub(meta.last_checkpoint_pos)
                };
                if behind > db.config.checkpoint_size_threshold {
                    let _ = checkpoint::checkpoint(&db);
                }
                schedule_flusher(&sched, Arc::downgrade(&db));
            }
        }
    });
}

fn schedule_checkpointer(scheduler: &Arc<Scheduler>, weak: Weak<DbInner>, interval: Duration) {
    let sched = scheduler.clone();
    scheduler.schedule(interval, move || {
        if let Some(db) = weak.upgrade() {
            if db.life.lock().closed.is_none() {
                if let Err(e) = checkpoint::checkpoint(&db) {
                    error!(error = %e, "periodic checkpoint failed");
                }
                schedule_checkpointer(&sched, Arc::downgrade(&db), interval);
            }
        }
    });
}

/// A named or temporary B-tree index.
pub struct Index {
    db: Arc<DbInner>,
    tree: Arc<Tree>,
}

impl Index {
    pub fn id(&self) -> IndexId {
        self.tree.id
    }

    /// A cursor bound to the given transaction.
    pub fn cursor<'t>(&self, txn: &'t Transaction) -> Cursor<'t> {
        Cursor::new(self.db.clone(), self.tree.clone(), txn)
    }

    /// Stores a value; None deletes the entry.
    pub fn store(&self, txn: &Transaction, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let mut cursor = self.cursor(txn);
        cursor.position_for_store(key);
        cursor.store(value)
    }

    /// Loads a value under the transaction's lock mode.
    pub fn load(&self, txn: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut cursor = self.cursor(txn);
        cursor.find(key)?;
        Ok(cursor.value().map(|v| v.to_vec()))
    }

    /// Deletes an entry.
    pub fn delete(&self, txn: &Transaction, key: &[u8]) -> Result<()> {
        self.store(txn, key, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mem_db() -> Database {
        let mut config = DbConfig::in_memory();
        config.checkpoint_interval = None;
        Database::open(config).unwrap()
    }

    fn disk_config(dir: &std::path::Path) -> DbConfig {
        let mut config = DbConfig::new(dir.join("base"));
        config.page_size = 512;
        config.fsync_enabled = false;
        config.checkpoint_interval = None;
        config
    }

    #[test]
    fn test_store_load_commit_in_memory() {
        let db = mem_db();
        let ix = db.open_index("test").unwrap();
        let txn = db.begin_txn();
        ix.store(&txn, b"k1", Some(b"v1")).unwrap();
        assert_eq!(ix.load(&txn, b"k1").unwrap().unwrap(), b"v1");
        txn.commit().unwrap();

        let txn2 = db.begin_txn();
        assert_eq!(ix.load(&txn2, b"k1").unwrap().unwrap(), b"v1");
        txn2.commit().unwrap();
    }

    #[test]
    fn test_rollback_restores_prior_value() {
        let db = mem_db();
        let ix = db.open_index("test").unwrap();

        let txn = db.begin_txn();
        ix.store(&txn, b"k", Some(b"v1")).unwrap();
        txn.commit().unwrap();

        let txn2 = db.begin_txn();
        ix.store(&txn2, b"k", Some(b"v2")).unwrap();
        assert_eq!(ix.load(&txn2, b"k").unwrap().unwrap(), b"v2");
        txn2.reset().unwrap();

        let txn3 = db.begin_txn();
        assert_eq!(ix.load(&txn3, b"k").unwrap().unwrap(), b"v1");
        txn3.commit().unwrap();
    }

    #[test]
    fn test_rollback_of_insert_removes_entry() {
        let db = mem_db();
        let ix = db.open_index("test").unwrap();
        let txn = db.begin_txn();
        ix.store(&txn, b"fresh", Some(b"v")).unwrap();
        txn.reset().unwrap();
        let txn2 = db.begin_txn();
        assert!(ix.load(&txn2, b"fresh").unwrap().is_none());
        txn2.commit().unwrap();
    }

    #[test]
    fn test_delete_ghost_reclaimed_after_commit() {
        let db = mem_db();
        let ix = db.open_index("test").unwrap();
        let txn = db.begin_txn();
        ix.store(&txn, b"k", Some(b"v")).unwrap();
        txn.commit().unwrap();

        let txn2 = db.begin_txn();
        ix.delete(&txn2, b"k").unwrap();
        txn2.commit().unwrap();

        let txn3 = db.begin_txn();
        assert!(ix.load(&txn3, b"k").unwrap().is_none());
        txn3.commit().unwrap();
    }

    #[test]
    fn test_uncommitted_not_visible_to_others() {
        let db = mem_db();
        let ix = db.open_index("test").unwrap();
        let writer = db.begin_txn();
        ix.store(&writer, b"k", Some(b"secret")).unwrap();

        // A reader in read-committed mode blocks on the row lock; with a
        // zero timeout it fails instead of seeing the uncommitted value.
        let reader = db.begin_txn_with(DurabilityMode::Sync, LockMode::ReadCommitted);
        reader.set_lock_timeout_nanos(0);
        let got = ix.load(&reader, b"k");
        assert!(matches!(got, Err(BorealError::LockTimeout)));

        // Read-uncommitted sees it without locking.
        let dirty = db.begin_txn_with(DurabilityMode::Sync, LockMode::ReadUncommitted);
        assert_eq!(ix.load(&dirty, b"k").unwrap().unwrap(), b"secret");
        writer.reset().unwrap();
    }

    #[test]
    fn test_durability_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open(disk_config(dir.path())).unwrap();
            let ix = db.open_index("persist").unwrap();
            let txn = db.begin_txn();
            ix.store(&txn, b"k1", Some(b"v1")).unwrap();
            txn.commit().unwrap();
            db.close().unwrap();
        }
        {
            let db = Database::open(disk_config(dir.path())).unwrap();
            let ix = db.open_index("persist").unwrap();
            let txn = db.begin_txn();
            assert_eq!(ix.load(&txn, b"k1").unwrap().unwrap(), b"v1");
            txn.commit().unwrap();
        }
    }

    #[test]
    fn test_crash_recovery_replays_redo() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open(disk_config(dir.path())).unwrap();
            let ix = db.open_index("wal").unwrap();
            let txn = db.begin_txn();
            ix.store(&txn, b"committed", Some(b"yes")).unwrap();
            txn.commit().unwrap();

            // A second transaction never commits.
            let txn2 = db.begin_txn();
            ix.store(&txn2, b"uncommitted", Some(b"no")).unwrap();

            db.close_abruptly();
            std::mem::forget(txn2);
        }
        {
            let db = Database::open(disk_config(dir.path())).unwrap();
            let ix = db.open_index("wal").unwrap();
            let txn = db.begin_txn();
            assert_eq!(ix.load(&txn, b"committed").unwrap().unwrap(), b"yes");
            assert!(ix.load(&txn, b"uncommitted").unwrap().is_none());
            txn.commit().unwrap();
        }
    }

    #[test]
    fn test_crash_rolls_back_overwrite() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open(disk_config(dir.path())).unwrap();
            let ix = db.open_index("wal").unwrap();
            let txn = db.begin_txn();
            ix.store(&txn, b"k", Some(b"v1")).unwrap();
            txn.commit().unwrap();

            let txn2 = db.begin_txn();
            ix.store(&txn2, b"k", Some(b"v2")).unwrap();
            db.close_abruptly();
            std::mem::forget(txn2);
        }
        {
            let db = Database::open(disk_config(dir.path())).unwrap();
            let ix = db.open_index("wal").unwrap();
            let txn = db.begin_txn();
            assert_eq!(ix.load(&txn, b"k").unwrap().unwrap(), b"v1");
            txn.commit().unwrap();
        }
    }

    #[test]
    fn test_nested_scopes() {
        let db = mem_db();
        let ix = db.open_index("scopes").unwrap();
        let txn = db.begin_txn();
        ix.store(&txn, b"outer", Some(b"1")).unwrap();
        txn.enter().unwrap();
        ix.store(&txn, b"inner", Some(b"2")).unwrap();
        txn.exit().unwrap();
        ix.store(&txn, b"outer2", Some(b"3")).unwrap();
        txn.commit().unwrap();

        let check = db.begin_txn();
        assert!(ix.load(&check, b"outer").unwrap().is_some());
        assert!(ix.load(&check, b"inner").unwrap().is_none());
        assert!(ix.load(&check, b"outer2").unwrap().is_some());
        check.commit().unwrap();
    }

    #[test]
    fn test_nested_scope_commit_folds_into_parent() {
        let db = mem_db();
        let ix = db.open_index("scopes").unwrap();
        let txn = db.begin_txn();
        txn.enter().unwrap();
        ix.store(&txn, b"kept", Some(b"v")).unwrap();
        txn.commit().unwrap(); // scope commit
        txn.reset().unwrap(); // whole transaction rolls back

        let check = db.begin_txn();
        assert!(ix.load(&check, b"kept").unwrap().is_none());
        check.commit().unwrap();
    }

    #[test]
    fn test_bogus_transaction_writes_directly() {
        let db = mem_db();
        let ix = db.open_index("bogus").unwrap();
        let bogus = db.bogus();
        ix.store(bogus, b"k", Some(b"v")).unwrap();
        assert_eq!(ix.load(bogus, b"k").unwrap().unwrap(), b"v");
        // Commit and reset are no-ops.
        bogus.commit().unwrap();
        bogus.reset().unwrap();
        assert_eq!(ix.load(bogus, b"k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn test_cursor_iteration_ordered() {
        let db = mem_db();
        let ix = db.open_index("iter").unwrap();
        let txn = db.begin_txn();
        for k in [3u8, 1, 4, 1, 5, 9, 2, 6] {
            ix.store(&txn, &[k], Some(&[k])).unwrap();
        }
        txn.commit().unwrap();

        let read = db.begin_txn();
        let mut cursor = ix.cursor(&read);
        cursor.first().unwrap();
        let mut keys = Vec::new();
        while let Some(k) = cursor.key() {
            keys.push(k.to_vec());
            cursor.next().unwrap();
        }
        assert_eq!(keys, vec![vec![1], vec![2], vec![3], vec![4], vec![5], vec![6], vec![9]]);
        read.commit().unwrap();
    }

    #[test]
    fn test_cursor_skip_with_limit() {
        let db = mem_db();
        let ix = db.open_index("skip").unwrap();
        let txn = db.begin_txn();
        for k in 0..10u8 {
            ix.store(&txn, &[k], Some(b"v")).unwrap();
        }
        txn.commit().unwrap();

        let read = db.begin_txn();
        let mut cursor = ix.cursor(&read);
        cursor.first().unwrap();
        let moved = cursor.skip(5, Some(&[3]), true).unwrap();
        assert!(moved <= 3);
        read.commit().unwrap();
    }

    #[test]
    fn test_fragmented_value_roundtrip_via_cursor() {
        let db = mem_db();
        let ix = db.open_index("big").unwrap();
        let txn = db.begin_txn();
        let mut cursor = ix.cursor(&txn);
        cursor.position_for_store(b"big");

        // Write 200 KiB in 8 KiB chunks through the positional API.
        let chunk: Vec<u8> = (0..8192).map(|i| (i % 241) as u8).collect();
        for n in 0..25u64 {
            cursor.value_write(n * 8192, &chunk).unwrap();
        }
        assert_eq!(cursor.value_length().unwrap(), Some(25 * 8192));
        txn.commit().unwrap();

        let read = db.begin_txn();
        let mut cursor = ix.cursor(&read);
        cursor.find(b"big").unwrap();
        let mut out = vec![0u8; 8192];
        for n in 0..25u64 {
            let got = cursor.value_read(n * 8192, &mut out).unwrap();
            assert_eq!(got, 8192);
            assert_eq!(out, chunk, "chunk {}", n);
        }
        read.commit().unwrap();
    }

    #[test]
    fn test_value_set_length_truncates() {
        let db = mem_db();
        let ix = db.open_index("trunc").unwrap();
        let txn = db.begin_txn();
        let mut cursor = ix.cursor(&txn);
        cursor.position_for_store(b"v");
        let data: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        cursor.value_write(0, &data).unwrap();
        cursor.value_set_length(5_000).unwrap();
        assert_eq!(cursor.value_length().unwrap(), Some(5_000));
        let mut out = vec![0u8; 5_000];
        assert_eq!(cursor.value_read(0, &mut out).unwrap(), 5_000);
        assert_eq!(out, &data[..5_000]);
        txn.commit().unwrap();
    }

    #[test]
    fn test_positional_rollback_restores_bytes() {
        let db = mem_db();
        let ix = db.open_index("posrb").unwrap();

        let txn = db.begin_txn();
        let mut cursor = ix.cursor(&txn);
        cursor.position_for_store(b"v");
        cursor.value_write(0, &[1u8; 1000]).unwrap();
        drop(cursor);
        txn.commit().unwrap();

        let txn2 = db.begin_txn();
        let mut cursor = ix.cursor(&txn2);
        cursor.position_for_store(b"v");
        cursor.value_write(100, &[9u8; 200]).unwrap();
        cursor.value_set_length(300).unwrap();
        drop(cursor);
        txn2.reset().unwrap();

        let check = db.begin_txn();
        let mut cursor = ix.cursor(&check);
        cursor.find(b"v").unwrap();
        assert_eq!(cursor.value_length().unwrap(), Some(1000));
        let mut out = vec![0u8; 1000];
        cursor.value_read(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 1));
        check.commit().unwrap();
    }

    #[test]
    fn test_deadlock_detection_between_transactions() {
        let db = Arc::new(mem_db());
        let ix = Arc::new(db.open_index("dead").unwrap());
        {
            let setup = db.begin_txn();
            ix.store(&setup, b"k1", Some(b"a")).unwrap();
            ix.store(&setup, b"k2", Some(b"b")).unwrap();
            setup.commit().unwrap();
        }

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let mut handles = Vec::new();
        for (mine, theirs) in [(b"k1", b"k2"), (b"k2", b"k1")] {
            let db = db.clone();
            let ix = ix.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                let txn = db.begin_txn();
                txn.set_lock_timeout_nanos(500_000_000);
                ix.store(&txn, mine, Some(b"x")).unwrap();
                barrier.wait();
                let r = ix.store(&txn, theirs, Some(b"y"));
                let _ = txn.reset();
                r
            }));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let failures: Vec<_> = results.iter().filter(|r| r.is_err()).collect();
        assert!(!failures.is_empty(), "at least one side must fail");
        assert!(results.iter().any(|r| {
            matches!(r, Err(BorealError::Deadlock)) || matches!(r, Err(BorealError::LockTimeout))
        }));
    }

    #[test]
    fn test_no_sync_commit_releases_in_background() {
        let dir = tempdir().unwrap();
        let db = Database::open(disk_config(dir.path())).unwrap();
        let ix = db.open_index("nosync").unwrap();

        let txn = db.begin_txn_with(DurabilityMode::NoSync, LockMode::RepeatableRead);
        ix.store(&txn, b"k", Some(b"v")).unwrap();
        txn.commit().unwrap();

        // The lock is held by the pending record until the background
        // flusher syncs; force it now.
        db.inner.redo.sync().unwrap();
        db.inner.release_pending().unwrap();

        let read = db.begin_txn();
        assert_eq!(ix.load(&read, b"k").unwrap().unwrap(), b"v");
        read.commit().unwrap();
        db.close().unwrap();
    }

    #[test]
    fn test_temp_tree_reclaimed_on_reopen() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open(disk_config(dir.path())).unwrap();
            let temp = db.new_temp_tree().unwrap();
            let txn = db.begin_txn();
            temp.store(&txn, b"scratch", Some(b"data")).unwrap();
            txn.commit().unwrap();
            db.close().unwrap();
        }
        {
            let db = Database::open(disk_config(dir.path())).unwrap();
            // The registry carries no temporary entries after recovery.
            let found = db
                .inner
                .registry
                .seek(&db.inner.store, &[0x00], crate::tree::Seek::Gt)
                .unwrap();
            if let Some((key, StoredValue::Inline(entry))) = found {
                if key.first() == Some(&0x00) {
                    let (_, flags, _) = decode_tree_entry(&entry).unwrap();
                    assert_eq!(flags & FLAG_TEMPORARY, 0);
                }
            }
        }
    }

    #[test]
    fn test_index_rename_and_delete() {
        let db = mem_db();
        let ix = db.open_index("before").unwrap();
        let txn = db.begin_txn();
        ix.store(&txn, b"k", Some(b"v")).unwrap();
        txn.commit().unwrap();

        db.rename_index("before", "after").unwrap();
        let renamed = db.open_index("after").unwrap();
        assert_eq!(renamed.id(), ix.id());

        db.delete_index("after").unwrap();
        assert!(db.open_index("after").unwrap().id() != ix.id());
    }

    #[test]
    fn test_snapshot_restore_matches_origin() {
        let dir = tempdir().unwrap();
        let db = Database::open(disk_config(dir.path())).unwrap();
        let ix = db.open_index("snap").unwrap();
        let txn = db.begin_txn();
        for k in 0..200u64 {
            ix.store(&txn, &k.to_be_bytes(), Some(format!("value-{}", k).as_bytes()))
                .unwrap();
        }
        txn.commit().unwrap();

        let mut stream = Vec::new();
        db.begin_snapshot(&mut stream).unwrap();

        // Mutations after the snapshot must not leak into the restore.
        let txn = db.begin_txn();
        for k in 0..100u64 {
            ix.store(&txn, &k.to_be_bytes(), Some(b"mutated")).unwrap();
        }
        for k in 100..150u64 {
            ix.delete(&txn, &k.to_be_bytes()).unwrap();
        }
        txn.commit().unwrap();

        let restore_dir = tempdir().unwrap();
        let restored =
            Database::restore_from_snapshot(disk_config(restore_dir.path()), &mut &stream[..])
                .unwrap();
        let rix = restored.open_index("snap").unwrap();
        let rtxn = restored.begin_txn();
        for k in 0..200u64 {
            assert_eq!(
                rix.load(&rtxn, &k.to_be_bytes()).unwrap().unwrap(),
                format!("value-{}", k).into_bytes(),
                "key {}",
                k
            );
        }
        rtxn.commit().unwrap();
        db.close().unwrap();
        restored.close().unwrap();
    }

    #[test]
    fn test_operations_fail_after_close() {
        let db = mem_db();
        let ix = db.open_index("closed").unwrap();
        db.close().unwrap();
        let txn = Transaction::new_bogus(db.inner.clone());
        let got = ix.load(&txn, b"k");
        let _ = got.expect_err("reads must fail after close");
        assert!(db.open_index("another").is_err());
    }
}
