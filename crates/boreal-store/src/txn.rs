//! Transactions.
//!
//! A transaction coordinates row locks, the undo log, redo records, and a
//! durability mode behind a nested scope stack. Entering a scope saves the
//! lock mode, timeout, and undo position; exiting rolls back just that
//! scope. Committing at depth folds the scope into its parent; committing
//! at the top performs the durable commit.
//!
//! The bogus transaction stands in for "no transaction": no locks, no
//! undo, no redo. It is used for internal bookkeeping such as trash
//! drainage and recovery.
//!
//! A failed operation that already changed state borks the transaction;
//! further operations fail until reset, which rolls back and revives it.
//! If the rollback itself fails, the locks are discarded and the database
//! is panicked.

use boreal_common::error::{BorealError, Result};
use boreal_common::types::{DurabilityMode, IndexId, LockMode, TxnId};
use boreal_redo::op::RedoOp;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::db::DbInner;
use crate::fragment;
use crate::lock::{LockKey, LockOwner, LockResult};
use crate::pending::PendingTxn;
use crate::store::PageStore;
use crate::trash::FragmentedTrash;
use crate::tree::{NewValue, StoredValue, Tree};
use crate::undo::{UndoLog, UndoOp};

pub(crate) const HAS_COMMIT: u8 = 1;
pub(crate) const HAS_TRASH: u8 = 2;
pub(crate) const HAS_PREPARE: u8 = 4;

/// Why a transaction refuses further work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Borked {
    No,
    /// An operation failed mid-change; reset to recover.
    Invalid(String),
    /// The database closed underneath the transaction.
    Closed(String),
}

pub(crate) struct Scope {
    pub locks: Vec<LockKey>,
    pub undo_mark: usize,
    pub saved_lock_mode: LockMode,
    pub saved_timeout: i64,
}

pub(crate) struct TxnInner {
    pub id: TxnId,
    pub durability: DurabilityMode,
    pub lock_mode: LockMode,
    pub timeout_nanos: i64,
    pub owner: Arc<LockOwner>,
    pub scopes: Vec<Scope>,
    pub undo: Arc<Mutex<UndoLog>>,
    pub flags: u8,
    pub borked: Borked,
}

impl TxnInner {
    fn fresh_scope(lock_mode: LockMode, timeout: i64) -> Scope {
        Scope {
            locks: Vec::new(),
            undo_mark: 0,
            saved_lock_mode: lock_mode,
            saved_timeout: timeout,
        }
    }

    fn all_locks(&self) -> Vec<LockKey> {
        self.scopes.iter().flat_map(|s| s.locks.iter().cloned()).collect()
    }
}

/// A transaction bound to a database.
pub struct Transaction {
    pub(crate) db: Arc<DbInner>,
    pub(crate) inner: Mutex<TxnInner>,
    pub(crate) bogus: bool,
}

impl Transaction {
    pub(crate) fn new(
        db: Arc<DbInner>,
        durability: DurabilityMode,
        lock_mode: LockMode,
        timeout_nanos: i64,
    ) -> Self {
        let owner = db.locks.new_owner();
        Self {
            inner: Mutex::new(TxnInner {
                id: TxnId::UNASSIGNED,
                durability,
                lock_mode,
                timeout_nanos,
                owner,
                scopes: vec![TxnInner::fresh_scope(lock_mode, timeout_nanos)],
                undo: Arc::new(Mutex::new(UndoLog::new())),
                flags: 0,
                borked: Borked::No,
            }),
            db,
            bogus: false,
        }
    }

    pub(crate) fn new_bogus(db: Arc<DbInner>) -> Self {
        let owner = db.locks.new_owner();
        Self {
            inner: Mutex::new(TxnInner {
                id: TxnId::UNASSIGNED,
                durability: DurabilityMode::NoRedo,
                lock_mode: LockMode::Unsafe,
                timeout_nanos: 0,
                owner,
                scopes: vec![TxnInner::fresh_scope(LockMode::Unsafe, 0)],
                undo: Arc::new(Mutex::new(UndoLog::new())),
                flags: 0,
                borked: Borked::No,
            }),
            db,
            bogus: true,
        }
    }

    /// True for the shared "no transaction" instance.
    pub fn is_bogus(&self) -> bool {
        self.bogus
    }

    /// The assigned transaction id, or zero before the first logged write.
    pub fn id(&self) -> TxnId {
        self.inner.lock().id
    }

    pub fn lock_mode(&self) -> LockMode {
        self.inner.lock().lock_mode
    }

    pub fn set_lock_mode(&self, mode: LockMode) {
        self.inner.lock().lock_mode = mode;
    }

    pub fn durability_mode(&self) -> DurabilityMode {
        self.inner.lock().durability
    }

    pub fn set_durability_mode(&self, mode: DurabilityMode) {
        self.inner.lock().durability = mode;
    }

    /// Lock timeout in nanoseconds; negative waits forever, zero tries
    /// once.
    pub fn lock_timeout_nanos(&self) -> i64 {
        self.inner.lock().timeout_nanos
    }

    pub fn set_lock_timeout_nanos(&self, nanos: i64) {
        self.inner.lock().timeout_nanos = nanos;
    }

    /// Attaches a diagnostic label surfaced in deadlock reports.
    pub fn attach(&self, attachment: impl Into<String>) {
        let inner = self.inner.lock();
        *inner.owner.attachment.lock() = Some(attachment.into());
    }

    pub fn attachment(&self) -> Option<String> {
        self.inner.lock().owner.attachment.lock().clone()
    }

    pub fn is_borked(&self) -> bool {
        self.inner.lock().borked != Borked::No
    }

    /// Explicit shared lock on a key. The outcome is reported as a value.
    pub fn lock_shared(&self, index: IndexId, key: &[u8]) -> LockResult {
        let (owner, timeout) = {
            let inner = self.inner.lock();
            (inner.owner.clone(), inner.timeout_nanos)
        };
        let r = self.db.locks.lock_shared(&owner, index, key, timeout);
        self.track_lock(index, key, r);
        r
    }

    /// Explicit upgradable lock on a key.
    pub fn lock_upgradable(&self, index: IndexId, key: &[u8]) -> LockResult {
        let (owner, timeout) = {
            let inner = self.inner.lock();
            (inner.owner.clone(), inner.timeout_nanos)
        };
        let r = self.db.locks.lock_upgradable(&owner, index, key, timeout);
        self.track_lock(index, key, r);
        r
    }

    /// Explicit exclusive lock on a key.
    pub fn lock_exclusive(&self, index: IndexId, key: &[u8]) -> LockResult {
        let (owner, timeout) = {
            let inner = self.inner.lock();
            (inner.owner.clone(), inner.timeout_nanos)
        };
        let r = self.db.locks.lock_exclusive(&owner, index, key, timeout);
        self.track_lock(index, key, r);
        r
    }

    fn track_lock(&self, index: IndexId, key: &[u8], r: LockResult) {
        if r == LockResult::Acquired {
            let mut inner = self.inner.lock();
            inner
                .scopes
                .last_mut()
                .expect("scope stack empty")
                .locks
                .push((index, key.to_vec()));
        }
    }

    /// Pushes a nested scope.
    pub fn enter(&self) -> Result<()> {
        if self.bogus {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        self.check_usable(&inner)?;
        let mark = {
            let mut undo = inner.undo.lock();
            undo.push(&self.db.store, UndoOp::ScopeEnter)?;
            undo.len() - 1
        };
        let scope = Scope {
            locks: Vec::new(),
            undo_mark: mark,
            saved_lock_mode: inner.lock_mode,
            saved_timeout: inner.timeout_nanos,
        };
        inner.scopes.push(scope);
        if inner.id.is_assigned() && self.redo_enabled(&inner) {
            self.db.redo.append(&RedoOp::TxnEnter { txn: inner.id });
        }
        Ok(())
    }

    /// Rolls back and pops the current scope. At the top level this is the
    /// same as reset.
    pub fn exit(&self) -> Result<()> {
        if self.bogus {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.scopes.len() == 1 {
            drop(inner);
            return self.reset();
        }
        self.check_usable(&inner)?;
        let scope = inner.scopes.pop().expect("scope stack empty");
        let result = self.rollback_to(&mut inner, scope.undo_mark);
        for (index, key) in scope.locks.iter().rev() {
            let ghost = self.db.locks.unlock(&inner.owner, *index, key);
            if ghost {
                self.db.delete_ghost(*index, key)?;
            }
        }
        inner.lock_mode = scope.saved_lock_mode;
        inner.timeout_nanos = scope.saved_timeout;
        if inner.id.is_assigned() && self.redo_enabled(&inner) {
            self.db.redo.append(&RedoOp::TxnRollback { txn: inner.id });
        }
        result
    }

    /// Commits the current scope; at the top level, the whole transaction.
    pub fn commit(&self) -> Result<()> {
        if self.bogus {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        self.check_usable(&inner)?;

        if inner.scopes.len() > 1 {
            // Fold into the parent scope; changes and locks survive.
            let scope = inner.scopes.pop().expect("scope stack empty");
            inner.lock_mode = scope.saved_lock_mode;
            inner.timeout_nanos = scope.saved_timeout;
            inner
                .scopes
                .last_mut()
                .expect("scope stack empty")
                .locks
                .extend(scope.locks);
            inner.undo.lock().push(&self.db.store, UndoOp::ScopeCommit)?;
            if inner.id.is_assigned() && self.redo_enabled(&inner) {
                self.db.redo.append(&RedoOp::TxnCommit { txn: inner.id });
            }
            return Ok(());
        }

        if inner.flags & HAS_COMMIT == 0 {
            // Read-only: nothing durable to do.
            self.release_locks(&inner, &inner.all_locks())?;
            self.db.deregister_txn(inner.id);
            self.finish_reset(&mut inner);
            return Ok(());
        }

        if inner.id.is_assigned() && self.redo_enabled(&inner) {
            let pos = self.db.redo.append(&RedoOp::TxnCommitFinal { txn: inner.id });
            match inner.durability {
                DurabilityMode::Sync => {
                    if let Err(e) = self.db.redo.commit_sync(pos) {
                        inner.borked = Borked::Invalid(format!("commit sync failed: {}", e));
                        return Err(e);
                    }
                }
                DurabilityMode::NoSync | DurabilityMode::NoFlush => {
                    // Hand everything off; a background worker releases the
                    // locks once the commit record is durable.
                    let locks = inner.all_locks();
                    let undo = inner.undo.clone();
                    let pending = PendingTxn {
                        txn_id: inner.id,
                        owner: inner.owner.clone(),
                        commit_pos: pos,
                        locks,
                        undo,
                        has_trash: inner.flags & HAS_TRASH != 0,
                    };
                    self.db.pending.enqueue(pending);
                    inner.undo = Arc::new(Mutex::new(UndoLog::new()));
                    inner.owner = self.db.locks.new_owner();
                    self.finish_reset(&mut inner);
                    return Ok(());
                }
                DurabilityMode::NoRedo => unreachable!("redo disabled but enabled"),
            }
        }

        self.finish_commit(&mut inner)
    }

    /// Rolls the whole transaction back and returns it to a fresh, usable
    /// state. A borked transaction is revived; if its rollback fails, the
    /// locks are discarded and the database is panicked.
    pub fn reset(&self) -> Result<()> {
        if self.bogus {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let rollback = self.rollback_to(&mut inner, 0);
        if let Err(e) = rollback {
            let locks = inner.all_locks();
            for (index, key) in locks.iter().rev() {
                self.db.locks.unlock(&inner.owner, *index, key);
            }
            self.db.deregister_txn(inner.id);
            self.finish_reset(&mut inner);
            self.db.panic(format!("rollback failed: {}", e));
            return Err(e);
        }
        if inner.id.is_assigned() && self.redo_enabled(&inner) {
            self.db.redo.append(&RedoOp::TxnRollbackFinal { txn: inner.id });
        }
        let locks = inner.all_locks();
        self.release_locks(&inner, &locks)?;
        inner.undo.lock().truncate(&self.db.store);
        self.db.deregister_txn(inner.id);
        self.finish_reset(&mut inner);
        Ok(())
    }

    fn finish_commit(&self, inner: &mut TxnInner) -> Result<()> {
        // Mark the log so a crash between the durable commit record and
        // the truncate reads as a commit, not a rollback.
        inner.undo.lock().push(&self.db.store, UndoOp::ScopeCommit)?;
        let locks = inner.all_locks();
        self.release_locks(inner, &locks)?;
        inner.undo.lock().truncate(&self.db.store);
        if inner.flags & HAS_TRASH != 0 {
            self.db.trash.empty(&self.db.store, inner.id)?;
        }
        self.db.deregister_txn(inner.id);
        self.finish_reset(inner);
        Ok(())
    }

    fn release_locks(&self, inner: &TxnInner, locks: &[LockKey]) -> Result<()> {
        for (index, key) in locks {
            let ghost = self.db.locks.unlock(&inner.owner, *index, key);
            if ghost {
                self.db.delete_ghost(*index, key)?;
            }
        }
        Ok(())
    }

    fn finish_reset(&self, inner: &mut TxnInner) {
        inner.id = TxnId::UNASSIGNED;
        inner.flags = 0;
        inner.borked = Borked::No;
        let lock_mode = inner.scopes.first().map(|s| s.saved_lock_mode);
        let timeout = inner.scopes.first().map(|s| s.saved_timeout);
        if let (Some(m), Some(t)) = (lock_mode, timeout) {
            inner.lock_mode = m;
            inner.timeout_nanos = t;
        }
        let lm = inner.lock_mode;
        let to = inner.timeout_nanos;
        inner.scopes = vec![TxnInner::fresh_scope(lm, to)];
    }

    fn rollback_to(&self, inner: &mut TxnInner, mark: usize) -> Result<()> {
        // Latch before undo lock, matching the checkpointer's order.
        let _c = self.db.commit_latch.shared();
        let undo = inner.undo.clone();
        let mut undo = undo.lock();
        while undo.len() > mark {
            let Some(op) = undo.pop(&self.db.store)? else {
                break;
            };
            apply_undo_op(&*self.db, inner.id, op)?;
        }
        Ok(())
    }

    pub(crate) fn check_usable(&self, inner: &TxnInner) -> Result<()> {
        match &inner.borked {
            Borked::No => self.db.check_open(),
            Borked::Invalid(reason) => Err(BorealError::InvalidTransaction(reason.clone())),
            Borked::Closed(reason) => Err(BorealError::ClosedCause(reason.clone())),
        }
    }

    pub(crate) fn redo_enabled(&self, inner: &TxnInner) -> bool {
        inner.durability != DurabilityMode::NoRedo && self.db.redo.is_enabled()
    }

    /// Assigns the transaction id on first use and registers the undo log
    /// for checkpointing.
    pub(crate) fn ensure_id(&self, inner: &mut TxnInner) -> TxnId {
        if !inner.id.is_assigned() {
            inner.id = self.db.assign_txn_id();
            self.db.register_txn(inner.id, inner.undo.clone());
        }
        inner.id
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.bogus {
            return;
        }
        let needs_rollback = {
            let inner = self.inner.lock();
            inner.flags & HAS_COMMIT != 0
                || inner.scopes.iter().any(|s| !s.locks.is_empty())
                || !inner.undo.lock().is_empty()
        };
        if needs_rollback {
            let _ = self.reset();
        }
    }
}

/// Maps a failed acquisition onto the error a composite operation returns.
pub(crate) fn lock_failure(result: LockResult) -> BorealError {
    match result {
        LockResult::TimedOutLock => BorealError::LockTimeout,
        LockResult::Deadlock => BorealError::Deadlock,
        LockResult::Illegal => BorealError::IllegalUpgrade,
        LockResult::Interrupted => BorealError::LockInterrupted,
        other => BorealError::Internal(format!("unexpected lock result {:?}", other)),
    }
}

/// Context for applying undo records; implemented by the live database and
/// by the recovery harness.
pub(crate) trait UndoContext {
    fn store(&self) -> &PageStore;
    fn trash(&self) -> &FragmentedTrash;
    fn tree_by_id(&self, id: IndexId) -> Result<Arc<Tree>>;
    fn remove_index_entry(&self, id: IndexId) -> Result<()>;
}

/// Performs a store or ghost-delete with undo logging. Shared between the
/// live write path and redo replay. Returns true if a ghost tombstone was
/// placed.
pub(crate) fn store_with_undo(
    store: &PageStore,
    trash: &FragmentedTrash,
    tree: &Arc<Tree>,
    undo: &mut UndoLog,
    txn_id: TxnId,
    key: &[u8],
    value: Option<&[u8]>,
    flags: &mut u8,
) -> Result<bool> {
    let new = match value {
        Some(v) => NewValue::Bytes(v),
        None => NewValue::Ghost,
    };
    let old = tree.store(store, key, new)?;
    let mut ghosted = false;
    match old {
        None => {
            if value.is_some() {
                undo.push(store, UndoOp::Uninsert { index: tree.id, key: key.to_vec() })?;
            }
        }
        Some(StoredValue::Inline(old_value)) => {
            let op = if value.is_some() {
                UndoOp::Unupdate { index: tree.id, key: key.to_vec(), value: old_value }
            } else {
                ghosted = true;
                UndoOp::Undelete { index: tree.id, key: key.to_vec(), value: old_value }
            };
            undo.push(store, op)?;
        }
        Some(StoredValue::Fragmented(desc)) => {
            if value.is_none() {
                ghosted = true;
            }
            trash.add(store, undo, txn_id, tree.id, key, desc)?;
            *flags |= HAS_TRASH;
        }
        Some(StoredValue::Ghost) => {
            // Overwriting our own tombstone: undoing the overwrite deletes
            // the entry again; the earlier undo record restores the
            // original value.
            if value.is_some() {
                undo.push(store, UndoOp::Uninsert { index: tree.id, key: key.to_vec() })?;
            } else {
                ghosted = true;
            }
        }
    }
    Ok(ghosted)
}

/// Applies one undo record against the live trees.
pub(crate) fn apply_undo_op(
    ctx: &dyn UndoContext,
    txn_id: TxnId,
    op: UndoOp,
) -> Result<()> {
    let store = ctx.store();
    match op {
        UndoOp::ScopeEnter | UndoOp::ScopeCommit | UndoOp::Prepare | UndoOp::Custom { .. } => {
            Ok(())
        }
        UndoOp::Uninsert { index, key } => {
            let tree = ctx.tree_by_id(index)?;
            if let Some(StoredValue::Fragmented(desc)) =
                tree.store(store, &key, NewValue::Remove)?
            {
                fragment::free(store, &desc)?;
            }
            Ok(())
        }
        UndoOp::Unupdate { index, key, value } | UndoOp::Undelete { index, key, value } => {
            let tree = ctx.tree_by_id(index)?;
            if let Some(StoredValue::Fragmented(desc)) =
                tree.store(store, &key, NewValue::Bytes(&value))?
            {
                // The displaced value was written by this transaction.
                fragment::free(store, &desc)?;
            }
            Ok(())
        }
        UndoOp::UndeleteFragmented { index, key, trash_suffix } => {
            let tree = ctx.tree_by_id(index)?;
            ctx.trash().remove(store, txn_id, &tree, &key, &trash_suffix)
        }
        UndoOp::Unextend { index, key, old_length } => {
            let tree = ctx.tree_by_id(index)?;
            crate::cursor::raw_set_length(store, &tree, &key, old_length)
        }
        UndoOp::Unalloc { index, key, pos, length } => {
            let tree = ctx.tree_by_id(index)?;
            crate::cursor::raw_clear(store, &tree, &key, pos, length)
        }
        UndoOp::Unwrite { index, key, pos, old } => {
            let tree = ctx.tree_by_id(index)?;
            crate::cursor::raw_write(store, &tree, &key, pos, &old)
        }
        UndoOp::Uncreate { index } => ctx.remove_index_entry(index),
    }
}
