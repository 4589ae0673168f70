//! Crash recovery.
//!
//! Recovery starts from the newest durable header: the checkpointed tree
//! roots, allocator state, and transaction table. Redo records are
//! replayed forward from the checkpoint position, re-performing each
//! logical operation without acquiring locks; the redo stream is the
//! single source of ordering. Replayed transactional operations rebuild
//! undo logs, so transactions that never reach a commit record roll back
//! exactly as live ones would. Afterwards the fragmented trash is drained
//! and temporary trees are reclaimed.
//!
//! The procedure is idempotent: replaying the same state twice produces
//! the same logical result, because stores overwrite, deletes of absent
//! keys are no-ops, and trash draining only frees what exists.

use boreal_common::error::Result;
use boreal_common::types::{IndexId, PageId, TxnId};
use boreal_redo::op::RedoOp;
use boreal_redo::reader::{RedoReader, RedoVisitor};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::checkpoint::read_txn_table;
use crate::cursor::{apply_with_undo, PositionalOp};
use crate::db::{
    decode_tree_entry, registry_id_key, registry_name_key, resolve_tree, FLAG_TEMPORARY,
};
use crate::fragment;
use crate::header::DbHeader;
use crate::store::PageStore;
use crate::trash::FragmentedTrash;
use crate::tree::{NewValue, Seek, StoredValue, Tree};
use crate::txn::{apply_undo_op, store_with_undo, UndoContext};
use crate::undo::{UndoLog, UndoOp};

/// Everything replay needs; a database that is not yet open for business.
pub(crate) struct RecoverCtx<'a> {
    pub store: &'a PageStore,
    pub registry: &'a Arc<Tree>,
    pub trash: &'a FragmentedTrash,
    pub trees: Mutex<HashMap<u64, Arc<Tree>>>,
}

impl UndoContext for RecoverCtx<'_> {
    fn store(&self) -> &PageStore {
        self.store
    }

    fn trash(&self) -> &FragmentedTrash {
        self.trash
    }

    fn tree_by_id(&self, id: IndexId) -> Result<Arc<Tree>> {
        resolve_tree(self.store, self.registry, &self.trees, id)
    }

    fn remove_index_entry(&self, id: IndexId) -> Result<()> {
        remove_registry_entry(self.store, self.registry, id)?;
        self.trees.lock().remove(&id.0);
        Ok(())
    }
}

pub(crate) fn remove_registry_entry(
    store: &PageStore,
    registry: &Arc<Tree>,
    id: IndexId,
) -> Result<()> {
    let id_key = registry_id_key(id);
    if let Some(StoredValue::Inline(entry)) = registry.load(store, &id_key)? {
        let (_, _, name) = decode_tree_entry(&entry)?;
        if !name.is_empty() {
            registry.store(store, &registry_name_key(&name), NewValue::Remove)?;
        }
    }
    registry.store(store, &id_key, NewValue::Remove)?;
    Ok(())
}

struct RecTxn {
    undo: UndoLog,
    flags: u8,
    /// Undo marks of open nested scopes.
    scopes: Vec<usize>,
}

impl RecTxn {
    fn new() -> Self {
        Self { undo: UndoLog::new(), flags: 0, scopes: Vec::new() }
    }
}

/// Applies replayed redo operations against the recovering trees.
pub(crate) struct RedoApplier<'a> {
    ctx: &'a RecoverCtx<'a>,
    txns: HashMap<u64, RecTxn>,
    /// Registered cursors: id to (index, current key).
    cursors: HashMap<u64, (IndexId, Option<Vec<u8>>)>,
    pub max_txn_id: u64,
}

impl<'a> RedoApplier<'a> {
    pub(crate) fn new(ctx: &'a RecoverCtx<'a>) -> Self {
        Self {
            ctx,
            txns: HashMap::new(),
            cursors: HashMap::new(),
            max_txn_id: 0,
        }
    }

    /// Seeds a transaction from the checkpoint's transaction table.
    pub(crate) fn seed_txn(&mut self, txn_id: TxnId, undo: UndoLog) {
        self.max_txn_id = self.max_txn_id.max(txn_id.0);
        self.txns.insert(txn_id.0, RecTxn { undo, flags: 0, scopes: Vec::new() });
    }

    fn txn(&mut self, id: TxnId) -> &mut RecTxn {
        self.max_txn_id = self.max_txn_id.max(id.0);
        self.txns.entry(id.0).or_insert_with(RecTxn::new)
    }

    fn apply_txn_store(
        &mut self,
        txn_id: TxnId,
        index: IndexId,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        let tree = self.ctx.tree_by_id(index)?;
        let rec = self
            .txns
            .entry(txn_id.0)
            .or_insert_with(RecTxn::new);
        self.max_txn_id = self.max_txn_id.max(txn_id.0);
        store_with_undo(
            self.ctx.store,
            self.ctx.trash,
            &tree,
            &mut rec.undo,
            txn_id,
            key,
            value,
            &mut rec.flags,
        )?;
        Ok(())
    }

    /// Commits a transaction: tombstones left by its deletes are removed
    /// and its trash is freed.
    fn commit_txn(&mut self, txn_id: TxnId) -> Result<()> {
        let Some(mut rec) = self.txns.remove(&txn_id.0) else {
            return Ok(());
        };
        while let Some(op) = rec.undo.pop(self.ctx.store)? {
            match op {
                UndoOp::Undelete { index, key, .. }
                | UndoOp::UndeleteFragmented { index, key, .. } => {
                    let tree = self.ctx.tree_by_id(index)?;
                    tree.delete_ghost(self.ctx.store, &key)?;
                }
                _ => {}
            }
        }
        rec.undo.truncate(self.ctx.store);
        self.ctx.trash.empty(self.ctx.store, txn_id)?;
        Ok(())
    }

    fn rollback_txn(&mut self, txn_id: TxnId) -> Result<()> {
        let Some(mut rec) = self.txns.remove(&txn_id.0) else {
            return Ok(());
        };
        while let Some(op) = rec.undo.pop(self.ctx.store)? {
            apply_undo_op(self.ctx, txn_id, op)?;
        }
        rec.undo.truncate(self.ctx.store);
        Ok(())
    }

    fn rollback_scope(&mut self, txn_id: TxnId) -> Result<()> {
        let store = self.ctx.store;
        let Some(rec) = self.txns.get_mut(&txn_id.0) else {
            return Ok(());
        };
        let mark = rec.scopes.pop().unwrap_or(0);
        let mut ops = Vec::new();
        while rec.undo.len() > mark {
            match rec.undo.pop(store)? {
                Some(op) => ops.push(op),
                None => break,
            }
        }
        for op in ops {
            apply_undo_op(self.ctx, txn_id, op)?;
        }
        Ok(())
    }

    /// Rolls back every transaction that never committed.
    pub(crate) fn rollback_unfinished(&mut self) -> Result<usize> {
        let ids: Vec<u64> = self.txns.keys().copied().collect();
        let count = ids.len();
        for id in ids {
            debug!(txn = id, "rolling back unfinished transaction");
            self.rollback_txn(TxnId(id))?;
        }
        Ok(count)
    }

    fn cursor_op(
        &mut self,
        cursor: u64,
        txn_id: TxnId,
        op: PositionalOp<'_>,
    ) -> Result<()> {
        let Some((index, Some(key))) = self.cursors.get(&cursor).cloned() else {
            warn!(cursor, "cursor value operation without a position");
            return Ok(());
        };
        let tree = self.ctx.tree_by_id(index)?;
        let rec = self.txns.entry(txn_id.0).or_insert_with(RecTxn::new);
        self.max_txn_id = self.max_txn_id.max(txn_id.0);
        apply_with_undo(self.ctx.store, &tree, &mut rec.undo, &key, &op)?;
        rec.flags |= crate::txn::HAS_COMMIT;
        Ok(())
    }
}

impl RedoVisitor for RedoApplier<'_> {
    fn apply(&mut self, _position: u64, op: RedoOp) -> Result<bool> {
        use RedoOp::*;
        match op {
            Timestamp { .. } | EndFile => {}
            Reset => {
                let ids: Vec<u64> = self.txns.keys().copied().collect();
                for id in ids {
                    self.rollback_txn(TxnId(id))?;
                }
            }

            Store { index, key, value } | StoreNoLock { index, key, value } => {
                let tree = self.ctx.tree_by_id(index)?;
                let new = match &value {
                    Some(v) => NewValue::Bytes(v),
                    None => NewValue::Remove,
                };
                if let Some(StoredValue::Fragmented(desc)) =
                    tree.store(self.ctx.store, &key, new)?
                {
                    fragment::free(self.ctx.store, &desc)?;
                }
            }
            RenameIndex { index, new_name } => {
                rename_registry_entry(self.ctx.store, self.ctx.registry, index, &new_name)?;
            }
            DeleteIndex { txn: _, index } => {
                let tree = self.ctx.tree_by_id(index)?;
                tree.delete_all(self.ctx.store)?;
                self.ctx.remove_index_entry(index)?;
            }

            TxnEnter { txn } => {
                let store = self.ctx.store;
                let rec = self.txn(txn);
                rec.undo.push(store, UndoOp::ScopeEnter)?;
                let len = rec.undo.len();
                rec.scopes.push(len);
            }
            TxnStore { txn, index, key, value } => {
                self.apply_txn_store(txn, index, &key, value.as_deref())?;
            }
            TxnDelete { txn, index, key } => {
                self.apply_txn_store(txn, index, &key, None)?;
            }
            TxnRollback { txn } => self.rollback_scope(txn)?,
            TxnRollbackFinal { txn } => self.rollback_txn(txn)?,
            TxnCommit { txn } => {
                if let Some(rec) = self.txns.get_mut(&txn.0) {
                    rec.scopes.pop();
                }
            }
            TxnCommitFinal { txn } => self.commit_txn(txn)?,
            TxnStoreCommit { txn, index, key, value } => {
                self.apply_txn_store(txn, index, &key, value.as_deref())?;
                if let Some(rec) = self.txns.get_mut(&txn.0) {
                    rec.scopes.pop();
                }
            }
            TxnStoreCommitFinal { txn, index, key, value } => {
                self.apply_txn_store(txn, index, &key, value.as_deref())?;
                self.commit_txn(txn)?;
            }
            TxnPrepare { txn } => {
                let rec = self.txn(txn);
                rec.flags |= crate::txn::HAS_PREPARE;
            }
            TxnCustom { .. } | TxnCustomLock { .. } => {
                // No custom handler is installed; the records are ordering
                // markers only.
            }

            CursorRegister { cursor, index } => {
                self.cursors.insert(cursor, (index, None));
            }
            CursorUnregister { cursor } => {
                self.cursors.remove(&cursor);
            }
            CursorFind { cursor, txn: _, key } => {
                if let Some(slot) = self.cursors.get_mut(&cursor) {
                    slot.1 = Some(key);
                }
            }
            CursorStore { cursor, txn, key, value } => {
                let index = match self.cursors.get_mut(&cursor) {
                    Some(slot) => {
                        slot.1 = Some(key.clone());
                        slot.0
                    }
                    None => {
                        warn!(cursor, "store through unregistered cursor");
                        return Ok(true);
                    }
                };
                self.apply_txn_store(txn, index, &key, value.as_deref())?;
            }
            CursorStoreCommit { cursor, txn, key, value } => {
                let index = match self.cursors.get_mut(&cursor) {
                    Some(slot) => {
                        slot.1 = Some(key.clone());
                        slot.0
                    }
                    None => return Ok(true),
                };
                self.apply_txn_store(txn, index, &key, value.as_deref())?;
                if let Some(rec) = self.txns.get_mut(&txn.0) {
                    rec.scopes.pop();
                }
            }
            CursorStoreCommitFinal { cursor, txn, key, value } => {
                let index = match self.cursors.get_mut(&cursor) {
                    Some(slot) => {
                        slot.1 = Some(key.clone());
                        slot.0
                    }
                    None => return Ok(true),
                };
                self.apply_txn_store(txn, index, &key, value.as_deref())?;
                self.commit_txn(txn)?;
            }
            CursorDelete { cursor, txn, key } => {
                let index = match self.cursors.get_mut(&cursor) {
                    Some(slot) => {
                        slot.1 = Some(key.clone());
                        slot.0
                    }
                    None => return Ok(true),
                };
                self.apply_txn_store(txn, index, &key, None)?;
            }
            CursorValueSetLength { cursor, txn, length } => {
                self.cursor_op(cursor, txn, PositionalOp::SetLength { len: length })?;
            }
            CursorValueWrite { cursor, txn, pos, data } => {
                self.cursor_op(cursor, txn, PositionalOp::Write { pos, data: &data })?;
            }
            CursorValueClear { cursor, txn, pos, length } => {
                self.cursor_op(cursor, txn, PositionalOp::Clear { pos, len: length })?;
            }

            LockShared { .. } | LockUpgradable { .. } | LockExclusive { .. } => {
                // Replay is single-stream; locks are not acquired.
            }
        }
        Ok(true)
    }
}

fn rename_registry_entry(
    store: &PageStore,
    registry: &Arc<Tree>,
    id: IndexId,
    new_name: &[u8],
) -> Result<()> {
    let id_key = registry_id_key(id);
    let Some(StoredValue::Inline(entry)) = registry.load(store, &id_key)? else {
        return Ok(());
    };
    let (root, flags, old_name) = decode_tree_entry(&entry)?;
    if !old_name.is_empty() {
        registry.store(store, &registry_name_key(&old_name), NewValue::Remove)?;
    }
    let new_entry = crate::db::encode_tree_entry(root, flags, new_name);
    registry.store(store, &id_key, NewValue::Bytes(&new_entry))?;
    registry.store(
        store,
        &registry_name_key(new_name),
        NewValue::Bytes(&id.0.to_le_bytes()),
    )?;
    Ok(())
}

/// Outcome of a completed recovery.
pub(crate) struct RecoveryOutcome {
    pub max_txn_id: u64,
    pub replayed_to: u64,
    pub next_redo_file: u64,
}

/// Runs the full recovery procedure against a durable database.
pub(crate) fn recover(
    ctx: &RecoverCtx<'_>,
    header: &DbHeader,
    redo_path_of: impl Fn(u64) -> PathBuf,
) -> Result<RecoveryOutcome> {
    let mut applier = RedoApplier::new(ctx);

    // Transactions in flight at the checkpoint, with their persisted undo.
    let (table, table_pages) = read_txn_table(ctx.store, header.txn_table_page)?;
    for (txn_id, undo_head) in table {
        let undo = UndoLog::load(ctx.store, undo_head)?;
        applier.seed_txn(txn_id, undo);
    }

    let replayed_to = RedoReader::replay(
        &redo_path_of,
        header.redo_file_num,
        header.redo_position,
        &mut applier,
    )?;

    let rolled_back = applier.rollback_unfinished()?;
    let reclaimed = ctx.trash.empty_all(ctx.store)?;
    let temp_trees = drop_temporary_trees(ctx)?;

    // The consumed transaction table is garbage now.
    for page in table_pages {
        ctx.store.allocator.free(page);
    }

    // The next redo file follows everything replay observed.
    let mut next_redo_file = header.redo_file_num;
    while redo_path_of(next_redo_file).exists() {
        next_redo_file += 1;
    }

    info!(
        replayed_to,
        rolled_back,
        reclaimed,
        temp_trees,
        max_txn = applier.max_txn_id.max(header.highest_txn_id.0),
        "recovery complete"
    );
    Ok(RecoveryOutcome {
        max_txn_id: applier.max_txn_id.max(header.highest_txn_id.0),
        replayed_to,
        next_redo_file,
    })
}

/// Deletes trees flagged temporary; their contents never survive a
/// restart.
fn drop_temporary_trees(ctx: &RecoverCtx<'_>) -> Result<usize> {
    let mut dropped = 0;
    let mut at: Vec<u8> = vec![0x00];
    loop {
        let found = ctx.registry.seek(ctx.store, &at, Seek::Gt)?;
        let Some((key, StoredValue::Inline(entry))) = found else {
            break;
        };
        if key.first() != Some(&0x00) {
            break;
        }
        at = key.clone();
        let (root, flags, _name) = decode_tree_entry(&entry)?;
        if flags & FLAG_TEMPORARY != 0 {
            let id = IndexId(u64::from_be_bytes(
                key[1..9].try_into().map_err(|_| {
                    boreal_common::error::BorealError::Corrupt(
                        "registry id key malformed".to_string(),
                    )
                })?,
            ));
            let tree = Arc::new(Tree::new(id, root, true));
            tree.delete_all(ctx.store)?;
            ctx.registry.store(ctx.store, &key, NewValue::Remove)?;
            dropped += 1;
        }
    }
    Ok(dropped)
}
