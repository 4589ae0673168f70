//! Transaction-bound cursors.
//!
//! A cursor holds a position (a key) in one index and performs reads,
//! writes, and positional value access under its transaction's lock mode.
//! Between operations no latches are held; a locality hint remembers the
//! last leaf visited and is revalidated by version before reuse, falling
//! back to a fresh descent when the leaf changed underneath.
//!
//! Registered cursors obtain a durable id so positional value operations
//! can be redo-logged as compact cursor records instead of full key and
//! value images.

use boreal_common::error::{BorealError, Result};
use boreal_common::types::{DurabilityMode, LockMode};
use boreal_redo::op::RedoOp;
use std::sync::Arc;

use crate::cache::NodeRef;
use crate::db::DbInner;
use crate::fragment;
use crate::lock::LockResult;
use crate::node::{KeyRef, ValueRef};
use crate::store::PageStore;
use crate::tree::{NewValue, Seek, StoredValue, Tree};
use crate::txn::{lock_failure, store_with_undo, Transaction, HAS_COMMIT};
use crate::undo::UndoOp;

/// Loaded state of the cursor's value.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ValueState {
    /// Nothing loaded; autoload was off.
    NotLoaded,
    /// The row does not exist (or is a ghost).
    Absent,
    Loaded(Vec<u8>),
}

struct LeafHint {
    node: NodeRef,
    version: u64,
}

/// An ordered cursor over one index.
pub struct Cursor<'t> {
    txn: &'t Transaction,
    tree: Arc<Tree>,
    db: Arc<DbInner>,
    key: Option<Vec<u8>>,
    value: ValueState,
    autoload: bool,
    register_id: Option<u64>,
    /// Key last named in a cursor redo record, to elide repeat finds.
    redo_key: Option<Vec<u8>>,
    hint: Option<LeafHint>,
}

impl<'t> Cursor<'t> {
    pub(crate) fn new(db: Arc<DbInner>, tree: Arc<Tree>, txn: &'t Transaction) -> Self {
        Self {
            txn,
            tree,
            db,
            key: None,
            value: ValueState::NotLoaded,
            autoload: true,
            register_id: None,
            redo_key: None,
            hint: None,
        }
    }

    /// The current key, or None when unpositioned.
    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// The loaded value: None when the row is absent or not loaded.
    pub fn value(&self) -> Option<&[u8]> {
        match &self.value {
            ValueState::Loaded(v) => Some(v),
            _ => None,
        }
    }

    /// True if the last load found a row.
    pub fn exists(&self) -> Result<bool> {
        match &self.value {
            ValueState::Loaded(_) => Ok(true),
            ValueState::Absent => Ok(false),
            ValueState::NotLoaded => {
                let Some(key) = self.key.clone() else {
                    return Ok(false);
                };
                Ok(matches!(
                    self.tree.load(&self.db.store, &key)?,
                    Some(StoredValue::Inline(_)) | Some(StoredValue::Fragmented(_))
                ))
            }
        }
    }

    /// Controls whether positioning operations load the value.
    pub fn autoload(&mut self, on: bool) {
        self.autoload = on;
    }

    /// Positions the cursor without locking or loading; the following
    /// store acquires the exclusive lock itself.
    pub(crate) fn position_for_store(&mut self, key: &[u8]) {
        self.key = Some(key.to_vec());
        self.value = ValueState::NotLoaded;
    }

    /// Positions on an exact key. The value state tells whether the row
    /// exists.
    pub fn find(&mut self, key: &[u8]) -> Result<()> {
        self.key = Some(key.to_vec());
        self.read_lock_current()?;
        self.load_current()
    }

    /// Positions on an exact key, first probing the last leaf visited
    /// before descending from the root.
    pub fn find_nearby(&mut self, key: &[u8]) -> Result<()> {
        // Probe the hinted leaf; `Some(state)` means the key's presence was
        // decided there, `None` means a full descent is required.
        let probed: Option<Option<StoredValue>> = match &self.hint {
            None => None,
            Some(hint) => {
                let guard = hint.node.read();
                if guard.version != hint.version
                    || !guard.is_leaf()
                    || guard.num_entries() == 0
                {
                    None
                } else {
                    let first = guard.key_at(0)?;
                    let last = guard.key_at(guard.num_entries() - 1)?;
                    let within = matches!((first, last), (KeyRef::Inline(f), KeyRef::Inline(l))
                        if f <= key && key <= l);
                    if !within {
                        None
                    } else {
                        let mut bail = |_: &[u8]| -> Result<Vec<u8>> {
                            Err(BorealError::Internal(
                                "fragmented key in hinted leaf".into(),
                            ))
                        };
                        match guard.search(key, &mut bail) {
                            Ok(Ok(pos)) => {
                                Some(Some(StoredValue::from_value_ref(guard.value_at(pos)?)))
                            }
                            Ok(Err(_)) => Some(None),
                            Err(_) => None,
                        }
                    }
                }
            }
        };

        let Some(state) = probed else {
            return self.find(key);
        };
        self.key = Some(key.to_vec());
        self.read_lock_current()?;
        // A lock wait may have let the leaf change; the version check
        // catches it and falls back to a fresh descent.
        let still_valid = match &self.hint {
            Some(hint) => hint.node.read().version == hint.version,
            None => false,
        };
        if still_valid {
            self.value = match state {
                Some(v) => self.loaded_state(&v)?,
                None => ValueState::Absent,
            };
            Ok(())
        } else {
            self.load_current()
        }
    }

    /// Positions on the first entry at or above `key`.
    pub fn find_ge(&mut self, key: &[u8]) -> Result<()> {
        self.seek_to(key, Seek::Ge)
    }

    /// Positions on the first entry above `key`.
    pub fn find_gt(&mut self, key: &[u8]) -> Result<()> {
        self.seek_to(key, Seek::Gt)
    }

    /// Positions on the last entry at or below `key`.
    pub fn find_le(&mut self, key: &[u8]) -> Result<()> {
        self.seek_to(key, Seek::Le)
    }

    /// Positions on the last entry below `key`.
    pub fn find_lt(&mut self, key: &[u8]) -> Result<()> {
        self.seek_to(key, Seek::Lt)
    }

    /// Positions on the first entry of the index.
    pub fn first(&mut self) -> Result<()> {
        match self.tree.first(&self.db.store)? {
            None => {
                self.key = None;
                self.value = ValueState::Absent;
                Ok(())
            }
            Some((key, _)) => {
                self.key = Some(key);
                self.read_lock_current()?;
                self.load_current()?;
                self.skip_ghost_forward()
            }
        }
    }

    /// Positions on the last entry of the index.
    pub fn last(&mut self) -> Result<()> {
        match self.tree.last(&self.db.store)? {
            None => {
                self.key = None;
                self.value = ValueState::Absent;
                Ok(())
            }
            Some((key, _)) => {
                self.key = Some(key);
                self.read_lock_current()?;
                self.load_current()?;
                self.skip_ghost_backward()
            }
        }
    }

    /// Moves to the next entry. Unpositioned cursors start at the first.
    pub fn next(&mut self) -> Result<()> {
        let Some(key) = self.key.clone() else {
            return self.first();
        };
        self.seek_to(&key, Seek::Gt)?;
        self.skip_ghost_forward()
    }

    /// Moves to the previous entry. Unpositioned cursors start at the
    /// last.
    pub fn previous(&mut self) -> Result<()> {
        let Some(key) = self.key.clone() else {
            return self.last();
        };
        self.seek_to(&key, Seek::Lt)?;
        self.skip_ghost_backward()
    }

    /// Moves `amount` entries forward (positive) or backward (negative).
    /// Returns the entries actually advanced.
    pub fn move_by(&mut self, amount: i64) -> Result<i64> {
        self.skip(amount, None, false)
    }

    /// Moves up to `n` entries in the direction of its sign, stopping
    /// early when a limit key is crossed. Returns the entries advanced.
    pub fn skip(&mut self, n: i64, limit: Option<&[u8]>, inclusive: bool) -> Result<i64> {
        let mut moved = 0i64;
        if n > 0 {
            for _ in 0..n {
                self.next()?;
                let Some(key) = self.key.clone() else { break };
                if let Some(limit) = limit {
                    let past = if inclusive {
                        key.as_slice() > limit
                    } else {
                        key.as_slice() >= limit
                    };
                    if past {
                        self.key = None;
                        self.value = ValueState::Absent;
                        break;
                    }
                }
                moved += 1;
            }
        } else {
            for _ in 0..(-n) {
                self.previous()?;
                let Some(key) = self.key.clone() else { break };
                if let Some(limit) = limit {
                    let past = if inclusive {
                        key.as_slice() < limit
                    } else {
                        key.as_slice() <= limit
                    };
                    if past {
                        self.key = None;
                        self.value = ValueState::Absent;
                        break;
                    }
                }
                moved -= 1;
            }
        }
        Ok(moved)
    }

    /// Reloads the value at the current position.
    pub fn load(&mut self) -> Result<Option<Vec<u8>>> {
        self.read_lock_current()?;
        self.load_current()?;
        Ok(self.value().map(|v| v.to_vec()))
    }

    /// Stores a value at the current key; None deletes the entry.
    pub fn store(&mut self, value: Option<&[u8]>) -> Result<()> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| BorealError::InvalidArgument("cursor is unpositioned".into()))?;
        self.write_value(&key, value)?;
        self.value = match value {
            Some(v) => ValueState::Loaded(v.to_vec()),
            None => ValueState::Absent,
        };
        self.hint = None;
        Ok(())
    }

    /// Deletes the entry at the current key.
    pub fn delete(&mut self) -> Result<()> {
        self.store(None)
    }

    /// Stores a value and commits the transaction.
    pub fn commit(&mut self, value: Option<&[u8]>) -> Result<()> {
        self.store(value)?;
        self.txn.commit()
    }

    /// Length of the value at the current key, or None for no row.
    pub fn value_length(&self) -> Result<Option<u64>> {
        let Some(key) = &self.key else {
            return Ok(None);
        };
        match self.tree.load(&self.db.store, key)? {
            Some(v) => v.length(),
            None => Ok(None),
        }
    }

    /// Reads `buf.len()` bytes of the value at byte offset `pos`. Short
    /// reads past the end of the value are truncated; the count read is
    /// returned.
    pub fn value_read(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let Some(key) = &self.key else {
            return Err(BorealError::InvalidArgument("cursor is unpositioned".into()));
        };
        raw_read(&self.db.store, &self.tree, key, pos, buf)
    }

    /// Writes bytes at a byte offset, extending the value as needed.
    pub fn value_write(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| BorealError::InvalidArgument("cursor is unpositioned".into()))?;
        self.positional_op(&key, PositionalOp::Write { pos, data })
    }

    /// Zeroes a byte range of the value.
    pub fn value_clear(&mut self, pos: u64, len: u64) -> Result<()> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| BorealError::InvalidArgument("cursor is unpositioned".into()))?;
        self.positional_op(&key, PositionalOp::Clear { pos, len })
    }

    /// Sets the value length, extending sparsely or truncating.
    pub fn value_set_length(&mut self, len: u64) -> Result<()> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| BorealError::InvalidArgument("cursor is unpositioned".into()))?;
        self.positional_op(&key, PositionalOp::SetLength { len })
    }

    /// Obtains a durable cursor id so positional operations are logged as
    /// cursor records.
    pub fn register(&mut self) -> Result<()> {
        if self.register_id.is_some() {
            return Ok(());
        }
        let id = self.db.assign_cursor_id();
        self.register_id = Some(id);
        self.redo_key = None;
        if self.redo_on() {
            self.db
                .redo
                .append(&RedoOp::CursorRegister { cursor: id, index: self.tree.id });
        }
        Ok(())
    }

    /// Clears the position and releases the registration.
    pub fn reset(&mut self) {
        if let Some(id) = self.register_id.take() {
            if self.redo_on() {
                self.db.redo.append(&RedoOp::CursorUnregister { cursor: id });
            }
        }
        self.key = None;
        self.value = ValueState::NotLoaded;
        self.redo_key = None;
        self.hint = None;
    }

    /// An independent cursor at the same position, bound to the same
    /// transaction.
    pub fn copy(&self) -> Cursor<'t> {
        Cursor {
            txn: self.txn,
            tree: self.tree.clone(),
            db: self.db.clone(),
            key: self.key.clone(),
            value: self.value.clone(),
            autoload: self.autoload,
            register_id: None,
            redo_key: None,
            hint: None,
        }
    }

    fn redo_on(&self) -> bool {
        if self.tree.temporary || !self.db.redo.is_enabled() || self.txn.bogus {
            return false;
        }
        let inner = self.txn.inner.lock();
        inner.durability != DurabilityMode::NoRedo
    }

    fn seek_to(&mut self, key: &[u8], seek: Seek) -> Result<()> {
        match self.tree.seek(&self.db.store, key, seek)? {
            None => {
                self.key = None;
                self.value = ValueState::Absent;
                Ok(())
            }
            Some((found, _)) => {
                self.key = Some(found);
                self.read_lock_current()?;
                self.load_current()
            }
        }
    }

    /// Iterates forward past ghost entries the load resolved to absent.
    fn skip_ghost_forward(&mut self) -> Result<()> {
        while self.key.is_some() && self.value == ValueState::Absent {
            let key = self.key.clone().expect("checked");
            match self.tree.seek(&self.db.store, &key, Seek::Gt)? {
                None => {
                    self.key = None;
                    return Ok(());
                }
                Some((found, _)) => {
                    self.key = Some(found);
                    self.read_lock_current()?;
                    self.load_current()?;
                }
            }
        }
        Ok(())
    }

    fn skip_ghost_backward(&mut self) -> Result<()> {
        while self.key.is_some() && self.value == ValueState::Absent {
            let key = self.key.clone().expect("checked");
            match self.tree.seek(&self.db.store, &key, Seek::Lt)? {
                None => {
                    self.key = None;
                    return Ok(());
                }
                Some((found, _)) => {
                    self.key = Some(found);
                    self.read_lock_current()?;
                    self.load_current()?;
                }
            }
        }
        Ok(())
    }

    /// Acquires the read lock the transaction's mode calls for.
    fn read_lock_current(&mut self) -> Result<()> {
        self.db.check_open()?;
        let Some(key) = self.key.clone() else {
            return Ok(());
        };
        if self.txn.bogus {
            return Ok(());
        }
        let (mode, owner, timeout) = {
            let inner = self.txn.inner.lock();
            self.txn.check_usable(&inner)?;
            (inner.lock_mode, inner.owner.clone(), inner.timeout_nanos)
        };
        let result = match mode {
            LockMode::Unsafe | LockMode::ReadUncommitted => return Ok(()),
            LockMode::ReadCommitted => {
                let r = self.db.locks.lock_shared(&owner, self.tree.id, &key, timeout);
                if r == LockResult::Acquired {
                    // Released as soon as the read completes; remember it
                    // only for this operation.
                    self.db.locks.unlock(&owner, self.tree.id, &key);
                }
                r
            }
            LockMode::RepeatableRead => {
                let r = self.db.locks.lock_shared(&owner, self.tree.id, &key, timeout);
                self.track(&key, r);
                r
            }
            LockMode::UpgradableRead => {
                let r = self.db.locks.lock_upgradable(&owner, self.tree.id, &key, timeout);
                self.track(&key, r);
                r
            }
        };
        if result.is_failure() {
            return Err(lock_failure(result));
        }
        Ok(())
    }

    fn track(&self, key: &[u8], r: LockResult) {
        if r == LockResult::Acquired {
            let mut inner = self.txn.inner.lock();
            inner
                .scopes
                .last_mut()
                .expect("scope stack empty")
                .locks
                .push((self.tree.id, key.to_vec()));
        }
    }

    fn loaded_state(&self, value: &StoredValue) -> Result<ValueState> {
        if !self.autoload {
            return Ok(match value {
                StoredValue::Ghost => ValueState::Absent,
                _ => ValueState::NotLoaded,
            });
        }
        Ok(match value.materialize(&self.db.store)? {
            Some(v) => ValueState::Loaded(v),
            None => ValueState::Absent,
        })
    }

    fn load_current(&mut self) -> Result<()> {
        let Some(key) = self.key.clone() else {
            self.value = ValueState::Absent;
            return Ok(());
        };
        self.value = match self.tree.load(&self.db.store, &key)? {
            None => ValueState::Absent,
            Some(v) => self.loaded_state(&v)?,
        };
        self.refresh_hint(&key)?;
        Ok(())
    }

    /// Caches the leaf now holding the key for find_nearby.
    fn refresh_hint(&mut self, _key: &[u8]) -> Result<()> {
        // The hint is only useful for inline keys within one leaf; the
        // root node works as a degenerate hint for single-node trees.
        let root = self.tree.root_id();
        if root.is_some() {
            if let Ok(node) = self.db.store.node(root) {
                if node.read().is_leaf() {
                    let version = node.read().version;
                    self.hint = Some(LeafHint { node, version });
                    return Ok(());
                }
            }
        }
        self.hint = None;
        Ok(())
    }

    /// The transactional write path shared by store and delete.
    fn write_value(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        self.db.check_open()?;

        if self.txn.bogus || self.txn.lock_mode() == LockMode::Unsafe {
            // Unsafe writes are physical and unrecoverable.
            let _c = self.db.commit_latch.shared();
            let new = match value {
                Some(v) => NewValue::Bytes(v),
                None => NewValue::Remove,
            };
            if let Some(StoredValue::Fragmented(desc)) =
                self.tree.store(&self.db.store, key, new)?
            {
                fragment::free(&self.db.store, &desc)?;
            }
            if self.redo_on() && !self.txn.bogus {
                self.db.redo.append(&RedoOp::StoreNoLock {
                    index: self.tree.id,
                    key: key.to_vec(),
                    value: value.map(|v| v.to_vec()),
                });
            }
            return Ok(());
        }

        let mut inner = self.txn.inner.lock();
        self.txn.check_usable(&inner)?;

        let r = self
            .db
            .locks
            .lock_exclusive(&inner.owner, self.tree.id, key, inner.timeout_nanos);
        if r.is_failure() {
            return Err(lock_failure(r));
        }
        if r == LockResult::Acquired {
            inner
                .scopes
                .last_mut()
                .expect("scope stack empty")
                .locks
                .push((self.tree.id, key.to_vec()));
        }
        let txn_id = self.txn.ensure_id(&mut inner);

        let result = (|| -> Result<()> {
            let _c = self.db.commit_latch.shared();
            let undo_arc = inner.undo.clone();
            let mut undo = undo_arc.lock();
            let mut flags = inner.flags;
            let ghosted = store_with_undo(
                &self.db.store,
                &self.db.trash,
                &self.tree,
                &mut undo,
                txn_id,
                key,
                value,
                &mut flags,
            )?;
            drop(undo);
            inner.flags = flags | HAS_COMMIT;
            if ghosted {
                self.db.locks.set_ghost(&inner.owner, self.tree.id, key);
            }
            if self.tree_redo_on(&inner) {
                let op = match (self.register_id, value) {
                    (Some(cursor), Some(v)) => RedoOp::CursorStore {
                        cursor,
                        txn: txn_id,
                        key: key.to_vec(),
                        value: Some(v.to_vec()),
                    },
                    (Some(cursor), None) => RedoOp::CursorDelete {
                        cursor,
                        txn: txn_id,
                        key: key.to_vec(),
                    },
                    (None, Some(v)) => RedoOp::TxnStore {
                        txn: txn_id,
                        index: self.tree.id,
                        key: key.to_vec(),
                        value: Some(v.to_vec()),
                    },
                    (None, None) => RedoOp::TxnDelete {
                        txn: txn_id,
                        index: self.tree.id,
                        key: key.to_vec(),
                    },
                };
                self.db.redo.append(&op);
            }
            Ok(())
        })();

        if let Err(e) = result {
            if !e.is_pre_state() {
                inner.borked =
                    crate::txn::Borked::Invalid(format!("store failed: {}", e));
            }
            return Err(e);
        }
        Ok(())
    }

    fn tree_redo_on(&self, inner: &crate::txn::TxnInner) -> bool {
        !self.tree.temporary
            && inner.durability != DurabilityMode::NoRedo
            && self.db.redo.is_enabled()
    }

    /// A positional value operation with locking, undo, and redo.
    fn positional_op(&mut self, key: &[u8], op: PositionalOp<'_>) -> Result<()> {
        self.db.check_open()?;

        if self.txn.bogus || self.txn.lock_mode() == LockMode::Unsafe {
            let _c = self.db.commit_latch.shared();
            return apply_raw(&self.db.store, &self.tree, key, &op);
        }

        let mut inner = self.txn.inner.lock();
        self.txn.check_usable(&inner)?;
        let r = self
            .db
            .locks
            .lock_exclusive(&inner.owner, self.tree.id, key, inner.timeout_nanos);
        if r.is_failure() {
            return Err(lock_failure(r));
        }
        if r == LockResult::Acquired {
            inner
                .scopes
                .last_mut()
                .expect("scope stack empty")
                .locks
                .push((self.tree.id, key.to_vec()));
        }
        let txn_id = self.txn.ensure_id(&mut inner);

        let result = (|| -> Result<()> {
            let _c = self.db.commit_latch.shared();
            let undo_arc = inner.undo.clone();
            let mut undo = undo_arc.lock();
            apply_with_undo(&self.db.store, &self.tree, &mut undo, key, &op)?;
            drop(undo);
            inner.flags |= HAS_COMMIT;
            if self.tree_redo_on(&inner) {
                if let Some(cursor) = self.register_id {
                    if self.redo_key.as_deref() != Some(key) {
                        self.db.redo.append(&RedoOp::CursorFind {
                            cursor,
                            txn: txn_id,
                            key: key.to_vec(),
                        });
                        self.redo_key = Some(key.to_vec());
                    }
                    let rop = match op {
                        PositionalOp::Write { pos, data } => RedoOp::CursorValueWrite {
                            cursor,
                            txn: txn_id,
                            pos,
                            data: data.to_vec(),
                        },
                        PositionalOp::Clear { pos, len } => RedoOp::CursorValueClear {
                            cursor,
                            txn: txn_id,
                            pos,
                            length: len,
                        },
                        PositionalOp::SetLength { len } => RedoOp::CursorValueSetLength {
                            cursor,
                            txn: txn_id,
                            length: len,
                        },
                    };
                    self.db.redo.append(&rop);
                } else {
                    // Without a registered cursor the full value image is
                    // logged.
                    let value = raw_read_all(&self.db.store, &self.tree, key)?;
                    self.db.redo.append(&RedoOp::TxnStore {
                        txn: txn_id,
                        index: self.tree.id,
                        key: key.to_vec(),
                        value,
                    });
                }
            }
            Ok(())
        })();

        if let Err(e) = result {
            if !e.is_pre_state() {
                inner.borked =
                    crate::txn::Borked::Invalid(format!("value operation failed: {}", e));
            }
            return Err(e);
        }
        self.value = ValueState::NotLoaded;
        self.hint = None;
        Ok(())
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        self.reset();
    }
}

pub(crate) enum PositionalOp<'a> {
    Write { pos: u64, data: &'a [u8] },
    Clear { pos: u64, len: u64 },
    SetLength { len: u64 },
}

/// Inline values longer than this are converted to fragmented form by
/// positional operations.
fn inline_limit(store: &PageStore) -> usize {
    crate::node::max_leaf_entry_len(store.page_size) / 2
}

impl StoredValue {
    pub(crate) fn from_value_ref(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Inline(b) => StoredValue::Inline(b.to_vec()),
            ValueRef::Fragmented(d) => StoredValue::Fragmented(d.to_vec()),
            ValueRef::Ghost => StoredValue::Ghost,
        }
    }
}

/// Reads part of a value; zero-filled past sparse pages, truncated at the
/// value's end.
pub(crate) fn raw_read(
    store: &PageStore,
    tree: &Tree,
    key: &[u8],
    pos: u64,
    buf: &mut [u8],
) -> Result<usize> {
    match tree.load(store, key)? {
        None | Some(StoredValue::Ghost) => Ok(0),
        Some(StoredValue::Inline(v)) => {
            if pos >= v.len() as u64 {
                return Ok(0);
            }
            let n = buf.len().min(v.len() - pos as usize);
            buf[..n].copy_from_slice(&v[pos as usize..pos as usize + n]);
            Ok(n)
        }
        Some(StoredValue::Fragmented(desc)) => {
            let full = fragment::length(&desc)?;
            if pos >= full {
                return Ok(0);
            }
            let n = buf.len().min((full - pos) as usize);
            fragment::read(store, &desc, pos, &mut buf[..n])?;
            Ok(n)
        }
    }
}

fn raw_read_all(store: &PageStore, tree: &Tree, key: &[u8]) -> Result<Option<Vec<u8>>> {
    match tree.load(store, key)? {
        None | Some(StoredValue::Ghost) => Ok(None),
        Some(v) => v.materialize(store),
    }
}

/// Writes bytes at an offset without undo logging; used by rollback.
pub(crate) fn raw_write(
    store: &PageStore,
    tree: &Tree,
    key: &[u8],
    pos: u64,
    data: &[u8],
) -> Result<()> {
    apply_raw(store, tree, key, &PositionalOp::Write { pos, data })
}

/// Zeroes a range without undo logging; used by rollback.
pub(crate) fn raw_clear(
    store: &PageStore,
    tree: &Tree,
    key: &[u8],
    pos: u64,
    len: u64,
) -> Result<()> {
    apply_raw(store, tree, key, &PositionalOp::Clear { pos, len })
}

/// Sets the value length without undo logging; used by rollback.
pub(crate) fn raw_set_length(
    store: &PageStore,
    tree: &Tree,
    key: &[u8],
    len: u64,
) -> Result<()> {
    apply_raw(store, tree, key, &PositionalOp::SetLength { len })
}

fn current_value(store: &PageStore, tree: &Tree, key: &[u8]) -> Result<Option<StoredValue>> {
    Ok(match tree.load(store, key)? {
        Some(StoredValue::Ghost) | None => None,
        other => other,
    })
}

/// Applies a positional operation, converting between inline and
/// fragmented representations as thresholds are crossed.
pub(crate) fn apply_raw(
    store: &PageStore,
    tree: &Tree,
    key: &[u8],
    op: &PositionalOp<'_>,
) -> Result<()> {
    let current = current_value(store, tree, key)?;
    match op {
        PositionalOp::Write { pos, data } => {
            let end = pos + data.len() as u64;
            match current {
                None | Some(StoredValue::Inline(_)) => {
                    let old = match current {
                        Some(StoredValue::Inline(v)) => v,
                        _ => Vec::new(),
                    };
                    let new_len = (old.len() as u64).max(end);
                    if new_len <= inline_limit(store) as u64 {
                        let mut composed = old;
                        composed.resize(new_len as usize, 0);
                        composed[*pos as usize..end as usize].copy_from_slice(data);
                        tree.store(store, key, NewValue::Bytes(&composed))?;
                    } else {
                        let mut composed = old;
                        composed.resize(new_len as usize, 0);
                        composed[*pos as usize..end as usize].copy_from_slice(data);
                        let desc = fragment::create(store, &composed)?;
                        tree.store(store, key, NewValue::Desc(desc))?;
                    }
                }
                Some(StoredValue::Fragmented(desc)) => {
                    let full = fragment::length(&desc)?;
                    let desc = if end > full {
                        fragment::set_length(store, &desc, end)?
                    } else {
                        desc
                    };
                    let (desc2, _) = fragment::write(store, &desc, *pos, data)?;
                    tree.store(store, key, NewValue::Desc(desc2))?;
                }
                Some(StoredValue::Ghost) => unreachable!("filtered above"),
            }
        }
        PositionalOp::Clear { pos, len } => match current {
            None => {}
            Some(StoredValue::Inline(mut v)) => {
                let end = (*pos + *len).min(v.len() as u64);
                if *pos < end {
                    v[*pos as usize..end as usize].iter_mut().for_each(|b| *b = 0);
                    tree.store(store, key, NewValue::Bytes(&v))?;
                }
            }
            Some(StoredValue::Fragmented(desc)) => {
                let full = fragment::length(&desc)?;
                let end = (*pos + *len).min(full);
                if *pos < end {
                    let (desc2, _) = fragment::clear(store, &desc, *pos, end - *pos)?;
                    tree.store(store, key, NewValue::Desc(desc2))?;
                }
            }
            Some(StoredValue::Ghost) => {}
        },
        PositionalOp::SetLength { len } => match current {
            None => {
                if *len <= inline_limit(store) as u64 {
                    tree.store(store, key, NewValue::Bytes(&vec![0u8; *len as usize]))?;
                } else {
                    let desc = fragment::create(store, &[])?;
                    let desc = fragment::set_length(store, &desc, *len)?;
                    tree.store(store, key, NewValue::Desc(desc))?;
                }
            }
            Some(StoredValue::Inline(mut v)) => {
                if *len <= inline_limit(store) as u64 {
                    v.resize(*len as usize, 0);
                    tree.store(store, key, NewValue::Bytes(&v))?;
                } else {
                    let desc = fragment::create(store, &v)?;
                    let desc = fragment::set_length(store, &desc, *len)?;
                    tree.store(store, key, NewValue::Desc(desc))?;
                }
            }
            Some(StoredValue::Fragmented(desc)) => {
                let desc2 = fragment::set_length(store, &desc, *len)?;
                // Truncation below the threshold converts back to inline.
                if *len <= inline_limit(store) as u64 {
                    let bytes = fragment::read_all(store, &desc2)?;
                    fragment::free(store, &desc2)?;
                    tree.store(store, key, NewValue::Bytes(&bytes))?;
                } else {
                    tree.store(store, key, NewValue::Desc(desc2))?;
                }
            }
            Some(StoredValue::Ghost) => {}
        },
    }
    Ok(())
}

/// Applies a positional operation and pushes the undo records that reverse
/// it: displaced bytes exactly once per modified region, and the previous
/// length when the value grows or shrinks.
pub(crate) fn apply_with_undo(
    store: &PageStore,
    tree: &Arc<Tree>,
    undo: &mut crate::undo::UndoLog,
    key: &[u8],
    op: &PositionalOp<'_>,
) -> Result<()> {
    let current = current_value(store, tree, key)?;
    let old_len = match &current {
        None => None,
        Some(v) => v.length()?,
    };

    match op {
        PositionalOp::Write { pos, data } => {
            let end = pos + data.len() as u64;
            match old_len {
                None => {
                    // A fresh entry; rolling back removes it.
                    undo.push(store, UndoOp::Uninsert { index: tree.id, key: key.to_vec() })?;
                }
                Some(old_len) => {
                    if end > old_len {
                        undo.push(
                            store,
                            UndoOp::Unextend {
                                index: tree.id,
                                key: key.to_vec(),
                                old_length: old_len,
                            },
                        )?;
                    }
                    let overlap_end = end.min(old_len);
                    if *pos < overlap_end {
                        let mut old = vec![0u8; (overlap_end - pos) as usize];
                        let n = raw_read(store, tree, key, *pos, &mut old)?;
                        old.truncate(n);
                        undo.push(
                            store,
                            UndoOp::Unwrite {
                                index: tree.id,
                                key: key.to_vec(),
                                pos: *pos,
                                old,
                            },
                        )?;
                    }
                }
            }
        }
        PositionalOp::Clear { pos, len } => {
            if let Some(old_len) = old_len {
                let end = (*pos + *len).min(old_len);
                if *pos < end {
                    let mut old = vec![0u8; (end - pos) as usize];
                    let n = raw_read(store, tree, key, *pos, &mut old)?;
                    old.truncate(n);
                    undo.push(
                        store,
                        UndoOp::Unwrite { index: tree.id, key: key.to_vec(), pos: *pos, old },
                    )?;
                }
            }
        }
        PositionalOp::SetLength { len } => match old_len {
            None => {
                undo.push(store, UndoOp::Uninsert { index: tree.id, key: key.to_vec() })?;
            }
            Some(old_len) => {
                if *len < old_len {
                    // Save the truncated tail, then the old length; the
                    // rollback re-extends first and restores bytes after.
                    let mut tail = vec![0u8; (old_len - len) as usize];
                    let n = raw_read(store, tree, key, *len, &mut tail)?;
                    tail.truncate(n);
                    undo.push(
                        store,
                        UndoOp::Unwrite {
                            index: tree.id,
                            key: key.to_vec(),
                            pos: *len,
                            old: tail,
                        },
                    )?;
                }
                undo.push(
                    store,
                    UndoOp::Unextend {
                        index: tree.id,
                        key: key.to_vec(),
                        old_length: old_len,
                    },
                )?;
            }
        },
    }

    apply_raw(store, tree, key, op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::PageAllocator;
    use crate::cache::NodeCache;
    use crate::pagearray::{MemPageArray, PageArray, SnapshotPageArray};
    use crate::undo::UndoLog;
    use boreal_common::types::{IndexId, PageId};

    fn mem_store() -> PageStore {
        let inner: Arc<dyn PageArray> = Arc::new(MemPageArray::new(512));
        let pages = Arc::new(SnapshotPageArray::new(inner));
        pages.set_page_count(2).unwrap();
        PageStore::new(pages, PageAllocator::new(2), NodeCache::new(200))
    }

    fn tree() -> Arc<Tree> {
        Arc::new(Tree::new(IndexId(3), PageId::NONE, false))
    }

    #[test]
    fn test_raw_write_creates_value() {
        let s = mem_store();
        let t = tree();
        raw_write(&s, &t, b"k", 5, b"hello").unwrap();
        let mut buf = [0u8; 10];
        let n = raw_read(&s, &t, b"k", 0, &mut buf).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf[..5], &[0; 5]);
        assert_eq!(&buf[5..], b"hello");
    }

    #[test]
    fn test_raw_write_large_converts_to_fragmented() {
        let s = mem_store();
        let t = tree();
        raw_write(&s, &t, b"k", 0, b"small").unwrap();
        // Writing far past the end converts the value to fragmented form.
        raw_write(&s, &t, b"k", 5_000, b"tail").unwrap();
        match t.load(&s, b"k").unwrap().unwrap() {
            StoredValue::Fragmented(_) => {}
            other => panic!("expected fragmented, got {:?}", other),
        }
        let mut buf = [0u8; 5];
        raw_read(&s, &t, b"k", 0, &mut buf).unwrap();
        assert_eq!(&buf, b"small");
        let mut buf = [0u8; 4];
        raw_read(&s, &t, b"k", 5_000, &mut buf).unwrap();
        assert_eq!(&buf, b"tail");
    }

    #[test]
    fn test_raw_set_length_truncates_back_to_inline() {
        let s = mem_store();
        let t = tree();
        let data: Vec<u8> = (0..4000).map(|i| (i % 250) as u8 + 1).collect();
        raw_write(&s, &t, b"k", 0, &data).unwrap();
        raw_set_length(&s, &t, b"k", 50).unwrap();
        match t.load(&s, b"k").unwrap().unwrap() {
            StoredValue::Inline(v) => assert_eq!(v, &data[..50]),
            other => panic!("expected inline after truncation, got {:?}", other),
        }
    }

    #[test]
    fn test_raw_clear_range() {
        let s = mem_store();
        let t = tree();
        raw_write(&s, &t, b"k", 0, &[7u8; 100]).unwrap();
        raw_clear(&s, &t, b"k", 10, 20).unwrap();
        let mut buf = [0u8; 100];
        raw_read(&s, &t, b"k", 0, &mut buf).unwrap();
        assert!(buf[10..30].iter().all(|&b| b == 0));
        assert!(buf[..10].iter().all(|&b| b == 7));
        assert!(buf[30..].iter().all(|&b| b == 7));
    }

    #[test]
    fn test_read_truncated_at_end() {
        let s = mem_store();
        let t = tree();
        raw_write(&s, &t, b"k", 0, b"12345").unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(raw_read(&s, &t, b"k", 3, &mut buf).unwrap(), 2);
        assert_eq!(raw_read(&s, &t, b"k", 9, &mut buf).unwrap(), 0);
        assert_eq!(raw_read(&s, &t, b"missing", 0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_write_with_undo_roundtrip() {
        let s = mem_store();
        let t = tree();
        let mut undo = UndoLog::new();

        raw_write(&s, &t, b"k", 0, &[1u8; 100]).unwrap();
        apply_with_undo(
            &s,
            &t,
            &mut undo,
            b"k",
            &PositionalOp::Write { pos: 40, data: &[9u8; 80] },
        )
        .unwrap();

        // The write extended and modified the value.
        let mut buf = [0u8; 120];
        assert_eq!(raw_read(&s, &t, b"k", 0, &mut buf).unwrap(), 120);
        assert!(buf[40..120].iter().all(|&b| b == 9));

        // Undo: first the displaced bytes, then the old length.
        let unwrite = undo.pop(&s).unwrap().unwrap();
        match &unwrite {
            UndoOp::Unwrite { pos, old, .. } => {
                assert_eq!(*pos, 40);
                assert_eq!(old, &vec![1u8; 60]);
            }
            other => panic!("expected Unwrite, got {:?}", other),
        }
        let unextend = undo.pop(&s).unwrap().unwrap();
        match &unextend {
            UndoOp::Unextend { old_length, .. } => assert_eq!(*old_length, 100),
            other => panic!("expected Unextend, got {:?}", other),
        }
    }

    #[test]
    fn test_set_length_undo_preserves_tail() {
        let s = mem_store();
        let t = tree();
        let mut undo = UndoLog::new();
        let data: Vec<u8> = (0..200).map(|i| i as u8) .collect();
        raw_write(&s, &t, b"k", 0, &data).unwrap();

        apply_with_undo(&s, &t, &mut undo, b"k", &PositionalOp::SetLength { len: 80 })
            .unwrap();
        let mut buf = [0u8; 200];
        assert_eq!(raw_read(&s, &t, b"k", 0, &mut buf).unwrap(), 80);

        // Unextend pops first, restoring length; Unwrite restores bytes.
        match undo.pop(&s).unwrap().unwrap() {
            UndoOp::Unextend { old_length, .. } => assert_eq!(old_length, 200),
            other => panic!("expected Unextend, got {:?}", other),
        }
        match undo.pop(&s).unwrap().unwrap() {
            UndoOp::Unwrite { pos, old, .. } => {
                assert_eq!(pos, 80);
                assert_eq!(old, data[80..].to_vec());
            }
            other => panic!("expected Unwrite, got {:?}", other),
        }
    }
}
