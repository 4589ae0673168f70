//! Copy-on-write B-tree.
//!
//! Latch discipline is strict top-down. Readers crab: the child is latched
//! before the parent is released, which also keeps copy-on-write renames
//! from racing the descent, since a rename requires the parent exclusively.
//! Writers hold the whole descent path exclusively so splits and merges can
//! repoint parents without re-latching.
//!
//! Every node on a write path is dirtied up front. Dirtying in a fresh
//! checkpoint generation assigns a new page id and repoints the parent, so
//! pages captured by the previous checkpoint root are never overwritten.
//!
//! This layer knows nothing of locks, undo, or redo; the transaction layer
//! wraps it. Deletes performed under a transaction replace the value with a
//! ghost; `delete_ghost` removes the tombstone at commit.

use boreal_common::error::{BorealError, Result};
use boreal_common::types::{IndexId, PageId};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::Mutex;

use crate::fragment;
use crate::node::{
    self, build_leaf_entry, encode_key_part, encode_value_part, KeyRef, NodeBuf, ValueRef,
};
use crate::store::PageStore;

pub type NodeReadGuard = ArcRwLockReadGuard<parking_lot::RawRwLock, NodeBuf>;
pub type NodeWriteGuard = ArcRwLockWriteGuard<parking_lot::RawRwLock, NodeBuf>;

/// Occupancy below which a node tries to merge with a neighbour.
fn low_water(page_size: usize) -> usize {
    page_size / 4
}

/// A value as stored, with fragment descriptors passed through so the
/// caller can manage fragment ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    Inline(Vec<u8>),
    Fragmented(Vec<u8>),
    Ghost,
}

impl StoredValue {
    fn from_ref(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Inline(b) => StoredValue::Inline(b.to_vec()),
            ValueRef::Fragmented(d) => StoredValue::Fragmented(d.to_vec()),
            ValueRef::Ghost => StoredValue::Ghost,
        }
    }

    /// Materializes the value bytes; None for a ghost.
    pub fn materialize(&self, store: &PageStore) -> Result<Option<Vec<u8>>> {
        match self {
            StoredValue::Inline(b) => Ok(Some(b.clone())),
            StoredValue::Fragmented(d) => Ok(Some(fragment::read_all(store, d)?)),
            StoredValue::Ghost => Ok(None),
        }
    }

    /// Logical length; None for a ghost.
    pub fn length(&self) -> Result<Option<u64>> {
        match self {
            StoredValue::Inline(b) => Ok(Some(b.len() as u64)),
            StoredValue::Fragmented(d) => Ok(Some(fragment::length(d)?)),
            StoredValue::Ghost => Ok(None),
        }
    }
}

/// What to store for a key.
pub enum NewValue<'a> {
    /// Plain bytes, fragmented automatically if the entry would overflow.
    Bytes(&'a [u8]),
    /// A prebuilt fragment descriptor whose pages the entry takes over.
    Desc(Vec<u8>),
    /// Replace the value with a ghost tombstone.
    Ghost,
    /// Remove the entry physically.
    Remove,
}

/// Seek relation for cursor positioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seek {
    Exact,
    Ge,
    Gt,
    Le,
    Lt,
}

/// An ordered map over pages.
pub struct Tree {
    pub id: IndexId,
    /// Temporary trees skip redo and are reclaimed during recovery.
    pub temporary: bool,
    root: Mutex<PageId>,
}

struct WriteFrame {
    guard: NodeWriteGuard,
}

impl Tree {
    pub fn new(id: IndexId, root: PageId, temporary: bool) -> Self {
        Self { id, temporary, root: Mutex::new(root) }
    }

    /// Current root page id; NONE when the tree has never been written.
    pub fn root_id(&self) -> PageId {
        *self.root.lock()
    }

    fn key_resolver<'a>(store: &'a PageStore) -> impl FnMut(&[u8]) -> Result<Vec<u8>> + 'a {
        move |desc: &[u8]| {
            let len = fragment::length(desc)? as usize;
            if len > store.max_key_size {
                return Err(BorealError::LargeKey { size: len, max: store.max_key_size });
            }
            fragment::read_all(store, desc)
        }
    }

    fn materialize_key(store: &PageStore, key: KeyRef<'_>) -> Result<Vec<u8>> {
        match key {
            KeyRef::Inline(k) => Ok(k.to_vec()),
            KeyRef::Fragmented(desc) => Tree::key_resolver(store)(desc),
        }
    }

    /// Builds a key part, fragmenting keys past the inline threshold.
    fn make_key_part(store: &PageStore, key: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        if key.len() > node::max_inline_key_len(store.page_size) {
            let desc = fragment::create(store, key)?;
            encode_key_part(&mut out, KeyRef::Fragmented(&desc));
        } else {
            encode_key_part(&mut out, KeyRef::Inline(key));
        }
        Ok(out)
    }

    /// Frees fragment pages owned by a stored key.
    fn free_key_fragments(store: &PageStore, key: KeyRef<'_>) -> Result<()> {
        if let KeyRef::Fragmented(desc) = key {
            fragment::free(store, desc)?;
        }
        Ok(())
    }

    fn acquire_root_read(&self, store: &PageStore) -> Result<Option<NodeReadGuard>> {
        loop {
            let root_id = *self.root.lock();
            if !root_id.is_some() {
                return Ok(None);
            }
            let node = store.node(root_id)?;
            let guard = node.read_arc();
            if *self.root.lock() == guard.id {
                return Ok(Some(guard));
            }
            // The root moved while we latched; retry.
        }
    }

    fn acquire_root_write(
        &self,
        store: &PageStore,
        create: bool,
    ) -> Result<Option<NodeWriteGuard>> {
        loop {
            let mut root_lk = self.root.lock();
            if !root_lk.is_some() {
                if !create {
                    return Ok(None);
                }
                let node = store.new_leaf()?;
                let guard = node.write_arc();
                *root_lk = guard.id;
                return Ok(Some(guard));
            }
            let root_id = *root_lk;
            drop(root_lk);
            let node = store.node(root_id)?;
            let guard = node.write_arc();
            if *self.root.lock() == guard.id {
                return Ok(Some(guard));
            }
        }
    }

    /// Descends for mutation, dirtying the path and holding it exclusively.
    /// Returns None when the tree is empty and `create` is false.
    fn descend_write(
        &self,
        store: &PageStore,
        key: &[u8],
        create: bool,
    ) -> Result<Option<(Vec<WriteFrame>, NodeWriteGuard, std::result::Result<usize, usize>)>>
    {
        let Some(mut guard) = self.acquire_root_write(store, create)? else {
            return Ok(None);
        };
        if let Some((_, new)) = store.mark_dirty(&mut guard)? {
            let _ = new;
            *self.root.lock() = guard.id;
        }

        let mut path = Vec::new();
        loop {
            if guard.is_leaf() {
                let found = guard.search(key, &mut Tree::key_resolver(store))?;
                return Ok(Some((path, guard, found)));
            }
            let idx = guard.child_index_for(guard.search(key, &mut Tree::key_resolver(store))?);
            let child_id = guard.child_at(idx);
            let child = store.node(child_id)?;
            let mut child_guard = child.write_arc();
            if let Some((_, new)) = store.mark_dirty(&mut child_guard)? {
                guard.set_child_at(idx, new);
            }
            path.push(WriteFrame { guard });
            guard = child_guard;
        }
    }

    /// Looks up a key without holding anything afterwards.
    pub fn load(&self, store: &PageStore, key: &[u8]) -> Result<Option<StoredValue>> {
        let Some(mut guard) = self.acquire_root_read(store)? else {
            return Ok(None);
        };
        loop {
            if guard.is_leaf() {
                return match guard.search(key, &mut Tree::key_resolver(store))? {
                    Ok(pos) => Ok(Some(StoredValue::from_ref(guard.value_at(pos)?))),
                    Err(_) => Ok(None),
                };
            }
            let idx = guard.child_index_for(guard.search(key, &mut Tree::key_resolver(store))?);
            let child_id = guard.child_at(idx);
            let child = store.node(child_id)?;
            let child_guard = child.read_arc();
            drop(guard);
            guard = child_guard;
        }
    }

    /// Stores, ghosts, or removes an entry. Returns the previous value so
    /// the caller can log undo and manage displaced fragments.
    pub fn store(
        &self,
        store: &PageStore,
        key: &[u8],
        new: NewValue<'_>,
    ) -> Result<Option<StoredValue>> {
        let create = !matches!(new, NewValue::Remove);
        let Some((mut path, mut leaf, found)) = self.descend_write(store, key, create)?
        else {
            return Ok(None);
        };

        match found {
            Ok(pos) => {
                let old = StoredValue::from_ref(leaf.value_at(pos)?);
                match new {
                    NewValue::Remove => {
                        Tree::free_key_fragments(store, leaf.key_at(pos)?)?;
                        leaf.delete_entry(pos);
                        self.repair_underflow(store, path, leaf)?;
                    }
                    NewValue::Ghost => {
                        if !leaf.update_value(pos, ValueRef::Ghost)? {
                            return Err(BorealError::Internal(
                                "ghost update failed to fit".to_string(),
                            ));
                        }
                    }
                    NewValue::Bytes(bytes) => {
                        let key_part_len = leaf.entry_bytes(pos)?.len()
                            - self.value_part_len(&leaf, pos)?;
                        let value = self.make_value(store, key_part_len, bytes)?;
                        let vref = value.as_ref();
                        if !leaf.update_value(pos, vref)? {
                            let key_part = self.key_part_bytes(&leaf, pos)?;
                            leaf.delete_entry(pos);
                            let mut entry = key_part;
                            encode_value_part(&mut entry, vref);
                            self.insert_with_split(store, &mut path, leaf, pos, &entry)?;
                        }
                    }
                    NewValue::Desc(desc) => {
                        let vref = ValueRef::Fragmented(&desc);
                        if !leaf.update_value(pos, vref)? {
                            let key_part = self.key_part_bytes(&leaf, pos)?;
                            leaf.delete_entry(pos);
                            let mut entry = key_part;
                            encode_value_part(&mut entry, vref);
                            self.insert_with_split(store, &mut path, leaf, pos, &entry)?;
                        }
                    }
                }
                Ok(Some(old))
            }
            Err(ip) => match new {
                NewValue::Remove | NewValue::Ghost => Ok(None),
                NewValue::Bytes(bytes) => {
                    let key_part = Tree::make_key_part(store, key)?;
                    let value = self.make_value(store, key_part.len(), bytes)?;
                    let mut entry = key_part;
                    encode_value_part(&mut entry, value.as_ref());
                    if !leaf.insert_entry(ip, &entry)? {
                        self.insert_with_split(store, &mut path, leaf, ip, &entry)?;
                    }
                    Ok(None)
                }
                NewValue::Desc(desc) => {
                    let key_part = Tree::make_key_part(store, key)?;
                    let mut entry = key_part;
                    encode_value_part(&mut entry, ValueRef::Fragmented(&desc));
                    if !leaf.insert_entry(ip, &entry)? {
                        self.insert_with_split(store, &mut path, leaf, ip, &entry)?;
                    }
                    Ok(None)
                }
            },
        }
    }

    fn value_part_len(&self, leaf: &NodeBuf, pos: usize) -> Result<usize> {
        let entry = leaf.entry_bytes(pos)?;
        let (_, key_end) = node::parse_key_part(entry, 0)?;
        Ok(entry.len() - key_end)
    }

    fn key_part_bytes(&self, leaf: &NodeBuf, pos: usize) -> Result<Vec<u8>> {
        let entry = leaf.entry_bytes(pos)?;
        let (_, key_end) = node::parse_key_part(entry, 0)?;
        Ok(entry[..key_end].to_vec())
    }

    fn make_value(
        &self,
        store: &PageStore,
        key_part_len: usize,
        bytes: &[u8],
    ) -> Result<OwnedValue> {
        let inline_entry = key_part_len + 1 + 10 + bytes.len();
        if inline_entry <= node::max_leaf_entry_len(store.page_size) {
            Ok(OwnedValue::Inline(bytes.to_vec()))
        } else {
            Ok(OwnedValue::Fragmented(fragment::create(store, bytes)?))
        }
    }

    /// Splits the leaf with `entry` included, balancing by bytes, then
    /// propagates the separator up the held path.
    fn insert_with_split(
        &self,
        store: &PageStore,
        path: &mut Vec<WriteFrame>,
        mut leaf: NodeWriteGuard,
        ip: usize,
        entry: &[u8],
    ) -> Result<()> {
        let n = leaf.num_entries();
        let mut entries: Vec<Vec<u8>> = Vec::with_capacity(n + 1);
        for i in 0..n {
            entries.push(leaf.entry_bytes(i)?.to_vec());
        }
        entries.insert(ip, entry.to_vec());

        let total: usize = entries.iter().map(|e| e.len() + 2).sum();
        let mut acc = 0usize;
        let mut split_at = entries.len() - 1;
        for (i, e) in entries.iter().enumerate() {
            acc += e.len() + 2;
            if acc * 2 >= total {
                split_at = (i + 1).min(entries.len() - 1).max(1);
                break;
            }
        }

        leaf.truncate_entries(0)?;
        for (i, e) in entries[..split_at].iter().enumerate() {
            if !leaf.insert_entry(i, e)? {
                return Err(BorealError::Internal("entry does not fit after split".into()));
            }
        }
        let right_ref = store.new_leaf()?;
        let mut right = right_ref.write_arc();
        for (i, e) in entries[split_at..].iter().enumerate() {
            if !right.insert_entry(i, e)? {
                return Err(BorealError::Internal("entry does not fit after split".into()));
            }
        }

        let sep_full = Tree::materialize_key(store, right.key_at(0)?)?;
        let sep_part = Tree::make_key_part(store, &sep_full)?;
        self.insert_parent_entry(store, path, leaf, sep_part, right)
    }

    /// Inserts a separator for a freshly split child, splitting ancestors
    /// as needed. The split halves stay latched until a parent links them,
    /// so no reader can observe a subtree whose upper entries are not yet
    /// reachable.
    fn insert_parent_entry(
        &self,
        store: &PageStore,
        path: &mut Vec<WriteFrame>,
        mut left: NodeWriteGuard,
        mut sep_part: Vec<u8>,
        mut right: NodeWriteGuard,
    ) -> Result<()> {
        loop {
            let Some(frame) = path.pop() else {
                // The root itself split; grow the tree by one level. The
                // halves release only after the new root is linked.
                let root_ref = store.new_internal()?;
                let mut rg = root_ref.write_arc();
                rg.set_child_at(0, right.id);
                let entry = raw_internal_entry(left.id, &sep_part);
                if !rg.insert_entry(0, &entry)? {
                    return Err(BorealError::Internal(
                        "separator does not fit in new root".into(),
                    ));
                }
                *self.root.lock() = rg.id;
                return Ok(());
            };
            let mut g = frame.guard;
            let idx = find_child_index(&g, left.id)?;
            let entry = raw_internal_entry(left.id, &sep_part);
            if g.insert_entry(idx, &entry)? {
                g.set_child_at(idx + 1, right.id);
                return Ok(());
            }

            // Split this internal node; the middle separator moves up.
            let sib_ref = store.new_internal()?;
            let mut rg = sib_ref.write_arc();
            g.split(&mut rg)?;
            let up_sep = rg.entry_bytes(0)?[8..].to_vec();
            let mid_child = rg.child_at(0);
            let n = g.num_entries();
            g.set_child_at(n, mid_child);
            rg.delete_entry(0);

            // Link the pending halves into whichever side now holds the
            // left child; only then may their latches release.
            {
                let target =
                    if find_child_index(&g, left.id).is_ok() { &mut g } else { &mut rg };
                let idx = find_child_index(target, left.id)?;
                let entry = raw_internal_entry(left.id, &sep_part);
                if !target.insert_entry(idx, &entry)? {
                    return Err(BorealError::Internal(
                        "separator does not fit after internal split".into(),
                    ));
                }
                target.set_child_at(idx + 1, right.id);
            }

            left = g;
            right = rg;
            sep_part = up_sep;
        }
    }

    /// Walks the held path upward merging or rebalancing underfull nodes,
    /// collapsing the root when it drains.
    fn repair_underflow(
        &self,
        store: &PageStore,
        mut path: Vec<WriteFrame>,
        mut child: NodeWriteGuard,
    ) -> Result<()> {
        loop {
            if child.used_bytes()? >= low_water(store.page_size) {
                return Ok(());
            }
            let Some(frame) = path.pop() else {
                // `child` is the root.
                if !child.is_leaf() && child.num_entries() == 0 {
                    let only = child.child_at(0);
                    *self.root.lock() = only;
                    let id = child.id;
                    drop(child);
                    store.free_node(id);
                }
                return Ok(());
            };
            let mut parent = frame.guard;
            if parent.num_entries() == 0 {
                // Pass-through parent; let the next level handle it.
                child = parent;
                continue;
            }

            let child_idx = find_child_index(&parent, child.id)?;
            let (left_idx, sep_idx) =
                if child_idx > 0 { (child_idx - 1, child_idx - 1) } else { (child_idx, child_idx) };
            let right_idx = left_idx + 1;

            let left_id = parent.child_at(left_idx);
            let right_id = parent.child_at(right_idx);

            // One of the two is `child`, already latched; latch the other.
            let (mut left, mut right);
            if child.id == left_id {
                let sib = store.node(right_id)?;
                left = child;
                right = sib.write_arc();
                if let Some((_, new)) = store.mark_dirty(&mut right)? {
                    parent.set_child_at(right_idx, new);
                }
            } else {
                let sib = store.node(left_id)?;
                left = sib.write_arc();
                if let Some((_, new)) = store.mark_dirty(&mut left)? {
                    parent.set_child_at(left_idx, new);
                }
                right = child;
            }

            let sep_part = {
                let entry = parent.entry_bytes(sep_idx)?;
                entry[8..].to_vec()
            };
            let sep_entry_len = sep_part.len() + 8 + 2;
            let combined = left.used_bytes()? + right.used_bytes()?
                - right.header_len()
                + if left.is_leaf() { 0 } else { sep_entry_len };

            if combined <= store.page_size * 3 / 4 {
                if left.is_leaf() {
                    if !left.absorb(&right)? {
                        return Err(BorealError::Internal("leaf merge overflow".into()));
                    }
                    // The dropped separator owns its fragments.
                    let (sep_key, _) = node::parse_key_part(&sep_part, 0)?;
                    Tree::free_key_fragments(store, sep_key)?;
                } else {
                    // Pull the separator down between the two runs.
                    let pulled = raw_internal_entry(left.child_at(left.num_entries()), &sep_part);
                    let at = left.num_entries();
                    if !left.insert_entry(at, &pulled)? {
                        return Err(BorealError::Internal("internal merge overflow".into()));
                    }
                    if !left.absorb(&right)? {
                        return Err(BorealError::Internal("internal merge overflow".into()));
                    }
                }
                parent.set_child_at(right_idx, left.id);
                parent.delete_entry(sep_idx);
                let right_page = right.id;
                // Invalidate cursor hints into the absorbed node.
                right.version += 1;
                drop(right);
                store.free_node(right_page);
                drop(left);
            } else if left.is_leaf() {
                // Rebalance from the larger neighbour, then refresh the
                // separator.
                rebalance_leaves(&mut left, &mut right)?;
                let new_sep_full = Tree::materialize_key(store, right.key_at(0)?)?;
                let new_sep_part = Tree::make_key_part(store, &new_sep_full)?;
                let (old_sep_key, _) = node::parse_key_part(&sep_part, 0)?;
                Tree::free_key_fragments(store, old_sep_key)?;
                let left_id = left.id;
                let right_id = right.id;
                parent.delete_entry(sep_idx);
                let entry = raw_internal_entry(left_id, &new_sep_part);
                if !parent.insert_entry(sep_idx, &entry)? {
                    return Err(BorealError::Internal("separator refresh overflow".into()));
                }
                parent.set_child_at(sep_idx + 1, right_id);
                drop(left);
                drop(right);
            } else {
                // Internal neighbours too full to merge; leave as is.
                drop(left);
                drop(right);
            }

            child = parent;
        }
    }

    /// Physically removes a ghost left by a committed delete. A no-op if
    /// the entry was restored or already removed.
    pub fn delete_ghost(&self, store: &PageStore, key: &[u8]) -> Result<()> {
        let Some((path, mut leaf, found)) = self.descend_write(store, key, false)? else {
            return Ok(());
        };
        if let Ok(pos) = found {
            if leaf.value_at(pos)? == ValueRef::Ghost {
                Tree::free_key_fragments(store, leaf.key_at(pos)?)?;
                leaf.delete_entry(pos);
                self.repair_underflow(store, path, leaf)?;
            }
        }
        Ok(())
    }

    /// Positions on the first entry.
    pub fn first(&self, store: &PageStore) -> Result<Option<(Vec<u8>, StoredValue)>> {
        self.edge(store, false)
    }

    /// Positions on the last entry.
    pub fn last(&self, store: &PageStore) -> Result<Option<(Vec<u8>, StoredValue)>> {
        self.edge(store, true)
    }

    fn edge(&self, store: &PageStore, high: bool) -> Result<Option<(Vec<u8>, StoredValue)>> {
        let Some(mut guard) = self.acquire_root_read(store)? else {
            return Ok(None);
        };
        loop {
            if guard.is_leaf() {
                let n = guard.num_entries();
                if n == 0 {
                    return Ok(None);
                }
                let pos = if high { n - 1 } else { 0 };
                let key = Tree::materialize_key(store, guard.key_at(pos)?)?;
                let value = StoredValue::from_ref(guard.value_at(pos)?);
                return Ok(Some((key, value)));
            }
            let idx = if high { guard.num_entries() } else { 0 };
            let child = store.node(guard.child_at(idx))?;
            let child_guard = child.read_arc();
            drop(guard);
            guard = child_guard;
        }
    }

    /// Finds an entry relative to `key`. The whole descent path is held
    /// shared so sibling subtrees stay reachable for boundary crossings.
    pub fn seek(
        &self,
        store: &PageStore,
        key: &[u8],
        seek: Seek,
    ) -> Result<Option<(Vec<u8>, StoredValue)>> {
        let Some(mut guard) = self.acquire_root_read(store)? else {
            return Ok(None);
        };
        let mut path: Vec<(NodeReadGuard, usize)> = Vec::new();
        loop {
            if guard.is_leaf() {
                break;
            }
            let idx = guard.child_index_for(guard.search(key, &mut Tree::key_resolver(store))?);
            let child = store.node(guard.child_at(idx))?;
            let child_guard = child.read_arc();
            path.push((guard, idx));
            guard = child_guard;
        }

        let found = guard.search(key, &mut Tree::key_resolver(store))?;
        let n = guard.num_entries();
        let pos: isize = match (seek, found) {
            (Seek::Exact, Ok(p)) => p as isize,
            (Seek::Exact, Err(_)) => return Ok(None),
            (Seek::Ge, Ok(p)) => p as isize,
            (Seek::Ge, Err(ip)) => ip as isize,
            (Seek::Gt, Ok(p)) => p as isize + 1,
            (Seek::Gt, Err(ip)) => ip as isize,
            (Seek::Le, Ok(p)) => p as isize,
            (Seek::Le, Err(ip)) => ip as isize - 1,
            (Seek::Lt, Ok(p)) => p as isize - 1,
            (Seek::Lt, Err(ip)) => ip as isize - 1,
        };

        if pos >= 0 && (pos as usize) < n {
            let pos = pos as usize;
            let key = Tree::materialize_key(store, guard.key_at(pos)?)?;
            let value = StoredValue::from_ref(guard.value_at(pos)?);
            return Ok(Some((key, value)));
        }

        if pos >= 0 {
            // Ran off the right edge; descend the next sibling subtree.
            while let Some((g, idx)) = path.pop() {
                if idx < g.num_entries() {
                    return self.descend_edge(store, g.child_at(idx + 1), false);
                }
            }
            Ok(None)
        } else {
            // Ran off the left edge.
            while let Some((g, idx)) = path.pop() {
                if idx > 0 {
                    return self.descend_edge(store, g.child_at(idx - 1), true);
                }
            }
            Ok(None)
        }
    }

    fn descend_edge(
        &self,
        store: &PageStore,
        from: PageId,
        high: bool,
    ) -> Result<Option<(Vec<u8>, StoredValue)>> {
        let node = store.node(from)?;
        let mut guard = node.read_arc();
        loop {
            if guard.is_leaf() {
                let n = guard.num_entries();
                if n == 0 {
                    return Ok(None);
                }
                let pos = if high { n - 1 } else { 0 };
                let key = Tree::materialize_key(store, guard.key_at(pos)?)?;
                let value = StoredValue::from_ref(guard.value_at(pos)?);
                return Ok(Some((key, value)));
            }
            let idx = if high { guard.num_entries() } else { 0 };
            let child = store.node(guard.child_at(idx))?;
            let child_guard = child.read_arc();
            drop(guard);
            guard = child_guard;
        }
    }

    /// Frees every page of the tree, fragments included. The tree is empty
    /// afterwards.
    pub fn delete_all(&self, store: &PageStore) -> Result<()> {
        let root = {
            let mut lk = self.root.lock();
            std::mem::replace(&mut *lk, PageId::NONE)
        };
        if root.is_some() {
            self.drop_subtree(store, root)?;
        }
        Ok(())
    }

    fn drop_subtree(&self, store: &PageStore, id: PageId) -> Result<()> {
        let node = store.node(id)?;
        let guard = node.read_arc();
        if guard.is_leaf() {
            for i in 0..guard.num_entries() {
                Tree::free_key_fragments(store, guard.key_at(i)?)?;
                if let ValueRef::Fragmented(desc) = guard.value_at(i)? {
                    fragment::free(store, desc)?;
                }
            }
        } else {
            for i in 0..=guard.num_entries() {
                self.drop_subtree(store, guard.child_at(i))?;
            }
            for i in 0..guard.num_entries() {
                Tree::free_key_fragments(store, guard.key_at(i)?)?;
            }
        }
        drop(guard);
        store.free_node(id);
        Ok(())
    }
}

enum OwnedValue {
    Inline(Vec<u8>),
    Fragmented(Vec<u8>),
}

impl OwnedValue {
    fn as_ref(&self) -> ValueRef<'_> {
        match self {
            OwnedValue::Inline(b) => ValueRef::Inline(b),
            OwnedValue::Fragmented(d) => ValueRef::Fragmented(d),
        }
    }
}

fn raw_internal_entry(child: PageId, key_part: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + key_part.len());
    out.extend_from_slice(&child.0.to_le_bytes());
    out.extend_from_slice(key_part);
    out
}

fn find_child_index(g: &NodeBuf, id: PageId) -> Result<usize> {
    for i in 0..=g.num_entries() {
        if g.child_at(i) == id {
            return Ok(i);
        }
    }
    Err(BorealError::Corrupt(format!(
        "child {} missing from internal node {}",
        id, g.id
    )))
}

/// Moves entries from the fuller leaf to the emptier one until their byte
/// usage is balanced.
fn rebalance_leaves(left: &mut NodeBuf, right: &mut NodeBuf) -> Result<()> {
    loop {
        let lu = left.used_bytes()?;
        let ru = right.used_bytes()?;
        if left.num_entries() > 1 && lu > ru {
            let i = left.num_entries() - 1;
            let entry = left.entry_bytes(i)?.to_vec();
            if lu - entry.len() <= ru {
                break;
            }
            if !right.insert_entry(0, &entry)? {
                break;
            }
            left.delete_entry(i);
        } else if right.num_entries() > 1 && ru > lu {
            let entry = right.entry_bytes(0)?.to_vec();
            if ru - entry.len() <= lu {
                break;
            }
            let at = left.num_entries();
            if !left.insert_entry(at, &entry)? {
                break;
            }
            right.delete_entry(0);
        } else {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::PageAllocator;
    use crate::cache::NodeCache;
    use crate::pagearray::{MemPageArray, PageArray, SnapshotPageArray};
    use std::sync::Arc;

    fn mem_store() -> PageStore {
        let inner: Arc<dyn PageArray> = Arc::new(MemPageArray::new(512));
        let pages = Arc::new(SnapshotPageArray::new(inner));
        pages.set_page_count(2).unwrap();
        PageStore::new(pages, PageAllocator::new(2), NodeCache::new(200))
    }

    fn tree() -> Tree {
        Tree::new(IndexId(1), PageId::NONE, false)
    }

    fn put(t: &Tree, s: &PageStore, k: &[u8], v: &[u8]) {
        t.store(s, k, NewValue::Bytes(v)).unwrap();
    }

    fn get(t: &Tree, s: &PageStore, k: &[u8]) -> Option<Vec<u8>> {
        t.load(s, k)
            .unwrap()
            .and_then(|v| v.materialize(s).unwrap())
    }

    #[test]
    fn test_store_load_single() {
        let s = mem_store();
        let t = tree();
        assert!(get(&t, &s, b"missing").is_none());
        put(&t, &s, b"hello", b"world");
        assert_eq!(get(&t, &s, b"hello").unwrap(), b"world");
    }

    #[test]
    fn test_overwrite() {
        let s = mem_store();
        let t = tree();
        put(&t, &s, b"k", b"v1");
        let old = t.store(&s, b"k", NewValue::Bytes(b"v2")).unwrap();
        assert_eq!(old, Some(StoredValue::Inline(b"v1".to_vec())));
        assert_eq!(get(&t, &s, b"k").unwrap(), b"v2");
    }

    #[test]
    fn test_many_inserts_split_and_sorted() {
        let s = mem_store();
        let t = tree();
        // Insert in a scrambled order; enough to force multi-level splits
        // with 512-byte pages.
        let mut keys: Vec<u64> = (0..500).collect();
        keys.reverse();
        for k in &keys {
            let key = format!("key{:08}", k);
            let val = format!("value-{}", k);
            put(&t, &s, key.as_bytes(), val.as_bytes());
        }
        for k in 0..500u64 {
            let key = format!("key{:08}", k);
            assert_eq!(
                get(&t, &s, key.as_bytes()).unwrap(),
                format!("value-{}", k).into_bytes(),
                "key {}",
                k
            );
        }
        // An in-order walk yields strictly increasing keys.
        let mut prev = Vec::new();
        let mut cur = t.first(&s).unwrap();
        let mut count = 0;
        while let Some((key, _)) = cur {
            assert!(key > prev, "keys out of order");
            prev = key.clone();
            cur = t.seek(&s, &key, Seek::Gt).unwrap();
            count += 1;
        }
        assert_eq!(count, 500);
    }

    #[test]
    fn test_delete_and_merge() {
        let s = mem_store();
        let t = tree();
        for k in 0..300u64 {
            let key = format!("key{:08}", k);
            put(&t, &s, key.as_bytes(), b"some-filler-value-bytes");
        }
        for k in 0..300u64 {
            if k % 3 != 0 {
                let key = format!("key{:08}", k);
                let old = t.store(&s, key.as_bytes(), NewValue::Remove).unwrap();
                assert!(old.is_some(), "key {}", k);
            }
        }
        for k in 0..300u64 {
            let key = format!("key{:08}", k);
            let got = get(&t, &s, key.as_bytes());
            if k % 3 == 0 {
                assert!(got.is_some(), "key {}", k);
            } else {
                assert!(got.is_none(), "key {}", k);
            }
        }
    }

    #[test]
    fn test_delete_everything_collapses_root() {
        let s = mem_store();
        let t = tree();
        for k in 0..200u64 {
            put(&t, &s, format!("key{:08}", k).as_bytes(), b"filler-filler-filler");
        }
        for k in 0..200u64 {
            t.store(&s, format!("key{:08}", k).as_bytes(), NewValue::Remove)
                .unwrap();
        }
        assert!(t.first(&s).unwrap().is_none());
        // The tree collapsed back to a single node.
        let root = s.node(t.root_id()).unwrap();
        assert!(root.read().is_leaf());
    }

    #[test]
    fn test_seek_variants() {
        let s = mem_store();
        let t = tree();
        for k in [10u64, 20, 30, 40] {
            put(&t, &s, &k.to_be_bytes(), b"v");
        }
        let key = |n: u64| n.to_be_bytes().to_vec();

        assert_eq!(t.seek(&s, &key(20), Seek::Exact).unwrap().unwrap().0, key(20));
        assert!(t.seek(&s, &key(25), Seek::Exact).unwrap().is_none());

        assert_eq!(t.seek(&s, &key(20), Seek::Ge).unwrap().unwrap().0, key(20));
        assert_eq!(t.seek(&s, &key(25), Seek::Ge).unwrap().unwrap().0, key(30));
        assert_eq!(t.seek(&s, &key(20), Seek::Gt).unwrap().unwrap().0, key(30));
        assert!(t.seek(&s, &key(40), Seek::Gt).unwrap().is_none());

        assert_eq!(t.seek(&s, &key(20), Seek::Le).unwrap().unwrap().0, key(20));
        assert_eq!(t.seek(&s, &key(25), Seek::Le).unwrap().unwrap().0, key(20));
        assert_eq!(t.seek(&s, &key(20), Seek::Lt).unwrap().unwrap().0, key(10));
        assert!(t.seek(&s, &key(10), Seek::Lt).unwrap().is_none());

        assert_eq!(t.first(&s).unwrap().unwrap().0, key(10));
        assert_eq!(t.last(&s).unwrap().unwrap().0, key(40));
    }

    #[test]
    fn test_seek_crosses_leaf_boundaries() {
        let s = mem_store();
        let t = tree();
        for k in 0..300u64 {
            put(&t, &s, format!("key{:08}", k).as_bytes(), b"boundary-filler-bytes");
        }
        // Walk backwards over every boundary.
        let mut cur = t.last(&s).unwrap();
        let mut count = 0;
        while let Some((key, _)) = cur {
            count += 1;
            cur = t.seek(&s, &key, Seek::Lt).unwrap();
        }
        assert_eq!(count, 300);
    }

    #[test]
    fn test_large_value_fragments() {
        let s = mem_store();
        let t = tree();
        let big: Vec<u8> = (0..50_000).map(|i| (i % 251) as u8).collect();
        put(&t, &s, b"big", &big);
        match t.load(&s, b"big").unwrap().unwrap() {
            StoredValue::Fragmented(_) => {}
            other => panic!("expected fragmented value, got {:?}", other),
        }
        assert_eq!(get(&t, &s, b"big").unwrap(), big);
    }

    #[test]
    fn test_large_key_fragments() {
        let s = mem_store();
        let t = tree();
        let big_key = vec![0xABu8; 600]; // past the 512-page inline limit
        put(&t, &s, &big_key, b"v");
        assert_eq!(get(&t, &s, &big_key).unwrap(), b"v");
        // Surrounding keys still resolve.
        put(&t, &s, b"small", b"w");
        assert_eq!(get(&t, &s, b"small").unwrap(), b"w");
        let old = t.store(&s, &big_key, NewValue::Remove).unwrap();
        assert!(old.is_some());
        assert!(get(&t, &s, &big_key).is_none());
    }

    #[test]
    fn test_ghost_lifecycle() {
        let s = mem_store();
        let t = tree();
        put(&t, &s, b"k", b"v");
        let old = t.store(&s, b"k", NewValue::Ghost).unwrap();
        assert_eq!(old, Some(StoredValue::Inline(b"v".to_vec())));
        assert_eq!(t.load(&s, b"k").unwrap(), Some(StoredValue::Ghost));

        // Commit-time reclamation removes the tombstone.
        t.delete_ghost(&s, b"k").unwrap();
        assert!(t.load(&s, b"k").unwrap().is_none());

        // Deleting a ghost that was restored is a no-op.
        put(&t, &s, b"r", b"v2");
        t.store(&s, b"r", NewValue::Ghost).unwrap();
        t.store(&s, b"r", NewValue::Bytes(b"v3")).unwrap();
        t.delete_ghost(&s, b"r").unwrap();
        assert_eq!(get(&t, &s, b"r").unwrap(), b"v3");
    }

    #[test]
    fn test_store_desc_takes_ownership() {
        let s = mem_store();
        let t = tree();
        let data = vec![0x5Au8; 3000];
        let desc = fragment::create(&s, &data).unwrap();
        t.store(&s, b"k", NewValue::Desc(desc)).unwrap();
        assert_eq!(get(&t, &s, b"k").unwrap(), data);
    }

    #[test]
    fn test_delete_all_frees_pages() {
        let s = mem_store();
        let t = tree();
        for k in 0..100u64 {
            put(&t, &s, format!("key{:08}", k).as_bytes(), b"delete-all-filler");
        }
        let big: Vec<u8> = vec![1u8; 5000];
        put(&t, &s, b"big", &big);
        t.delete_all(&s).unwrap();
        assert!(!t.root_id().is_some());
        assert!(s.allocator.deferred_count() > 0);
        // The tree is usable again afterwards.
        put(&t, &s, b"after", b"v");
        assert_eq!(get(&t, &s, b"after").unwrap(), b"v");
    }

    #[test]
    fn test_zero_length_keys_and_values() {
        let s = mem_store();
        let t = tree();
        put(&t, &s, b"", b"");
        assert_eq!(get(&t, &s, b"").unwrap(), b"");
        put(&t, &s, b"a", b"");
        assert_eq!(get(&t, &s, b"a").unwrap(), b"");
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let s = Arc::new(mem_store());
        let t = Arc::new(tree());
        for k in 0..200u64 {
            put(&t, &s, format!("key{:08}", k).as_bytes(), b"concurrent-filler");
        }
        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = s.clone();
            let t = t.clone();
            handles.push(std::thread::spawn(move || {
                for k in 0..200u64 {
                    let key = format!("key{:08}", k);
                    assert!(t.load(&s, key.as_bytes()).unwrap().is_some());
                }
            }));
        }
        {
            let s = s.clone();
            let t = t.clone();
            handles.push(std::thread::spawn(move || {
                for k in 200..400u64 {
                    let key = format!("key{:08}", k);
                    t.store(&s, key.as_bytes(), NewValue::Bytes(b"new")).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for k in 0..400u64 {
            let key = format!("key{:08}", k);
            assert!(t.load(&s, key.as_bytes()).unwrap().is_some());
        }
    }
}
