//! Bounded cache of decoded B-tree nodes.
//!
//! Slots live in an arena indexed by `u32`; the LRU list is intrusive, with
//! prev/next stored as slot indices. A node is pinned by holding its
//! `NodeRef`: eviction only considers slots whose Arc has no other holders
//! and whose latch can be taken without blocking. Evicting a dirty node
//! writes it to its page id while the node's write latch is held, so the
//! buffer cannot be reused mid-flush.

use boreal_common::error::{BorealError, Result};
use boreal_common::types::PageId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use crate::node::NodeBuf;
use crate::pagearray::PageArray;

/// Shared handle to a cached node. Holding one pins the node.
pub type NodeRef = Arc<RwLock<NodeBuf>>;

/// How a node joins the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Normal: may be evicted when cold.
    Evictable,
    /// Exempt from eviction until made evictable.
    Unevictable,
    /// Allocation must not evict anything; fail instead of evicting.
    NoEvict,
}

const NIL: u32 = u32::MAX;

struct Slot {
    node: Option<NodeRef>,
    prev: u32,
    next: u32,
    evictable: bool,
}

struct CacheState {
    map: HashMap<u64, u32>,
    slots: Vec<Slot>,
    /// Least recently used end.
    lru_head: u32,
    /// Most recently used end.
    lru_tail: u32,
    free: Vec<u32>,
}

impl CacheState {
    fn unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let s = &self.slots[idx as usize];
            (s.prev, s.next)
        };
        if prev == NIL {
            self.lru_head = next;
        } else {
            self.slots[prev as usize].next = next;
        }
        if next == NIL {
            self.lru_tail = prev;
        } else {
            self.slots[next as usize].prev = prev;
        }
        let s = &mut self.slots[idx as usize];
        s.prev = NIL;
        s.next = NIL;
    }

    fn push_mru(&mut self, idx: u32) {
        let tail = self.lru_tail;
        self.slots[idx as usize].prev = tail;
        self.slots[idx as usize].next = NIL;
        if tail == NIL {
            self.lru_head = idx;
        } else {
            self.slots[tail as usize].next = idx;
        }
        self.lru_tail = idx;
    }

    fn touch(&mut self, idx: u32) {
        if self.lru_tail != idx {
            self.unlink(idx);
            self.push_mru(idx);
        }
    }
}

/// Fixed-capacity node cache.
pub struct NodeCache {
    state: Mutex<CacheState>,
    max_nodes: usize,
}

impl NodeCache {
    pub fn new(max_nodes: usize) -> Self {
        Self::with_bounds(0, max_nodes)
    }

    /// Creates a cache that reserves arena capacity for `min_nodes` up
    /// front and never holds more than `max_nodes`.
    pub fn with_bounds(min_nodes: usize, max_nodes: usize) -> Self {
        let max_nodes = max_nodes.max(5);
        Self {
            state: Mutex::new(CacheState {
                map: HashMap::new(),
                slots: Vec::with_capacity(min_nodes.min(max_nodes)),
                lru_head: NIL,
                lru_tail: NIL,
                free: Vec::new(),
            }),
            max_nodes,
        }
    }

    /// Sizes the cache to roughly a quarter of available memory, with a
    /// floor that keeps small systems functional.
    pub fn auto_sized(page_size: usize) -> Self {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let target_bytes = (sys.available_memory() / 4) as usize;
        let nodes = (target_bytes / page_size).max(1_000);
        Self::new(nodes)
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    pub fn cached_count(&self) -> usize {
        self.state.lock().map.len()
    }

    /// Returns the node for `id`, loading it from the page array on a miss.
    pub fn get(&self, pages: &dyn PageArray, id: PageId, gen: u64) -> Result<NodeRef> {
        let mut state = self.state.lock();
        if let Some(&idx) = state.map.get(&id.0) {
            state.touch(idx);
            let node = state.slots[idx as usize]
                .node
                .clone()
                .expect("mapped slot has no node");
            return Ok(node);
        }

        let idx = self.acquire_slot(&mut state, pages, CacheMode::Evictable)?;
        let mut page = vec![0u8; pages.page_size()].into_boxed_slice();
        pages.read_page(id, &mut page)?;
        let node: NodeRef = Arc::new(RwLock::new(NodeBuf::from_page(id, page, gen)?));
        let slot = &mut state.slots[idx as usize];
        slot.node = Some(node.clone());
        slot.evictable = true;
        state.map.insert(id.0, idx);
        state.push_mru(idx);
        Ok(node)
    }

    /// Inserts a freshly created node (splits, new roots).
    pub fn insert_new(
        &self,
        pages: &dyn PageArray,
        buf: NodeBuf,
        mode: CacheMode,
    ) -> Result<NodeRef> {
        let id = buf.id;
        let mut state = self.state.lock();
        let idx = self.acquire_slot(&mut state, pages, mode)?;
        let node: NodeRef = Arc::new(RwLock::new(buf));
        let slot = &mut state.slots[idx as usize];
        slot.node = Some(node.clone());
        slot.evictable = mode == CacheMode::Evictable;
        state.map.insert(id.0, idx);
        state.push_mru(idx);
        Ok(node)
    }

    fn acquire_slot(
        &self,
        state: &mut CacheState,
        pages: &dyn PageArray,
        mode: CacheMode,
    ) -> Result<u32> {
        if let Some(idx) = state.free.pop() {
            return Ok(idx);
        }
        if state.slots.len() < self.max_nodes {
            let idx = state.slots.len() as u32;
            state.slots.push(Slot { node: None, prev: NIL, next: NIL, evictable: true });
            return Ok(idx);
        }
        if mode == CacheMode::NoEvict {
            return Err(BorealError::CacheExhausted);
        }
        self.evict_one(state, pages)
    }

    /// Evicts the coldest unpinned, evictable node and returns its slot.
    fn evict_one(&self, state: &mut CacheState, pages: &dyn PageArray) -> Result<u32> {
        let mut cursor = state.lru_head;
        while cursor != NIL {
            let next = state.slots[cursor as usize].next;
            let candidate = state.slots[cursor as usize]
                .node
                .clone()
                .expect("lru slot has no node");
            if state.slots[cursor as usize].evictable && Arc::strong_count(&candidate) == 2 {
                // Only the cache and this local clone hold it. The latch is
                // taken without blocking; a contended node is skipped.
                if let Some(mut guard) = candidate.try_write() {
                    if guard.dirty {
                        pages.write_page(guard.id, &guard.page)?;
                        guard.dirty = false;
                    }
                    let id = guard.id;
                    drop(guard);
                    state.map.remove(&id.0);
                    state.unlink(cursor);
                    state.slots[cursor as usize].node = None;
                    return Ok(cursor);
                }
            }
            cursor = next;
        }
        Err(BorealError::CacheExhausted)
    }

    /// Moves the map entry when copy-on-write reassigns a node's page id.
    pub fn rekey(&self, old: PageId, new: PageId) {
        let mut state = self.state.lock();
        if let Some(idx) = state.map.remove(&old.0) {
            state.map.insert(new.0, idx);
        }
    }

    /// Drops a deleted node from the cache.
    pub fn remove(&self, id: PageId) {
        let mut state = self.state.lock();
        if let Some(idx) = state.map.remove(&id.0) {
            state.unlink(idx);
            state.slots[idx as usize].node = None;
            state.free.push(idx);
        }
    }

    /// Best-effort most-recently-used hint.
    pub fn used(&self, id: PageId) {
        if let Some(mut state) = self.state.try_lock() {
            if let Some(&idx) = state.map.get(&id.0) {
                state.touch(idx);
            }
        }
    }

    /// Moves a node to the least-recently-used end so it is evicted first.
    pub fn unused(&self, id: PageId) {
        let mut state = self.state.lock();
        if let Some(&idx) = state.map.get(&id.0) {
            state.unlink(idx);
            let head = state.lru_head;
            state.slots[idx as usize].next = head;
            state.slots[idx as usize].prev = NIL;
            if head == NIL {
                state.lru_tail = idx;
            } else {
                state.slots[head as usize].prev = idx;
            }
            state.lru_head = idx;
        }
    }

    pub fn make_unevictable(&self, id: PageId) {
        let mut state = self.state.lock();
        if let Some(&idx) = state.map.get(&id.0) {
            state.slots[idx as usize].evictable = false;
        }
    }

    pub fn make_evictable(&self, id: PageId) {
        let mut state = self.state.lock();
        if let Some(&idx) = state.map.get(&id.0) {
            state.slots[idx as usize].evictable = true;
        }
    }

    /// Writes every dirty node assigned in generation `closed_gen` or
    /// earlier to its page id. Returns the number of nodes written.
    pub fn flush_dirty(&self, pages: &dyn PageArray, closed_gen: u64) -> Result<usize> {
        let nodes: Vec<NodeRef> = {
            let state = self.state.lock();
            state
                .slots
                .iter()
                .filter_map(|s| s.node.clone())
                .collect()
        };
        let mut written = 0;
        for node in nodes {
            let mut guard = node.write();
            if guard.dirty && guard.gen <= closed_gen {
                pages.write_page(guard.id, &guard.page)?;
                guard.dirty = false;
                written += 1;
            }
        }
        Ok(written)
    }
}
