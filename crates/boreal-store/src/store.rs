//! Shared page-store services: the page array, allocator, node cache, and
//! the checkpoint generation that drives copy-on-write.
//!
//! Copy-on-write is generation-based. Each checkpoint closes a generation.
//! The first time a node is dirtied in a new generation it moves to a
//! freshly allocated page id; its old id is freed deferred, keeping every
//! page reachable from the previous durable root intact until the next
//! header sync. If the node still carried unflushed changes belonging to
//! the closed generation, those are written to the old id first, so the
//! image the in-progress checkpoint captures is complete.

use boreal_common::error::Result;
use boreal_common::types::PageId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::alloc::PageAllocator;
use crate::cache::{CacheMode, NodeCache, NodeRef};
use crate::node::NodeBuf;
use crate::pagearray::{PageArray, SnapshotPageArray};

/// The engine's page-level services, shared by trees, fragments, undo
/// spill, and the checkpointer.
pub struct PageStore {
    pub pages: Arc<SnapshotPageArray>,
    pub allocator: PageAllocator,
    pub cache: NodeCache,
    pub page_size: usize,
    /// Largest key materialized in memory; larger stored keys fail with
    /// LargeKey when loaded.
    pub max_key_size: usize,
    gen: AtomicU64,
}

impl PageStore {
    pub fn new(
        pages: Arc<SnapshotPageArray>,
        allocator: PageAllocator,
        cache: NodeCache,
    ) -> Self {
        let page_size = pages.page_size();
        Self {
            pages,
            allocator,
            cache,
            page_size,
            max_key_size: 1024 * 1024,
            gen: AtomicU64::new(1),
        }
    }

    pub fn with_max_key_size(mut self, max_key_size: usize) -> Self {
        self.max_key_size = max_key_size;
        self
    }

    /// Current checkpoint generation.
    pub fn gen(&self) -> u64 {
        self.gen.load(Ordering::Acquire)
    }

    /// Closes the current generation; called by the checkpointer with the
    /// commit latch held exclusively. Returns the closed generation.
    pub fn bump_gen(&self) -> u64 {
        self.gen.fetch_add(1, Ordering::AcqRel)
    }

    /// Fetches a node through the cache.
    pub fn node(&self, id: PageId) -> Result<NodeRef> {
        self.cache.get(&*self.pages, id, self.gen())
    }

    /// Allocates and caches an empty leaf node.
    pub fn new_leaf(&self) -> Result<NodeRef> {
        let id = self.allocator.alloc();
        let buf = NodeBuf::new_leaf(id, self.page_size, self.gen());
        self.cache.insert_new(&*self.pages, buf, CacheMode::Evictable)
    }

    /// Allocates and caches an empty internal node.
    pub fn new_internal(&self) -> Result<NodeRef> {
        let id = self.allocator.alloc();
        let buf = NodeBuf::new_internal(id, self.page_size, self.gen());
        self.cache.insert_new(&*self.pages, buf, CacheMode::Evictable)
    }

    /// Prepares a latched node for modification. Returns the (old, new)
    /// page ids when copy-on-write reassigned the node, so the caller can
    /// repoint the parent.
    pub fn mark_dirty(&self, buf: &mut NodeBuf) -> Result<Option<(PageId, PageId)>> {
        let current = self.gen();
        if buf.gen == current {
            buf.dirty = true;
            return Ok(None);
        }
        if buf.dirty {
            // Unflushed changes belong to the closed generation; complete
            // its image at the old id before moving on.
            self.pages.write_page(buf.id, &buf.page)?;
        }
        let old = buf.id;
        let new = self.allocator.alloc();
        buf.id = new;
        buf.gen = current;
        buf.dirty = true;
        self.cache.rekey(old, new);
        self.allocator.free(old);
        Ok(Some((old, new)))
    }

    /// Frees a node's page and drops it from the cache.
    pub fn free_node(&self, id: PageId) {
        self.cache.remove(id);
        self.allocator.free(id);
    }

    /// Reads a raw (non-node) page.
    pub fn read_raw(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        self.pages.read_page(id, buf)
    }

    /// Writes a raw (non-node) page.
    pub fn write_raw(&self, id: PageId, buf: &[u8]) -> Result<()> {
        self.pages.write_page(id, buf)
    }
}
