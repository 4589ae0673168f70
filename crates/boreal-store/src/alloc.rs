//! Page allocator with a persisted free list.
//!
//! Allocation draws from the in-memory free set or mints a fresh page past
//! the end of the array. A freed page enters the deferred set: it is
//! persisted as free by the next checkpoint but only becomes allocatable
//! once that checkpoint's header is durable. Until then the page may still
//! be referenced by the previous durable root, and reusing it would corrupt
//! the state a crash would recover to.
//!
//! The free list itself is stored copy-on-write in a chain of pages minted
//! at commit time. The chain pages of the superseded checkpoint are
//! recycled the same deferred way.
//!
//! Chain page layout: next page id (8), entry count (4), reserved (4),
//! then 8-byte page ids, little-endian.

use boreal_common::error::{BorealError, Result};
use boreal_common::types::PageId;
use parking_lot::Mutex;

use crate::pagearray::PageArray;

const CHAIN_HEADER: usize = 16;

struct AllocState {
    /// Allocatable now.
    free: Vec<u64>,
    /// Freed since the last completed checkpoint.
    deferred: Vec<u64>,
    /// Pages holding the current durable free list.
    list_pages: Vec<u64>,
    /// Pages written by an in-progress commit.
    pending_list_pages: Vec<u64>,
    /// Next page index minted by growing the array.
    next_new: u64,
}

/// Allocates, frees, and recycles fixed-size pages.
pub struct PageAllocator {
    state: Mutex<AllocState>,
}

impl PageAllocator {
    /// Creates an allocator for a fresh database. Pages 0 and 1 are the
    /// header pair and are never handed out.
    pub fn new(page_count: u64) -> Self {
        Self {
            state: Mutex::new(AllocState {
                free: Vec::new(),
                deferred: Vec::new(),
                list_pages: Vec::new(),
                pending_list_pages: Vec::new(),
                next_new: page_count.max(2),
            }),
        }
    }

    /// Rebuilds the allocator from the persisted free list.
    pub fn load(pages: &dyn PageArray, root: PageId, page_count: u64) -> Result<Self> {
        let mut free = Vec::new();
        let mut list_pages = Vec::new();
        let page_size = pages.page_size();
        let mut buf = vec![0u8; page_size];
        let mut next = root;
        while next.is_some() {
            pages.read_page(next, &mut buf)?;
            list_pages.push(next.0);
            let count =
                u32::from_le_bytes(buf[8..12].try_into().expect("slice len")) as usize;
            let max_entries = (page_size - CHAIN_HEADER) / 8;
            if count > max_entries {
                return Err(BorealError::PageCorrupted {
                    page_id: next.0,
                    reason: "free list entry count out of range".to_string(),
                });
            }
            for i in 0..count {
                let at = CHAIN_HEADER + i * 8;
                free.push(u64::from_le_bytes(
                    buf[at..at + 8].try_into().expect("slice len"),
                ));
            }
            next = PageId(u64::from_le_bytes(buf[0..8].try_into().expect("slice len")));
        }
        Ok(Self {
            state: Mutex::new(AllocState {
                free,
                deferred: Vec::new(),
                list_pages,
                pending_list_pages: Vec::new(),
                next_new: page_count.max(2),
            }),
        })
    }

    /// Allocates one page.
    pub fn alloc(&self) -> PageId {
        let mut s = self.state.lock();
        match s.free.pop() {
            Some(id) => PageId(id),
            None => {
                let id = s.next_new;
                s.next_new += 1;
                PageId(id)
            }
        }
    }

    /// Frees a page. The page becomes allocatable only after the next
    /// completed checkpoint.
    pub fn free(&self, id: PageId) {
        debug_assert!(id.0 >= 2, "freed a header page");
        self.state.lock().deferred.push(id.0);
    }

    /// Ensures at least `n` pages are immediately allocatable without
    /// growing the array mid-operation.
    pub fn reserve(&self, n: usize) {
        let mut s = self.state.lock();
        while s.free.len() < n {
            let id = s.next_new;
            s.next_new += 1;
            s.free.push(id);
        }
    }

    /// Number of immediately allocatable pages.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Number of pages awaiting the next checkpoint.
    pub fn deferred_count(&self) -> usize {
        self.state.lock().deferred.len()
    }

    /// Index one past the highest page this allocator may have handed out.
    pub fn logical_page_count(&self) -> u64 {
        self.state.lock().next_new
    }

    /// Persists the free list for a checkpoint and returns its root. The
    /// persisted set is everything that will be free once the new header is
    /// durable: the free set, the deferred set, and the superseded list
    /// chain.
    pub fn commit(&self, pages: &dyn PageArray) -> Result<PageId> {
        let mut s = self.state.lock();
        let mut to_persist: Vec<u64> = Vec::with_capacity(
            s.free.len() + s.deferred.len() + s.list_pages.len(),
        );
        to_persist.extend_from_slice(&s.free);
        to_persist.extend_from_slice(&s.deferred);
        to_persist.extend_from_slice(&s.list_pages);

        let page_size = pages.page_size();
        let per_page = (page_size - CHAIN_HEADER) / 8;
        let mut chain_pages = Vec::new();
        let mut root = PageId::NONE;

        // Chunks are written back to front so each page links to the
        // previously written one.
        let mut remaining = &to_persist[..];
        let mut chunks = Vec::new();
        while !remaining.is_empty() {
            let take = remaining.len().min(per_page);
            let (chunk, rest) = remaining.split_at(take);
            chunks.push(chunk);
            remaining = rest;
        }
        let mut buf = vec![0u8; page_size];
        for chunk in chunks.iter().rev() {
            let id = s.next_new;
            s.next_new += 1;
            buf.iter_mut().for_each(|b| *b = 0);
            buf[0..8].copy_from_slice(&root.0.to_le_bytes());
            buf[8..12].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
            for (i, page) in chunk.iter().enumerate() {
                let at = CHAIN_HEADER + i * 8;
                buf[at..at + 8].copy_from_slice(&page.to_le_bytes());
            }
            pages.write_page(PageId(id), &buf)?;
            chain_pages.push(id);
            root = PageId(id);
        }

        s.pending_list_pages = chain_pages;
        Ok(root)
    }

    /// Completes a checkpoint after its header is durable. Deferred pages
    /// and the superseded list chain become allocatable.
    pub fn finish_checkpoint(&self) {
        let mut s = self.state.lock();
        let deferred = std::mem::take(&mut s.deferred);
        s.free.extend(deferred);
        let old_list = std::mem::take(&mut s.list_pages);
        s.free.extend(old_list);
        s.list_pages = std::mem::take(&mut s.pending_list_pages);
    }

    /// Abandons an in-progress commit after a failure; the pending chain
    /// pages are recycled.
    pub fn abort_commit(&self) {
        let mut s = self.state.lock();
        let pending = std::mem::take(&mut s.pending_list_pages);
        s.deferred.extend(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagearray::MemPageArray;

    #[test]
    fn test_alloc_mints_past_headers() {
        let alloc = PageAllocator::new(0);
        assert_eq!(alloc.alloc(), PageId(2));
        assert_eq!(alloc.alloc(), PageId(3));
        assert_eq!(alloc.logical_page_count(), 4);
    }

    #[test]
    fn test_freed_page_not_reused_before_checkpoint() {
        let alloc = PageAllocator::new(2);
        let a = alloc.alloc();
        alloc.free(a);
        assert_eq!(alloc.deferred_count(), 1);
        // The freed page must not come back yet.
        let b = alloc.alloc();
        assert_ne!(a, b);
        alloc.finish_checkpoint();
        assert_eq!(alloc.deferred_count(), 0);
        assert_eq!(alloc.alloc(), a);
    }

    #[test]
    fn test_reserve() {
        let alloc = PageAllocator::new(2);
        alloc.reserve(5);
        assert_eq!(alloc.free_count(), 5);
        for _ in 0..5 {
            alloc.alloc();
        }
        assert_eq!(alloc.free_count(), 0);
    }

    #[test]
    fn test_commit_and_load_roundtrip() {
        let pages = MemPageArray::new(512);
        pages.set_page_count(2).unwrap();
        let alloc = PageAllocator::new(2);

        let a = alloc.alloc();
        let b = alloc.alloc();
        let _c = alloc.alloc();
        alloc.free(a);
        alloc.free(b);

        let root = alloc.commit(&pages).unwrap();
        assert!(root.is_some());
        alloc.finish_checkpoint();

        let loaded =
            PageAllocator::load(&pages, root, alloc.logical_page_count()).unwrap();
        // The persisted free set is exactly the two freed pages.
        let mut got = Vec::new();
        while loaded.free_count() > 0 {
            got.push(loaded.alloc().0);
        }
        got.sort_unstable();
        assert_eq!(got, vec![a.0, b.0]);
    }

    #[test]
    fn test_commit_empty_free_list() {
        let pages = MemPageArray::new(512);
        pages.set_page_count(2).unwrap();
        let alloc = PageAllocator::new(2);
        let root = alloc.commit(&pages).unwrap();
        assert_eq!(root, PageId::NONE);
        alloc.finish_checkpoint();
    }

    #[test]
    fn test_old_chain_recycled_next_checkpoint() {
        let pages = MemPageArray::new(512);
        pages.set_page_count(2).unwrap();
        let alloc = PageAllocator::new(2);

        let a = alloc.alloc();
        alloc.free(a);
        let root1 = alloc.commit(&pages).unwrap();
        alloc.finish_checkpoint();
        assert!(root1.is_some());

        // Second checkpoint persists the first chain page as free.
        let root2 = alloc.commit(&pages).unwrap();
        alloc.finish_checkpoint();
        assert!(root2.is_some());
        assert_ne!(root1, root2);

        let loaded =
            PageAllocator::load(&pages, root2, alloc.logical_page_count()).unwrap();
        let mut got = Vec::new();
        while loaded.free_count() > 0 {
            got.push(loaded.alloc().0);
        }
        assert!(got.contains(&root1.0));
    }

    #[test]
    fn test_multi_page_chain() {
        let pages = MemPageArray::new(512);
        pages.set_page_count(2).unwrap();
        let alloc = PageAllocator::new(2);

        // More frees than fit in one 512-byte chain page (62 entries).
        let ids: Vec<PageId> = (0..200).map(|_| alloc.alloc()).collect();
        for id in &ids {
            alloc.free(*id);
        }
        let root = alloc.commit(&pages).unwrap();
        alloc.finish_checkpoint();

        let loaded =
            PageAllocator::load(&pages, root, alloc.logical_page_count()).unwrap();
        assert_eq!(loaded.free_count(), 200);
    }

    #[test]
    fn test_abort_commit_recycles_chain() {
        let pages = MemPageArray::new(512);
        pages.set_page_count(2).unwrap();
        let alloc = PageAllocator::new(2);
        let a = alloc.alloc();
        alloc.free(a);
        alloc.commit(&pages).unwrap();
        alloc.abort_commit();
        // Deferred still holds the freed page plus the abandoned chain page.
        assert!(alloc.deferred_count() >= 2);
    }
}
