//! Per-transaction undo log.
//!
//! A stack of compensating records, appended as operations execute and
//! applied in reverse on rollback. Records live inline until the log grows
//! past a threshold, then spill into a chain of pages allocated from the
//! page store but outside any tree. The chain head is persisted in the
//! checkpoint's transaction table so recovery can roll back transactions
//! that were in flight at the checkpoint.
//!
//! Chain page layout: next page id (8), byte length (2), serialized
//! records oldest-first. The head page holds the newest spilled records; a
//! record never spans pages.

use boreal_common::error::{BorealError, Result};
use boreal_common::types::{IndexId, PageId};
use boreal_common::varint;
use bytes::{Buf, BufMut};

use crate::store::PageStore;

const OP_SCOPE_ENTER: u8 = 1;
const OP_SCOPE_COMMIT: u8 = 2;
const OP_UNINSERT: u8 = 3;
const OP_UNUPDATE: u8 = 4;
const OP_UNDELETE: u8 = 5;
const OP_UNDELETE_FRAGMENTED: u8 = 6;
const OP_UNCREATE: u8 = 7;
const OP_UNEXTEND: u8 = 8;
const OP_UNALLOC: u8 = 9;
const OP_UNWRITE: u8 = 10;
const OP_PREPARE: u8 = 11;
const OP_CUSTOM: u8 = 12;

const CHAIN_HEADER: usize = 10;

/// A compensating action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOp {
    /// Sentinel marking a nested scope boundary.
    ScopeEnter,
    /// Sentinel marking a committed scope folded into its parent.
    ScopeCommit,
    /// Reverses an insert by deleting the key.
    Uninsert { index: IndexId, key: Vec<u8> },
    /// Reverses an update by restoring the previous value.
    Unupdate { index: IndexId, key: Vec<u8>, value: Vec<u8> },
    /// Reverses a delete by restoring the previous value.
    Undelete { index: IndexId, key: Vec<u8>, value: Vec<u8> },
    /// Reverses a fragmented delete by moving the value back out of the
    /// trash. The payload is the index key followed by the trash suffix.
    UndeleteFragmented { index: IndexId, key: Vec<u8>, trash_suffix: Vec<u8> },
    /// Reverses an index creation.
    Uncreate { index: IndexId },
    /// Reverses a value extension by restoring the previous length.
    Unextend { index: IndexId, key: Vec<u8>, old_length: u64 },
    /// Reverses a sparse allocation by clearing the range.
    Unalloc { index: IndexId, key: Vec<u8>, pos: u64, length: u64 },
    /// Reverses a positional write by restoring the displaced bytes.
    Unwrite { index: IndexId, key: Vec<u8>, pos: u64, old: Vec<u8> },
    /// Marks a prepared two-phase transaction.
    Prepare,
    /// Opaque handler-defined payload.
    Custom { message: Vec<u8> },
}

fn put_bytes(out: &mut Vec<u8>, b: &[u8]) {
    varint::put_u64(out, b.len() as u64);
    out.put_slice(b);
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let len = varint::get_u64(buf)? as usize;
    if buf.remaining() < len {
        return Err(BorealError::Corrupt("truncated undo record".to_string()));
    }
    let mut v = vec![0u8; len];
    buf.copy_to_slice(&mut v);
    Ok(v)
}

impl UndoOp {
    pub fn encode(&self, out: &mut Vec<u8>) {
        use UndoOp::*;
        match self {
            ScopeEnter => out.push(OP_SCOPE_ENTER),
            ScopeCommit => out.push(OP_SCOPE_COMMIT),
            Uninsert { index, key } => {
                out.push(OP_UNINSERT);
                varint::put_u64(out, index.0);
                put_bytes(out, key);
            }
            Unupdate { index, key, value } => {
                out.push(OP_UNUPDATE);
                varint::put_u64(out, index.0);
                put_bytes(out, key);
                put_bytes(out, value);
            }
            Undelete { index, key, value } => {
                out.push(OP_UNDELETE);
                varint::put_u64(out, index.0);
                put_bytes(out, key);
                put_bytes(out, value);
            }
            UndeleteFragmented { index, key, trash_suffix } => {
                out.push(OP_UNDELETE_FRAGMENTED);
                varint::put_u64(out, index.0);
                put_bytes(out, key);
                put_bytes(out, trash_suffix);
            }
            Uncreate { index } => {
                out.push(OP_UNCREATE);
                varint::put_u64(out, index.0);
            }
            Unextend { index, key, old_length } => {
                out.push(OP_UNEXTEND);
                varint::put_u64(out, index.0);
                put_bytes(out, key);
                varint::put_u64(out, *old_length);
            }
            Unalloc { index, key, pos, length } => {
                out.push(OP_UNALLOC);
                varint::put_u64(out, index.0);
                put_bytes(out, key);
                varint::put_u64(out, *pos);
                varint::put_u64(out, *length);
            }
            Unwrite { index, key, pos, old } => {
                out.push(OP_UNWRITE);
                varint::put_u64(out, index.0);
                put_bytes(out, key);
                varint::put_u64(out, *pos);
                put_bytes(out, old);
            }
            Prepare => out.push(OP_PREPARE),
            Custom { message } => {
                out.push(OP_CUSTOM);
                put_bytes(out, message);
            }
        }
    }

    pub fn decode(buf: &mut &[u8]) -> Result<UndoOp> {
        use UndoOp::*;
        if !buf.has_remaining() {
            return Err(BorealError::Corrupt("empty undo record".to_string()));
        }
        let op = buf.get_u8();
        Ok(match op {
            OP_SCOPE_ENTER => ScopeEnter,
            OP_SCOPE_COMMIT => ScopeCommit,
            OP_UNINSERT => Uninsert {
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
            },
            OP_UNUPDATE => Unupdate {
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
                value: get_bytes(buf)?,
            },
            OP_UNDELETE => Undelete {
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
                value: get_bytes(buf)?,
            },
            OP_UNDELETE_FRAGMENTED => UndeleteFragmented {
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
                trash_suffix: get_bytes(buf)?,
            },
            OP_UNCREATE => Uncreate { index: IndexId(varint::get_u64(buf)?) },
            OP_UNEXTEND => Unextend {
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
                old_length: varint::get_u64(buf)?,
            },
            OP_UNALLOC => Unalloc {
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
                pos: varint::get_u64(buf)?,
                length: varint::get_u64(buf)?,
            },
            OP_UNWRITE => Unwrite {
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
                pos: varint::get_u64(buf)?,
                old: get_bytes(buf)?,
            },
            OP_PREPARE => Prepare,
            OP_CUSTOM => Custom { message: get_bytes(buf)? },
            other => {
                return Err(BorealError::Corrupt(format!("unknown undo opcode {}", other)))
            }
        })
    }
}

/// Per-transaction stack of compensating records.
pub struct UndoLog {
    records: Vec<UndoOp>,
    mem_bytes: usize,
    /// Records currently living in the spill chain.
    spilled_count: usize,
    /// Newest spill chain page; NONE when nothing spilled.
    spill_head: PageId,
    /// Every chain page, for freeing at truncate.
    spill_pages: Vec<PageId>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            mem_bytes: 0,
            spilled_count: 0,
            spill_head: PageId::NONE,
            spill_pages: Vec::new(),
        }
    }

    /// Total records in the log, inline and spilled.
    pub fn len(&self) -> usize {
        self.records.len() + self.spilled_count
    }

    /// Rebuilds a log from a persisted chain; used during recovery. The
    /// chain pages stay owned by the log and are freed at truncate.
    pub fn load(store: &PageStore, head: PageId) -> Result<Self> {
        let mut log = UndoLog::new();
        log.spill_head = head;
        let mut next = head;
        let mut buf = vec![0u8; store.page_size];
        let mut chains: Vec<Vec<UndoOp>> = Vec::new();
        while next.is_some() {
            store.read_raw(next, &mut buf)?;
            log.spill_pages.push(next);
            let len = u16::from_le_bytes([buf[8], buf[9]]) as usize;
            if CHAIN_HEADER + len > store.page_size {
                return Err(BorealError::PageCorrupted {
                    page_id: next.0,
                    reason: "undo chain length out of range".to_string(),
                });
            }
            let mut slice = &buf[CHAIN_HEADER..CHAIN_HEADER + len];
            let mut ops = Vec::new();
            while !slice.is_empty() {
                ops.push(UndoOp::decode(&mut slice)?);
            }
            chains.push(ops);
            next = PageId(u64::from_le_bytes(buf[0..8].try_into().expect("len")));
        }
        // Chain head holds the newest records; flatten oldest-first.
        for ops in chains.into_iter().rev() {
            log.records.extend(ops);
        }
        log.spill_head = PageId::NONE;
        Ok(log)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && !self.spill_head.is_some()
    }

    /// Pushes a record, spilling to pages when the inline buffer exceeds
    /// half a page.
    pub fn push(&mut self, store: &PageStore, op: UndoOp) -> Result<()> {
        let mut encoded = Vec::new();
        op.encode(&mut encoded);
        self.mem_bytes += encoded.len();
        self.records.push(op);
        if self.mem_bytes > store.page_size / 2 {
            self.spill(store)?;
        }
        Ok(())
    }

    /// Pops the newest record, reloading from the spill chain as needed.
    pub fn pop(&mut self, store: &PageStore) -> Result<Option<UndoOp>> {
        loop {
            if let Some(op) = self.records.pop() {
                return Ok(Some(op));
            }
            if !self.spill_head.is_some() {
                return Ok(None);
            }
            let mut buf = vec![0u8; store.page_size];
            store.read_raw(self.spill_head, &mut buf)?;
            let len = u16::from_le_bytes([buf[8], buf[9]]) as usize;
            let mut slice = &buf[CHAIN_HEADER..CHAIN_HEADER + len];
            let before = self.records.len();
            while !slice.is_empty() {
                self.records.push(UndoOp::decode(&mut slice)?);
            }
            self.spilled_count -= self.records.len() - before;
            let consumed = self.spill_head;
            self.spill_head =
                PageId(u64::from_le_bytes(buf[0..8].try_into().expect("len")));
            self.spill_pages.retain(|p| *p != consumed);
            store.allocator.free(consumed);
        }
    }

    /// Moves every inline record into the spill chain.
    fn spill(&mut self, store: &PageStore) -> Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        let capacity = store.page_size - CHAIN_HEADER;
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut current: Vec<u8> = Vec::new();
        for op in &self.records {
            let mut encoded = Vec::new();
            op.encode(&mut encoded);
            if encoded.len() > capacity {
                return Err(BorealError::Internal(
                    "undo record exceeds page capacity".to_string(),
                ));
            }
            if current.len() + encoded.len() > capacity {
                chunks.push(std::mem::take(&mut current));
            }
            current.extend_from_slice(&encoded);
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        // Older chunks link toward the existing chain; the newest chunk
        // becomes the head.
        let mut next = self.spill_head;
        let mut buf = vec![0u8; store.page_size];
        for chunk in chunks {
            let id = store.allocator.alloc();
            buf.iter_mut().for_each(|b| *b = 0);
            buf[0..8].copy_from_slice(&next.0.to_le_bytes());
            buf[8..10].copy_from_slice(&(chunk.len() as u16).to_le_bytes());
            buf[CHAIN_HEADER..CHAIN_HEADER + chunk.len()].copy_from_slice(&chunk);
            store.write_raw(id, &buf)?;
            self.spill_pages.push(id);
            next = id;
        }
        self.spill_head = next;
        self.spilled_count += self.records.len();
        self.records.clear();
        self.mem_bytes = 0;
        Ok(())
    }

    /// Spills everything and returns the chain head for the checkpoint's
    /// transaction table.
    pub fn persist(&mut self, store: &PageStore) -> Result<PageId> {
        self.spill(store)?;
        Ok(self.spill_head)
    }

    /// Discards the whole log, freeing its chain pages.
    pub fn truncate(&mut self, store: &PageStore) {
        for page in self.spill_pages.drain(..) {
            store.allocator.free(page);
        }
        self.spill_head = PageId::NONE;
        self.records.clear();
        self.mem_bytes = 0;
        self.spilled_count = 0;
    }
}

impl Default for UndoLog {
    fn default() -> Self {
        Self::new()
    }
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
        PageStore::new(pages, PageAllocator::new(2), NodeCache::new(50))
    }

    fn sample(i: u64) -> UndoOp {
        UndoOp::Undelete {
            index: IndexId(3),
            key: i.to_be_bytes().to_vec(),
            value: vec![i as u8; 20],
        }
    }

    #[test]
    fn test_encode_decode_all_ops() {
        let ops = vec![
            UndoOp::ScopeEnter,
            UndoOp::ScopeCommit,
            UndoOp::Uninsert { index: IndexId(1), key: b"k".to_vec() },
            UndoOp::Unupdate { index: IndexId(1), key: b"k".to_vec(), value: b"v".to_vec() },
            UndoOp::Undelete { index: IndexId(1), key: b"k".to_vec(), value: vec![] },
            UndoOp::UndeleteFragmented {
                index: IndexId(2),
                key: b"k2".to_vec(),
                trash_suffix: vec![0xff],
            },
            UndoOp::Uncreate { index: IndexId(9) },
            UndoOp::Unextend { index: IndexId(1), key: b"k".to_vec(), old_length: 4096 },
            UndoOp::Unalloc { index: IndexId(1), key: b"k".to_vec(), pos: 10, length: 20 },
            UndoOp::Unwrite {
                index: IndexId(1),
                key: b"k".to_vec(),
                pos: 100,
                old: vec![1, 2, 3],
            },
            UndoOp::Prepare,
            UndoOp::Custom { message: b"handler".to_vec() },
        ];
        for op in ops {
            let mut buf = Vec::new();
            op.encode(&mut buf);
            let mut slice = &buf[..];
            assert_eq!(UndoOp::decode(&mut slice).unwrap(), op);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_push_pop_lifo() {
        let store = mem_store();
        let mut log = UndoLog::new();
        for i in 0..5 {
            log.push(&store, sample(i)).unwrap();
        }
        for i in (0..5).rev() {
            assert_eq!(log.pop(&store).unwrap().unwrap(), sample(i));
        }
        assert!(log.pop(&store).unwrap().is_none());
        assert!(log.is_empty());
    }

    #[test]
    fn test_spill_and_pop_back() {
        let store = mem_store();
        let mut log = UndoLog::new();
        // Enough records to force several spills with 512-byte pages.
        for i in 0..100 {
            log.push(&store, sample(i)).unwrap();
        }
        assert!(log.spill_head.is_some() || !log.records.is_empty());
        for i in (0..100).rev() {
            assert_eq!(log.pop(&store).unwrap().unwrap(), sample(i), "record {}", i);
        }
        assert!(log.pop(&store).unwrap().is_none());
    }

    #[test]
    fn test_persist_and_load() {
        let store = mem_store();
        let mut log = UndoLog::new();
        for i in 0..50 {
            log.push(&store, sample(i)).unwrap();
        }
        let head = log.persist(&store).unwrap();
        assert!(head.is_some());

        let mut loaded = UndoLog::load(&store, head).unwrap();
        for i in (0..50).rev() {
            assert_eq!(loaded.pop(&store).unwrap().unwrap(), sample(i), "record {}", i);
        }
        assert!(loaded.pop(&store).unwrap().is_none());
    }

    #[test]
    fn test_truncate_frees_chain() {
        let store = mem_store();
        let mut log = UndoLog::new();
        for i in 0..100 {
            log.push(&store, sample(i)).unwrap();
        }
        log.persist(&store).unwrap();
        let deferred_before = store.allocator.deferred_count();
        log.truncate(&store);
        assert!(store.allocator.deferred_count() > deferred_before);
        assert!(log.is_empty());
    }

    #[test]
    fn test_scope_sentinels_pop_in_order() {
        let store = mem_store();
        let mut log = UndoLog::new();
        log.push(&store, sample(1)).unwrap();
        log.push(&store, UndoOp::ScopeEnter).unwrap();
        log.push(&store, sample(2)).unwrap();

        assert_eq!(log.pop(&store).unwrap().unwrap(), sample(2));
        assert_eq!(log.pop(&store).unwrap().unwrap(), UndoOp::ScopeEnter);
        assert_eq!(log.pop(&store).unwrap().unwrap(), sample(1));
    }
}
