//! Fragmented large values.
//!
//! A value too large for its leaf entry is stored as a descriptor plus
//! separately allocated pages. The descriptor holds the full length, an
//! optional inline head, and either a direct list of data page ids or the
//! root of an indirect tree of pointer pages. A data page id of zero means
//! a sparse, all-zero page: extending a value allocates nothing until real
//! bytes arrive.
//!
//! Descriptor layout: full length (varint), inline length (varint), inline
//! bytes, mode byte (0 direct, 1 indirect); direct mode is followed by a
//! count varint and 8-byte page ids, indirect mode by a level byte and the
//! 8-byte root page id. The encoding appears in stored leaf entries and
//! must stay bit-stable.
//!
//! Every mutation is copy-on-write: affected data pages move to fresh ids,
//! pointer pages are rebuilt, and the superseded pages are freed deferred.

use boreal_common::error::{BorealError, Result};
use boreal_common::types::PageId;
use boreal_common::varint;

use crate::store::PageStore;

/// Largest direct page list; beyond this the descriptor switches to an
/// indirect tree.
pub const DIRECT_MAX: usize = 32;

const MODE_DIRECT: u8 = 0;
const MODE_INDIRECT: u8 = 1;

/// A decoded fragmented value.
pub struct Fragmented {
    pub full_len: u64,
    pub inline: Vec<u8>,
    /// Data page ids in order; zero marks a sparse all-zero page.
    pub ids: Vec<u64>,
}

/// Original bytes displaced by a write, reported for undo logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OldRegion {
    pub pos: u64,
    pub bytes: Vec<u8>,
}

fn ids_per_page(store: &PageStore) -> usize {
    store.page_size / 8
}

fn page_count(full_len: u64, inline_len: usize, page_size: usize) -> usize {
    let tail = full_len.saturating_sub(inline_len as u64);
    tail.div_ceil(page_size as u64) as usize
}

/// Returns the full value length without materializing anything.
pub fn length(desc: &[u8]) -> Result<u64> {
    let mut slice = desc;
    varint::get_u64(&mut slice)
}

/// Decodes a descriptor, materializing indirect trees. Returns the value
/// and the pointer pages backing it (empty for direct mode).
pub fn parse(store: &PageStore, desc: &[u8]) -> Result<(Fragmented, Vec<u64>)> {
    let mut slice = desc;
    let full_len = varint::get_u64(&mut slice)?;
    let inline_len = varint::get_u64(&mut slice)? as usize;
    if slice.len() < inline_len + 1 {
        return Err(corrupt("fragment descriptor truncated"));
    }
    let inline = slice[..inline_len].to_vec();
    slice = &slice[inline_len..];
    let mode = slice[0];
    slice = &slice[1..];

    let count = page_count(full_len, inline_len, store.page_size);
    let mut ptr_pages = Vec::new();
    let ids = match mode {
        MODE_DIRECT => {
            let n = varint::get_u64(&mut slice)? as usize;
            if n != count || slice.len() < n * 8 {
                return Err(corrupt("direct fragment list malformed"));
            }
            (0..n)
                .map(|i| u64::from_le_bytes(slice[i * 8..i * 8 + 8].try_into().expect("len")))
                .collect()
        }
        MODE_INDIRECT => {
            if slice.len() < 9 {
                return Err(corrupt("indirect fragment header truncated"));
            }
            let levels = slice[0];
            let root = u64::from_le_bytes(slice[1..9].try_into().expect("len"));
            let mut ids = Vec::with_capacity(count);
            collect_ids(store, levels, root, count, &mut ids, &mut ptr_pages)?;
            ids
        }
        other => return Err(corrupt(&format!("bad fragment mode {}", other))),
    };
    Ok((Fragmented { full_len, inline, ids }, ptr_pages))
}

fn collect_ids(
    store: &PageStore,
    level: u8,
    page: u64,
    need: usize,
    out: &mut Vec<u64>,
    ptrs: &mut Vec<u64>,
) -> Result<()> {
    if out.len() >= need {
        return Ok(());
    }
    if level == 0 {
        out.push(page);
        return Ok(());
    }
    let per = ids_per_page(store);
    let child_cap = per.pow((level - 1) as u32);
    if page == 0 {
        // Sparse subtree.
        let want = (need - out.len()).min(per * child_cap);
        out.extend(std::iter::repeat(0).take(want));
        return Ok(());
    }
    ptrs.push(page);
    let mut buf = vec![0u8; store.page_size];
    store.read_raw(PageId(page), &mut buf)?;
    for i in 0..per {
        if out.len() >= need {
            break;
        }
        let child = u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().expect("len"));
        collect_ids(store, level - 1, child, need, out, ptrs)?;
    }
    Ok(())
}

/// Encodes a value back into a descriptor, writing pointer pages for
/// indirect mode. The caller frees the pointer pages of the previous
/// encoding.
pub fn build(store: &PageStore, frag: &Fragmented) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    varint::put_u64(&mut out, frag.full_len);
    varint::put_u64(&mut out, frag.inline.len() as u64);
    out.extend_from_slice(&frag.inline);

    if frag.ids.len() <= DIRECT_MAX {
        out.push(MODE_DIRECT);
        varint::put_u64(&mut out, frag.ids.len() as u64);
        for id in &frag.ids {
            out.extend_from_slice(&id.to_le_bytes());
        }
    } else {
        let per = ids_per_page(store);
        let mut levels = 1u8;
        while per.pow(levels as u32) < frag.ids.len() {
            levels += 1;
        }
        let root = build_tree(store, &frag.ids, levels)?;
        out.push(MODE_INDIRECT);
        out.push(levels);
        out.extend_from_slice(&root.to_le_bytes());
    }
    Ok(out)
}

fn build_tree(store: &PageStore, ids: &[u64], level: u8) -> Result<u64> {
    if level == 0 {
        debug_assert_eq!(ids.len(), 1);
        return Ok(ids[0]);
    }
    let per = ids_per_page(store);
    let child_cap = per.pow((level - 1) as u32);
    let mut children = Vec::with_capacity(per);
    for chunk in ids.chunks(child_cap) {
        children.push(build_tree(store, chunk, level - 1)?);
    }
    if children.iter().all(|&c| c == 0) {
        return Ok(0);
    }
    let mut buf = vec![0u8; store.page_size];
    for (i, child) in children.iter().enumerate() {
        buf[i * 8..i * 8 + 8].copy_from_slice(&child.to_le_bytes());
    }
    let id = store.allocator.alloc();
    store.write_raw(id, &buf)?;
    Ok(id.0)
}

/// Stores `data` as a new fragmented value and returns its descriptor.
pub fn create(store: &PageStore, data: &[u8]) -> Result<Vec<u8>> {
    let page_size = store.page_size;
    let mut ids = Vec::with_capacity(data.len().div_ceil(page_size));
    let mut buf = vec![0u8; page_size];
    for chunk in data.chunks(page_size) {
        if chunk.iter().all(|&b| b == 0) {
            ids.push(0);
            continue;
        }
        buf[..chunk.len()].copy_from_slice(chunk);
        buf[chunk.len()..].iter_mut().for_each(|b| *b = 0);
        let id = store.allocator.alloc();
        store.write_raw(id, &buf)?;
        ids.push(id.0);
    }
    build(
        store,
        &Fragmented { full_len: data.len() as u64, inline: Vec::new(), ids },
    )
}

/// Reads `out.len()` bytes starting at `pos`.
pub fn read(store: &PageStore, desc: &[u8], pos: u64, out: &mut [u8]) -> Result<()> {
    let (frag, _) = parse(store, desc)?;
    if pos + out.len() as u64 > frag.full_len {
        return Err(BorealError::InvalidArgument(
            "fragment read beyond value length".to_string(),
        ));
    }
    let page_size = store.page_size as u64;
    let inline_len = frag.inline.len() as u64;
    let mut buf = vec![0u8; store.page_size];

    let mut at = pos;
    let mut filled = 0usize;
    while filled < out.len() {
        if at < inline_len {
            let take = ((inline_len - at) as usize).min(out.len() - filled);
            out[filled..filled + take]
                .copy_from_slice(&frag.inline[at as usize..at as usize + take]);
            filled += take;
            at += take as u64;
            continue;
        }
        let rel = at - inline_len;
        let pi = (rel / page_size) as usize;
        let off = (rel % page_size) as usize;
        let take = (store.page_size - off).min(out.len() - filled);
        if frag.ids[pi] == 0 {
            out[filled..filled + take].iter_mut().for_each(|b| *b = 0);
        } else {
            store.read_raw(PageId(frag.ids[pi]), &mut buf)?;
            out[filled..filled + take].copy_from_slice(&buf[off..off + take]);
        }
        filled += take;
        at += take as u64;
    }
    Ok(())
}

/// Reads the whole value.
pub fn read_all(store: &PageStore, desc: &[u8]) -> Result<Vec<u8>> {
    let len = length(desc)? as usize;
    let mut out = vec![0u8; len];
    read(store, desc, 0, &mut out)?;
    Ok(out)
}

/// Overwrites `data` at `pos`, which must lie within the value. Affected
/// pages move to fresh ids. Returns the new descriptor and the displaced
/// regions, one per modified stretch, for undo logging.
pub fn write(
    store: &PageStore,
    desc: &[u8],
    pos: u64,
    data: &[u8],
) -> Result<(Vec<u8>, Vec<OldRegion>)> {
    let (mut frag, old_ptrs) = parse(store, desc)?;
    if pos + data.len() as u64 > frag.full_len {
        return Err(BorealError::InvalidArgument(
            "fragment write beyond value length".to_string(),
        ));
    }
    let page_size = store.page_size as u64;
    let inline_len = frag.inline.len() as u64;
    let mut regions = Vec::new();
    let mut buf = vec![0u8; store.page_size];

    let mut at = pos;
    let mut used = 0usize;
    while used < data.len() {
        if at < inline_len {
            let take = ((inline_len - at) as usize).min(data.len() - used);
            let a = at as usize;
            regions.push(OldRegion { pos: at, bytes: frag.inline[a..a + take].to_vec() });
            frag.inline[a..a + take].copy_from_slice(&data[used..used + take]);
            used += take;
            at += take as u64;
            continue;
        }
        let rel = at - inline_len;
        let pi = (rel / page_size) as usize;
        let off = (rel % page_size) as usize;
        let take = (store.page_size - off).min(data.len() - used);

        let old_id = frag.ids[pi];
        if old_id == 0 {
            buf.iter_mut().for_each(|b| *b = 0);
        } else {
            store.read_raw(PageId(old_id), &mut buf)?;
        }
        regions.push(OldRegion { pos: at, bytes: buf[off..off + take].to_vec() });
        buf[off..off + take].copy_from_slice(&data[used..used + take]);

        let new_id = store.allocator.alloc();
        store.write_raw(new_id, &buf)?;
        if old_id != 0 {
            store.allocator.free(PageId(old_id));
        }
        frag.ids[pi] = new_id.0;
        used += take;
        at += take as u64;
    }

    let new_desc = build(store, &frag)?;
    free_pointer_pages(store, &old_ptrs);
    Ok((new_desc, regions))
}

/// Changes the value's length. Extension is sparse; truncation frees pages
/// past the end and zeroes the kept partial tail so a later extension
/// reads zeros.
pub fn set_length(store: &PageStore, desc: &[u8], new_len: u64) -> Result<Vec<u8>> {
    let (mut frag, old_ptrs) = parse(store, desc)?;
    let page_size = store.page_size as u64;

    if new_len >= frag.full_len {
        let count = page_count(new_len, frag.inline.len(), store.page_size);
        frag.ids.resize(count, 0);
        frag.full_len = new_len;
    } else {
        let inline_len = frag.inline.len() as u64;
        if new_len <= inline_len {
            for &id in &frag.ids {
                if id != 0 {
                    store.allocator.free(PageId(id));
                }
            }
            frag.ids.clear();
            frag.inline.truncate(new_len as usize);
        } else {
            let keep = (new_len - inline_len).div_ceil(page_size) as usize;
            for &id in &frag.ids[keep..] {
                if id != 0 {
                    store.allocator.free(PageId(id));
                }
            }
            frag.ids.truncate(keep);
            // Zero the tail of the kept partial page.
            let tail_off = ((new_len - inline_len) % page_size) as usize;
            if tail_off != 0 && frag.ids[keep - 1] != 0 {
                let mut buf = vec![0u8; store.page_size];
                store.read_raw(PageId(frag.ids[keep - 1]), &mut buf)?;
                buf[tail_off..].iter_mut().for_each(|b| *b = 0);
                let new_id = store.allocator.alloc();
                store.write_raw(new_id, &buf)?;
                store.allocator.free(PageId(frag.ids[keep - 1]));
                frag.ids[keep - 1] = new_id.0;
            }
        }
        frag.full_len = new_len;
    }

    let new_desc = build(store, &frag)?;
    free_pointer_pages(store, &old_ptrs);
    Ok(new_desc)
}

/// Zeroes `len` bytes at `pos`. Fully covered pages are freed back to
/// sparse; partial pages are rewritten copy-on-write.
pub fn clear(
    store: &PageStore,
    desc: &[u8],
    pos: u64,
    len: u64,
) -> Result<(Vec<u8>, Vec<OldRegion>)> {
    let (mut frag, old_ptrs) = parse(store, desc)?;
    if pos + len > frag.full_len {
        return Err(BorealError::InvalidArgument(
            "fragment clear beyond value length".to_string(),
        ));
    }
    let page_size = store.page_size as u64;
    let inline_len = frag.inline.len() as u64;
    let mut regions = Vec::new();
    let mut buf = vec![0u8; store.page_size];

    let mut at = pos;
    let end = pos + len;
    while at < end {
        if at < inline_len {
            let take = ((inline_len - at).min(end - at)) as usize;
            let a = at as usize;
            regions.push(OldRegion { pos: at, bytes: frag.inline[a..a + take].to_vec() });
            frag.inline[a..a + take].iter_mut().for_each(|b| *b = 0);
            at += take as u64;
            continue;
        }
        let rel = at - inline_len;
        let pi = (rel / page_size) as usize;
        let off = (rel % page_size) as usize;
        let take = ((page_size - off as u64).min(end - at)) as usize;
        let old_id = frag.ids[pi];

        if old_id == 0 {
            at += take as u64;
            continue;
        }
        store.read_raw(PageId(old_id), &mut buf)?;
        regions.push(OldRegion { pos: at, bytes: buf[off..off + take].to_vec() });
        if off == 0 && take == store.page_size {
            store.allocator.free(PageId(old_id));
            frag.ids[pi] = 0;
        } else {
            buf[off..off + take].iter_mut().for_each(|b| *b = 0);
            let new_id = store.allocator.alloc();
            store.write_raw(new_id, &buf)?;
            store.allocator.free(PageId(old_id));
            frag.ids[pi] = new_id.0;
        }
        at += take as u64;
    }

    let new_desc = build(store, &frag)?;
    free_pointer_pages(store, &old_ptrs);
    Ok((new_desc, regions))
}

/// Frees every page the descriptor references.
pub fn free(store: &PageStore, desc: &[u8]) -> Result<()> {
    let (frag, ptrs) = parse(store, desc)?;
    for id in frag.ids {
        if id != 0 {
            store.allocator.free(PageId(id));
        }
    }
    free_pointer_pages(store, &ptrs);
    Ok(())
}

fn free_pointer_pages(store: &PageStore, ptrs: &[u64]) {
    for &p in ptrs {
        if p != 0 {
            store.allocator.free(PageId(p));
        }
    }
}

fn corrupt(reason: &str) -> BorealError {
    BorealError::Corrupt(reason.to_string())
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

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8 + 1).collect()
    }

    #[test]
    fn test_create_read_roundtrip_direct() {
        let store = mem_store();
        let data = pattern(2000); // 4 pages of 512
        let desc = create(&store, &data).unwrap();
        assert_eq!(length(&desc).unwrap(), 2000);
        assert_eq!(read_all(&store, &desc).unwrap(), data);
    }

    #[test]
    fn test_create_read_roundtrip_indirect() {
        let store = mem_store();
        // 40 pages exceeds DIRECT_MAX, forcing the indirect tree.
        let data = pattern(512 * 40);
        let desc = create(&store, &data).unwrap();
        assert_eq!(read_all(&store, &desc).unwrap(), data);
        // Descriptor stays small regardless of value size.
        assert!(desc.len() < 32);
    }

    #[test]
    fn test_sparse_pages_not_allocated() {
        let store = mem_store();
        let data = vec![0u8; 512 * 8];
        let free_before = store.allocator.logical_page_count();
        let desc = create(&store, &data).unwrap();
        assert_eq!(store.allocator.logical_page_count(), free_before);
        assert_eq!(read_all(&store, &desc).unwrap(), data);
    }

    #[test]
    fn test_read_at_offset() {
        let store = mem_store();
        let data = pattern(3000);
        let desc = create(&store, &data).unwrap();
        let mut out = vec![0u8; 700];
        read(&store, &desc, 450, &mut out).unwrap();
        assert_eq!(out, &data[450..1150]);
    }

    #[test]
    fn test_read_beyond_length_fails() {
        let store = mem_store();
        let desc = create(&store, &pattern(100)).unwrap();
        let mut out = vec![0u8; 10];
        assert!(read(&store, &desc, 95, &mut out).is_err());
    }

    #[test]
    fn test_write_cows_affected_pages() {
        let store = mem_store();
        let data = pattern(2048);
        let desc = create(&store, &data).unwrap();
        let (frag_before, _) = parse(&store, &desc).unwrap();

        let patch = vec![0xEE; 600];
        let (desc2, regions) = write(&store, &desc, 500, &patch).unwrap();

        let mut expect = data.clone();
        expect[500..1100].copy_from_slice(&patch);
        assert_eq!(read_all(&store, &desc2).unwrap(), expect);

        // Displaced regions reproduce the original bytes exactly once.
        let mut reassembled = Vec::new();
        for r in &regions {
            reassembled.extend_from_slice(&r.bytes);
        }
        assert_eq!(reassembled, &data[500..1100]);

        // The affected pages moved to new ids.
        let (frag_after, _) = parse(&store, &desc2).unwrap();
        assert_ne!(frag_before.ids[0], frag_after.ids[0]);
        assert_ne!(frag_before.ids[1], frag_after.ids[1]);
        assert_ne!(frag_before.ids[2], frag_after.ids[2]);
        assert_eq!(frag_before.ids[3], frag_after.ids[3]);
    }

    #[test]
    fn test_write_into_sparse_page() {
        let store = mem_store();
        let desc = create(&store, &vec![0u8; 1024]).unwrap();
        let (desc2, regions) = write(&store, &desc, 512, &[7u8; 10]).unwrap();
        let all = read_all(&store, &desc2).unwrap();
        assert_eq!(&all[512..522], &[7u8; 10]);
        assert!(all[..512].iter().all(|&b| b == 0));
        assert_eq!(regions[0].bytes, vec![0u8; 10]);
    }

    #[test]
    fn test_set_length_extends_sparsely() {
        let store = mem_store();
        let data = pattern(600);
        let desc = create(&store, &data).unwrap();
        let pages_before = store.allocator.logical_page_count();
        let desc2 = set_length(&store, &desc, 512 * 100).unwrap();
        // Extension allocates no data pages.
        assert_eq!(store.allocator.logical_page_count(), pages_before);
        assert_eq!(length(&desc2).unwrap(), 512 * 100);
        let all = read_all(&store, &desc2).unwrap();
        assert_eq!(&all[..600], &data[..]);
        assert!(all[600..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_set_length_truncates_and_zeroes_tail() {
        let store = mem_store();
        let data = pattern(2048);
        let desc = create(&store, &data).unwrap();
        let desc2 = set_length(&store, &desc, 700).unwrap();
        assert_eq!(length(&desc2).unwrap(), 700);
        assert_eq!(read_all(&store, &desc2).unwrap(), &data[..700]);
        // Extending again reads zeros, not stale bytes.
        let desc3 = set_length(&store, &desc2, 2048).unwrap();
        let all = read_all(&store, &desc3).unwrap();
        assert_eq!(&all[..700], &data[..700]);
        assert!(all[700..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_clear_frees_whole_pages() {
        let store = mem_store();
        let data = pattern(512 * 4);
        let desc = create(&store, &data).unwrap();
        let (desc2, regions) = clear(&store, &desc, 512, 1024).unwrap();
        let (frag, _) = parse(&store, &desc2).unwrap();
        assert_eq!(frag.ids[1], 0);
        assert_eq!(frag.ids[2], 0);
        let all = read_all(&store, &desc2).unwrap();
        assert!(all[512..1536].iter().all(|&b| b == 0));
        assert_eq!(&all[..512], &data[..512]);
        let total: usize = regions.iter().map(|r| r.bytes.len()).sum();
        assert_eq!(total, 1024);
    }

    #[test]
    fn test_clear_partial_page() {
        let store = mem_store();
        let data = pattern(512);
        let desc = create(&store, &data).unwrap();
        let (desc2, _) = clear(&store, &desc, 100, 50).unwrap();
        let all = read_all(&store, &desc2).unwrap();
        assert!(all[100..150].iter().all(|&b| b == 0));
        assert_eq!(&all[..100], &data[..100]);
        assert_eq!(&all[150..], &data[150..]);
    }

    #[test]
    fn test_free_releases_everything() {
        let store = mem_store();
        let data = pattern(512 * 40);
        let desc = create(&store, &data).unwrap();
        free(&store, &desc).unwrap();
        // 40 data pages plus at least one pointer page are deferred.
        assert!(store.allocator.deferred_count() >= 41);
    }

    #[test]
    fn test_inline_head_roundtrip() {
        let store = mem_store();
        let frag = Fragmented {
            full_len: 100,
            inline: pattern(100),
            ids: Vec::new(),
        };
        let desc = build(&store, &frag).unwrap();
        assert_eq!(read_all(&store, &desc).unwrap(), frag.inline);

        let (desc2, regions) = write(&store, &desc, 10, &[9u8; 20]).unwrap();
        let all = read_all(&store, &desc2).unwrap();
        assert_eq!(&all[10..30], &[9u8; 20]);
        assert_eq!(regions[0].pos, 10);
        assert_eq!(regions[0].bytes.len(), 20);
    }
}
