//! Fixed-size-page random-access block device.
//!
//! A `PageArray` addresses pages by 64-bit index. Writes grow the array as
//! needed. `SnapshotPageArray` decorates another array and offers the
//! original contents of a page to every registered snapshot hook before the
//! page is overwritten; copy-on-write snapshots depend on this pre-image
//! fan-out.

use boreal_common::error::{BorealError, Result};
use boreal_common::types::PageId;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use std::os::unix::fs::FileExt;

/// Random-access array of fixed-size pages.
pub trait PageArray: Send + Sync {
    /// Bytes per page, fixed at creation.
    fn page_size(&self) -> usize;

    /// Number of pages in the array.
    fn page_count(&self) -> u64;

    /// Truncates or extends the array to exactly `count` pages.
    fn set_page_count(&self, count: u64) -> Result<()>;

    /// Reads a full page into `buf`.
    fn read_page(&self, index: PageId, buf: &mut [u8]) -> Result<()>;

    /// Reads `len` bytes starting at byte `start` within the page.
    fn read_partial(&self, index: PageId, start: usize, buf: &mut [u8]) -> Result<()>;

    /// Reads `count` consecutive pages into `buf`.
    fn read_cluster(&self, index: PageId, buf: &mut [u8], count: u64) -> Result<()>;

    /// Writes a full page, growing the array as necessary.
    fn write_page(&self, index: PageId, buf: &[u8]) -> Result<()>;

    /// Makes preceding writes durable. `metadata` additionally syncs file
    /// length changes.
    fn sync(&self, metadata: bool) -> Result<()>;

    /// Returns true if the array cannot be written.
    fn is_read_only(&self) -> bool {
        false
    }
}

/// Page array backed by a single file, addressed positionally.
pub struct FilePageArray {
    file: File,
    page_size: usize,
    page_count: AtomicU64,
    read_only: bool,
    fsync_enabled: bool,
}

impl FilePageArray {
    /// Opens or creates the file at `path`.
    pub fn open(path: &Path, page_size: usize, fsync_enabled: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 {
            return Err(BorealError::Corrupt(format!(
                "file length {} not a multiple of page size {}",
                len, page_size
            )));
        }
        Ok(Self {
            file,
            page_size,
            page_count: AtomicU64::new(len / page_size as u64),
            read_only: false,
            fsync_enabled,
        })
    }

    /// Opens the file read-only.
    pub fn open_read_only(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            page_size,
            page_count: AtomicU64::new(len / page_size as u64),
            read_only: true,
            fsync_enabled: false,
        })
    }

    fn check_readable(&self, index: PageId, len: usize, start: usize) -> Result<u64> {
        let count = self.page_count.load(Ordering::Acquire);
        if index.0 >= count {
            return Err(BorealError::InvalidPageId(index.0));
        }
        if start + len > self.page_size {
            return Err(BorealError::InvalidArgument(
                "read beyond page bounds".to_string(),
            ));
        }
        Ok(index.0 * self.page_size as u64 + start as u64)
    }
}

impl PageArray for FilePageArray {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u64 {
        self.page_count.load(Ordering::Acquire)
    }

    fn set_page_count(&self, count: u64) -> Result<()> {
        if self.read_only {
            return Err(BorealError::InvalidArgument("read-only page array".to_string()));
        }
        self.file.set_len(count * self.page_size as u64)?;
        self.page_count.store(count, Ordering::Release);
        Ok(())
    }

    fn read_page(&self, index: PageId, buf: &mut [u8]) -> Result<()> {
        let off = self.check_readable(index, self.page_size, 0)?;
        self.file.read_exact_at(&mut buf[..self.page_size], off)?;
        Ok(())
    }

    fn read_partial(&self, index: PageId, start: usize, buf: &mut [u8]) -> Result<()> {
        let off = self.check_readable(index, buf.len(), start)?;
        self.file.read_exact_at(buf, off)?;
        Ok(())
    }

    fn read_cluster(&self, index: PageId, buf: &mut [u8], count: u64) -> Result<()> {
        let total = self.page_size as u64 * count;
        if index.0 + count > self.page_count() {
            return Err(BorealError::InvalidPageId(index.0 + count - 1));
        }
        self.file
            .read_exact_at(&mut buf[..total as usize], index.0 * self.page_size as u64)?;
        Ok(())
    }

    fn write_page(&self, index: PageId, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BorealError::InvalidArgument("read-only page array".to_string()));
        }
        if buf.len() != self.page_size {
            return Err(BorealError::InvalidArgument(
                "write buffer is not page sized".to_string(),
            ));
        }
        self.file.write_all_at(buf, index.0 * self.page_size as u64)?;
        // Grow the logical count when writing past the end.
        let mut count = self.page_count.load(Ordering::Acquire);
        while index.0 >= count {
            match self.page_count.compare_exchange(
                count,
                index.0 + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => count = actual,
            }
        }
        Ok(())
    }

    fn sync(&self, metadata: bool) -> Result<()> {
        if !self.fsync_enabled {
            return Ok(());
        }
        if metadata {
            self.file.sync_all()?;
        } else {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Page array held entirely in memory, for temporary databases and tests.
pub struct MemPageArray {
    page_size: usize,
    pages: RwLock<Vec<Box<[u8]>>>,
}

impl MemPageArray {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: RwLock::new(Vec::new()),
        }
    }
}

impl PageArray for MemPageArray {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u64 {
        self.pages.read().len() as u64
    }

    fn set_page_count(&self, count: u64) -> Result<()> {
        let mut pages = self.pages.write();
        let page_size = self.page_size;
        pages.resize_with(count as usize, || vec![0u8; page_size].into_boxed_slice());
        Ok(())
    }

    fn read_page(&self, index: PageId, buf: &mut [u8]) -> Result<()> {
        let pages = self.pages.read();
        let page = pages
            .get(index.0 as usize)
            .ok_or(BorealError::InvalidPageId(index.0))?;
        buf[..self.page_size].copy_from_slice(page);
        Ok(())
    }

    fn read_partial(&self, index: PageId, start: usize, buf: &mut [u8]) -> Result<()> {
        let pages = self.pages.read();
        let page = pages
            .get(index.0 as usize)
            .ok_or(BorealError::InvalidPageId(index.0))?;
        if start + buf.len() > self.page_size {
            return Err(BorealError::InvalidArgument(
                "read beyond page bounds".to_string(),
            ));
        }
        buf.copy_from_slice(&page[start..start + buf.len()]);
        Ok(())
    }

    fn read_cluster(&self, index: PageId, buf: &mut [u8], count: u64) -> Result<()> {
        for i in 0..count {
            let at = (i as usize) * self.page_size;
            self.read_page(PageId(index.0 + i), &mut buf[at..at + self.page_size])?;
        }
        Ok(())
    }

    fn write_page(&self, index: PageId, buf: &[u8]) -> Result<()> {
        if buf.len() != self.page_size {
            return Err(BorealError::InvalidArgument(
                "write buffer is not page sized".to_string(),
            ));
        }
        let mut pages = self.pages.write();
        let page_size = self.page_size;
        if index.0 as usize >= pages.len() {
            pages.resize_with(index.0 as usize + 1, || {
                vec![0u8; page_size].into_boxed_slice()
            });
        }
        pages[index.0 as usize].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self, _metadata: bool) -> Result<()> {
        Ok(())
    }
}

/// Pre-image hook registered by an active snapshot.
pub trait SnapshotHook: Send + Sync {
    /// Offered the original contents of a page about to be overwritten.
    fn capture(&self, index: PageId, original: &[u8]);
}

/// Decorator that fans page overwrites out to snapshot hooks.
pub struct SnapshotPageArray {
    inner: Arc<dyn PageArray>,
    hooks: Mutex<Vec<Arc<dyn SnapshotHook>>>,
}

impl SnapshotPageArray {
    pub fn new(inner: Arc<dyn PageArray>) -> Self {
        Self {
            inner,
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Direct access to the undecorated array.
    pub fn inner(&self) -> &Arc<dyn PageArray> {
        &self.inner
    }

    pub fn register(&self, hook: Arc<dyn SnapshotHook>) {
        self.hooks.lock().push(hook);
    }

    pub fn unregister(&self, hook: &Arc<dyn SnapshotHook>) {
        self.hooks.lock().retain(|h| !Arc::ptr_eq(h, hook));
    }

    pub fn has_hooks(&self) -> bool {
        !self.hooks.lock().is_empty()
    }
}

impl PageArray for SnapshotPageArray {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn page_count(&self) -> u64 {
        self.inner.page_count()
    }

    fn set_page_count(&self, count: u64) -> Result<()> {
        self.inner.set_page_count(count)
    }

    fn read_page(&self, index: PageId, buf: &mut [u8]) -> Result<()> {
        self.inner.read_page(index, buf)
    }

    fn read_partial(&self, index: PageId, start: usize, buf: &mut [u8]) -> Result<()> {
        self.inner.read_partial(index, start, buf)
    }

    fn read_cluster(&self, index: PageId, buf: &mut [u8], count: u64) -> Result<()> {
        self.inner.read_cluster(index, buf, count)
    }

    fn write_page(&self, index: PageId, buf: &[u8]) -> Result<()> {
        let hooks: Vec<_> = self.hooks.lock().clone();
        if !hooks.is_empty() && index.0 < self.inner.page_count() {
            let mut original = vec![0u8; self.page_size()];
            self.inner.read_page(index, &mut original)?;
            for hook in &hooks {
                hook.capture(index, &original);
            }
        }
        self.inner.write_page(index, buf)
    }

    fn sync(&self, metadata: bool) -> Result<()> {
        self.inner.sync(metadata)
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }
}

/// Restores a snapshot stream into a fresh page array, writing consecutive
/// pages beginning at index 0. Refuses non-empty or read-only targets.
pub fn restore_from_snapshot(
    target: &dyn PageArray,
    stream: &mut dyn Read,
) -> Result<u64> {
    if target.is_read_only() {
        return Err(BorealError::InvalidArgument(
            "cannot restore into a read-only page array".to_string(),
        ));
    }
    if target.page_count() != 0 {
        return Err(BorealError::InvalidArgument(
            "cannot restore into a non-empty page array".to_string(),
        ));
    }

    let page_size = target.page_size();
    let mut buf = vec![0u8; page_size];
    let mut index = 0u64;
    loop {
        let mut filled = 0;
        while filled < page_size {
            let n = stream.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(index);
        }
        if filled != page_size {
            return Err(BorealError::Corrupt(
                "snapshot stream is not page aligned".to_string(),
            ));
        }
        target.write_page(PageId(index), &buf)?;
        index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PS: usize = 512;

    fn filled(b: u8) -> Vec<u8> {
        vec![b; PS]
    }

    #[test]
    fn test_mem_array_write_read() {
        let arr = MemPageArray::new(PS);
        assert_eq!(arr.page_count(), 0);
        arr.write_page(PageId(0), &filled(0xAA)).unwrap();
        arr.write_page(PageId(3), &filled(0xBB)).unwrap();
        assert_eq!(arr.page_count(), 4);

        let mut buf = vec![0u8; PS];
        arr.read_page(PageId(0), &mut buf).unwrap();
        assert_eq!(buf[0], 0xAA);
        arr.read_page(PageId(3), &mut buf).unwrap();
        assert_eq!(buf[PS - 1], 0xBB);
        // Implicitly grown pages are zeroed.
        arr.read_page(PageId(1), &mut buf).unwrap();
        assert_eq!(buf, vec![0u8; PS]);
    }

    #[test]
    fn test_mem_array_read_partial() {
        let arr = MemPageArray::new(PS);
        let mut page = filled(0);
        page[100..104].copy_from_slice(&[1, 2, 3, 4]);
        arr.write_page(PageId(0), &page).unwrap();

        let mut buf = [0u8; 4];
        arr.read_partial(PageId(0), 100, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        let mut too_far = [0u8; 4];
        assert!(arr.read_partial(PageId(0), PS - 2, &mut too_far).is_err());
    }

    #[test]
    fn test_mem_array_invalid_reads() {
        let arr = MemPageArray::new(PS);
        let mut buf = vec![0u8; PS];
        assert!(matches!(
            arr.read_page(PageId(0), &mut buf),
            Err(BorealError::InvalidPageId(0))
        ));
    }

    #[test]
    fn test_file_array_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");
        let arr = FilePageArray::open(&path, PS, false).unwrap();

        arr.write_page(PageId(0), &filled(0x11)).unwrap();
        arr.write_page(PageId(5), &filled(0x22)).unwrap();
        assert_eq!(arr.page_count(), 6);
        arr.sync(true).unwrap();
        drop(arr);

        let arr = FilePageArray::open(&path, PS, false).unwrap();
        assert_eq!(arr.page_count(), 6);
        let mut buf = vec![0u8; PS];
        arr.read_page(PageId(5), &mut buf).unwrap();
        assert_eq!(buf[0], 0x22);
    }

    #[test]
    fn test_file_array_read_cluster() {
        let dir = tempdir().unwrap();
        let arr = FilePageArray::open(&dir.path().join("c.db"), PS, false).unwrap();
        for i in 0..4u64 {
            arr.write_page(PageId(i), &filled(i as u8)).unwrap();
        }
        let mut buf = vec![0u8; PS * 3];
        arr.read_cluster(PageId(1), &mut buf, 3).unwrap();
        assert_eq!(buf[0], 1);
        assert_eq!(buf[PS], 2);
        assert_eq!(buf[2 * PS], 3);
        assert!(arr.read_cluster(PageId(2), &mut buf, 3).is_err());
    }

    #[test]
    fn test_file_array_set_page_count() {
        let dir = tempdir().unwrap();
        let arr = FilePageArray::open(&dir.path().join("t.db"), PS, false).unwrap();
        for i in 0..10u64 {
            arr.write_page(PageId(i), &filled(1)).unwrap();
        }
        arr.set_page_count(4).unwrap();
        assert_eq!(arr.page_count(), 4);
        let mut buf = vec![0u8; PS];
        assert!(arr.read_page(PageId(4), &mut buf).is_err());
    }

    #[test]
    fn test_snapshot_fanout_captures_preimage() {
        struct Recording {
            seen: Mutex<Vec<(u64, u8)>>,
        }
        impl SnapshotHook for Recording {
            fn capture(&self, index: PageId, original: &[u8]) {
                self.seen.lock().push((index.0, original[0]));
            }
        }

        let inner: Arc<dyn PageArray> = Arc::new(MemPageArray::new(PS));
        let arr = SnapshotPageArray::new(inner);
        arr.write_page(PageId(0), &filled(0x01)).unwrap();

        let hook = Arc::new(Recording { seen: Mutex::new(Vec::new()) });
        arr.register(hook.clone());

        // Overwriting an existing page offers its original contents.
        arr.write_page(PageId(0), &filled(0x02)).unwrap();
        // Writing past the end offers nothing.
        arr.write_page(PageId(9), &filled(0x03)).unwrap();

        let hook_dyn: Arc<dyn SnapshotHook> = hook.clone();
        arr.unregister(&hook_dyn);
        arr.write_page(PageId(0), &filled(0x04)).unwrap();

        assert_eq!(*hook.seen.lock(), vec![(0, 0x01)]);
    }

    #[test]
    fn test_restore_from_snapshot() {
        let source = MemPageArray::new(PS);
        source.write_page(PageId(0), &filled(0xAA)).unwrap();
        source.write_page(PageId(1), &filled(0xBB)).unwrap();

        let mut stream = Vec::new();
        let mut buf = vec![0u8; PS];
        for i in 0..source.page_count() {
            source.read_page(PageId(i), &mut buf).unwrap();
            stream.extend_from_slice(&buf);
        }

        let target = MemPageArray::new(PS);
        let n = restore_from_snapshot(&target, &mut &stream[..]).unwrap();
        assert_eq!(n, 2);
        target.read_page(PageId(1), &mut buf).unwrap();
        assert_eq!(buf[0], 0xBB);
    }

    #[test]
    fn test_restore_refuses_non_empty() {
        let target = MemPageArray::new(PS);
        target.write_page(PageId(0), &filled(1)).unwrap();
        let stream = filled(2);
        assert!(restore_from_snapshot(&target, &mut &stream[..]).is_err());
    }

    #[test]
    fn test_restore_rejects_unaligned_stream() {
        let target = MemPageArray::new(PS);
        let stream = vec![0u8; PS + 7];
        assert!(restore_from_snapshot(&target, &mut &stream[..]).is_err());
    }
}
