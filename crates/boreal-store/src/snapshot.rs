//! Copy-on-write snapshots.
//!
//! A snapshot streams pages 0..N-1 as they were at its begin time, without
//! blocking writers. A pre-image hook registered on the page array copies
//! the original contents of any in-range page about to be overwritten into
//! the page-copy index; the writer loop emits each page exactly once,
//! preferring a captured copy over the live page. A mutex and condition
//! over (progress, writing page) guarantee the hook and the writer never
//! handle the same page concurrently: an overwriter blocks while the
//! writer is reading that page live.

use boreal_common::error::Result;
use boreal_common::types::PageId;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::checkpoint::checkpoint;
use crate::db::DbInner;
use crate::pagearray::{PageArray, SnapshotHook};

struct SnapState {
    /// Pages below this index have been emitted.
    progress: u64,
    /// Page-copy index: pre-images captured before overwrites.
    copies: BTreeMap<u64, Vec<u8>>,
    /// Page the writer is currently reading live, if any.
    writing: Option<u64>,
}

pub(crate) struct SnapshotCapture {
    state: Mutex<SnapState>,
    cond: Condvar,
    /// Pages at or above this index are out of snapshot range. Starts at
    /// max so captures registered before the count is taken are kept.
    limit: AtomicU64,
}

impl SnapshotCapture {
    fn new() -> Self {
        Self {
            state: Mutex::new(SnapState {
                progress: 0,
                copies: BTreeMap::new(),
                writing: None,
            }),
            cond: Condvar::new(),
            limit: AtomicU64::new(u64::MAX),
        }
    }
}

impl SnapshotHook for SnapshotCapture {
    fn capture(&self, index: PageId, original: &[u8]) {
        if index.0 >= self.limit.load(Ordering::Acquire) {
            return;
        }
        let mut s = self.state.lock();
        loop {
            if index.0 < s.progress || s.copies.contains_key(&index.0) {
                // Already emitted or already captured.
                return;
            }
            if s.writing == Some(index.0) {
                // The writer is reading this page live; the overwrite
                // waits until it is done.
                self.cond.wait(&mut s);
                continue;
            }
            break;
        }
        s.copies.insert(index.0, original.to_vec());
    }
}

/// Streams a consistent snapshot of the page array into `sink`. Returns
/// the number of pages written. A checkpoint runs first so the stream
/// begins with a valid header pair.
pub(crate) fn write_snapshot(db: &DbInner, sink: &mut dyn Write) -> Result<u64> {
    checkpoint(db)?;

    let capture = Arc::new(SnapshotCapture::new());
    let hook: Arc<dyn SnapshotHook> = capture.clone();
    db.store.pages.register(hook.clone());

    let count = db.store.pages.page_count();
    capture.limit.store(count, Ordering::Release);
    {
        // Drop placeholder captures past the real range.
        let mut s = capture.state.lock();
        let _ = s.copies.split_off(&count);
    }

    let result = stream_pages(db, &capture, count, sink);
    db.store.pages.unregister(&hook);
    // The page-copy index dies with the capture.
    capture.state.lock().copies.clear();

    if result.is_ok() {
        info!(pages = count, "snapshot complete");
    }
    result.map(|_| count)
}

fn stream_pages(
    db: &DbInner,
    capture: &SnapshotCapture,
    count: u64,
    sink: &mut dyn Write,
) -> Result<()> {
    let page_size = db.store.page_size;
    let mut buf = vec![0u8; page_size];

    for i in 0..count {
        let copied = {
            let mut s = capture.state.lock();
            match s.copies.remove(&i) {
                Some(copy) => {
                    s.progress = i + 1;
                    Some(copy)
                }
                None => {
                    s.writing = Some(i);
                    None
                }
            }
        };
        match copied {
            Some(copy) => sink.write_all(&copy)?,
            None => {
                let read = db.store.pages.read_page(PageId(i), &mut buf);
                {
                    let mut s = capture.state.lock();
                    s.writing = None;
                    s.progress = i + 1;
                    capture.cond.notify_all();
                }
                read?;
                sink.write_all(&buf)?;
            }
        }
    }
    Ok(())
}
