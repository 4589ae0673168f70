//! Short-duration shared/exclusive latch.
//!
//! A latch guards engine structures for the duration of a single operation.
//! It is distinct from a row lock, which is a named, transaction-scoped
//! entity. The commit latch is the most prominent instance: writers hold it
//! shared while appending a single operation's undo and redo records, and
//! the checkpointer holds it exclusively while capturing a consistent root.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared/exclusive latch with writer-preferring fairness.
#[derive(Default)]
pub struct Latch {
    rw: RwLock<()>,
}

/// RAII guard for shared latch ownership.
pub struct SharedGuard<'a> {
    _inner: RwLockReadGuard<'a, ()>,
}

/// RAII guard for exclusive latch ownership.
pub struct ExclusiveGuard<'a> {
    _inner: RwLockWriteGuard<'a, ()>,
}

impl Latch {
    pub fn new() -> Self {
        Self { rw: RwLock::new(()) }
    }

    /// Acquires the latch shared, blocking as needed.
    pub fn shared(&self) -> SharedGuard<'_> {
        SharedGuard { _inner: self.rw.read() }
    }

    /// Tries to acquire the latch shared without blocking.
    pub fn try_shared(&self) -> Option<SharedGuard<'_>> {
        self.rw.try_read().map(|g| SharedGuard { _inner: g })
    }

    /// Acquires the latch exclusively, blocking as needed.
    pub fn exclusive(&self) -> ExclusiveGuard<'_> {
        ExclusiveGuard { _inner: self.rw.write() }
    }

    /// Tries to acquire the latch exclusively without blocking.
    pub fn try_exclusive(&self) -> Option<ExclusiveGuard<'_>> {
        self.rw.try_write().map(|g| ExclusiveGuard { _inner: g })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_latch_shared_concurrent() {
        let latch = Latch::new();
        let g1 = latch.shared();
        let g2 = latch.shared();
        assert!(latch.try_exclusive().is_none());
        drop(g1);
        assert!(latch.try_exclusive().is_none());
        drop(g2);
        assert!(latch.try_exclusive().is_some());
    }

    #[test]
    fn test_latch_exclusive_blocks_shared() {
        let latch = Latch::new();
        let g = latch.exclusive();
        assert!(latch.try_shared().is_none());
        drop(g);
        assert!(latch.try_shared().is_some());
    }

    #[test]
    fn test_latch_handoff_across_threads() {
        let latch = Arc::new(Latch::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let latch = latch.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = latch.exclusive();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8000);
    }
}
