//! Pending commit queue.
//!
//! A transaction committing in NoSync or NoFlush durability does not wait
//! for the redo fsync. It transfers ownership of its locks, undo log, and
//! trash obligation into a pending record and returns to the caller. A
//! background worker syncs the redo stream and then releases pending
//! records in commit order, preserving per-transaction atomicity without
//! blocking committers.

use boreal_common::types::TxnId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::lock::{LockKey, LockOwner};
use crate::undo::UndoLog;

/// Everything a committed-but-not-yet-durable transaction still owns.
pub struct PendingTxn {
    pub txn_id: TxnId,
    pub owner: Arc<LockOwner>,
    /// Redo position of the commit record; released once the synced
    /// position reaches it.
    pub commit_pos: u64,
    /// Locks to release in acquisition order.
    pub locks: Vec<LockKey>,
    pub undo: Arc<Mutex<UndoLog>>,
    pub has_trash: bool,
}

/// FIFO of pending commits, ordered by commit position.
#[derive(Default)]
pub struct PendingQueue {
    queue: Mutex<VecDeque<PendingTxn>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()) }
    }

    pub fn enqueue(&self, pending: PendingTxn) {
        self.queue.lock().push_back(pending);
    }

    /// Removes and returns every record whose commit position is durable.
    pub fn take_ready(&self, synced_pos: u64) -> Vec<PendingTxn> {
        let mut queue = self.queue.lock();
        let mut ready = Vec::new();
        while let Some(front) = queue.front() {
            if front.commit_pos > synced_pos {
                break;
            }
            ready.push(queue.pop_front().expect("peeked entry vanished"));
        }
        ready
    }

    /// Removes everything regardless of durability; used at close after a
    /// final sync.
    pub fn drain_all(&self) -> Vec<PendingTxn> {
        self.queue.lock().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockManager;
    use boreal_common::types::IndexId;

    fn pending(mgr: &LockManager, pos: u64) -> PendingTxn {
        PendingTxn {
            txn_id: TxnId(pos),
            owner: mgr.new_owner(),
            commit_pos: pos,
            locks: vec![(IndexId(1), pos.to_be_bytes().to_vec())],
            undo: Arc::new(Mutex::new(UndoLog::new())),
            has_trash: false,
        }
    }

    #[test]
    fn test_take_ready_respects_positions() {
        let mgr = LockManager::new();
        let q = PendingQueue::new();
        q.enqueue(pending(&mgr, 100));
        q.enqueue(pending(&mgr, 200));
        q.enqueue(pending(&mgr, 300));

        let ready = q.take_ready(250);
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].commit_pos, 100);
        assert_eq!(ready[1].commit_pos, 200);
        assert_eq!(q.len(), 1);

        assert!(q.take_ready(250).is_empty());
        let rest = q.take_ready(300);
        assert_eq!(rest.len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn test_drain_all() {
        let mgr = LockManager::new();
        let q = PendingQueue::new();
        q.enqueue(pending(&mgr, 10));
        q.enqueue(pending(&mgr, 20));
        assert_eq!(q.drain_all().len(), 2);
        assert!(q.is_empty());
    }
}
