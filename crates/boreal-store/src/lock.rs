//! Row lock manager.
//!
//! Locks are named by (index id, key) and owned by lock owners, not
//! threads. A lock is in exactly one state: unowned, shared by one or more
//! owners, upgradable (one owner, possibly alongside shared owners), or
//! exclusive. Acquisition outcomes are values of [`LockResult`], never
//! errors.
//!
//! The table is sharded by key hash; a shard's mutex guards only its map.
//! Each lock entry carries its own mutex and two condition queues: one for
//! upgradable waiters and one for shared waiters and exclusive upgraders
//! draining the shared count. Waiters re-validate state after every wakeup,
//! so a signal is a hint, not a transfer.
//!
//! An exclusive owner may attach a ghost marker to the entry after
//! tombstoning a deleted record; whoever fully releases the exclusive lock
//! learns of the ghost and physically reclaims it.

use boreal_common::types::IndexId;
use boreal_sync::condition::{await_on, LatchCondition, WaiterKind, WaitResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Outcome of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// No lock is held and none was requested to be.
    Unowned,
    /// The lock was newly acquired.
    Acquired,
    /// An upgradable lock was promoted to exclusive.
    Upgraded,
    /// The owner already held a shared lock.
    OwnedShared,
    /// The owner already held an upgradable lock.
    OwnedUpgradable,
    /// The owner already held an exclusive lock.
    OwnedExclusive,
    /// Promotion from shared while another owner holds upgradable.
    Illegal,
    /// The waiter was interrupted, typically by database close.
    Interrupted,
    /// The timeout elapsed before the lock became available.
    TimedOutLock,
    /// Waiting would cycle; the request was abandoned.
    Deadlock,
}

impl LockResult {
    /// True if the owner holds the lock after the call.
    pub fn is_held(&self) -> bool {
        matches!(
            self,
            LockResult::Acquired
                | LockResult::Upgraded
                | LockResult::OwnedShared
                | LockResult::OwnedUpgradable
                | LockResult::OwnedExclusive
        )
    }

    /// True if the call acquired something that must later be released.
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockResult::Acquired | LockResult::Upgraded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            LockResult::Illegal
                | LockResult::Interrupted
                | LockResult::TimedOutLock
                | LockResult::Deadlock
        )
    }
}

/// A lock name.
pub type LockKey = (IndexId, Vec<u8>);

/// A participant that can own locks; typically a transaction.
pub struct LockOwner {
    pub id: u64,
    /// Diagnostic attachment surfaced in deadlock reports.
    pub attachment: Mutex<Option<String>>,
    /// The lock this owner is currently blocked on, if any.
    waiting_for: Mutex<Option<LockKey>>,
}

const UPGRADABLE: u32 = 0x8000_0000;
const EXCLUSIVE: u32 = u32::MAX;

struct LockState {
    /// Shared count in the low 31 bits; the high bit marks an upgradable
    /// owner; all bits set marks exclusive.
    count: u32,
    owner: Option<Arc<LockOwner>>,
    shared: Vec<Arc<LockOwner>>,
    ghost: bool,
    /// Waiters for the upgradable half.
    queue_u: LatchCondition,
    /// Shared waiters and exclusive upgraders draining the shared count.
    queue_sx: LatchCondition,
}

impl LockState {
    fn is_unused(&self) -> bool {
        self.count == 0
            && self.owner.is_none()
            && self.shared.is_empty()
            && !self.ghost
            && self.queue_u.is_empty()
            && self.queue_sx.is_empty()
    }

    fn shared_count(&self) -> u32 {
        if self.count == EXCLUSIVE {
            0
        } else {
            self.count & !UPGRADABLE
        }
    }

    fn holds_shared(&self, owner: &Arc<LockOwner>) -> bool {
        self.shared.iter().any(|o| o.id == owner.id)
    }

    fn remove_shared(&mut self, owner: &Arc<LockOwner>) -> bool {
        let before = self.shared.len();
        self.shared.retain(|o| o.id != owner.id);
        self.shared.len() != before
    }
}

struct LockEntry {
    key: LockKey,
    state: Mutex<LockState>,
}

struct Shard {
    map: Mutex<HashMap<LockKey, Arc<LockEntry>>>,
}

/// Sharded table of row locks.
pub struct LockManager {
    shards: Vec<Shard>,
    shard_mask: usize,
    next_owner_id: AtomicU64,
}

impl LockManager {
    pub fn new() -> Self {
        let shards = std::thread::available_parallelism()
            .map(|p| p.get() * 4)
            .unwrap_or(16)
            .next_power_of_two();
        Self {
            shards: (0..shards)
                .map(|_| Shard { map: Mutex::new(HashMap::new()) })
                .collect(),
            shard_mask: shards - 1,
            next_owner_id: AtomicU64::new(1),
        }
    }

    pub fn new_owner(&self) -> Arc<LockOwner> {
        Arc::new(LockOwner {
            id: self.next_owner_id.fetch_add(1, Ordering::Relaxed),
            attachment: Mutex::new(None),
            waiting_for: Mutex::new(None),
        })
    }

    fn shard_of(&self, key: &LockKey) -> &Shard {
        use std::hash::{Hash, Hasher};
        let mut h = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut h);
        &self.shards[(h.finish() as usize) & self.shard_mask]
    }

    fn entry(&self, key: &LockKey) -> Arc<LockEntry> {
        let shard = self.shard_of(key);
        let mut map = shard.map.lock();
        map.entry(key.clone())
            .or_insert_with(|| {
                Arc::new(LockEntry {
                    key: key.clone(),
                    state: Mutex::new(LockState {
                        count: 0,
                        owner: None,
                        shared: Vec::new(),
                        ghost: false,
                        queue_u: LatchCondition::new(),
                        queue_sx: LatchCondition::new(),
                    }),
                })
            })
            .clone()
    }

    fn lookup(&self, key: &LockKey) -> Option<Arc<LockEntry>> {
        self.shard_of(key).map.lock().get(key).cloned()
    }

    /// Removes the entry if it became unused.
    fn reap(&self, entry: &Arc<LockEntry>) {
        let shard = self.shard_of(&entry.key);
        let mut map = shard.map.lock();
        if let Some(found) = map.get(&entry.key) {
            if Arc::ptr_eq(found, entry) && entry.state.lock().is_unused() {
                map.remove(&entry.key);
            }
        }
    }

    /// Reports what `owner` holds on the lock without acquiring anything.
    pub fn check(&self, owner: &Arc<LockOwner>, index: IndexId, key: &[u8]) -> LockResult {
        let lk = (index, key.to_vec());
        match self.lookup(&lk) {
            None => LockResult::Unowned,
            Some(entry) => {
                let s = entry.state.lock();
                if s.owner.as_ref().map(|o| o.id) == Some(owner.id) {
                    if s.count == EXCLUSIVE {
                        LockResult::OwnedExclusive
                    } else {
                        LockResult::OwnedUpgradable
                    }
                } else if s.holds_shared(owner) {
                    LockResult::OwnedShared
                } else {
                    LockResult::Unowned
                }
            }
        }
    }

    /// Acquires a shared lock. Timeout is in nanoseconds: negative waits
    /// forever, zero tries once.
    pub fn lock_shared(
        &self,
        owner: &Arc<LockOwner>,
        index: IndexId,
        key: &[u8],
        nanos_timeout: i64,
    ) -> LockResult {
        let lk = (index, key.to_vec());
        let entry = self.entry(&lk);
        let deadline = make_deadline(nanos_timeout);
        let mut s = entry.state.lock();

        loop {
            if s.owner.as_ref().map(|o| o.id) == Some(owner.id) {
                return if s.count == EXCLUSIVE {
                    LockResult::OwnedExclusive
                } else {
                    LockResult::OwnedUpgradable
                };
            }
            if s.count != EXCLUSIVE && s.holds_shared(owner) {
                return LockResult::OwnedShared;
            }
            if s.count != EXCLUSIVE && s.queue_sx.is_empty() {
                if s.shared_count() >= 0x7fff_fffd {
                    return LockResult::Illegal;
                }
                s.count = (s.count & UPGRADABLE) | (s.shared_count() + 1);
                s.shared.push(owner.clone());
                *owner.waiting_for.lock() = None;
                return LockResult::Acquired;
            }

            match self.wait_sx(owner, &entry, &lk, &mut s, deadline, WaiterKind::Shared) {
                WaitOutcome::Retry => continue,
                WaitOutcome::Fail(r) => {
                    drop(s);
                    self.reap(&entry);
                    return r;
                }
            }
        }
    }

    /// Acquires an upgradable lock, or promotes an existing shared one.
    pub fn lock_upgradable(
        &self,
        owner: &Arc<LockOwner>,
        index: IndexId,
        key: &[u8],
        nanos_timeout: i64,
    ) -> LockResult {
        let lk = (index, key.to_vec());
        let entry = self.entry(&lk);
        let deadline = make_deadline(nanos_timeout);
        let mut s = entry.state.lock();

        loop {
            if s.owner.as_ref().map(|o| o.id) == Some(owner.id) {
                return if s.count == EXCLUSIVE {
                    LockResult::OwnedExclusive
                } else {
                    LockResult::OwnedUpgradable
                };
            }
            if s.count != EXCLUSIVE && s.holds_shared(owner) {
                if s.count & UPGRADABLE != 0 {
                    // Another owner already holds the upgradable half.
                    return LockResult::Illegal;
                }
                // In-place promotion; the shared half folds into the
                // upgradable ownership.
                s.remove_shared(owner);
                s.count = (s.shared_count() - 1) | UPGRADABLE;
                s.owner = Some(owner.clone());
                *owner.waiting_for.lock() = None;
                return LockResult::OwnedUpgradable;
            }
            if s.count & UPGRADABLE == 0 && s.count != EXCLUSIVE {
                s.count |= UPGRADABLE;
                s.owner = Some(owner.clone());
                *owner.waiting_for.lock() = None;
                return LockResult::Acquired;
            }

            match self.wait_u(owner, &entry, &lk, &mut s, deadline) {
                WaitOutcome::Retry => continue,
                WaitOutcome::Fail(r) => {
                    drop(s);
                    self.reap(&entry);
                    return r;
                }
            }
        }
    }

    /// Acquires an exclusive lock: the upgradable half first, then a wait
    /// for the shared count to drain.
    pub fn lock_exclusive(
        &self,
        owner: &Arc<LockOwner>,
        index: IndexId,
        key: &[u8],
        nanos_timeout: i64,
    ) -> LockResult {
        let ur = self.lock_upgradable(owner, index, key, nanos_timeout);
        if !ur.is_held() || ur == LockResult::OwnedExclusive {
            return ur;
        }

        let lk = (index, key.to_vec());
        let entry = self.entry(&lk);
        let deadline = make_deadline(nanos_timeout);
        let mut s = entry.state.lock();

        loop {
            if s.count == UPGRADABLE && s.shared.is_empty() {
                s.count = EXCLUSIVE;
                *owner.waiting_for.lock() = None;
                return if ur == LockResult::OwnedUpgradable {
                    LockResult::Upgraded
                } else {
                    LockResult::Acquired
                };
            }

            match self.wait_sx(owner, &entry, &lk, &mut s, deadline, WaiterKind::Regular) {
                WaitOutcome::Retry => continue,
                WaitOutcome::Fail(r) => {
                    // Give back the upgradable half if this call took it.
                    if ur == LockResult::Acquired {
                        s.count &= !UPGRADABLE;
                        s.owner = None;
                        s.queue_u.signal_all();
                    }
                    drop(s);
                    self.reap(&entry);
                    return r;
                }
            }
        }
    }

    /// Marks the entry ghosted; the owner must hold the lock exclusively.
    pub fn set_ghost(&self, owner: &Arc<LockOwner>, index: IndexId, key: &[u8]) -> bool {
        let lk = (index, key.to_vec());
        if let Some(entry) = self.lookup(&lk) {
            let mut s = entry.state.lock();
            if s.count == EXCLUSIVE && s.owner.as_ref().map(|o| o.id) == Some(owner.id) {
                s.ghost = true;
                return true;
            }
        }
        false
    }

    /// Fully releases whatever `owner` holds on the lock. Returns true if a
    /// ghost was pending; the caller must then physically reclaim the
    /// tombstone.
    pub fn unlock(&self, owner: &Arc<LockOwner>, index: IndexId, key: &[u8]) -> bool {
        let lk = (index, key.to_vec());
        let Some(entry) = self.lookup(&lk) else {
            return false;
        };
        let mut s = entry.state.lock();
        let mut ghost = false;

        if s.owner.as_ref().map(|o| o.id) == Some(owner.id) {
            ghost = std::mem::take(&mut s.ghost);
            s.owner = None;
            if s.count == EXCLUSIVE {
                s.count = 0;
            } else {
                s.count &= !UPGRADABLE;
            }
            s.queue_u.signal_all();
            s.queue_sx.signal_all();
        } else if s.remove_shared(owner) {
            s.count = (s.count & UPGRADABLE) | (s.shared_count() - 1);
            if s.shared_count() == 0 {
                // An exclusive upgrader may be draining the shared count.
                s.queue_sx.signal_all();
            }
        }

        let unused = s.is_unused();
        drop(s);
        if unused {
            self.reap(&entry);
        }
        ghost
    }

    /// Downgrades an exclusive or upgradable lock to shared. Returns a
    /// pending ghost as `unlock` does.
    pub fn unlock_to_shared(&self, owner: &Arc<LockOwner>, index: IndexId, key: &[u8]) -> bool {
        let lk = (index, key.to_vec());
        let Some(entry) = self.lookup(&lk) else {
            return false;
        };
        let mut s = entry.state.lock();
        if s.owner.as_ref().map(|o| o.id) != Some(owner.id) {
            return false;
        }
        let ghost = std::mem::take(&mut s.ghost);
        s.owner = None;
        s.count = if s.count == EXCLUSIVE { 1 } else { s.shared_count() + 1 };
        s.shared.push(owner.clone());
        s.queue_u.signal_all();
        s.queue_sx.signal_all();
        ghost
    }

    /// Downgrades an exclusive lock to upgradable.
    pub fn unlock_to_upgradable(
        &self,
        owner: &Arc<LockOwner>,
        index: IndexId,
        key: &[u8],
    ) -> bool {
        let lk = (index, key.to_vec());
        let Some(entry) = self.lookup(&lk) else {
            return false;
        };
        let mut s = entry.state.lock();
        if s.owner.as_ref().map(|o| o.id) != Some(owner.id) {
            return false;
        }
        let ghost = std::mem::take(&mut s.ghost);
        if s.count == EXCLUSIVE {
            s.count = UPGRADABLE;
            s.queue_sx.signal_all();
        }
        ghost
    }

    /// Wakes every waiter with an interrupted status; used at close.
    pub fn interrupt_all(&self) {
        for shard in &self.shards {
            let map = shard.map.lock();
            for entry in map.values() {
                let mut s = entry.state.lock();
                s.queue_u.clear();
                s.queue_sx.clear();
            }
        }
    }

    fn wait_u(
        &self,
        owner: &Arc<LockOwner>,
        entry: &Arc<LockEntry>,
        lk: &LockKey,
        s: &mut parking_lot::MutexGuard<'_, LockState>,
        deadline: Deadline,
    ) -> WaitOutcome {
        self.wait_common(owner, entry, lk, s, deadline, true, WaiterKind::Regular)
    }

    fn wait_sx(
        &self,
        owner: &Arc<LockOwner>,
        entry: &Arc<LockEntry>,
        lk: &LockKey,
        s: &mut parking_lot::MutexGuard<'_, LockState>,
        deadline: Deadline,
        kind: WaiterKind,
    ) -> WaitOutcome {
        self.wait_common(owner, entry, lk, s, deadline, false, kind)
    }

    fn wait_common(
        &self,
        owner: &Arc<LockOwner>,
        entry: &Arc<LockEntry>,
        lk: &LockKey,
        s: &mut parking_lot::MutexGuard<'_, LockState>,
        deadline: Deadline,
        upgradable_queue: bool,
        kind: WaiterKind,
    ) -> WaitOutcome {
        let remaining = match deadline.remaining_nanos() {
            Some(n) => n,
            None => {
                *owner.waiting_for.lock() = Some(lk.clone());
                return self.timed_out(owner, entry);
            }
        };
        *owner.waiting_for.lock() = Some(lk.clone());

        // Infinite waits park in bounded slices so a cycle that forms
        // around them is still detected.
        let infinite = remaining < 0;
        let slice = if infinite { 1_000_000_000 } else { remaining };

        let result = if upgradable_queue {
            await_on(s, |st| &mut st.queue_u, kind, slice)
        } else {
            await_on(s, |st| &mut st.queue_sx, kind, slice)
        };
        match result {
            WaitResult::Signaled => {
                *owner.waiting_for.lock() = None;
                WaitOutcome::Retry
            }
            WaitResult::Interrupted => {
                *owner.waiting_for.lock() = None;
                WaitOutcome::Fail(LockResult::Interrupted)
            }
            WaitResult::TimedOut if infinite => {
                if self.detect_deadlock(owner, entry) {
                    *owner.waiting_for.lock() = None;
                    WaitOutcome::Fail(LockResult::Deadlock)
                } else {
                    WaitOutcome::Retry
                }
            }
            WaitResult::TimedOut => self.timed_out(owner, entry),
        }
    }

    fn timed_out(&self, owner: &Arc<LockOwner>, entry: &Arc<LockEntry>) -> WaitOutcome {
        // The waiting_for edge stays set so peers can walk through this
        // owner; it is cleared once the failure is returned.
        if self.detect_deadlock(owner, entry) {
            *owner.waiting_for.lock() = None;
            WaitOutcome::Fail(LockResult::Deadlock)
        } else {
            WaitOutcome::Fail(LockResult::TimedOutLock)
        }
    }

    /// Walks waiting-for edges from `origin`. A path back through other
    /// owners to a lock `origin` holds means the timeout was a deadlock,
    /// not contention.
    fn detect_deadlock(&self, origin: &Arc<LockOwner>, start: &Arc<LockEntry>) -> bool {
        let mut cycle: Vec<(IndexId, Option<String>)> = Vec::new();
        let found =
            self.walk_waiters(origin, start, &mut HashSet::new(), true, &mut cycle);
        if found {
            let attachments: Vec<String> =
                cycle.iter().filter_map(|(_, a)| a.clone()).collect();
            warn!(
                locks = cycle.len(),
                ?attachments,
                "deadlock detected; abandoning lock request"
            );
        }
        found
    }

    fn walk_waiters(
        &self,
        origin: &Arc<LockOwner>,
        entry: &Arc<LockEntry>,
        visited: &mut HashSet<u64>,
        first: bool,
        cycle: &mut Vec<(IndexId, Option<String>)>,
    ) -> bool {
        let owners: Vec<Arc<LockOwner>> = {
            let s = entry.state.lock();
            s.owner.iter().cloned().chain(s.shared.iter().cloned()).collect()
        };
        for o in owners {
            if o.id == origin.id {
                // Origin owning the lock it waits on (an exclusive
                // upgrader draining shared owners) is not a cycle.
                if first {
                    continue;
                }
                return true;
            }
            if !visited.insert(o.id) {
                continue;
            }
            let waiting = o.waiting_for.lock().clone();
            if let Some(wk) = waiting {
                if let Some(next) = self.lookup(&wk) {
                    cycle.push((entry.key.0, o.attachment.lock().clone()));
                    if self.walk_waiters(origin, &next, visited, false, cycle) {
                        return true;
                    }
                    cycle.pop();
                }
            }
        }
        false
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

enum WaitOutcome {
    Retry,
    Fail(LockResult),
}

#[derive(Clone, Copy)]
struct Deadline {
    /// None means wait forever.
    at: Option<Instant>,
    try_once: bool,
}

fn make_deadline(nanos: i64) -> Deadline {
    if nanos < 0 {
        Deadline { at: None, try_once: false }
    } else if nanos == 0 {
        Deadline { at: None, try_once: true }
    } else {
        Deadline {
            at: Some(Instant::now() + std::time::Duration::from_nanos(nanos as u64)),
            try_once: false,
        }
    }
}

impl Deadline {
    /// Remaining wait budget; None when exhausted.
    fn remaining_nanos(&self) -> Option<i64> {
        if self.try_once {
            return None;
        }
        match self.at {
            None => Some(-1),
            Some(at) => {
                let now = Instant::now();
                if now >= at {
                    None
                } else {
                    Some((at - now).as_nanos() as i64)
                }
            }
        }
    }
}
