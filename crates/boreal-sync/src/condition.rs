//! Condition queue without spurious wakeups.
//!
//! Unlike a generic condition variable, a waiter returns only because it was
//! signalled, its deadline passed, or the queue was cleared. Waiters are
//! FIFO-ordered records tagged Regular, Shared, or Tagged; a queued entry may
//! also be a continuation, which the signalling thread runs in place while it
//! still holds the protecting mutex (ownership transfer).
//!
//! The queue itself must live inside a `parking_lot::Mutex` together with the
//! state it coordinates. `await_on` enqueues a waiter, releases the mutex
//! while parked, and re-acquires it before returning.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why an await returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// A signal was delivered to this waiter.
    Signaled,
    /// The relative timeout elapsed first.
    TimedOut,
    /// The queue was cleared while waiting.
    Interrupted,
}

/// Kind of a queued waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterKind {
    Regular,
    /// Waiting for shared access; `signal_shared` wakes only these.
    Shared,
    /// Wakeable by `signal_tagged` in addition to plain signals.
    Tagged,
}

const WAITING: u8 = 0;
const SIGNALED: u8 = 1;
const CLEARED: u8 = 2;

/// A parked waiter. The flag protocol makes spurious wakeups impossible:
/// `park` returns only once the flag leaves the WAITING state or the
/// deadline passes.
pub struct WaitNode {
    kind: WaiterKind,
    state: Mutex<u8>,
    cond: Condvar,
}

impl WaitNode {
    fn new(kind: WaiterKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            state: Mutex::new(WAITING),
            cond: Condvar::new(),
        })
    }

    pub fn kind(&self) -> WaiterKind {
        self.kind
    }

    /// Parks until signalled or the relative nanosecond timeout elapses.
    /// Negative timeout waits indefinitely; zero returns immediately.
    pub fn park(&self, nanos_timeout: i64) -> WaitResult {
        let mut state = self.state.lock();
        if nanos_timeout < 0 {
            while *state == WAITING {
                self.cond.wait(&mut state);
            }
        } else if nanos_timeout > 0 {
            let deadline = Instant::now() + Duration::from_nanos(nanos_timeout as u64);
            while *state == WAITING {
                if self.cond.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
        }
        match *state {
            SIGNALED => WaitResult::Signaled,
            CLEARED => WaitResult::Interrupted,
            _ => WaitResult::TimedOut,
        }
    }

    fn deliver(&self, value: u8) {
        let mut state = self.state.lock();
        *state = value;
        self.cond.notify_one();
    }

    /// True if a signal reached this node, regardless of what `park`
    /// observed first.
    pub fn was_signaled(&self) -> bool {
        *self.state.lock() == SIGNALED
    }
}

enum Entry {
    Waiter(Arc<WaitNode>),
    Continuation(Box<dyn FnOnce() + Send>),
}

/// FIFO queue of waiters associated with a mutex-protected structure.
#[derive(Default)]
pub struct LatchCondition {
    queue: VecDeque<Entry>,
}

impl LatchCondition {
    pub fn new() -> Self {
        Self { queue: VecDeque::new() }
    }

    /// Returns true if no waiters are enqueued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Enqueues a waiter at the tail and returns its parking node.
    pub fn enqueue(&mut self, kind: WaiterKind) -> Arc<WaitNode> {
        let node = WaitNode::new(kind);
        self.queue.push_back(Entry::Waiter(node.clone()));
        node
    }

    /// Enqueues a waiter at the head, ahead of all other waiters.
    pub fn enqueue_priority(&mut self, kind: WaiterKind) -> Arc<WaitNode> {
        let node = WaitNode::new(kind);
        self.queue.push_front(Entry::Waiter(node.clone()));
        node
    }

    /// Enqueues a continuation to run when signalled. The signalling thread
    /// runs it in place, still holding the protecting mutex.
    pub fn upon_signal(&mut self, cont: Box<dyn FnOnce() + Send>) {
        self.queue.push_back(Entry::Continuation(cont));
    }

    /// Removes a timed-out waiter. Returns false if the waiter was already
    /// dequeued, in which case a signal was consumed and the caller must
    /// treat the wait as signalled.
    pub fn cancel(&mut self, node: &Arc<WaitNode>) -> bool {
        let before = self.queue.len();
        self.queue.retain(|e| match e {
            Entry::Waiter(w) => !Arc::ptr_eq(w, node),
            Entry::Continuation(_) => true,
        });
        self.queue.len() != before
    }

    /// Signals the head entry, of any kind. Returns true if one was woken
    /// or run.
    pub fn signal(&mut self) -> bool {
        match self.queue.pop_front() {
            None => false,
            Some(Entry::Waiter(w)) => {
                w.deliver(SIGNALED);
                true
            }
            Some(Entry::Continuation(cont)) => {
                cont();
                true
            }
        }
    }

    /// Signals every queued entry.
    pub fn signal_all(&mut self) {
        while self.signal() {}
    }

    /// Signals the head entry only if it is a shared waiter. Returns true
    /// if a shared waiter was woken.
    pub fn signal_shared(&mut self) -> bool {
        match self.queue.front() {
            Some(Entry::Waiter(w)) if w.kind == WaiterKind::Shared => self.signal(),
            _ => false,
        }
    }

    /// Signals the head entry only if it is tagged.
    pub fn signal_tagged(&mut self) -> bool {
        match self.queue.front() {
            Some(Entry::Waiter(w)) if w.kind == WaiterKind::Tagged => self.signal(),
            _ => false,
        }
    }

    /// Wakes every waiter with an interrupted status and drops all
    /// continuations.
    pub fn clear(&mut self) {
        while let Some(entry) = self.queue.pop_front() {
            if let Entry::Waiter(w) = entry {
                w.deliver(CLEARED);
            }
        }
    }
}

/// Blocks on `cond` until signalled, releasing the mutex while parked.
///
/// `cond_of` re-locates the condition inside the guarded structure after the
/// mutex is re-acquired; the structure may have been mutated while parked.
pub fn await_on<T, F>(
    guard: &mut MutexGuard<'_, T>,
    cond_of: F,
    kind: WaiterKind,
    nanos_timeout: i64,
) -> WaitResult
where
    F: Fn(&mut T) -> &mut LatchCondition,
{
    let node = cond_of(&mut **guard).enqueue(kind);
    let result = MutexGuard::unlocked(guard, || node.park(nanos_timeout));
    if result == WaitResult::Signaled {
        return result;
    }
    // Not signalled from park's perspective. Remove from the queue; if the
    // waiter was already dequeued, the signal raced the timeout and must not
    // be lost.
    if !cond_of(&mut **guard).cancel(&node) && node.was_signaled() {
        return WaitResult::Signaled;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    struct Guarded {
        ready: bool,
        cond: LatchCondition,
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let shared = Arc::new(Mutex::new(Guarded {
            ready: false,
            cond: LatchCondition::new(),
        }));

        let waiter = {
            let shared = shared.clone();
            thread::spawn(move || {
                let mut guard = shared.lock();
                while !guard.ready {
                    let r = await_on(&mut guard, |g| &mut g.cond, WaiterKind::Regular, -1);
                    assert_eq!(r, WaitResult::Signaled);
                }
            })
        };

        thread::sleep(Duration::from_millis(20));
        {
            let mut guard = shared.lock();
            guard.ready = true;
            guard.cond.signal();
        }
        waiter.join().unwrap();
    }

    #[test]
    fn test_timeout() {
        let shared = Mutex::new(Guarded {
            ready: false,
            cond: LatchCondition::new(),
        });
        let mut guard = shared.lock();
        let r = await_on(&mut guard, |g| &mut g.cond, WaiterKind::Regular, 5_000_000);
        assert_eq!(r, WaitResult::TimedOut);
        assert!(guard.cond.is_empty());
    }

    #[test]
    fn test_try_once_timeout() {
        let shared = Mutex::new(Guarded {
            ready: false,
            cond: LatchCondition::new(),
        });
        let mut guard = shared.lock();
        let r = await_on(&mut guard, |g| &mut g.cond, WaiterKind::Regular, 0);
        assert_eq!(r, WaitResult::TimedOut);
    }

    #[test]
    fn test_signal_empty_queue() {
        let mut cond = LatchCondition::new();
        assert!(!cond.signal());
        assert!(!cond.signal_shared());
        assert!(!cond.signal_tagged());
    }

    #[test]
    fn test_signal_tagged_skips_regular_head() {
        let mut cond = LatchCondition::new();
        let _regular = cond.enqueue(WaiterKind::Regular);
        let _tagged = cond.enqueue(WaiterKind::Tagged);
        // Head is regular; tagged signal must not wake anything.
        assert!(!cond.signal_tagged());
        assert!(cond.signal());
        // Now the tagged waiter is at the head.
        assert!(cond.signal_tagged());
    }

    #[test]
    fn test_signal_shared_only_wakes_shared() {
        let mut cond = LatchCondition::new();
        let _s = cond.enqueue(WaiterKind::Shared);
        assert!(cond.signal_shared());
        let _r = cond.enqueue(WaiterKind::Regular);
        assert!(!cond.signal_shared());
    }

    #[test]
    fn test_priority_enqueue_goes_first() {
        let mut cond = LatchCondition::new();
        let first = cond.enqueue(WaiterKind::Regular);
        let prio = cond.enqueue_priority(WaiterKind::Regular);
        cond.signal();
        assert!(prio.was_signaled());
        assert!(!first.was_signaled());
    }

    #[test]
    fn test_continuation_runs_on_signal() {
        let ran = Arc::new(Mutex::new(false));
        let mut cond = LatchCondition::new();
        {
            let ran = ran.clone();
            cond.upon_signal(Box::new(move || {
                *ran.lock() = true;
            }));
        }
        assert!(!*ran.lock());
        cond.signal();
        assert!(*ran.lock());
    }

    #[test]
    fn test_clear_interrupts() {
        let shared = Arc::new(Mutex::new(Guarded {
            ready: false,
            cond: LatchCondition::new(),
        }));

        let waiter = {
            let shared = shared.clone();
            thread::spawn(move || {
                let mut guard = shared.lock();
                await_on(&mut guard, |g| &mut g.cond, WaiterKind::Regular, -1)
            })
        };

        thread::sleep(Duration::from_millis(20));
        shared.lock().cond.clear();
        assert_eq!(waiter.join().unwrap(), WaitResult::Interrupted);
    }

    #[test]
    fn test_signal_all_drains() {
        let mut cond = LatchCondition::new();
        let a = cond.enqueue(WaiterKind::Regular);
        let b = cond.enqueue(WaiterKind::Shared);
        let c = cond.enqueue(WaiterKind::Tagged);
        cond.signal_all();
        assert!(a.was_signaled() && b.was_signaled() && c.was_signaled());
        assert!(cond.is_empty());
    }
}
