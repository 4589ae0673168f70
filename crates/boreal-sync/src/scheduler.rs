//! Delay-queue scheduler for background engine tasks.
//!
//! The database uses one scheduler instance for its periodic checkpointer,
//! the redo background flusher, and deferred cleanup work. Tasks are plain
//! closures; delayed tasks run no earlier than their due time.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send>;

struct Delayed {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for Delayed {}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the earliest due time wins.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    heap: BinaryHeap<Delayed>,
    next_seq: u64,
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// Runs submitted tasks on a fixed pool of worker threads.
pub struct Scheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates a scheduler backed by `threads` worker threads.
    pub fn new(threads: usize) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let inner = inner.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("boreal-sched-{}", i))
                    .spawn(move || worker_loop(inner))
                    .expect("failed to spawn scheduler thread"),
            );
        }

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Submits a task to run as soon as a worker is free.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        self.schedule_at(Instant::now(), Box::new(task));
    }

    /// Submits a task to run after the given delay.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        self.schedule_at(Instant::now() + delay, Box::new(task));
    }

    fn schedule_at(&self, due: Instant, task: Task) {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Delayed { due, seq, task });
        self.inner.cond.notify_one();
    }

    /// Stops accepting tasks, drops pending ones, and joins the workers.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.heap.clear();
            self.inner.cond.notify_all();
        }
        let mut workers = self.workers.lock();
        for h in workers.drain(..) {
            let _ = h.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<Inner>) {
    let mut state = inner.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        match state.heap.peek() {
            None => {
                inner.cond.wait(&mut state);
            }
            Some(head) if head.due > now => {
                let due = head.due;
                inner.cond.wait_until(&mut state, due);
            }
            Some(_) => {
                let delayed = state.heap.pop().expect("peeked entry vanished");
                parking_lot::MutexGuard::unlocked(&mut state, || (delayed.task)());
            }
        }
    }
}
