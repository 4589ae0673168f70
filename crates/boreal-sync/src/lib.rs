//! Concurrency primitives for BorealDB.
//!
//! Provides the shared/exclusive latch used for short-duration mutual
//! exclusion, the condition queue used to transfer ownership between
//! waiters without spurious wakeups, and the delay-queue scheduler that
//! runs background engine tasks.

pub mod condition;
pub mod latch;
pub mod scheduler;

pub use condition::{await_on, LatchCondition, WaitNode, WaitResult, WaiterKind};
pub use latch::{ExclusiveGuard, Latch, SharedGuard};
pub use scheduler::Scheduler;
