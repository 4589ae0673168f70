//! Transactional copy-on-write B-tree storage engine for BorealDB.
//!
//! The engine layers, bottom up: a page-addressable block device
//! ([`pagearray`]), a persisted free-list allocator ([`alloc`]), a bounded
//! node cache ([`cache`]), the copy-on-write B-tree ([`node`], [`tree`],
//! [`cursor`], [`fragment`]), the row lock manager ([`lock`]), per
//! transaction undo logging ([`undo`], [`txn`]), and the durability
//! machinery ([`checkpoint`], [`recover`], [`snapshot`]). [`db`] wires the
//! layers into the public [`Database`] handle.

pub mod alloc;
pub mod cache;
pub mod checkpoint;
pub mod cursor;
pub mod db;
pub mod fragment;
pub mod header;
pub mod lock;
pub mod node;
pub mod pagearray;
pub mod pending;
pub mod recover;
pub mod snapshot;
pub mod store;
pub mod trash;
pub mod tree;
pub mod txn;
pub mod undo;

pub use boreal_common::{
    BorealError, DbConfig, DurabilityMode, IndexId, LockMode, PageId, Result, TxnId,
};
pub use cursor::Cursor;
pub use db::{Database, Index};
pub use lock::LockResult;
pub use txn::Transaction;
