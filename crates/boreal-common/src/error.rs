//! Error types for BorealDB.

use thiserror::Error;

/// Result type alias using BorealError.
pub type Result<T> = std::result::Result<T, BorealError>;

/// Errors that can occur in BorealDB operations.
///
/// Lock acquisition outcomes are deliberately not represented here; they are
/// values of `LockResult` and are reported through return values, not errors.
#[derive(Debug, Error)]
pub enum BorealError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Argument errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid page id: {0}")]
    InvalidPageId(u64),

    #[error("Illegal page size: {0}")]
    IllegalPageSize(usize),

    // Capacity errors
    #[error("Key too large: {size} bytes (max {max})")]
    LargeKey { size: usize, max: usize },

    #[error("Value too large: {size} bytes (max {max})")]
    LargeValue { size: usize, max: usize },

    // Lock failures surfaced by composite operations. The dedicated lock
    // methods report these as LockResult values instead.
    #[error("Lock request timed out")]
    LockTimeout,

    #[error("Deadlock detected")]
    Deadlock,

    #[error("Illegal lock upgrade")]
    IllegalUpgrade,

    #[error("Lock wait interrupted")]
    LockInterrupted,

    // Transaction errors
    #[error("Transaction is invalid: {0}")]
    InvalidTransaction(String),

    #[error("Replica is not modifiable")]
    UnmodifiableReplica,

    // Lifecycle errors
    #[error("Database is closed")]
    Closed,

    #[error("Database is closed: {0}")]
    ClosedCause(String),

    #[error("Database is panicked: {0}")]
    Panicked(String),

    // Storage errors
    #[error("Page {page_id} corrupted: {reason}")]
    PageCorrupted { page_id: u64, reason: String },

    #[error("Database corrupted: {0}")]
    Corrupt(String),

    #[error("Redo log corrupted at position {position}: {reason}")]
    RedoCorrupted { position: u64, reason: String },

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("Node cache exhausted, all nodes are dirty and unevictable")]
    CacheExhausted,

    #[error("Snapshot aborted: {0}")]
    SnapshotAborted(String),

    // Index errors
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BorealError {
    /// Returns true if the failure indicates on-disk or in-memory corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            BorealError::PageCorrupted { .. }
                | BorealError::Corrupt(_)
                | BorealError::RedoCorrupted { .. }
        )
    }

    /// Returns true if the failure is pre-state: it happened before any
    /// change was made, and so the transaction need not be borked.
    pub fn is_pre_state(&self) -> bool {
        matches!(
            self,
            BorealError::InvalidArgument(_)
                | BorealError::InvalidPageId(_)
                | BorealError::IllegalPageSize(_)
                | BorealError::LargeKey { .. }
                | BorealError::LargeValue { .. }
                | BorealError::LockTimeout
                | BorealError::Deadlock
                | BorealError::IllegalUpgrade
                | BorealError::LockInterrupted
        )
    }
}
