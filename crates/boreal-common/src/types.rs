//! Core identifier and mode types.

use serde::{Deserialize, Serialize};

/// Identifier of a fixed-size page within the page array.
///
/// Page 0 and page 1 are reserved for the double-buffered database header,
/// so 0 never identifies an allocated tree or fragment page. The engine uses
/// `PageId::NONE` to mean "no page".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PageId(pub u64);

impl PageId {
    /// Sentinel for "no page".
    pub const NONE: PageId = PageId(0);

    /// Returns true if this id refers to an actual page.
    pub fn is_some(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a B-tree index.
///
/// Index ids are random and non-zero; id 0 is reserved for the registry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct IndexId(pub u64);

impl IndexId {
    /// The registry of indexes.
    pub const REGISTRY: IndexId = IndexId(0);
}

impl std::fmt::Display for IndexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifier of a transaction. 0 means "not yet assigned".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Transaction id before one has been assigned.
    pub const UNASSIGNED: TxnId = TxnId(0);

    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durability of a transaction commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DurabilityMode {
    /// Write and fsync the redo log before commit returns.
    #[default]
    Sync,
    /// Write the redo log; a background task fsyncs it.
    NoSync,
    /// Buffer the redo record; flushed lazily in batches.
    NoFlush,
    /// Write no redo record at all.
    NoRedo,
}

/// How a transaction acquires row locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LockMode {
    /// Upgradable locks for reads, exclusive for writes.
    UpgradableRead,
    /// Shared locks for reads, held to the end of the transaction.
    #[default]
    RepeatableRead,
    /// Shared locks for reads, released as soon as the read completes.
    ReadCommitted,
    /// No read locks at all.
    ReadUncommitted,
    /// No locks of any kind. Writes are not recoverable.
    Unsafe,
}

impl LockMode {
    /// Returns true if reads under this mode acquire a lock.
    pub fn is_locking_reads(&self) -> bool {
        matches!(
            self,
            LockMode::UpgradableRead | LockMode::RepeatableRead | LockMode::ReadCommitted
        )
    }

    /// Returns true if read locks are retained until scope exit.
    pub fn is_repeatable(&self) -> bool {
        matches!(self, LockMode::UpgradableRead | LockMode::RepeatableRead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_id_none() {
        assert!(!PageId::NONE.is_some());
        assert!(PageId(1).is_some());
        assert_eq!(PageId::default(), PageId::NONE);
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(PageId(42).to_string(), "42");
    }

    #[test]
    fn test_page_id_ordering() {
        assert!(PageId(1) < PageId(2));
        assert!(PageId(100) > PageId(99));
    }

    #[test]
    fn test_index_id_registry() {
        assert_eq!(IndexId::REGISTRY, IndexId(0));
        assert_ne!(IndexId(1), IndexId::REGISTRY);
    }

    #[test]
    fn test_index_id_display() {
        assert_eq!(IndexId(0xAB).to_string(), "0xab");
    }

    #[test]
    fn test_txn_id_assignment() {
        assert!(!TxnId::UNASSIGNED.is_assigned());
        assert!(TxnId(7).is_assigned());
    }

    #[test]
    fn test_durability_mode_default() {
        assert_eq!(DurabilityMode::default(), DurabilityMode::Sync);
    }

    #[test]
    fn test_lock_mode_default() {
        assert_eq!(LockMode::default(), LockMode::RepeatableRead);
    }

    #[test]
    fn test_lock_mode_locking_reads() {
        assert!(LockMode::RepeatableRead.is_locking_reads());
        assert!(LockMode::UpgradableRead.is_locking_reads());
        assert!(LockMode::ReadCommitted.is_locking_reads());
        assert!(!LockMode::ReadUncommitted.is_locking_reads());
        assert!(!LockMode::Unsafe.is_locking_reads());
    }

    #[test]
    fn test_lock_mode_repeatable() {
        assert!(LockMode::RepeatableRead.is_repeatable());
        assert!(LockMode::UpgradableRead.is_repeatable());
        assert!(!LockMode::ReadCommitted.is_repeatable());
    }

    #[test]
    fn test_serde_roundtrip() {
        for mode in [
            DurabilityMode::Sync,
            DurabilityMode::NoSync,
            DurabilityMode::NoFlush,
            DurabilityMode::NoRedo,
        ] {
            let s = serde_json::to_string(&mode).unwrap();
            let back: DurabilityMode = serde_json::from_str(&s).unwrap();
            assert_eq!(mode, back);
        }
        let s = serde_json::to_string(&PageId(5)).unwrap();
        let back: PageId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, PageId(5));
    }
}
