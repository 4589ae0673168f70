//! Configuration for a BorealDB database.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BorealError, Result};
use crate::types::DurabilityMode;

/// Minimum supported page size in bytes.
pub const MIN_PAGE_SIZE: usize = 512;

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Configuration for opening a database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Path prefix for the page file and redo files. None opens a
    /// non-durable in-memory database.
    pub base_file: Option<PathBuf>,
    /// Bytes per page. Power of two, at least 512. Immutable once the
    /// database has been created.
    pub page_size: usize,
    /// Minimum number of nodes the cache retains.
    pub min_cache_nodes: usize,
    /// Maximum number of nodes the cache may hold.
    pub max_cache_nodes: usize,
    /// Default durability for new transactions.
    pub durability_mode: DurabilityMode,
    /// Default lock timeout for new transactions.
    pub lock_timeout: Duration,
    /// Interval between automatic checkpoints. None disables the periodic
    /// checkpointer; checkpoints then run only on demand.
    pub checkpoint_interval: Option<Duration>,
    /// Redo bytes written since the last checkpoint that trigger an early
    /// checkpoint.
    pub checkpoint_size_threshold: u64,
    /// Largest key the engine will materialize in memory. Stored keys past
    /// the per-page inline threshold are fragmented; loading one larger
    /// than this fails with a LargeKey error.
    pub max_key_size: usize,
    /// Whether page and redo syncs issue fsync. Disabled only for tests.
    pub fsync_enabled: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            base_file: None,
            page_size: DEFAULT_PAGE_SIZE,
            min_cache_nodes: 100,
            max_cache_nodes: 10_000,
            durability_mode: DurabilityMode::Sync,
            lock_timeout: Duration::from_secs(1),
            checkpoint_interval: Some(Duration::from_secs(60)),
            checkpoint_size_threshold: 64 * 1024 * 1024,
            max_key_size: 1024 * 1024,
            fsync_enabled: true,
        }
    }
}

impl DbConfig {
    /// Creates a config rooted at the given base path.
    pub fn new(base_file: impl Into<PathBuf>) -> Self {
        Self {
            base_file: Some(base_file.into()),
            ..Default::default()
        }
    }

    /// Creates a config for a non-durable in-memory database.
    pub fn in_memory() -> Self {
        Self {
            base_file: None,
            ..Default::default()
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(BorealError::IllegalPageSize(self.page_size));
        }
        if self.page_size > 65536 {
            return Err(BorealError::IllegalPageSize(self.page_size));
        }
        if self.min_cache_nodes < 5 {
            return Err(BorealError::InvalidArgument(
                "min_cache_nodes must be at least 5".to_string(),
            ));
        }
        if self.max_cache_nodes < self.min_cache_nodes {
            return Err(BorealError::InvalidArgument(
                "max_cache_nodes below min_cache_nodes".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of the page data file.
    pub fn data_file(&self) -> Option<PathBuf> {
        self.base_file.as_ref().map(|b| with_suffix(b, "db"))
    }

    /// Path of a redo file with the given file number.
    pub fn redo_file(&self, num: u64) -> Option<PathBuf> {
        self.base_file
            .as_ref()
            .map(|b| with_suffix(b, &format!("redo.{}", num)))
    }
}

fn with_suffix(base: &PathBuf, suffix: &str) -> PathBuf {
    let mut name = base.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    base.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.page_size, 4096);
        assert!(config.base_file.is_none());
        assert_eq!(config.durability_mode, DurabilityMode::Sync);
        assert!(config.fsync_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_paths() {
        let config = DbConfig::new("/tmp/testdb/base");
        assert_eq!(
            config.data_file().unwrap(),
            PathBuf::from("/tmp/testdb/base.db")
        );
        assert_eq!(
            config.redo_file(3).unwrap(),
            PathBuf::from("/tmp/testdb/base.redo.3")
        );
    }

    #[test]
    fn test_config_in_memory_has_no_paths() {
        let config = DbConfig::in_memory();
        assert!(config.data_file().is_none());
        assert!(config.redo_file(0).is_none());
    }

    #[test]
    fn test_page_size_validation() {
        let mut config = DbConfig::default();

        config.page_size = 511;
        assert!(config.validate().is_err());

        config.page_size = 4095; // not a power of two
        assert!(config.validate().is_err());

        config.page_size = 512;
        assert!(config.validate().is_ok());

        config.page_size = 65536;
        assert!(config.validate().is_ok());

        config.page_size = 131072;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cache_bounds_validation() {
        let mut config = DbConfig::default();

        config.min_cache_nodes = 2;
        assert!(config.validate().is_err());

        config.min_cache_nodes = 100;
        config.max_cache_nodes = 50;
        assert!(config.validate().is_err());

        config.max_cache_nodes = 100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let original = DbConfig::new("/data/db");
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: DbConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original.base_file, deserialized.base_file);
        assert_eq!(original.page_size, deserialized.page_size);
        assert_eq!(original.durability_mode, deserialized.durability_mode);
    }
}
