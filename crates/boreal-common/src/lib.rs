//! BorealDB common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all BorealDB components.

pub mod config;
pub mod error;
pub mod types;
pub mod varint;

pub use config::DbConfig;
pub use error::{BorealError, Result};
pub use types::{DurabilityMode, IndexId, LockMode, PageId, TxnId};
