//! Vault module: per-user records and the transactions that touch them.
//!
//! This module provides:
//! - The binary `VaultRecord` format with versioned decoding (`format`)
//! - `VaultEngine`, which owns the lock table, file source and policy (`engine`)
//! - Read, write and create transactions with commit/rollback (`transaction`)

pub mod engine;
pub mod format;
pub mod transaction;

use crate::errors::{Result, VaultError};

// Re-export the most commonly used items.
pub use engine::{VaultEngine, VaultSnapshot};
pub use format::{RecordVersion, VaultRecord};
pub use transaction::{
    lock_file_path, staging_path, CreateTxn, Finished, Outcome, ReadTxn, VaultView, WriteContext, WriteLocking,
    WriteTxn,
};

/// Check that `name` can be used as a vault file name.
///
/// The first character must be an ASCII letter or digit; the rest may
/// also be `_`, `.`, `$` or `-`. This keeps names from escaping the data
/// directory and from colliding with staging files.
pub fn validate_username(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$' | '-'))
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(VaultError::InvalidUsername(name.to_string()))
    }
}
