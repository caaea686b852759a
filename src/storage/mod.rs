//! Storage module: file handles and the sources that open them.
//!
//! This module provides:
//! - `ByteFile`, a cursor-tracking binary file handle (`byte_file`)
//! - `NativeSource`, backed by the real filesystem (`native`)
//! - `MemorySource`, an in-memory fake with the same semantics (`memory`)

pub mod byte_file;
pub mod memory;
pub mod native;

use std::path::Path;
use std::time::SystemTime;

use crate::errors::Result;

pub use byte_file::{ByteFile, FileBackend, OpenMode, Whence};
pub use memory::MemorySource;
pub use native::NativeSource;

/// Opens, stats, renames and removes files by path.
///
/// Opening a missing path with `OpenMode::Read` must fail with
/// `VaultError::NotFound` so callers can tell absence apart from other
/// IO failures. Opening an existing path with `OpenMode::CreateNew` must
/// fail with an `AlreadyExists` IO error.
pub trait FileSource: Send + Sync {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<ByteFile>;

    fn mtime(&self, path: &Path) -> Result<SystemTime>;

    fn exists(&self, path: &Path) -> bool;

    /// Atomically make `dst` what `src` was. `src` is gone afterwards.
    fn rename_replacing(&self, src: &Path, dst: &Path) -> Result<()>;

    fn remove(&self, path: &Path) -> Result<()>;

    /// Try to claim `path` exclusively across every process sharing the
    /// directory. Returns `None` while someone else holds the claim.
    ///
    /// The claim is advisory. Only callers that ask for it are excluded.
    fn try_lock(&self, path: &Path) -> Result<Option<PathLock>>;
}

/// A claim taken with `FileSource::try_lock`. Dropping it releases the
/// claim.
pub struct PathLock {
    _held: Box<dyn Send + Sync>,
}

impl PathLock {
    pub fn new(held: impl Send + Sync + 'static) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

impl std::fmt::Debug for PathLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathLock").finish_non_exhaustive()
    }
}
