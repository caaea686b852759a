//! `FileSource` over the real filesystem.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::SystemTime;

use fs2::FileExt;
use tracing::debug;

use crate::errors::{Result, VaultError};

use super::byte_file::{ByteFile, FileBackend, OpenMode};
use super::PathLock;

/// Real filesystem access through `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeSource;

impl NativeSource {
    pub fn new() -> Self {
        Self
    }
}

struct NativeFile {
    file: File,
    mode: OpenMode,
}

impl FileBackend for NativeFile {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read(buf)
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<usize> {
        // O_APPEND ignores the offset; seeking first is harmless.
        if self.mode != OpenMode::Append {
            self.file.seek(SeekFrom::Start(pos))?;
        }
        self.file.write(buf)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn modified(&mut self) -> io::Result<SystemTime> {
        self.file.metadata()?.modified()
    }

    fn close(&mut self) -> io::Result<()> {
        if self.mode.is_writable() {
            self.file.flush()?;
            self.file.sync_all()?;
        }
        Ok(())
    }
}

fn map_not_found(err: io::Error, path: &Path) -> VaultError {
    if err.kind() == io::ErrorKind::NotFound {
        VaultError::NotFound(path.to_path_buf())
    } else {
        VaultError::Io(err)
    }
}

impl super::FileSource for NativeSource {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<ByteFile> {
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.write(true).create(true).truncate(true),
            OpenMode::Append => options.append(true).create(true),
            OpenMode::CreateNew => options.write(true).create_new(true),
        };
        let file = options.open(path).map_err(|e| map_not_found(e, path))?;
        Ok(ByteFile::new(path, mode, Box::new(NativeFile { file, mode })))
    }

    fn mtime(&self, path: &Path) -> Result<SystemTime> {
        let meta = fs::metadata(path).map_err(|e| map_not_found(e, path))?;
        Ok(meta.modified()?)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn rename_replacing(&self, src: &Path, dst: &Path) -> Result<()> {
        // rename(2) replaces `dst` atomically on the same filesystem.
        fs::rename(src, dst).map_err(|e| map_not_found(e, src))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| map_not_found(e, path))
    }

    /// `flock`s `path`, creating it if needed. The file is left behind
    /// on release; removing it would let two processes lock different
    /// inodes under one name.
    fn try_lock(&self, path: &Path) -> Result<Option<PathLock>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "took file lock");
                Ok(Some(PathLock::new(file)))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
