//! Positional binary reads and writes over an open file handle.
//!
//! `ByteFile` tracks its own cursor and forwards every transfer to a
//! `FileBackend` at an explicit offset, so the same code drives a real
//! file and the in-memory fake used by the orchestrator tests.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::errors::{Result, VaultError};

/// How a file is opened by a `FileSource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only. The file must exist.
    Read,
    /// Write-only. Creates the file, truncating any previous contents.
    Write,
    /// Write-only. Creates the file if needed; every write lands at the end.
    Append,
    /// Write-only. Creates the file and fails if it already exists.
    CreateNew,
}

impl OpenMode {
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// Reference point for `ByteFile::seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Begin,
    Current,
    End,
}

/// Raw positional access to one open file.
///
/// Each call moves at most `buf.len()` bytes and reports how many
/// actually moved; looping until completion is `ByteFile`'s job.
pub trait FileBackend: Send {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize>;
    fn write_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<usize>;
    fn size(&mut self) -> io::Result<u64>;
    fn modified(&mut self) -> io::Result<SystemTime>;
    /// Flush whatever the backend buffers. Called exactly once.
    fn close(&mut self) -> io::Result<()>;
}

/// An open file with a tracked cursor and little-endian integer helpers.
pub struct ByteFile {
    backend: Option<Box<dyn FileBackend>>,
    path: PathBuf,
    mode: OpenMode,
    pos: u64,
}

impl ByteFile {
    pub fn new(path: impl Into<PathBuf>, mode: OpenMode, backend: Box<dyn FileBackend>) -> Self {
        Self {
            backend: Some(backend),
            path: path.into(),
            mode,
            pos: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Current cursor offset.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn is_closed(&self) -> bool {
        self.backend.is_none()
    }

    fn backend(&mut self) -> Result<&mut Box<dyn FileBackend>> {
        self.backend.as_mut().ok_or(VaultError::Closed)
    }

    /// Read up to `n` bytes from the cursor.
    ///
    /// With `exact`, anything short of `n` bytes is a `ShortIo` error and
    /// the cursor still advances past the bytes that did arrive. At most
    /// the bytes left in the file are buffered, whatever `n` asks for.
    pub fn read_bytes(&mut self, n: usize, exact: bool) -> Result<Vec<u8>> {
        let start = self.pos;
        let backend = self.backend()?;
        let remaining = backend.size()?.saturating_sub(start);
        let want = usize::try_from(remaining).map_or(n, |r| n.min(r));
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            match backend.read_at(start + filled as u64, &mut buf[filled..]) {
                Ok(0) => break,
                Ok(got) => filled += got,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.pos += filled as u64;

        if exact && filled != n {
            return Err(VaultError::ShortIo {
                op: "read",
                expected: n,
                actual: filled,
            });
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Read everything from the cursor to the end of the file.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let len = self.backend()?.size()?;
        let remaining = usize::try_from(len.saturating_sub(self.pos))
            .map_err(|_| VaultError::FieldTooLarge("remaining file length"))?;
        self.read_bytes(remaining, false)
    }

    /// Write `buf` at the cursor and return the number of bytes written.
    pub fn write_bytes(&mut self, buf: &[u8], exact: bool) -> Result<usize> {
        let start = self.pos;
        let backend = self.backend()?;
        let mut written = 0;
        while written < buf.len() {
            match backend.write_at(start + written as u64, &buf[written..]) {
                Ok(0) => break,
                Ok(put) => written += put,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.pos += written as u64;

        if exact && written != buf.len() {
            return Err(VaultError::ShortIo {
                op: "write",
                expected: buf.len(),
                actual: written,
            });
        }
        Ok(written)
    }

    /// Move the cursor and return its new absolute offset.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let base = match whence {
            Whence::Begin => 0,
            Whence::Current => self.pos,
            Whence::End => self.backend()?.size()?,
        };
        let target = base.checked_add_signed(offset).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek to {offset} from {whence:?} leaves the file"),
            )
        })?;
        self.pos = target;
        Ok(target)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2, true)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4, true)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u16(&mut self, n: u16) -> Result<()> {
        self.write_bytes(&n.to_le_bytes(), true).map(|_| ())
    }

    pub fn write_u32(&mut self, n: u32) -> Result<()> {
        self.write_bytes(&n.to_le_bytes(), true).map(|_| ())
    }

    /// Last modification time of the underlying file.
    pub fn mtime(&mut self) -> Result<SystemTime> {
        Ok(self.backend()?.modified()?)
    }

    /// Release the handle. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self.backend.take() {
            Some(mut backend) => {
                debug!(path = %self.path.display(), mode = ?self.mode, "closing file");
                backend.close()?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for ByteFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(path = %self.path.display(), error = %e, "close on drop failed");
        }
    }
}

impl std::fmt::Debug for ByteFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteFile")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("pos", &self.pos)
            .field("closed", &self.is_closed())
            .finish()
    }
}
