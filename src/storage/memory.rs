//! In-memory `FileSource` for tests.
//!
//! Files are shared nodes in a path map. Handles keep a reference to
//! their node, so a handle opened before `remove` or `rename_replacing`
//! keeps seeing the old contents, as an unlinked inode would.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::errors::{Result, VaultError};

use super::byte_file::{ByteFile, FileBackend, OpenMode};
use super::PathLock;

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    mtime: SystemTime,
}

impl Node {
    fn empty() -> Self {
        Self {
            data: Vec::new(),
            mtime: SystemTime::now(),
        }
    }
}

type SharedNode = Arc<Mutex<Node>>;

#[derive(Debug, Default)]
struct Inner {
    files: HashMap<PathBuf, SharedNode>,
    /// Largest size any write may grow a file to; beyond it writes come up short.
    capacity: Option<usize>,
    /// Paths claimed through `try_lock`. Claims are not files.
    claims: HashSet<PathBuf>,
}

/// A filesystem that lives in a `HashMap`.
///
/// Cloning yields another view of the same files.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite `path` with `data`.
    pub fn insert(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        let node = Node {
            data: data.into(),
            mtime: SystemTime::now(),
        };
        self.inner
            .lock()
            .files
            .insert(path.into(), Arc::new(Mutex::new(node)));
    }

    /// Snapshot of a file's bytes, if it exists.
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        let node = self.inner.lock().files.get(path).cloned()?;
        let data = node.lock().data.clone();
        Some(data)
    }

    /// Overwrite a file's modification time.
    pub fn set_mtime(&self, path: &Path, mtime: SystemTime) -> Result<()> {
        let node = self.node(path)?;
        node.lock().mtime = mtime;
        Ok(())
    }

    /// Cap every file at `bytes`; writes past the cap transfer short.
    pub fn set_capacity(&self, bytes: Option<usize>) {
        self.inner.lock().capacity = bytes;
    }

    /// All paths currently present, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.inner.lock().files.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn node(&self, path: &Path) -> Result<SharedNode> {
        self.inner
            .lock()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(path.to_path_buf()))
    }
}

struct MemoryFile {
    node: SharedNode,
    mode: OpenMode,
    source: Arc<Mutex<Inner>>,
}

fn bad_descriptor(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("handle not opened for {what}"),
    )
}

impl FileBackend for MemoryFile {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        if self.mode != OpenMode::Read {
            return Err(bad_descriptor("reading"));
        }
        let node = self.node.lock();
        let Ok(pos) = usize::try_from(pos) else {
            return Ok(0);
        };
        if pos >= node.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(node.data.len() - pos);
        buf[..n].copy_from_slice(&node.data[pos..pos + n]);
        Ok(n)
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<usize> {
        if !self.mode.is_writable() {
            return Err(bad_descriptor("writing"));
        }
        let capacity = self.source.lock().capacity;
        let mut node = self.node.lock();
        let pos = match self.mode {
            OpenMode::Append => node.data.len(),
            _ => usize::try_from(pos)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?,
        };
        let room = capacity.map_or(usize::MAX, |cap| cap.saturating_sub(pos));
        let n = buf.len().min(room);
        if n == 0 {
            return Ok(0);
        }
        if node.data.len() < pos + n {
            node.data.resize(pos + n, 0);
        }
        node.data[pos..pos + n].copy_from_slice(&buf[..n]);
        node.mtime = SystemTime::now();
        Ok(n)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.node.lock().data.len() as u64)
    }

    fn modified(&mut self) -> io::Result<SystemTime> {
        Ok(self.node.lock().mtime)
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl super::FileSource for MemorySource {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<ByteFile> {
        let node = {
            let mut inner = self.inner.lock();
            match mode {
                OpenMode::Read => inner
                    .files
                    .get(path)
                    .cloned()
                    .ok_or_else(|| VaultError::NotFound(path.to_path_buf()))?,
                OpenMode::Write => {
                    let node = inner
                        .files
                        .entry(path.to_path_buf())
                        .or_insert_with(|| Arc::new(Mutex::new(Node::empty())))
                        .clone();
                    {
                        let mut n = node.lock();
                        n.data.clear();
                        n.mtime = SystemTime::now();
                    }
                    node
                }
                OpenMode::Append => inner
                    .files
                    .entry(path.to_path_buf())
                    .or_insert_with(|| Arc::new(Mutex::new(Node::empty())))
                    .clone(),
                OpenMode::CreateNew => {
                    if inner.files.contains_key(path) {
                        return Err(io::Error::new(
                            io::ErrorKind::AlreadyExists,
                            format!("{} already exists", path.display()),
                        )
                        .into());
                    }
                    let node = Arc::new(Mutex::new(Node::empty()));
                    inner.files.insert(path.to_path_buf(), Arc::clone(&node));
                    node
                }
            }
        };
        let backend = MemoryFile {
            node,
            mode,
            source: Arc::clone(&self.inner),
        };
        Ok(ByteFile::new(path, mode, Box::new(backend)))
    }

    fn mtime(&self, path: &Path) -> Result<SystemTime> {
        let node = self.node(path)?;
        let mtime = node.lock().mtime;
        Ok(mtime)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.lock().files.contains_key(path)
    }

    fn rename_replacing(&self, src: &Path, dst: &Path) -> Result<()> {
        let mut inner = self.inner.lock();
        let node = inner
            .files
            .remove(src)
            .ok_or_else(|| VaultError::NotFound(src.to_path_buf()))?;
        inner.files.insert(dst.to_path_buf(), node);
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.inner
            .lock()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| VaultError::NotFound(path.to_path_buf()))
    }

    fn try_lock(&self, path: &Path) -> Result<Option<PathLock>> {
        if !self.inner.lock().claims.insert(path.to_path_buf()) {
            return Ok(None);
        }
        Ok(Some(PathLock::new(Claim {
            source: Arc::clone(&self.inner),
            path: path.to_path_buf(),
        })))
    }
}

struct Claim {
    source: Arc<Mutex<Inner>>,
    path: PathBuf,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.source.lock().claims.remove(&self.path);
    }
}
