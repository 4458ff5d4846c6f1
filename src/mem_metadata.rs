// src/mem_metadata.rs
//
// In-memory backend
//
// A namespace held in a BTreeMap behind a mutex. Clones share the namespace,
// so several ranks running as threads of one process see the same tree.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

use crate::metadata_ops::{AccessMode, Backend, FileHandle, FsUsage, OpenMode, StatInfo, Xfer};

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

type Namespace = BTreeMap<PathBuf, Node>;

/// In-memory backend
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Namespace>>,
}

/// Normalized key: `.` components dropped, so `./out/x` and `out/x` agree
fn key(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Parents that always exist: filesystem root and the working directory
fn is_implicit_dir(path: &Path) -> bool {
    path.as_os_str().is_empty() || path == Path::new("/")
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Namespace>> {
        self.inner.lock().map_err(|_| anyhow!("memory backend lock poisoned"))
    }

    fn check_parent(ns: &Namespace, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        if is_implicit_dir(parent) {
            return Ok(());
        }
        match ns.get(parent) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => bail!("not a directory: {}", parent.display()),
            None => bail!("no such directory: {}", parent.display()),
        }
    }

    /// Number of entries (files and directories)
    pub fn len(&self) -> usize {
        self.lock().map(|ns| ns.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entry paths, sorted
    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().map(|ns| ns.keys().cloned().collect()).unwrap_or_default()
    }

    /// Whether `path` exists
    pub fn exists(&self, path: &Path) -> bool {
        let path = key(path);
        is_implicit_dir(&path) || self.lock().map(|ns| ns.contains_key(&path)).unwrap_or(false)
    }

    /// Overwrite one byte of a file in place, for corruption tests
    pub fn overwrite(&self, path: &Path, offset: usize, byte: u8) -> Result<()> {
        let mut ns = self.lock()?;
        match ns.get_mut(&key(path)) {
            Some(Node::File(data)) if offset < data.len() => {
                data[offset] = byte;
                Ok(())
            }
            Some(Node::File(_)) => bail!("offset {} beyond end of {}", offset, path.display()),
            _ => bail!("no such file: {}", path.display()),
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "MEMORY"
    }

    async fn mkdir(&self, path: &Path) -> Result<()> {
        trace!("mkdir: {}", path.display());
        let path = key(path);
        let mut ns = self.lock()?;
        if is_implicit_dir(&path) || ns.contains_key(&path) {
            bail!("unable to create directory {}: already exists", path.display());
        }
        Self::check_parent(&ns, &path)
            .map_err(|e| anyhow!("unable to create directory {}: {}", path.display(), e))?;
        ns.insert(path, Node::Dir);
        Ok(())
    }

    async fn rmdir(&self, path: &Path) -> Result<()> {
        trace!("rmdir: {}", path.display());
        let path = key(path);
        let mut ns = self.lock()?;
        match ns.get(&path) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => bail!("unable to remove directory {}: not a directory", path.display()),
            None => bail!("unable to remove directory {}: no such directory", path.display()),
        }
        let has_children = ns
            .range(path.clone()..)
            .nth(1)
            .is_some_and(|(next, _)| next.starts_with(&path));
        if has_children {
            bail!("unable to remove directory {}: directory not empty", path.display());
        }
        ns.remove(&path);
        Ok(())
    }

    async fn create(&self, path: &Path) -> Result<Box<dyn FileHandle>> {
        trace!("create: {}", path.display());
        let path = key(path);
        {
            let mut ns = self.lock()?;
            Self::check_parent(&ns, &path)
                .map_err(|e| anyhow!("unable to create file {}: {}", path.display(), e))?;
            if let Some(Node::Dir) = ns.get(&path) {
                bail!("unable to create file {}: is a directory", path.display());
            }
            ns.insert(path.clone(), Node::File(Vec::new()));
        }
        Ok(Box::new(MemoryFile { backend: self.clone(), path }))
    }

    async fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        trace!("open: {} ({:?})", path.display(), mode);
        let path = key(path);
        match self.lock()?.get(&path) {
            Some(Node::File(_)) => {}
            Some(Node::Dir) => bail!("unable to open file {}: is a directory", path.display()),
            None => bail!("unable to open file {}: no such file", path.display()),
        }
        Ok(Box::new(MemoryFile { backend: self.clone(), path }))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        trace!("unlink: {}", path.display());
        let path = key(path);
        let mut ns = self.lock()?;
        match ns.get(&path) {
            Some(Node::File(_)) => {
                ns.remove(&path);
                Ok(())
            }
            Some(Node::Dir) => bail!("unable to remove file {}: is a directory", path.display()),
            None => bail!("unable to remove file {}: no such file", path.display()),
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        trace!("rename: {} -> {}", from.display(), to.display());
        let from = key(from);
        let to = key(to);
        let mut ns = self.lock()?;
        if !ns.contains_key(&from) {
            bail!("unable to rename {} to {}: no such entry", from.display(), to.display());
        }
        if ns.contains_key(&to) {
            bail!("unable to rename {} to {}: target exists", from.display(), to.display());
        }
        Self::check_parent(&ns, &to)
            .map_err(|e| anyhow!("unable to rename {} to {}: {}", from.display(), to.display(), e))?;

        // Move the entry and everything below it
        let moved: Vec<PathBuf> = ns
            .range(from.clone()..)
            .take_while(|(p, _)| p.starts_with(&from))
            .map(|(p, _)| p.clone())
            .collect();
        for old in moved {
            if let Some(node) = ns.remove(&old) {
                let rest = old.strip_prefix(&from).unwrap_or(Path::new(""));
                let new = if rest.as_os_str().is_empty() { to.clone() } else { to.join(rest) };
                ns.insert(new, node);
            }
        }
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<StatInfo> {
        trace!("stat: {}", path.display());
        let path = key(path);
        if is_implicit_dir(&path) {
            return Ok(StatInfo { size: 0, is_dir: true });
        }
        match self.lock()?.get(&path) {
            Some(Node::Dir) => Ok(StatInfo { size: 0, is_dir: true }),
            Some(Node::File(data)) => Ok(StatInfo { size: data.len() as u64, is_dir: false }),
            None => bail!("unable to stat {}: no such entry", path.display()),
        }
    }

    async fn access(&self, path: &Path, _mode: AccessMode) -> Result<bool> {
        Ok(self.exists(path))
    }

    async fn mknod(&self, path: &Path) -> Result<()> {
        trace!("mknod: {}", path.display());
        let path = key(path);
        let mut ns = self.lock()?;
        if ns.contains_key(&path) {
            bail!("unable to mknod file {}: already exists", path.display());
        }
        Self::check_parent(&ns, &path)
            .map_err(|e| anyhow!("unable to mknod file {}: {}", path.display(), e))?;
        ns.insert(path, Node::File(Vec::new()));
        Ok(())
    }

    async fn statfs(&self, _path: &Path) -> Result<FsUsage> {
        let entries = self.lock()?.len() as u64;
        Ok(FsUsage {
            total_bytes: 0,
            free_bytes: 0,
            total_inodes: entries,
            free_inodes: 0,
        })
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Handle to an in-memory file; data is read and written through the
/// shared namespace on every transfer
struct MemoryFile {
    backend: MemoryBackend,
    path: PathBuf,
}

#[async_trait]
impl FileHandle for MemoryFile {
    async fn xfer(&mut self, xfer: Xfer<'_>, offset: u64) -> Result<usize> {
        let mut ns = self.backend.lock()?;
        let data = match ns.get_mut(&self.path) {
            Some(Node::File(data)) => data,
            _ => bail!("file {} vanished while open", self.path.display()),
        };
        let offset = offset as usize;
        match xfer {
            Xfer::Write(buf) => {
                let end = offset + buf.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[offset..end].copy_from_slice(buf);
                Ok(buf.len())
            }
            Xfer::Read(buf) => {
                if offset >= data.len() {
                    return Ok(0);
                }
                let n = buf.len().min(data.len() - offset);
                buf[..n].copy_from_slice(&data[offset..offset + n]);
                Ok(n)
            }
        }
    }

    async fn fsync(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
