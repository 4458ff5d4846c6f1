// src/fs_metadata.rs
//
// POSIX filesystem backend
//
// Namespace and payload operations go through tokio::fs; access, mknod,
// statvfs and sync use libc directly.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::ffi::CString;
use std::io::SeekFrom;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::trace;

use crate::metadata_ops::{AccessMode, Backend, FileHandle, FsUsage, OpenMode, StatInfo, Xfer};

/// POSIX filesystem backend. Paths are used as given.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixBackend;

impl PosixBackend {
    pub fn new() -> Self {
        Self
    }
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("Invalid path (embedded NUL): {}", path.display()))
}

#[async_trait]
impl Backend for PosixBackend {
    fn name(&self) -> &'static str {
        "POSIX"
    }

    async fn mkdir(&self, path: &Path) -> Result<()> {
        trace!("mkdir: {}", path.display());
        tokio::fs::create_dir(path)
            .await
            .context(format!("unable to create directory {}", path.display()))
    }

    async fn rmdir(&self, path: &Path) -> Result<()> {
        trace!("rmdir: {}", path.display());
        tokio::fs::remove_dir(path)
            .await
            .context(format!("unable to remove directory {}", path.display()))
    }

    async fn create(&self, path: &Path) -> Result<Box<dyn FileHandle>> {
        trace!("create: {}", path.display());
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
            .context(format!("unable to create file {}", path.display()))?;
        Ok(Box::new(PosixFile { file, path: path.to_path_buf() }))
    }

    async fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        trace!("open: {} ({:?})", path.display(), mode);
        let mut options = tokio::fs::OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.read(true).write(true),
        };
        let file = options
            .open(path)
            .await
            .context(format!("unable to open file {}", path.display()))?;
        Ok(Box::new(PosixFile { file, path: path.to_path_buf() }))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        trace!("unlink: {}", path.display());
        tokio::fs::remove_file(path)
            .await
            .context(format!("unable to remove file {}", path.display()))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        trace!("rename: {} -> {}", from.display(), to.display());
        tokio::fs::rename(from, to)
            .await
            .context(format!("unable to rename {} to {}", from.display(), to.display()))
    }

    async fn stat(&self, path: &Path) -> Result<StatInfo> {
        trace!("stat: {}", path.display());
        let metadata = tokio::fs::metadata(path)
            .await
            .context(format!("unable to stat {}", path.display()))?;
        Ok(StatInfo { size: metadata.len(), is_dir: metadata.is_dir() })
    }

    async fn access(&self, path: &Path, mode: AccessMode) -> Result<bool> {
        trace!("access: {} mode={}", path.display(), mode);
        let path_cstr = c_path(path)?;
        let result = unsafe { libc::access(path_cstr.as_ptr(), mode.to_posix_mode()) };
        Ok(result == 0)
    }

    async fn mknod(&self, path: &Path) -> Result<()> {
        trace!("mknod: {}", path.display());
        let path_cstr = c_path(path)?;
        let result = unsafe { libc::mknod(path_cstr.as_ptr(), libc::S_IFREG | 0o664, 0) };
        if result != 0 {
            return Err(std::io::Error::last_os_error())
                .context(format!("unable to mknod file {}", path.display()));
        }
        Ok(())
    }

    async fn statfs(&self, path: &Path) -> Result<FsUsage> {
        let path_cstr = c_path(path)?;
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        let result = unsafe { libc::statvfs(path_cstr.as_ptr(), &mut st) };
        if result != 0 {
            return Err(std::io::Error::last_os_error())
                .context(format!("unable to statfs {}", path.display()));
        }
        let frsize = st.f_frsize as u64;
        Ok(FsUsage {
            total_bytes: st.f_blocks as u64 * frsize,
            free_bytes: st.f_bavail as u64 * frsize,
            total_inodes: st.f_files as u64,
            free_inodes: st.f_ffree as u64,
        })
    }

    async fn sync(&self) -> Result<()> {
        tokio::task::spawn_blocking(|| unsafe { libc::sync() })
            .await
            .context("sync task failed")
    }
}

/// Open POSIX file
struct PosixFile {
    file: tokio::fs::File,
    path: PathBuf,
}

#[async_trait]
impl FileHandle for PosixFile {
    async fn xfer(&mut self, xfer: Xfer<'_>, offset: u64) -> Result<usize> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .context(format!("unable to seek in {}", self.path.display()))?;
        match xfer {
            Xfer::Write(buf) => {
                self.file
                    .write_all(buf)
                    .await
                    .context(format!("unable to write file {}", self.path.display()))?;
                self.file
                    .flush()
                    .await
                    .context(format!("unable to write file {}", self.path.display()))?;
                Ok(buf.len())
            }
            Xfer::Read(buf) => {
                let mut done = 0;
                while done < buf.len() {
                    let n = self
                        .file
                        .read(&mut buf[done..])
                        .await
                        .context(format!("unable to read file {}", self.path.display()))?;
                    if n == 0 {
                        break;
                    }
                    done += n;
                }
                Ok(done)
            }
        }
    }

    async fn fsync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .await
            .context(format!("unable to sync file {}", self.path.display()))
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        if let Err(e) = self.file.flush().await {
            bail!("unable to close file {}: {}", self.path.display(), e);
        }
        Ok(())
    }
}
