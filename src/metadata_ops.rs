// src/metadata_ops.rs
//
// Storage backend abstraction for the metadata benchmark
//
// The workload engine only ever talks to a `Backend` trait object selected at
// startup; payload I/O goes through the `FileHandle` returned by create/open.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

/// Namespace and data operations the benchmark needs from a storage system
///
/// Implementations:
/// - `PosixBackend`: native filesystem calls (tokio::fs + libc)
/// - `MemoryBackend`: in-process namespace for dry runs and tests
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend name for banners and logs
    fn name(&self) -> &'static str;

    /// Create a single directory (parent must exist)
    async fn mkdir(&self, path: &Path) -> Result<()>;

    /// Remove an empty directory
    async fn rmdir(&self, path: &Path) -> Result<()>;

    /// Create (or truncate-open) a file for writing
    async fn create(&self, path: &Path) -> Result<Box<dyn FileHandle>>;

    /// Open an existing file
    async fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>>;

    /// Remove a file
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Rename a file or directory
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Stat a file or directory
    async fn stat(&self, path: &Path) -> Result<StatInfo>;

    /// Test access permissions; `Ok(false)` when denied or missing
    async fn access(&self, path: &Path, mode: AccessMode) -> Result<bool>;

    /// Create an empty regular file without opening it
    async fn mknod(&self, path: &Path) -> Result<()>;

    /// Capacity and inode usage of the filesystem holding `path`
    async fn statfs(&self, path: &Path) -> Result<FsUsage>;

    /// Flush everything to stable storage
    async fn sync(&self) -> Result<()>;
}

/// An open file. Owned by the engine call that opened it until `close`.
#[async_trait]
pub trait FileHandle: Send {
    /// Move bytes between the buffer and the file at `offset`.
    /// Returns the number of bytes moved; callers treat anything other than
    /// the buffer length as an error.
    async fn xfer(&mut self, xfer: Xfer<'_>, offset: u64) -> Result<usize>;

    /// Flush this file to stable storage
    async fn fsync(&mut self) -> Result<()>;

    /// Release the handle
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Direction and buffer of a payload transfer
pub enum Xfer<'a> {
    Write(&'a [u8]),
    Read(&'a mut [u8]),
}

impl Xfer<'_> {
    pub fn len(&self) -> usize {
        match self {
            Xfer::Write(buf) => buf.len(),
            Xfer::Read(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How an existing file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Result of a stat call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatInfo {
    pub size: u64,
    pub is_dir: bool,
}

/// Filesystem capacity and inode usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
}

impl FsUsage {
    pub fn used_bytes_pct(&self) -> f64 {
        used_pct(self.total_bytes, self.free_bytes)
    }

    pub fn used_inodes_pct(&self) -> f64 {
        used_pct(self.total_inodes, self.free_inodes)
    }
}

fn used_pct(total: u64, free: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * (total.saturating_sub(free)) as f64 / total as f64
    }
}

/// Access permission test modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Execute,
    /// Existence only
    Exists,
}

impl AccessMode {
    /// Convert to POSIX access() mode bits
    pub fn to_posix_mode(&self) -> i32 {
        match self {
            AccessMode::Read => libc::R_OK,
            AccessMode::Write => libc::W_OK,
            AccessMode::Execute => libc::X_OK,
            AccessMode::Exists => libc::F_OK,
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::Read => write!(f, "read"),
            AccessMode::Write => write!(f, "write"),
            AccessMode::Execute => write!(f, "execute"),
            AccessMode::Exists => write!(f, "exists"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mode_to_posix() {
        assert_eq!(AccessMode::Read.to_posix_mode(), libc::R_OK);
        assert_eq!(AccessMode::Write.to_posix_mode(), libc::W_OK);
        assert_eq!(AccessMode::Execute.to_posix_mode(), libc::X_OK);
        assert_eq!(AccessMode::Exists.to_posix_mode(), libc::F_OK);
    }

    #[test]
    fn test_xfer_len() {
        let data = [1u8, 2, 3];
        assert_eq!(Xfer::Write(&data).len(), 3);
        let mut buf = [0u8; 0];
        assert!(Xfer::Read(&mut buf).is_empty());
    }

    #[test]
    fn test_usage_percentages() {
        let usage = FsUsage { total_bytes: 200, free_bytes: 50, total_inodes: 0, free_inodes: 0 };
        assert!((usage.used_bytes_pct() - 75.0).abs() < f64::EPSILON);
        assert_eq!(usage.used_inodes_pct(), 0.0);
    }
}
