//! Disk capability interface
//!
//! All paths passed to a [`Disk`] are relative to its root and use `/`
//! as separator. Missing files surface as [`donut_common::Error::DiskIo`]
//! with [`std::io::ErrorKind::NotFound`] so callers can tell absence from
//! other failures.

use donut_common::Result;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Readable object stream, released by dropping it
pub type ObjectReader = Box<dyn Read + Send>;

/// Writable file stream; `flush` makes the written bytes durable
pub type ObjectWriter = Box<dyn Write + Send>;

/// A physical storage location
pub trait Disk: Send + Sync {
    /// Root path of this disk
    fn path(&self) -> &Path;

    /// Create a directory (and missing parents); existing directories are fine
    fn make_dir(&self, name: &str) -> Result<()>;

    /// Create or truncate a file for streaming writes
    fn create_file(&self, rel: &str) -> Result<ObjectWriter>;

    /// Open a file for streaming reads, returning its size
    fn open_file(&self, rel: &str) -> Result<(ObjectReader, u64)>;

    /// Read a whole file
    fn read_file(&self, rel: &str) -> Result<Vec<u8>>;

    /// Replace a file so readers see either the old or the new contents
    fn write_file_atomic(&self, rel: &str, bytes: &[u8]) -> Result<()>;

    /// Rename a file or directory, replacing the target file
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Entry names of a directory, sorted
    fn list_dir(&self, rel: &str) -> Result<Vec<String>>;

    /// Remove a file or directory tree; removing nothing is not an error
    fn remove_all(&self, rel: &str) -> Result<()>;

    /// Whether a file or directory exists
    fn exists(&self, rel: &str) -> bool;

    /// I/O counters
    fn stats(&self) -> DiskStatsSnapshot;
}

/// Opens disks by path
pub trait DiskProvider: Send + Sync {
    fn open(&self, path: &str) -> Result<Arc<dyn Disk>>;
}

/// Disk statistics
#[derive(Debug, Default)]
pub struct DiskStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub errors: AtomicU64,
}

impl DiskStats {
    pub fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> DiskStatsSnapshot {
        DiskStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DiskStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub errors: u64,
}
