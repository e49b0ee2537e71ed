//! Directory-backed disk driver
//!
//! A [`LocalDisk`] is a directory on a mounted filesystem. Writes go
//! through buffered files whose `flush` optionally fsyncs, and atomic
//! replacement uses write-to-temp then rename.

use crate::disk::{Disk, DiskProvider, DiskStats, DiskStatsSnapshot, ObjectReader, ObjectWriter};
use donut_common::{Error, Result};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Disk manager for a single directory
pub struct LocalDisk {
    /// Root directory
    root: PathBuf,
    /// fsync files before reporting them written
    sync_writes: bool,
    /// Statistics
    stats: Arc<DiskStats>,
}

impl LocalDisk {
    /// Open a disk rooted at `path`, creating the directory if needed
    pub fn open(path: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        if root.as_os_str().is_empty() {
            return Err(Error::invalid_argument("disk path cannot be empty"));
        }
        if root.exists() && !root.is_dir() {
            return Err(Error::invalid_argument(format!(
                "disk path {} is not a directory",
                root.display()
            )));
        }
        fs::create_dir_all(&root)?;

        debug!("Opened disk at {}", root.display());

        Ok(Self {
            root,
            sync_writes,
            stats: Arc::new(DiskStats::default()),
        })
    }

    /// Map a relative `/`-separated path under the root
    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for part in rel.split('/').filter(|p| !p.is_empty()) {
            let mut components = Path::new(part).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(c)), None) => path.push(c),
                _ => {
                    return Err(Error::invalid_argument(format!(
                        "path component {part:?} escapes disk root"
                    )));
                }
            }
        }
        Ok(path)
    }

    fn track<T>(&self, result: io::Result<T>) -> Result<T> {
        result.map_err(|e| {
            self.stats.record_error();
            Error::DiskIo(e)
        })
    }
}

impl Disk for LocalDisk {
    fn path(&self) -> &Path {
        &self.root
    }

    fn make_dir(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        self.track(fs::create_dir_all(path))
    }

    fn create_file(&self, rel: &str) -> Result<ObjectWriter> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            self.track(fs::create_dir_all(parent))?;
        }
        let file = self.track(File::create(&path))?;
        Ok(Box::new(FileWriter {
            inner: BufWriter::new(file),
            sync: self.sync_writes,
            stats: self.stats.clone(),
            written: 0,
        }))
    }

    fn open_file(&self, rel: &str) -> Result<(ObjectReader, u64)> {
        let path = self.resolve(rel)?;
        let file = self.track(File::open(&path))?;
        let size = self.track(file.metadata())?.len();
        Ok((
            Box::new(FileReader {
                inner: file,
                stats: self.stats.clone(),
            }),
            size,
        ))
    }

    fn read_file(&self, rel: &str) -> Result<Vec<u8>> {
        let path = self.resolve(rel)?;
        let bytes = self.track(fs::read(path))?;
        self.stats.record_read(bytes.len() as u64);
        Ok(bytes)
    }

    fn write_file_atomic(&self, rel: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(rel)?;
        let file_name = path
            .file_name()
            .ok_or_else(|| Error::invalid_argument("cannot write to the disk root"))?
            .to_string_lossy()
            .into_owned();
        let tmp = path.with_file_name(format!("{}.tmp-{}", file_name, uuid::Uuid::new_v4()));

        if let Some(parent) = path.parent() {
            self.track(fs::create_dir_all(parent))?;
        }

        let result = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            if self.sync_writes {
                file.sync_all()?;
            }
            fs::rename(&tmp, &path)
        })();

        if result.is_err() {
            match fs::remove_file(&tmp) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove temp file {}: {}", tmp.display(), e),
            }
        }
        self.track(result)?;
        self.stats.record_write(bytes.len() as u64);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        if let Some(parent) = to.parent() {
            self.track(fs::create_dir_all(parent))?;
        }
        self.track(fs::rename(from, to))
    }

    fn list_dir(&self, rel: &str) -> Result<Vec<String>> {
        let path = self.resolve(rel)?;
        let mut names = Vec::new();
        for entry in self.track(fs::read_dir(path))? {
            let entry = self.track(entry)?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn remove_all(&self, rel: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        if path == self.root {
            return Err(Error::invalid_argument("refusing to remove the disk root"));
        }
        let result = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        self.track(result)
    }

    fn exists(&self, rel: &str) -> bool {
        self.resolve(rel).is_ok_and(|p| p.exists())
    }

    fn stats(&self) -> DiskStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Buffered file writer counting bytes into the disk statistics
struct FileWriter {
    inner: BufWriter<File>,
    sync: bool,
    stats: Arc<DiskStats>,
    written: u64,
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        if self.sync {
            self.inner.get_ref().sync_all()?;
        }
        if self.written > 0 {
            self.stats.record_write(self.written);
            self.written = 0;
        }
        Ok(())
    }
}

struct FileReader {
    inner: File,
    stats: Arc<DiskStats>,
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.stats.record_read(n as u64);
        }
        Ok(n)
    }
}

/// Opens [`LocalDisk`]s
#[derive(Clone, Debug, Default)]
pub struct LocalDiskProvider {
    sync_writes: bool,
}

impl LocalDiskProvider {
    #[must_use]
    pub const fn new(sync_writes: bool) -> Self {
        Self { sync_writes }
    }
}

impl DiskProvider for LocalDiskProvider {
    fn open(&self, path: &str) -> Result<Arc<dyn Disk>> {
        Ok(Arc::new(LocalDisk::open(path, self.sync_writes)?))
    }
}
