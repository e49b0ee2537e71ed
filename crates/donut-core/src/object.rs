//! One replica of a stored object
//!
//! An [`Object`] is a transient view over an object directory on a single
//! disk. Its two metadata records are read on first access and cached
//! for the lifetime of the view.

use donut_common::types::{ObjectKeyError, files};
use donut_common::{Error, Md5Calculator, Metadata, ObjectKey, Result, ResultExt};
use donut_disk::{Disk, ObjectReader};
use parking_lot::Mutex;
use std::io::Read;
use std::sync::Arc;

/// Object metadata key holding the payload digest
pub const MD5_KEY: &str = "md5";
/// Object metadata key holding the payload length
pub const SIZE_KEY: &str = "size";
/// Donut object metadata key holding the replica slot list
pub const REPLICAS_KEY: &str = "replicas";

/// View over one object directory on one disk
pub struct Object {
    key: ObjectKey,
    bucket: String,
    path: String,
    disk: Arc<dyn Disk>,
    object_metadata: Mutex<Option<Metadata>>,
    donut_object_metadata: Mutex<Option<Metadata>>,
}

impl Object {
    /// Create a view for `name` inside the bucket directory `bucket_path`
    pub fn new(
        name: &str,
        bucket: &str,
        bucket_path: &str,
        disk: Arc<dyn Disk>,
    ) -> Result<Self> {
        let key = ObjectKey::new(name).map_err(|e| match e {
            ObjectKeyError::Empty => Error::invalid_argument("object name cannot be empty"),
            other => Error::InvalidObjectKey(other),
        })?;
        let path = format!("{bucket_path}/{}", key.encoded());
        Ok(Self {
            key,
            bucket: bucket.to_string(),
            path,
            disk,
            object_metadata: Mutex::new(None),
            donut_object_metadata: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.key.as_str()
    }

    /// Object directory relative to the disk root
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn disk(&self) -> &Arc<dyn Disk> {
        &self.disk
    }

    /// User-facing metadata (`objectMetadata.json`)
    pub fn get_object_metadata(&self) -> Result<Metadata> {
        self.cached(&self.object_metadata, files::OBJECT_METADATA)
    }

    /// Internal bookkeeping (`donutObjectMetadata.json`)
    pub fn get_donut_object_metadata(&self) -> Result<Metadata> {
        self.cached(&self.donut_object_metadata, files::DONUT_OBJECT_METADATA)
    }

    /// Open the payload, returning the stream and its stored length
    pub fn open_data(&self) -> Result<(ObjectReader, u64)> {
        self.disk
            .open_file(&format!("{}/{}", self.path, files::OBJECT_DATA))
            .map_err(|e| self.missing_as_not_found(e))
            .with_context(|| format!("opening data of {}/{}", self.bucket, self.key))
    }

    /// Whether both records are readable and the payload matches the
    /// digest recorded in the donut object metadata
    pub fn verify(&self, buffer_size: usize) -> Result<bool> {
        let donut = self.get_donut_object_metadata()?;
        self.get_object_metadata()?;
        let Some(expected) = donut.get(MD5_KEY) else {
            return Ok(false);
        };

        let (mut reader, _) = self.open_data()?;
        let mut md5 = Md5Calculator::new();
        let mut buf = vec![0u8; buffer_size.max(1)];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            md5.update(&buf[..n]);
        }
        Ok(&md5.finalize() == expected)
    }

    fn cached(&self, slot: &Mutex<Option<Metadata>>, file: &str) -> Result<Metadata> {
        let mut slot = slot.lock();
        if let Some(metadata) = slot.as_ref() {
            return Ok(metadata.clone());
        }

        let bytes = self
            .disk
            .read_file(&format!("{}/{}", self.path, file))
            .map_err(|e| self.missing_as_not_found(e))
            .with_context(|| format!("reading {file} of {}/{}", self.bucket, self.key))?;
        let metadata: Metadata = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {file} of {}/{}", self.bucket, self.key))?;

        *slot = Some(metadata.clone());
        Ok(metadata)
    }

    fn missing_as_not_found(&self, err: Error) -> Error {
        if err.is_missing_file() {
            Error::object_not_found(&self.bucket, self.key.as_str())
        } else {
            err
        }
    }
}
