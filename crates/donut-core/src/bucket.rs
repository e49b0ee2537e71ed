//! Bucket records

use donut_common::types::{BUCKET_METADATA_VERSION, files};
use donut_common::{Acl, BucketName, Error, Metadata, Result, ResultExt};
use donut_disk::Disk;
use parking_lot::RwLock;

/// Bucket metadata keys owned by the coordinator
pub const NAME_KEY: &str = "name";
pub const ACL_KEY: &str = "acl";
pub const CREATED_KEY: &str = "created";
pub const VERSION_KEY: &str = "version";

/// A named collection of objects and its metadata record
#[derive(Debug)]
pub struct Bucket {
    name: BucketName,
    metadata: RwLock<Metadata>,
}

impl Bucket {
    /// Fresh bucket record stamped with the current time
    #[must_use]
    pub fn new(name: BucketName, acl: Acl) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert(NAME_KEY.to_string(), name.to_string());
        metadata.insert(ACL_KEY.to_string(), acl.to_string());
        metadata.insert(CREATED_KEY.to_string(), crate::timestamp());
        metadata.insert(VERSION_KEY.to_string(), BUCKET_METADATA_VERSION.to_string());
        Self {
            name,
            metadata: RwLock::new(metadata),
        }
    }

    /// Rebuild a bucket from a stored record
    pub fn from_metadata(name: BucketName, metadata: Metadata) -> Result<Self> {
        match metadata.get(NAME_KEY) {
            Some(recorded) if recorded == name.as_str() => {}
            recorded => {
                return Err(Error::internal(format!(
                    "bucket record for {name} names {recorded:?}"
                )));
            }
        }
        Ok(Self {
            name,
            metadata: RwLock::new(metadata),
        })
    }

    /// Read a stored record from `<domain>/<bucket>/bucketMetadata.json`
    pub fn load(domain: &str, name: BucketName, disk: &dyn Disk) -> Result<Self> {
        let rel = Self::record_path(domain, name.as_str());
        let bytes = disk.read_file(&rel)?;
        let metadata: Metadata = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing bucket record {rel}"))?;
        Self::from_metadata(name, metadata)
    }

    #[must_use]
    pub const fn name(&self) -> &BucketName {
        &self.name
    }

    #[must_use]
    pub fn metadata(&self) -> Metadata {
        self.metadata.read().clone()
    }

    /// ACL recorded for this bucket; missing means private
    pub fn acl(&self) -> Result<Acl> {
        self.metadata
            .read()
            .get(ACL_KEY)
            .map_or(Ok(Acl::Private), |acl| acl.parse())
    }

    /// Record with `updates` merged in, leaving coordinator-owned keys
    /// intact; an `acl` update must be a valid ACL
    pub fn merged(&self, updates: &Metadata) -> Result<Metadata> {
        let mut metadata = self.metadata();
        for (key, value) in updates {
            match key.as_str() {
                NAME_KEY | VERSION_KEY => {}
                ACL_KEY => {
                    let acl: Acl = value.parse()?;
                    metadata.insert(key.clone(), acl.to_string());
                }
                _ => {
                    metadata.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(metadata)
    }

    /// Replace the in-memory record
    pub fn replace_metadata(&self, metadata: Metadata) {
        *self.metadata.write() = metadata;
    }

    /// Create the bucket directory and write its record on one disk
    pub fn persist(&self, domain: &str, disk: &dyn Disk) -> Result<()> {
        Self::persist_metadata(domain, self.name.as_str(), &self.metadata(), disk)
    }

    pub(crate) fn persist_metadata(
        domain: &str,
        bucket: &str,
        metadata: &Metadata,
        disk: &dyn Disk,
    ) -> Result<()> {
        disk.make_dir(&Self::dir(domain, bucket))?;
        let record = serde_json::to_vec_pretty(metadata)?;
        disk.write_file_atomic(&Self::record_path(domain, bucket), &record)
    }

    /// Bucket directory relative to the disk root
    #[must_use]
    pub fn dir(domain: &str, bucket: &str) -> String {
        format!("{domain}/{bucket}")
    }

    #[must_use]
    pub fn record_path(domain: &str, bucket: &str) -> String {
        format!("{domain}/{bucket}/{}", files::BUCKET_METADATA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use donut_disk::LocalDisk;
    use tempfile::tempdir;

    fn photos() -> BucketName {
        BucketName::new("photos").unwrap()
    }

    #[test]
    fn test_new_bucket_record() {
        let bucket = Bucket::new(photos(), Acl::PublicRead);
        let metadata = bucket.metadata();
        assert_eq!(metadata[NAME_KEY], "photos");
        assert_eq!(metadata[ACL_KEY], "public-read");
        assert_eq!(metadata[VERSION_KEY], "1.0");
        assert!(metadata.contains_key(CREATED_KEY));
        assert_eq!(bucket.acl().unwrap(), Acl::PublicRead);
    }

    #[test]
    fn test_merge_keeps_owned_keys() {
        let bucket = Bucket::new(photos(), Acl::Private);
        let mut updates = Metadata::new();
        updates.insert("name".into(), "hijacked".into());
        updates.insert("version".into(), "9.9".into());
        updates.insert("owner".into(), "alice".into());
        updates.insert("acl".into(), "public-read-write".into());

        let merged = bucket.merged(&updates).unwrap();
        assert_eq!(merged["name"], "photos");
        assert_eq!(merged["version"], "1.0");
        assert_eq!(merged["owner"], "alice");
        assert_eq!(merged["acl"], "public-read-write");

        updates.insert("acl".into(), "everyone".into());
        assert!(matches!(
            bucket.merged(&updates),
            Err(Error::InvalidAcl(_))
        ));
    }

    #[test]
    fn test_persist_and_load() {
        let dir = tempdir().unwrap();
        let disk = LocalDisk::open(dir.path(), false).unwrap();
        let bucket = Bucket::new(photos(), Acl::AuthenticatedRead);
        bucket.persist("donut", &disk).unwrap();

        assert!(dir.path().join("donut/photos/bucketMetadata.json").is_file());
        let loaded = Bucket::load("donut", photos(), &disk).unwrap();
        assert_eq!(loaded.metadata(), bucket.metadata());

        let other = BucketName::new("videos").unwrap();
        assert!(Bucket::load("donut", other, &disk).unwrap_err().is_missing_file());
    }

    #[test]
    fn test_record_must_match_directory() {
        let mut metadata = Metadata::new();
        metadata.insert(NAME_KEY.into(), "videos".into());
        assert!(Bucket::from_metadata(photos(), metadata).is_err());
    }
}
