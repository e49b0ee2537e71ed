//! Donut coordinator
//!
//! A [`Donut`] owns the node and bucket registries of one named storage
//! domain and serves the object storage operations. Objects are mirrored:
//! every disk attached at write time receives a full copy, and the slots
//! holding a copy are recorded in the donut object metadata.
//!
//! Registries sit behind read-write locks that are only held long enough
//! to copy out `Arc` handles; disk I/O always runs without them. Writers
//! to one object path are serialized through [`PathLocks`].

use crate::bucket::Bucket;
use crate::listing::{self, ListObjectsResult};
use crate::locks::PathLocks;
use crate::management::DonutConfig;
use crate::node::Node;
use crate::object::{MD5_KEY, Object, REPLICAS_KEY, SIZE_KEY};
use donut_common::config::StorageSettings;
use donut_common::types::{DONUT_OBJECT_METADATA_VERSION, OBJECT_METADATA_VERSION, files};
use donut_common::{
    Acl, BucketName, Error, Md5Calculator, Metadata, ObjectKey, Result, ResultExt, Settings,
    Slot, normalize_md5,
};
use donut_disk::{Disk, DiskProvider, LocalDiskProvider, ObjectReader};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Placement format recorded in donut object metadata
pub const MIRROR_FORMAT: &str = "mirror";

/// Content type recorded when the caller supplies none
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Object metadata keys written by the coordinator; callers cannot set these
/// except `contentType`
const SYSTEM_KEYS: &[&str] = &[
    "version",
    "bucket",
    "object",
    SIZE_KEY,
    MD5_KEY,
    "contentType",
    "created",
];

/// Directory under the domain root holding in-flight writes
const STAGING_DIR: &str = ".tmp";

/// Bucket and object operations
pub trait ObjectStorage {
    /// Metadata record of a bucket
    fn get_bucket_metadata(&self, bucket: &str) -> Result<Metadata>;

    /// Merge caller keys into a bucket record on every disk
    fn set_bucket_metadata(&self, bucket: &str, metadata: &Metadata) -> Result<()>;

    /// Every bucket with its metadata
    fn list_buckets(&self) -> Result<BTreeMap<String, Metadata>>;

    /// Create a bucket on every disk
    fn make_bucket(&self, bucket: &str, acl: &str) -> Result<()>;

    /// One page of object keys
    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        delimiter: &str,
        max_keys: usize,
    ) -> Result<ListObjectsResult>;

    /// Object payload stream and its size
    fn get_object(&self, bucket: &str, object: &str) -> Result<(ObjectReader, u64)>;

    /// User-facing object metadata
    fn get_object_metadata(&self, bucket: &str, object: &str) -> Result<Metadata>;

    /// Store an object, returning the hex MD5 of its payload
    fn put_object(
        &self,
        bucket: &str,
        object: &str,
        expected_md5: &str,
        reader: &mut dyn Read,
        metadata: &Metadata,
    ) -> Result<String>;

    /// Remove an object from every disk
    fn delete_object(&self, bucket: &str, object: &str) -> Result<()>;
}

/// A disk together with the slot naming it
#[derive(Clone)]
pub struct Replica {
    pub slot: Slot,
    pub disk: Arc<dyn Disk>,
}

/// Coordinator for one storage domain
pub struct Donut {
    name: String,
    pub(crate) nodes: RwLock<BTreeMap<String, Arc<Node>>>,
    pub(crate) buckets: RwLock<BTreeMap<String, Arc<Bucket>>>,
    pub(crate) provider: Arc<dyn DiskProvider>,
    pub(crate) storage: StorageSettings,
    pub(crate) locks: PathLocks,
    pub(crate) config_lock: Mutex<()>,
}

impl Donut {
    /// Build a domain over local directories
    pub fn new(name: &str, node_disks: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        Self::with_provider(
            name,
            node_disks,
            Arc::new(LocalDiskProvider::default()),
            StorageSettings::default(),
        )
    }

    /// Build the domain declared in a settings file
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::with_provider(
            &settings.domain.name,
            &settings.nodes,
            Arc::new(LocalDiskProvider::new(settings.storage.sync_writes)),
            settings.storage.clone(),
        )
    }

    /// Build a domain, opening disks through `provider`
    ///
    /// Disk orders are the positions in each node's list. Buckets already
    /// present on the disks are served.
    pub fn with_provider(
        name: &str,
        node_disks: &BTreeMap<String, Vec<String>>,
        provider: Arc<dyn DiskProvider>,
        storage: StorageSettings,
    ) -> Result<Self> {
        validate_domain_name(name)?;
        if node_disks.is_empty() {
            return Err(Error::invalid_argument("node disk map cannot be empty"));
        }
        if let Some((node, _)) = node_disks.iter().find(|(_, disks)| disks.is_empty()) {
            return Err(Error::InvalidDisksArgument { node: node.clone() });
        }

        let donut = Self::empty(name, provider, storage);
        for (node_name, disks) in node_disks {
            let node = Node::with_disks(
                node_name.as_str(),
                name,
                disks.iter().enumerate(),
                donut.provider.as_ref(),
            )
            .with_context(|| format!("attaching node {node_name} to domain {name}"))?;
            donut.insert_node(node)?;
        }

        let buckets = donut.discover_buckets(&donut.replicas())?;
        *donut.buckets.write() = buckets;
        donut.log_topology();
        Ok(donut)
    }

    /// Restart a domain from the configuration saved on one of its disks
    pub fn open(
        disk_path: &str,
        domain: &str,
        provider: Arc<dyn DiskProvider>,
        storage: StorageSettings,
    ) -> Result<Self> {
        validate_domain_name(domain)?;
        let disk = provider
            .open(disk_path)
            .with_context(|| format!("opening disk {disk_path}"))?;
        let config = DonutConfig::read(disk.as_ref(), domain)?;
        if config.name != domain {
            return Err(Error::invalid_argument(format!(
                "disk {disk_path} holds domain {} not {domain}",
                config.name
            )));
        }

        let donut = Self::empty(domain, provider, storage);
        let nodes = config.build_nodes(donut.provider.as_ref())?;
        let buckets = donut.discover_buckets(&replicas_of(&nodes))?;
        *donut.nodes.write() = nodes;
        *donut.buckets.write() = buckets;
        donut.log_topology();
        Ok(donut)
    }

    fn empty(name: &str, provider: Arc<dyn DiskProvider>, storage: StorageSettings) -> Self {
        Self {
            name: name.to_string(),
            nodes: RwLock::new(BTreeMap::new()),
            buckets: RwLock::new(BTreeMap::new()),
            provider,
            storage,
            locks: PathLocks::new(),
            config_lock: Mutex::new(()),
        }
    }

    /// Domain name; also the directory created on every disk
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.read().get(name).cloned()
    }

    #[must_use]
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.read().keys().cloned().collect()
    }

    /// Every attached disk, ordered by slot
    #[must_use]
    pub fn replicas(&self) -> Vec<Replica> {
        replicas_of(&self.nodes.read())
    }

    pub(crate) fn insert_node(&self, node: Node) -> Result<()> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(node.name()) {
            return Err(Error::NodeAlreadyExists(node.name().to_string()));
        }
        nodes.insert(node.name().to_string(), Arc::new(node));
        Ok(())
    }

    pub(crate) fn bucket(&self, bucket: &str) -> Result<Arc<Bucket>> {
        self.buckets
            .read()
            .get(bucket)
            .cloned()
            .ok_or_else(|| Error::BucketNotFound(bucket.to_string()))
    }

    pub(crate) fn bucket_handles(&self) -> Vec<Arc<Bucket>> {
        self.buckets.read().values().cloned().collect()
    }

    /// Object directory relative to a disk root
    pub(crate) fn object_dir(&self, bucket: &str, key: &ObjectKey) -> String {
        format!("{}/{}", Bucket::dir(&self.name, bucket), key.encoded())
    }

    pub(crate) fn object_view(&self, bucket: &str, key: &str, replica: &Replica) -> Result<Object> {
        Object::new(
            key,
            bucket,
            &Bucket::dir(&self.name, bucket),
            replica.disk.clone(),
        )
    }

    pub(crate) fn staging_path(&self) -> String {
        format!("{}/{STAGING_DIR}/{}", self.name, uuid::Uuid::new_v4())
    }

    /// Bucket records found on `replicas`, first readable record wins
    pub(crate) fn discover_buckets(
        &self,
        replicas: &[Replica],
    ) -> Result<BTreeMap<String, Arc<Bucket>>> {
        let mut found = BTreeMap::new();
        for replica in replicas {
            let entries = match replica.disk.list_dir(&self.name) {
                Ok(entries) => entries,
                Err(e) if e.is_missing_file() => continue,
                Err(e) => {
                    return Err(e.context(format!("listing buckets on {}", replica.slot)));
                }
            };
            for entry in entries {
                if found.contains_key(&entry) {
                    continue;
                }
                // Staging and config entries are not valid bucket names
                let Ok(name) = BucketName::new(entry.as_str()) else {
                    continue;
                };
                match Bucket::load(&self.name, name, replica.disk.as_ref()) {
                    Ok(bucket) => {
                        debug!("Found bucket {} on {}", entry, replica.slot);
                        found.insert(entry, Arc::new(bucket));
                    }
                    Err(e) if e.is_missing_file() => {}
                    Err(e) => warn!("Skipping bucket {} on {}: {}", entry, replica.slot, e),
                }
            }
        }
        Ok(found)
    }

    /// Union of object keys stored for `bucket` across all disks
    pub(crate) fn object_keys(&self, bucket: &str) -> Result<BTreeSet<String>> {
        let dir = Bucket::dir(&self.name, bucket);
        let mut keys = BTreeSet::new();
        for replica in self.replicas() {
            let entries = match replica.disk.list_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.is_missing_file() => continue,
                Err(e) => {
                    return Err(e.context(format!("listing {bucket} on {}", replica.slot)));
                }
            };
            keys.extend(
                entries
                    .iter()
                    .filter(|entry| entry.as_str() != files::BUCKET_METADATA)
                    .filter_map(|entry| ObjectKey::decode(entry))
                    .map(|key| key.to_string()),
            );
        }
        Ok(keys)
    }

    /// Donut object metadata of the first replica holding the object
    pub fn get_donut_object_metadata(&self, bucket: &str, object: &str) -> Result<Metadata> {
        self.bucket(bucket)?;
        self.first_replica(bucket, object, Object::get_donut_object_metadata)
    }

    /// Run `read` against each replica in slot order and return the first
    /// success; replicas without the object are skipped
    ///
    /// The object's path lock is held for the duration, so `read` never
    /// observes a commit halfway through. Handles opened by `read` stay
    /// valid after the lock is released.
    fn first_replica<T>(
        &self,
        bucket: &str,
        object: &str,
        read: impl Fn(&Object) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.locks.lock(format!("{bucket}/{object}"));
        let mut failure = None;
        for replica in self.replicas() {
            let view = self.object_view(bucket, object, &replica)?;
            match read(&view) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_object_not_found() => {}
                Err(e) => {
                    debug!("Replica {} of {}/{} unreadable: {}", replica.slot, bucket, object, e);
                    failure.get_or_insert(e);
                }
            }
        }
        Err(failure.unwrap_or_else(|| Error::object_not_found(bucket, object)))
    }

    /// Stream the payload to a staging directory on every replica and
    /// write both metadata records next to it
    #[allow(clippy::too_many_arguments)]
    fn stage_object(
        &self,
        bucket: &str,
        key: &ObjectKey,
        expected_md5: Option<&str>,
        reader: &mut dyn Read,
        user_metadata: &Metadata,
        replicas: &[Replica],
        staging: &str,
    ) -> Result<String> {
        let data_path = format!("{staging}/{}", files::OBJECT_DATA);
        let mut writers = replicas
            .iter()
            .map(|replica| {
                replica
                    .disk
                    .create_file(&data_path)
                    .with_context(|| format!("staging {bucket}/{key} on {}", replica.slot))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut md5 = Md5Calculator::new();
        let mut buf = vec![0u8; self.storage.buffer_size.max(1)];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from(e).context("reading object payload")),
            };
            md5.update(&buf[..n]);
            for (writer, replica) in writers.iter_mut().zip(replicas) {
                writer
                    .write_all(&buf[..n])
                    .with_context(|| format!("writing {bucket}/{key} to {}", replica.slot))?;
            }
        }
        for (writer, replica) in writers.iter_mut().zip(replicas) {
            writer
                .flush()
                .with_context(|| format!("flushing {bucket}/{key} on {}", replica.slot))?;
        }
        drop(writers);

        let size = md5.size();
        let actual = md5.finalize();
        if let Some(expected) = expected_md5
            && expected != actual
        {
            return Err(Error::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }

        let created = crate::timestamp();
        let slots: Vec<Slot> = replicas.iter().map(|r| r.slot.clone()).collect();
        let object_record = serde_json::to_vec_pretty(&object_metadata(
            bucket,
            key,
            size,
            &actual,
            &created,
            user_metadata,
        ))?;
        let donut_record = serde_json::to_vec_pretty(&donut_object_metadata(
            size,
            &actual,
            &created,
            &Slot::join(&slots),
        ))?;

        for replica in replicas {
            let disk = replica.disk.as_ref();
            disk.write_file_atomic(
                &format!("{staging}/{}", files::OBJECT_METADATA),
                &object_record,
            )
            .and_then(|()| {
                disk.write_file_atomic(
                    &format!("{staging}/{}", files::DONUT_OBJECT_METADATA),
                    &donut_record,
                )
            })
            .with_context(|| format!("staging metadata of {bucket}/{key} on {}", replica.slot))?;
        }

        Ok(actual)
    }

    /// Move a staged object directory into place, retiring any previous
    /// version of it
    pub(crate) fn install(&self, disk: &dyn Disk, staging: &str, target: &str) -> Result<()> {
        if !disk.exists(target) {
            return disk.rename(staging, target);
        }

        let retired = format!("{staging}-old");
        disk.rename(target, &retired)?;
        if let Err(e) = disk.rename(staging, target) {
            if let Err(restore) = disk.rename(&retired, target) {
                warn!("Failed to restore {} after aborted install: {}", target, restore);
            }
            return Err(e);
        }
        disk.remove_all(&retired)
    }

    /// Remove a staging directory, logging failures
    pub(crate) fn discard(&self, disk: &dyn Disk, staging: &str) {
        if let Err(e) = disk.remove_all(staging) {
            warn!("Failed to remove staging directory {}: {}", staging, e);
        }
    }

    fn log_topology(&self) {
        let nodes = self.nodes.read();
        info!(
            "Domain {} ready: {} nodes, {} disks, {} buckets",
            self.name,
            nodes.len(),
            nodes.values().map(|n| n.disk_count()).sum::<usize>(),
            self.buckets.read().len()
        );
        for node in nodes.values() {
            debug!("Node {:?}", node);
        }
    }
}

impl fmt::Debug for Donut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Donut")
            .field("name", &self.name)
            .field("nodes", &self.node_names())
            .field("buckets", &self.buckets.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ObjectStorage for Donut {
    fn get_bucket_metadata(&self, bucket: &str) -> Result<Metadata> {
        Ok(self.bucket(bucket)?.metadata())
    }

    fn set_bucket_metadata(&self, bucket: &str, metadata: &Metadata) -> Result<()> {
        let record = self.bucket(bucket)?;
        let _guard = self.locks.lock(bucket);
        let merged = record.merged(metadata)?;
        for replica in self.replicas() {
            Bucket::persist_metadata(&self.name, bucket, &merged, replica.disk.as_ref())
                .with_context(|| format!("updating bucket {bucket} on {}", replica.slot))?;
        }
        record.replace_metadata(merged);
        debug!("Updated metadata of bucket {}", bucket);
        Ok(())
    }

    fn list_buckets(&self) -> Result<BTreeMap<String, Metadata>> {
        Ok(self
            .buckets
            .read()
            .iter()
            .map(|(name, bucket)| (name.clone(), bucket.metadata()))
            .collect())
    }

    fn make_bucket(&self, bucket: &str, acl: &str) -> Result<()> {
        let name = BucketName::new(bucket)?;
        let acl: Acl = acl.parse()?;

        let _guard = self.locks.lock(bucket);
        if self.buckets.read().contains_key(bucket) {
            return Err(Error::BucketAlreadyExists(bucket.to_string()));
        }

        let record = Bucket::new(name, acl);
        for replica in self.replicas() {
            record
                .persist(&self.name, replica.disk.as_ref())
                .with_context(|| format!("creating bucket {bucket} on {}", replica.slot))?;
        }
        self.buckets
            .write()
            .insert(bucket.to_string(), Arc::new(record));

        info!("Created bucket {} ({})", bucket, acl);
        Ok(())
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        delimiter: &str,
        max_keys: usize,
    ) -> Result<ListObjectsResult> {
        self.bucket(bucket)?;
        let keys = self.object_keys(bucket)?;
        Ok(listing::paginate(&keys, prefix, marker, delimiter, max_keys))
    }

    fn get_object(&self, bucket: &str, object: &str) -> Result<(ObjectReader, u64)> {
        self.bucket(bucket)?;
        self.first_replica(bucket, object, |view| {
            let donut = view.get_donut_object_metadata()?;
            let (reader, stored) = view.open_data()?;
            let size = donut
                .get(SIZE_KEY)
                .and_then(|s| s.parse().ok())
                .unwrap_or(stored);
            Ok((reader, size))
        })
    }

    fn get_object_metadata(&self, bucket: &str, object: &str) -> Result<Metadata> {
        self.bucket(bucket)?;
        self.first_replica(bucket, object, Object::get_object_metadata)
    }

    fn put_object(
        &self,
        bucket: &str,
        object: &str,
        expected_md5: &str,
        reader: &mut dyn Read,
        metadata: &Metadata,
    ) -> Result<String> {
        self.bucket(bucket)?;
        let key = ObjectKey::new(object)?;
        let expected = normalize_md5(expected_md5)?;

        let _guard = self.locks.lock(format!("{bucket}/{object}"));
        let replicas = self.replicas();
        if replicas.is_empty() {
            return Err(Error::internal("no disks attached to domain"));
        }

        let staging = self.staging_path();
        let target = self.object_dir(bucket, &key);
        let result = self
            .stage_object(
                bucket,
                &key,
                expected.as_deref(),
                reader,
                metadata,
                &replicas,
                &staging,
            )
            .and_then(|md5| {
                for replica in &replicas {
                    self.install(replica.disk.as_ref(), &staging, &target)
                        .with_context(|| {
                            format!("committing {bucket}/{object} on {}", replica.slot)
                        })?;
                }
                Ok(md5)
            });

        match &result {
            Ok(md5) => debug!("Stored {}/{} ({}) on {} disks", bucket, object, md5, replicas.len()),
            Err(_) => {
                for replica in &replicas {
                    self.discard(replica.disk.as_ref(), &staging);
                }
            }
        }
        result
    }

    fn delete_object(&self, bucket: &str, object: &str) -> Result<()> {
        self.bucket(bucket)?;
        let key = ObjectKey::new(object)?;

        let _guard = self.locks.lock(format!("{bucket}/{object}"));
        let dir = self.object_dir(bucket, &key);
        let mut removed = false;
        for replica in self.replicas() {
            if replica.disk.exists(&dir) {
                replica
                    .disk
                    .remove_all(&dir)
                    .with_context(|| format!("removing {bucket}/{object} from {}", replica.slot))?;
                removed = true;
            }
        }
        if !removed {
            return Err(Error::object_not_found(bucket, object));
        }
        debug!("Deleted {}/{}", bucket, object);
        Ok(())
    }
}

/// Disks of `nodes` as replicas, ordered by slot
pub(crate) fn replicas_of(nodes: &BTreeMap<String, Arc<Node>>) -> Vec<Replica> {
    nodes
        .values()
        .flat_map(|node| {
            node.list_disks()
                .into_iter()
                .map(move |(order, disk)| Replica {
                    slot: Slot::new(node.name(), order),
                    disk,
                })
        })
        .collect()
}

fn validate_domain_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_argument("domain name cannot be empty"));
    }
    if name == "." || name == ".." || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(Error::invalid_argument(format!(
            "domain name {name:?} is not a valid directory name"
        )));
    }
    Ok(())
}

fn object_metadata(
    bucket: &str,
    key: &ObjectKey,
    size: u64,
    md5: &str,
    created: &str,
    user: &Metadata,
) -> Metadata {
    let mut metadata: Metadata = user
        .iter()
        .filter(|(k, _)| !SYSTEM_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let content_type = user
        .get("contentType")
        .filter(|v| !v.is_empty())
        .map_or(DEFAULT_CONTENT_TYPE, String::as_str);

    metadata.insert("version".into(), OBJECT_METADATA_VERSION.into());
    metadata.insert("bucket".into(), bucket.into());
    metadata.insert("object".into(), key.to_string());
    metadata.insert(SIZE_KEY.into(), size.to_string());
    metadata.insert(MD5_KEY.into(), md5.into());
    metadata.insert("contentType".into(), content_type.into());
    metadata.insert("created".into(), created.into());
    metadata
}

fn donut_object_metadata(size: u64, md5: &str, created: &str, replicas: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("version".into(), DONUT_OBJECT_METADATA_VERSION.into());
    metadata.insert("format".into(), MIRROR_FORMAT.into());
    metadata.insert(SIZE_KEY.into(), size.to_string());
    metadata.insert(MD5_KEY.into(), md5.into());
    metadata.insert("created".into(), created.into());
    metadata.insert(REPLICAS_KEY.into(), replicas.into());
    metadata
}
