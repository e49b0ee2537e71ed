//! Donut Core - storage domain coordinator
//!
//! This crate assembles disks into nodes and nodes into a named storage
//! domain, and serves a bucket/object namespace on top of it:
//! - [`Donut`]: the coordinator, implementing [`ObjectStorage`] and [`Management`]
//! - [`Node`]: an ordered registry of disks
//! - [`Bucket`] and [`Object`]: metadata records persisted as JSON on every disk
//! - heal and rebalance keep mirrored replicas consistent after failures
//!   and topology changes

pub mod bucket;
pub mod donut;
pub mod listing;
pub mod locks;
pub mod management;
pub mod node;
pub mod object;
pub mod repair;

pub use bucket::Bucket;
pub use donut::{Donut, ObjectStorage, Replica};
pub use listing::ListObjectsResult;
pub use locks::PathLocks;
pub use management::{DiskDescriptor, DonutConfig, Management};
pub use node::{Node, NodeConfig};
pub use object::Object;
pub use repair::{HealReport, RebalanceReport};

/// Creation timestamp stored in metadata records
pub(crate) fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::{Donut, ObjectStorage};
    use donut_common::{Metadata, Result};
    use donut_disk::{Disk, DiskProvider, LocalDiskProvider};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;

    /// `<root>/<node>-disk<i>` paths for each `(node, disk count)`
    pub fn node_map(root: &Path, layout: &[(&str, usize)]) -> BTreeMap<String, Vec<String>> {
        layout
            .iter()
            .map(|(node, count)| {
                let disks = (0..*count)
                    .map(|i| {
                        root.join(format!("{node}-disk{i}"))
                            .to_string_lossy()
                            .into_owned()
                    })
                    .collect();
                ((*node).to_string(), disks)
            })
            .collect()
    }

    pub fn domain(root: &Path, layout: &[(&str, usize)]) -> Donut {
        Donut::new("test", &node_map(root, layout)).unwrap()
    }

    pub fn put(donut: &Donut, bucket: &str, key: &str, payload: &[u8]) {
        donut
            .put_object(bucket, key, "", &mut &payload[..], &Metadata::new())
            .unwrap();
    }

    /// Local disks, except paths containing `failing` refuse to open
    pub struct FlakyProvider {
        failing: String,
        inner: LocalDiskProvider,
    }

    impl FlakyProvider {
        pub fn failing_on(failing: &str) -> Self {
            Self {
                failing: failing.to_string(),
                inner: LocalDiskProvider::default(),
            }
        }
    }

    impl DiskProvider for FlakyProvider {
        fn open(&self, path: &str) -> Result<Arc<dyn Disk>> {
            if path.contains(&self.failing) {
                return Err(std::io::Error::other(format!("disk {path} is offline")).into());
            }
            self.inner.open(path)
        }
    }
}
