//! Storage node: an ordered registry of disks
//!
//! Disk orders are the positions the operator declared for a node and
//! are kept verbatim across save and reload.

use donut_common::types::{CONFIG_VERSION, files};
use donut_common::{Error, Result, ResultExt};
use donut_disk::{Disk, DiskProvider};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Persisted node record (`nodeMetadata.json`)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub version: String,
    pub name: String,
    /// Disk order to disk path
    pub disks: BTreeMap<usize, String>,
}

/// A storage node owning an ordered set of disks
pub struct Node {
    name: String,
    disks: RwLock<BTreeMap<usize, Arc<dyn Disk>>>,
}

impl Node {
    /// Create a node without disks
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::invalid_argument("node name cannot be empty"));
        }
        // Replica lists are comma separated
        if name.contains(',') {
            return Err(Error::invalid_argument(format!(
                "node name {name:?} cannot contain ','"
            )));
        }
        Ok(Self {
            name,
            disks: RwLock::new(BTreeMap::new()),
        })
    }

    /// Open each `(order, path)` through the provider, create the domain
    /// directory on it and attach it at that order
    pub fn with_disks<I, P>(
        name: impl Into<String>,
        domain: &str,
        disks: I,
        provider: &dyn DiskProvider,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, P)>,
        P: AsRef<str>,
    {
        let node = Self::new(name)?;
        for (order, path) in disks {
            let path = path.as_ref();
            let disk = provider
                .open(path)
                .with_context(|| format!("opening disk {path} for node {}", node.name))?;
            disk.make_dir(domain)
                .with_context(|| format!("creating domain directory {domain} on {path}"))?;
            node.attach_disk(disk, order)?;
        }
        Ok(node)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the disk registry
    #[must_use]
    pub fn list_disks(&self) -> BTreeMap<usize, Arc<dyn Disk>> {
        self.disks.read().clone()
    }

    /// Disk at `order`, if attached
    #[must_use]
    pub fn disk(&self, order: usize) -> Option<Arc<dyn Disk>> {
        self.disks.read().get(&order).cloned()
    }

    #[must_use]
    pub fn disk_count(&self) -> usize {
        self.disks.read().len()
    }

    /// Attach a disk at an unoccupied order
    pub fn attach_disk(&self, disk: Arc<dyn Disk>, order: usize) -> Result<()> {
        let mut disks = self.disks.write();
        if disks.contains_key(&order) {
            return Err(Error::DiskOrderOccupied {
                node: self.name.clone(),
                order,
            });
        }
        debug!(
            "Attached disk {} to node {} at order {}",
            disk.path().display(),
            self.name,
            order
        );
        disks.insert(order, disk);
        Ok(())
    }

    /// Detach and return the disk at `order`
    pub fn detach_disk(&self, order: usize) -> Result<Arc<dyn Disk>> {
        let disk = self
            .disks
            .write()
            .remove(&order)
            .ok_or_else(|| Error::DiskNotFound {
                node: self.name.clone(),
                order,
            })?;
        debug!("Detached disk at order {} from node {}", order, self.name);
        Ok(disk)
    }

    /// Current registry as a persistable record
    #[must_use]
    pub fn config(&self) -> NodeConfig {
        NodeConfig {
            version: CONFIG_VERSION.to_string(),
            name: self.name.clone(),
            disks: self
                .disks
                .read()
                .iter()
                .map(|(order, disk)| (*order, disk.path().to_string_lossy().into_owned()))
                .collect(),
        }
    }

    /// Write `nodeMetadata.json` into the domain directory of every disk
    pub fn save_config(&self, domain: &str) -> Result<()> {
        let record = serde_json::to_vec_pretty(&self.config())?;
        let rel = format!("{domain}/{}", files::NODE_CONFIG);
        for (order, disk) in self.list_disks() {
            disk.write_file_atomic(&rel, &record)
                .with_context(|| format!("saving node {} config to disk {order}", self.name))?;
        }
        Ok(())
    }

    /// Reload the disk registry from the first readable node record
    ///
    /// Disks are reopened at their recorded paths and orders. The
    /// registry is replaced only once every disk has been opened.
    pub fn load_config(&self, domain: &str, provider: &dyn DiskProvider) -> Result<()> {
        let record = self.read_config(domain)?;
        if record.name != self.name {
            return Err(Error::invalid_argument(format!(
                "node record names {} but this node is {}",
                record.name, self.name
            )));
        }

        let reloaded = Self::with_disks(record.name, domain, record.disks, provider)?;
        let disks = reloaded.disks.into_inner();
        info!("Loaded node {} with {} disks", self.name, disks.len());
        *self.disks.write() = disks;
        Ok(())
    }

    fn read_config(&self, domain: &str) -> Result<NodeConfig> {
        let rel = format!("{domain}/{}", files::NODE_CONFIG);
        let mut last_error = None;
        for (order, disk) in self.list_disks() {
            match disk.read_file(&rel) {
                Ok(bytes) => {
                    return serde_json::from_slice(&bytes)
                        .with_context(|| format!("parsing node {} config", self.name));
                }
                Err(e) => {
                    debug!("Node {} config unreadable on disk {}: {}", self.name, order, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| Error::DiskNotFound {
                node: self.name.clone(),
                order: 0,
            })
            .context(format!("loading node {} config", self.name)))
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("disks", &self.config().disks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use donut_disk::LocalDiskProvider;
    use tempfile::tempdir;

    fn disk_paths(root: &std::path::Path, count: usize) -> Vec<String> {
        (0..count)
            .map(|i| root.join(format!("disk{i}")).to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_node_requires_name() {
        assert!(matches!(Node::new(""), Err(Error::InvalidArgument(_))));
        assert_eq!(Node::new("node1").unwrap().name(), "node1");
    }

    #[test]
    fn test_attach_and_detach_disks() {
        let dir = tempdir().unwrap();
        let provider = LocalDiskProvider::default();
        let paths = disk_paths(dir.path(), 2);
        let node = Node::with_disks("node1", "donut", paths.iter().cloned().enumerate(), &provider)
            .unwrap();

        assert_eq!(node.disk_count(), 2);
        assert!(dir.path().join("disk1/donut").is_dir());

        let extra = provider.open(&disk_paths(dir.path(), 3)[2]).unwrap();
        let err = node.attach_disk(extra.clone(), 1).unwrap_err();
        assert!(matches!(err, Error::DiskOrderOccupied { order: 1, .. }));
        node.attach_disk(extra, 7).unwrap();

        let orders: Vec<_> = node.list_disks().keys().copied().collect();
        assert_eq!(orders, vec![0, 1, 7]);

        node.detach_disk(0).unwrap();
        assert!(matches!(
            node.detach_disk(0),
            Err(Error::DiskNotFound { order: 0, .. })
        ));
        assert_eq!(node.disk_count(), 2);
    }

    #[test]
    fn test_save_and_load_config_keeps_orders() {
        let dir = tempdir().unwrap();
        let provider = LocalDiskProvider::default();
        let paths = disk_paths(dir.path(), 3);
        let node = Node::with_disks(
            "node1",
            "donut",
            [(0, &paths[0]), (4, &paths[1]), (9, &paths[2])],
            &provider,
        )
        .unwrap();
        node.save_config("donut").unwrap();

        let saved = node.config();
        node.detach_disk(4).unwrap();
        node.detach_disk(9).unwrap();
        node.load_config("donut", &provider).unwrap();

        assert_eq!(node.config(), saved);
        assert_eq!(
            node.disk(4).unwrap().path(),
            std::path::Path::new(&paths[1])
        );
    }

    #[test]
    fn test_load_config_without_record() {
        let dir = tempdir().unwrap();
        let provider = LocalDiskProvider::default();
        let paths = disk_paths(dir.path(), 1);
        let node =
            Node::with_disks("node1", "donut", [(0, &paths[0])], &provider).unwrap();

        let err = node.load_config("donut", &provider).unwrap_err();
        assert!(err.is_missing_file());
        assert_eq!(node.disk_count(), 1);
    }
}
