//! Topology management and configuration records

use crate::donut::{Donut, replicas_of};
use crate::node::Node;
use crate::repair::{HealReport, RebalanceReport};
use donut_common::types::{CONFIG_VERSION, files};
use donut_common::{Error, Result, ResultExt};
use donut_disk::{Disk, DiskProvider, DiskStatsSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Topology and maintenance operations
pub trait Management {
    /// Repair missing or damaged replicas
    fn heal(&self) -> Result<HealReport>;

    /// Spread every object over all attached disks
    fn rebalance(&self) -> Result<RebalanceReport>;

    /// Disks of every node, ascending by order
    fn info(&self) -> Result<BTreeMap<String, Vec<DiskDescriptor>>>;

    /// Add a node with at least one disk
    fn attach_node(&self, node: Node) -> Result<()>;

    /// Remove a node; the domain always keeps one
    fn detach_node(&self, name: &str) -> Result<Arc<Node>>;

    /// Persist the topology on every disk
    fn save_config(&self) -> Result<()>;

    /// Replace the topology with the one persisted on disk
    fn load_config(&self) -> Result<()>;
}

/// One disk as reported by [`Management::info`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DiskDescriptor {
    pub order: usize,
    pub path: String,
    pub stats: DiskStatsSnapshot,
}

/// Persisted coordinator record (`donutMetadata.json`)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonutConfig {
    pub version: String,
    pub name: String,
    /// Node name to disk order to disk path
    pub nodes: BTreeMap<String, BTreeMap<usize, String>>,
}

impl DonutConfig {
    /// Read the record of `domain` from one disk
    pub fn read(disk: &dyn Disk, domain: &str) -> Result<Self> {
        let rel = format!("{domain}/{}", files::DONUT_CONFIG);
        let bytes = disk
            .read_file(&rel)
            .with_context(|| format!("reading {rel} from {}", disk.path().display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {rel}"))
    }

    /// Open every recorded disk at its recorded order
    pub fn build_nodes(&self, provider: &dyn DiskProvider) -> Result<BTreeMap<String, Arc<Node>>> {
        if self.nodes.is_empty() {
            return Err(Error::Configuration(format!(
                "domain {} record lists no nodes",
                self.name
            )));
        }
        let mut nodes = BTreeMap::new();
        for (name, disks) in &self.nodes {
            if disks.is_empty() {
                return Err(Error::InvalidDisksArgument { node: name.clone() });
            }
            let node = Node::with_disks(
                name.as_str(),
                &self.name,
                disks.iter().map(|(order, path)| (*order, path)),
                provider,
            )
            .with_context(|| format!("restoring node {name}"))?;
            nodes.insert(name.clone(), Arc::new(node));
        }
        Ok(nodes)
    }
}

impl Donut {
    /// Current topology as a persistable record
    #[must_use]
    pub fn config(&self) -> DonutConfig {
        DonutConfig {
            version: CONFIG_VERSION.to_string(),
            name: self.name().to_string(),
            nodes: self
                .nodes
                .read()
                .iter()
                .map(|(name, node)| (name.clone(), node.config().disks))
                .collect(),
        }
    }

    fn read_config(&self) -> Result<DonutConfig> {
        let mut failure = None;
        for replica in self.replicas() {
            match DonutConfig::read(replica.disk.as_ref(), self.name()) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    debug!("Domain record unreadable on {}: {}", replica.slot, e);
                    failure.get_or_insert(e);
                }
            }
        }
        Err(failure.unwrap_or_else(|| Error::internal("no disks attached to domain")))
    }
}

impl Management for Donut {
    fn heal(&self) -> Result<HealReport> {
        self.heal_domain()
    }

    fn rebalance(&self) -> Result<RebalanceReport> {
        self.rebalance_domain()
    }

    fn info(&self) -> Result<BTreeMap<String, Vec<DiskDescriptor>>> {
        let nodes: Vec<Arc<Node>> = self.nodes.read().values().cloned().collect();
        Ok(nodes
            .iter()
            .map(|node| {
                let disks = node
                    .list_disks()
                    .into_iter()
                    .map(|(order, disk)| DiskDescriptor {
                        order,
                        path: disk.path().to_string_lossy().into_owned(),
                        stats: disk.stats(),
                    })
                    .collect();
                (node.name().to_string(), disks)
            })
            .collect())
    }

    fn attach_node(&self, node: Node) -> Result<()> {
        if self.nodes.read().contains_key(node.name()) {
            return Err(Error::NodeAlreadyExists(node.name().to_string()));
        }
        if node.disk_count() == 0 {
            return Err(Error::InvalidDisksArgument {
                node: node.name().to_string(),
            });
        }
        for (order, disk) in node.list_disks() {
            disk.make_dir(self.name()).with_context(|| {
                format!("creating domain directory on {}:{order}", node.name())
            })?;
        }

        let name = node.name().to_string();
        let disks = node.disk_count();
        self.insert_node(node)?;
        info!("Attached node {} with {} disks to {}", name, disks, self.name());
        Ok(())
    }

    fn detach_node(&self, name: &str) -> Result<Arc<Node>> {
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(name) {
            return Err(Error::NodeNotFound(name.to_string()));
        }
        if nodes.len() == 1 {
            return Err(Error::invalid_argument(format!(
                "cannot detach {name}: it is the last node of {}",
                self.name()
            )));
        }
        let node = nodes
            .remove(name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;
        drop(nodes);

        info!("Detached node {} from {}", name, self.name());
        Ok(node)
    }

    fn save_config(&self) -> Result<()> {
        let _guard = self.config_lock.lock();
        let config = self.config();
        let record = serde_json::to_vec_pretty(&config)?;
        let rel = format!("{}/{}", self.name(), files::DONUT_CONFIG);

        for replica in self.replicas() {
            replica
                .disk
                .write_file_atomic(&rel, &record)
                .with_context(|| format!("saving domain record to {}", replica.slot))?;
        }
        let nodes: Vec<Arc<Node>> = self.nodes.read().values().cloned().collect();
        for node in nodes {
            node.save_config(self.name())?;
        }

        info!(
            "Saved configuration of {} ({} nodes)",
            self.name(),
            config.nodes.len()
        );
        Ok(())
    }

    fn load_config(&self) -> Result<()> {
        let _guard = self.config_lock.lock();
        let config = self.read_config()?;
        if config.name != self.name() {
            return Err(Error::invalid_argument(format!(
                "domain record names {} but this domain is {}",
                config.name,
                self.name()
            )));
        }

        let nodes = config.build_nodes(self.provider.as_ref())?;
        let buckets = self.discover_buckets(&replicas_of(&nodes))?;
        *self.nodes.write() = nodes;
        *self.buckets.write() = buckets;

        info!(
            "Loaded configuration of {} ({} nodes)",
            self.name(),
            config.nodes.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::donut::ObjectStorage;
    use crate::test_support::{domain, node_map, put};
    use donut_common::config::StorageSettings;
    use donut_disk::LocalDiskProvider;
    use tempfile::tempdir;

    fn orders(info: &BTreeMap<String, Vec<DiskDescriptor>>, node: &str) -> Vec<usize> {
        info[node].iter().map(|d| d.order).collect()
    }

    #[test]
    fn test_info_reports_declared_topology() {
        let dir = tempdir().unwrap();
        let map = node_map(dir.path(), &[("node1", 3), ("node2", 1)]);
        let donut = Donut::new("test", &map).unwrap();

        let info = donut.info().unwrap();
        assert_eq!(info.len(), 2);
        assert_eq!(orders(&info, "node1"), vec![0, 1, 2]);
        assert_eq!(orders(&info, "node2"), vec![0]);
        for (node, paths) in &map {
            let reported: Vec<_> = info[node].iter().map(|d| d.path.clone()).collect();
            assert_eq!(&reported, paths);
        }
    }

    #[test]
    fn test_attach_node() {
        let dir = tempdir().unwrap();
        let donut = domain(dir.path(), &[("node1", 1)]);
        let provider = LocalDiskProvider::default();

        let paths = node_map(dir.path(), &[("node2", 2)]).remove("node2").unwrap();
        let node = Node::with_disks("node2", "elsewhere", paths.iter().enumerate(), &provider)
            .unwrap();
        donut.attach_node(node).unwrap();
        assert!(dir.path().join("node2-disk1/test").is_dir());
        assert_eq!(orders(&donut.info().unwrap(), "node2"), vec![0, 1]);

        let duplicate = Node::with_disks("node2", "test", paths.iter().enumerate(), &provider)
            .unwrap();
        assert!(matches!(
            donut.attach_node(duplicate),
            Err(Error::NodeAlreadyExists(_))
        ));
        assert!(matches!(
            donut.attach_node(Node::new("node3").unwrap()),
            Err(Error::InvalidDisksArgument { .. })
        ));
    }

    #[test]
    fn test_detach_node() {
        let dir = tempdir().unwrap();
        let donut = domain(dir.path(), &[("node1", 1), ("node2", 1)]);

        assert!(matches!(
            donut.detach_node("node9"),
            Err(Error::NodeNotFound(_))
        ));
        let detached = donut.detach_node("node2").unwrap();
        assert_eq!(detached.name(), "node2");
        assert!(matches!(
            donut.detach_node("node1"),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(donut.node_names(), vec!["node1"]);
    }

    #[test]
    fn test_save_config_then_open() {
        let dir = tempdir().unwrap();
        let donut = domain(dir.path(), &[("node1", 2), ("node2", 2)]);
        donut.make_bucket("docs", "").unwrap();
        put(&donut, "docs", "a", b"payload");
        donut.save_config().unwrap();

        let disk = dir.path().join("node2-disk1");
        let reopened = Donut::open(
            disk.to_str().unwrap(),
            "test",
            Arc::new(LocalDiskProvider::default()),
            StorageSettings::default(),
        )
        .unwrap();

        let strip = |info: BTreeMap<String, Vec<DiskDescriptor>>| {
            info.into_iter()
                .map(|(node, disks)| {
                    let disks: Vec<_> = disks.into_iter().map(|d| (d.order, d.path)).collect();
                    (node, disks)
                })
                .collect::<BTreeMap<_, _>>()
        };
        assert_eq!(strip(reopened.info().unwrap()), strip(donut.info().unwrap()));
        assert_eq!(reopened.config(), donut.config());
        assert!(reopened.list_buckets().unwrap().contains_key("docs"));
        assert_eq!(
            reopened.get_object_metadata("docs", "a").unwrap()["md5"],
            donut.get_object_metadata("docs", "a").unwrap()["md5"]
        );

        let record = reopened.node("node1").unwrap().config();
        assert_eq!(record.disks.len(), 2);
        assert!(dir.path().join("node1-disk0/test/nodeMetadata.json").is_file());
    }

    #[test]
    fn test_open_rejects_other_domain() {
        let dir = tempdir().unwrap();
        let donut = domain(dir.path(), &[("node1", 1)]);
        donut.save_config().unwrap();

        let disk = dir.path().join("node1-disk0");
        let err = Donut::open(
            disk.to_str().unwrap(),
            "other",
            Arc::new(LocalDiskProvider::default()),
            StorageSettings::default(),
        )
        .unwrap_err();
        assert!(err.is_missing_file());
    }

    #[test]
    fn test_load_config_restores_saved_topology() {
        let dir = tempdir().unwrap();
        let donut = domain(dir.path(), &[("node1", 1), ("node2", 1)]);
        donut.save_config().unwrap();
        let saved = donut.config();

        donut.detach_node("node2").unwrap();
        donut.node("node1").unwrap().detach_disk(0).unwrap();
        assert!(donut.load_config().is_err());

        let donut = domain(dir.path(), &[("node1", 1)]);
        donut.load_config().unwrap();
        assert_eq!(donut.config(), saved);
        assert_eq!(donut.node_names(), vec!["node1", "node2"]);
    }

    #[test]
    fn test_load_config_rejects_foreign_record() {
        let dir = tempdir().unwrap();
        let donut = domain(dir.path(), &[("node1", 1)]);
        let foreign = DonutConfig {
            version: CONFIG_VERSION.to_string(),
            name: "other".to_string(),
            nodes: BTreeMap::new(),
        };
        donut.replicas()[0]
            .disk
            .write_file_atomic(
                "test/donutMetadata.json",
                &serde_json::to_vec(&foreign).unwrap(),
            )
            .unwrap();

        assert!(matches!(
            donut.load_config(),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(donut.node_names(), vec!["node1"]);
    }
}
