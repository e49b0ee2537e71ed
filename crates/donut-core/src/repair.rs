//! Heal and rebalance
//!
//! Both walk the namespace one object at a time, holding only that
//! object's path lock. A replica is healthy when both metadata records
//! read back and its payload matches the recorded digest; among healthy
//! replicas the most recently written one is the source for repairs.

use crate::bucket::Bucket;
use crate::donut::{Donut, Replica};
use crate::object::{MD5_KEY, REPLICAS_KEY};
use donut_common::types::files;
use donut_common::{Metadata, ObjectKey, Result, ResultExt, Slot};
use serde::Serialize;
use std::io::Write;
use tracing::{debug, info, warn};

/// Outcome of a heal run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HealReport {
    pub buckets_scanned: usize,
    /// Bucket records recreated on disks that lacked them
    pub buckets_repaired: usize,
    pub objects_scanned: usize,
    /// Replicas rewritten from a healthy source
    pub replicas_repaired: usize,
    /// Objects without any healthy replica
    pub unrecoverable: usize,
    /// Objects that could not be processed, with the reason
    pub failures: Vec<String>,
}

/// Outcome of a rebalance run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RebalanceReport {
    pub buckets_repaired: usize,
    pub objects_scanned: usize,
    /// Replicas written to disks that lacked the object
    pub replicas_copied: usize,
    /// Objects whose replica list changed
    pub objects_updated: usize,
    pub unrecoverable: usize,
    pub failures: Vec<String>,
}

/// What one disk holds for an object
enum ReplicaState {
    Healthy(Metadata),
    Missing,
    Damaged,
}

impl ReplicaState {
    /// Healthy and identical to `source`
    fn matches(&self, source: &Metadata) -> bool {
        match self {
            Self::Healthy(metadata) => {
                metadata.get(MD5_KEY) == source.get(MD5_KEY)
                    && metadata.get("created") == source.get("created")
            }
            Self::Missing | Self::Damaged => false,
        }
    }
}

impl Donut {
    pub(crate) fn heal_domain(&self) -> Result<HealReport> {
        let mut report = HealReport::default();
        let replicas = self.replicas();

        for bucket in self.bucket_handles() {
            let name = bucket.name().as_str();
            report.buckets_scanned += 1;
            match self.restore_bucket(&bucket, &replicas) {
                Ok(restored) => report.buckets_repaired += restored,
                Err(e) => {
                    warn!("Heal failed for bucket {}: {}", name, e);
                    report.failures.push(format!("{name}: {e}"));
                    continue;
                }
            }

            let keys = match self.object_keys(name) {
                Ok(keys) => keys,
                Err(e) => {
                    warn!("Heal could not list bucket {}: {}", name, e);
                    report.failures.push(format!("{name}: {e}"));
                    continue;
                }
            };
            for key in keys {
                report.objects_scanned += 1;
                match self.heal_object(name, &key, &replicas) {
                    Ok(Some(repaired)) => report.replicas_repaired += repaired,
                    Ok(None) => {
                        warn!("No healthy replica of {}/{}", name, key);
                        report.unrecoverable += 1;
                    }
                    Err(e) => {
                        warn!("Heal failed for {}/{}: {}", name, key, e);
                        report.failures.push(format!("{name}/{key}: {e}"));
                    }
                }
            }
        }

        info!(
            "Heal of {} done: {} objects scanned, {} replicas repaired, {} unrecoverable",
            self.name(),
            report.objects_scanned,
            report.replicas_repaired,
            report.unrecoverable
        );
        Ok(report)
    }

    pub(crate) fn rebalance_domain(&self) -> Result<RebalanceReport> {
        let mut report = RebalanceReport::default();
        let replicas = self.replicas();
        let slots: Vec<Slot> = replicas.iter().map(|r| r.slot.clone()).collect();
        let target = Slot::join(&slots);

        for bucket in self.bucket_handles() {
            let name = bucket.name().as_str();
            match self.restore_bucket(&bucket, &replicas) {
                Ok(restored) => report.buckets_repaired += restored,
                Err(e) => {
                    warn!("Rebalance failed for bucket {}: {}", name, e);
                    report.failures.push(format!("{name}: {e}"));
                    continue;
                }
            }

            let keys = match self.object_keys(name) {
                Ok(keys) => keys,
                Err(e) => {
                    warn!("Rebalance could not list bucket {}: {}", name, e);
                    report.failures.push(format!("{name}: {e}"));
                    continue;
                }
            };
            for key in keys {
                report.objects_scanned += 1;
                match self.rebalance_object(name, &key, &replicas, &target) {
                    Ok(Some((copied, updated))) => {
                        report.replicas_copied += copied;
                        report.objects_updated += usize::from(updated);
                    }
                    Ok(None) => {
                        warn!("No healthy replica of {}/{}", name, key);
                        report.unrecoverable += 1;
                    }
                    Err(e) => {
                        warn!("Rebalance failed for {}/{}: {}", name, key, e);
                        report.failures.push(format!("{name}/{key}: {e}"));
                    }
                }
            }
        }

        info!(
            "Rebalance of {} done: {} objects scanned, {} replicas copied, {} objects updated",
            self.name(),
            report.objects_scanned,
            report.replicas_copied,
            report.objects_updated
        );
        Ok(report)
    }

    /// Write the bucket record to every disk missing it
    fn restore_bucket(&self, bucket: &Bucket, replicas: &[Replica]) -> Result<usize> {
        let name = bucket.name().as_str();
        let _guard = self.locks.lock(name);
        let record = Bucket::record_path(self.name(), name);
        let mut restored = 0;
        for replica in replicas {
            if replica.disk.exists(&record) {
                continue;
            }
            bucket
                .persist(self.name(), replica.disk.as_ref())
                .with_context(|| format!("restoring bucket {name} on {}", replica.slot))?;
            debug!("Restored bucket {} on {}", name, replica.slot);
            restored += 1;
        }
        Ok(restored)
    }

    /// Repair the listed replicas of one object; `None` when no healthy
    /// replica exists
    fn heal_object(&self, bucket: &str, key: &str, replicas: &[Replica]) -> Result<Option<usize>> {
        let _guard = self.locks.lock(format!("{bucket}/{key}"));
        let states = self.inspect(bucket, key, replicas)?;
        let Some((source, metadata)) = newest(replicas, &states) else {
            return Ok(None);
        };

        let listed = Slot::split(metadata.get(REPLICAS_KEY).map_or("", String::as_str))?;
        let mut repaired = 0;
        for (replica, state) in replicas.iter().zip(&states) {
            if !listed.contains(&replica.slot) || state.matches(metadata) {
                continue;
            }
            self.copy_replica(bucket, key, source, replica, None)?;
            debug!("Repaired {}/{} on {}", bucket, key, replica.slot);
            repaired += 1;
        }
        Ok(Some(repaired))
    }

    /// Place one object on every target slot and record the new replica
    /// list; returns copies made and whether the list changed
    fn rebalance_object(
        &self,
        bucket: &str,
        key: &str,
        replicas: &[Replica],
        target: &str,
    ) -> Result<Option<(usize, bool)>> {
        let _guard = self.locks.lock(format!("{bucket}/{key}"));
        let states = self.inspect(bucket, key, replicas)?;
        let Some((source, metadata)) = newest(replicas, &states) else {
            return Ok(None);
        };

        let changed = metadata.get(REPLICAS_KEY).map(String::as_str) != Some(target);
        let mut updated = metadata.clone();
        updated.insert(REPLICAS_KEY.to_string(), target.to_string());
        let record = serde_json::to_vec_pretty(&updated)?;
        let dir = self.object_dir(bucket, &ObjectKey::new(key)?);

        let mut copied = 0;
        for (replica, state) in replicas.iter().zip(&states) {
            if state.matches(metadata) {
                if changed {
                    replica
                        .disk
                        .write_file_atomic(
                            &format!("{dir}/{}", files::DONUT_OBJECT_METADATA),
                            &record,
                        )
                        .with_context(|| {
                            format!("updating replicas of {bucket}/{key} on {}", replica.slot)
                        })?;
                }
            } else {
                self.copy_replica(bucket, key, source, replica, Some(&updated))?;
                debug!("Copied {}/{} to {}", bucket, key, replica.slot);
                copied += 1;
            }
        }
        Ok(Some((copied, changed)))
    }

    fn inspect(&self, bucket: &str, key: &str, replicas: &[Replica]) -> Result<Vec<ReplicaState>> {
        let mut states = Vec::with_capacity(replicas.len());
        for replica in replicas {
            let view = self.object_view(bucket, key, replica)?;
            let state = match view.verify(self.storage.buffer_size) {
                Ok(true) => ReplicaState::Healthy(view.get_donut_object_metadata()?),
                Ok(false) => {
                    debug!("Replica {} of {}/{} fails checksum", replica.slot, bucket, key);
                    ReplicaState::Damaged
                }
                Err(e) if e.is_object_not_found() => ReplicaState::Missing,
                Err(e) => {
                    debug!("Replica {} of {}/{} unreadable: {}", replica.slot, bucket, key, e);
                    ReplicaState::Damaged
                }
            };
            states.push(state);
        }
        Ok(states)
    }

    /// Copy an object directory between disks through a staging area,
    /// optionally replacing the donut object metadata on the way
    fn copy_replica(
        &self,
        bucket: &str,
        key: &str,
        from: &Replica,
        to: &Replica,
        donut_metadata: Option<&Metadata>,
    ) -> Result<()> {
        let dir = self.object_dir(bucket, &ObjectKey::new(key)?);
        let staging = self.staging_path();
        let src = from.disk.as_ref();
        let dst = to.disk.as_ref();

        let result = (|| -> Result<()> {
            let (mut reader, _) = src.open_file(&format!("{dir}/{}", files::OBJECT_DATA))?;
            let mut writer = dst.create_file(&format!("{staging}/{}", files::OBJECT_DATA))?;
            std::io::copy(&mut reader, &mut writer)?;
            writer.flush()?;
            drop(writer);

            let object_record = src.read_file(&format!("{dir}/{}", files::OBJECT_METADATA))?;
            dst.write_file_atomic(
                &format!("{staging}/{}", files::OBJECT_METADATA),
                &object_record,
            )?;
            let donut_record = match donut_metadata {
                Some(metadata) => serde_json::to_vec_pretty(metadata)?,
                None => src.read_file(&format!("{dir}/{}", files::DONUT_OBJECT_METADATA))?,
            };
            dst.write_file_atomic(
                &format!("{staging}/{}", files::DONUT_OBJECT_METADATA),
                &donut_record,
            )?;
            self.install(dst, &staging, &dir)
        })();

        if result.is_err() {
            self.discard(dst, &staging);
        }
        result.with_context(|| {
            format!("copying {bucket}/{key} from {} to {}", from.slot, to.slot)
        })
    }
}

/// Most recently written healthy replica
fn newest<'a>(
    replicas: &'a [Replica],
    states: &'a [ReplicaState],
) -> Option<(&'a Replica, &'a Metadata)> {
    replicas
        .iter()
        .zip(states)
        .filter_map(|(replica, state)| match state {
            ReplicaState::Healthy(metadata) => Some((replica, metadata)),
            ReplicaState::Missing | ReplicaState::Damaged => None,
        })
        .max_by(|(_, a), (_, b)| a.get("created").cmp(&b.get("created")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::donut::ObjectStorage;
    use crate::management::Management;
    use crate::node::Node;
    use crate::test_support::{domain, node_map, put};
    use donut_disk::LocalDiskProvider;
    use std::io::Read;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    fn read_replica(donut: &Donut, replica: &Replica, bucket: &str, key: &str) -> Vec<u8> {
        let view = donut.object_view(bucket, key, replica).unwrap();
        let (mut reader, _) = view.open_data().unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        data
    }

    #[test]
    fn test_heal_restores_deleted_replica() {
        let dir = tempdir().unwrap();
        let donut = domain(dir.path(), &[("node1", 2), ("node2", 1)]);
        donut.make_bucket("docs", "").unwrap();
        put(&donut, "docs", "a/b", b"precious");
        put(&donut, "docs", "c", b"other");

        let replicas = donut.replicas();
        replicas[1].disk.remove_all("test/docs/a%2Fb").unwrap();

        let report = donut.heal().unwrap();
        assert_eq!(report.objects_scanned, 2);
        assert_eq!(report.replicas_repaired, 1);
        assert_eq!(report.unrecoverable, 0);
        assert!(report.failures.is_empty());
        assert_eq!(read_replica(&donut, &replicas[1], "docs", "a/b"), b"precious");

        let again = donut.heal().unwrap();
        assert_eq!(again.replicas_repaired, 0);
        assert_eq!(again.buckets_repaired, 0);
    }

    #[test]
    fn test_heal_repairs_corruption_and_bucket_records() {
        let dir = tempdir().unwrap();
        let donut = domain(dir.path(), &[("node1", 3)]);
        donut.make_bucket("docs", "").unwrap();
        put(&donut, "docs", "a", b"original");

        let replicas = donut.replicas();
        replicas[0]
            .disk
            .write_file_atomic("test/docs/a/data", b"bitrot!!")
            .unwrap();
        replicas[2]
            .disk
            .write_file_atomic("test/docs/a/objectMetadata.json", b"garbage")
            .unwrap();
        replicas[1]
            .disk
            .remove_all("test/docs/bucketMetadata.json")
            .unwrap();

        let report = donut.heal().unwrap();
        assert_eq!(report.buckets_repaired, 1);
        assert_eq!(report.replicas_repaired, 2);
        for replica in &replicas {
            assert_eq!(read_replica(&donut, replica, "docs", "a"), b"original");
        }
        assert!(replicas[1].disk.exists("test/docs/bucketMetadata.json"));
    }

    #[test]
    fn test_heal_counts_unrecoverable() {
        let dir = tempdir().unwrap();
        let donut = domain(dir.path(), &[("node1", 2)]);
        donut.make_bucket("docs", "").unwrap();
        put(&donut, "docs", "a", b"payload");

        for replica in donut.replicas() {
            replica
                .disk
                .write_file_atomic("test/docs/a/data", b"damaged")
                .unwrap();
        }

        let report = donut.heal().unwrap();
        assert_eq!(report.unrecoverable, 1);
        assert_eq!(report.replicas_repaired, 0);
    }

    #[test]
    fn test_heal_skips_detached_slots() {
        let dir = tempdir().unwrap();
        let donut = domain(dir.path(), &[("node1", 1), ("node2", 1)]);
        donut.make_bucket("docs", "").unwrap();
        put(&donut, "docs", "a", b"payload");

        donut.detach_node("node2").unwrap();
        let report = donut.heal().unwrap();
        assert_eq!(report.replicas_repaired, 0);
        assert_eq!(report.unrecoverable, 0);
    }

    #[test]
    fn test_rebalance_after_attach_node() {
        let dir = tempdir().unwrap();
        let donut = domain(dir.path(), &[("node1", 1)]);
        donut.make_bucket("docs", "").unwrap();
        put(&donut, "docs", "a", b"one");
        put(&donut, "docs", "b", b"two");

        let paths = node_map(dir.path(), &[("node2", 2)]).remove("node2").unwrap();
        let node = Node::with_disks(
            "node2",
            "test",
            paths.iter().enumerate(),
            &LocalDiskProvider::default(),
        )
        .unwrap();
        donut.attach_node(node).unwrap();

        let report = donut.rebalance().unwrap();
        assert_eq!(report.objects_scanned, 2);
        assert_eq!(report.replicas_copied, 4);
        assert_eq!(report.objects_updated, 2);
        assert_eq!(report.buckets_repaired, 2);

        let replicas = donut.replicas();
        for replica in &replicas {
            assert_eq!(read_replica(&donut, replica, "docs", "b"), b"two");
            let view = donut.object_view("docs", "a", replica).unwrap();
            assert_eq!(
                view.get_donut_object_metadata().unwrap()["replicas"],
                "node1:0,node2:0,node2:1"
            );
        }

        let again = donut.rebalance().unwrap();
        assert_eq!(again.replicas_copied, 0);
        assert_eq!(again.objects_updated, 0);

        // Heal now treats the new disks as listed replicas
        replicas[2].disk.remove_all("test/docs/a").unwrap();
        assert_eq!(donut.heal().unwrap().replicas_repaired, 1);
    }

    #[test]
    fn test_rebalance_drops_detached_slots() {
        let dir = tempdir().unwrap();
        let donut = domain(dir.path(), &[("node1", 1), ("node2", 1)]);
        donut.make_bucket("docs", "").unwrap();
        put(&donut, "docs", "a", b"payload");

        donut.detach_node("node2").unwrap();
        let report = donut.rebalance().unwrap();
        assert_eq!(report.replicas_copied, 0);
        assert_eq!(report.objects_updated, 1);
        assert_eq!(
            donut.get_donut_object_metadata("docs", "a").unwrap()["replicas"],
            "node1:0"
        );
        // Data on the detached disk is left in place
        assert!(dir.path().join("node2-disk0/test/docs/a/data").is_file());
    }

    #[test]
    fn test_repair_runs_alongside_traffic() {
        let dir = tempdir().unwrap();
        let donut = domain(dir.path(), &[("node1", 2), ("node2", 1)]);
        donut.make_bucket("docs", "").unwrap();
        let payloads: Vec<Vec<u8>> = (0..4)
            .map(|i| format!("version {i} ").repeat(50 * (i + 1)).into_bytes())
            .collect();
        let keys = ["shared/a", "shared/b"];
        for key in keys {
            put(&donut, "docs", key, &payloads[0]);
        }

        let done = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                for round in 0..60 {
                    for key in keys {
                        put(&donut, "docs", key, &payloads[round % payloads.len()]);
                    }
                }
                done.store(true, Ordering::SeqCst);
            });
            s.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    for key in keys {
                        let (mut reader, size) = donut.get_object("docs", key).unwrap();
                        let mut data = Vec::new();
                        reader.read_to_end(&mut data).unwrap();
                        assert_eq!(data.len() as u64, size);
                        assert!(payloads.contains(&data));
                    }
                }
            });
            s.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    assert!(donut.heal().unwrap().failures.is_empty());
                    assert!(donut.rebalance().unwrap().failures.is_empty());
                }
            });
        });

        assert_eq!(donut.heal().unwrap().replicas_repaired, 0);
        assert_eq!(donut.locks.held(), 0);
        for key in keys {
            let md5 = donut.get_donut_object_metadata("docs", key).unwrap()["md5"].clone();
            for replica in donut.replicas() {
                let view = donut.object_view("docs", key, &replica).unwrap();
                assert!(view.verify(4096).unwrap());
                assert_eq!(view.get_donut_object_metadata().unwrap()["md5"], md5);
            }
        }
    }
}
