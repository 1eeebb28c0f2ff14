//! Immutable cluster snapshot used for all routing decisions.
//!
//! A [`ClusterMap`] is built once by the configuration refresher and never
//! mutated afterwards. The network layer swaps whole snapshots atomically;
//! every dispatch reads exactly one consistent snapshot.

use crate::error::{TopologyError, TopologyResult};
use crate::node::NodeInfo;
use crate::service::ServiceType;

/// Sentinel used in partition entries when no node holds the role,
/// e.g. a master slot mid-rebalance.
pub const NO_NODE: i32 = -1;

/// One partition's placement: a master slot plus zero or more replicas.
///
/// Indices refer into the owning [`ClusterMap`]'s node list. A value of
/// [`NO_NODE`] means the slot is vacant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub master: i32,
    pub replicas: Vec<i32>,
}

impl Partition {
    /// Whether a master is currently assigned.
    pub fn has_master(&self) -> bool {
        self.master >= 0
    }

    /// Node index of the given replica slot, if assigned.
    pub fn replica(&self, index: usize) -> Option<i32> {
        self.replicas.get(index).copied().filter(|&i| i >= 0)
    }
}

/// Ordered partition table. Keys map to partitions by `hash(key) % len`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionMap {
    partitions: Vec<Partition>,
}

impl PartitionMap {
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self { partitions }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn get(&self, index: usize) -> Option<&Partition> {
        self.partitions.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter()
    }
}

/// Immutable snapshot of one bucket's cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMap {
    revision: u64,
    bucket: String,
    nodes: Vec<NodeInfo>,
    partitions: Option<PartitionMap>,
}

impl ClusterMap {
    /// Build a snapshot. Callers normally go through [`crate::parse_payload`];
    /// this constructor exists for tests and synthetic topologies.
    pub fn new(
        revision: u64,
        bucket: impl Into<String>,
        nodes: Vec<NodeInfo>,
        partitions: Option<PartitionMap>,
    ) -> Self {
        Self {
            revision,
            bucket: bucket.into(),
            nodes,
            partitions,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn node_at(&self, index: usize) -> Option<&NodeInfo> {
        self.nodes.get(index)
    }

    /// The partition table, if this bucket is partitioned.
    pub fn partition_map(&self) -> Option<&PartitionMap> {
        self.partitions.as_ref()
    }

    pub fn has_partitions(&self) -> bool {
        self.partitions.is_some()
    }

    /// Nodes exposing the given service, with their plain ports.
    pub fn nodes_for_service(
        &self,
        service: ServiceType,
    ) -> impl Iterator<Item = (usize, &NodeInfo, u16)> {
        self.nodes.iter().enumerate().filter_map(move |(i, n)| {
            n.port_for(service, false).map(|port| (i, n, port))
        })
    }

    /// Whether `other` carries a strictly newer configuration.
    pub fn is_newer_than(&self, other: &ClusterMap) -> bool {
        self.revision > other.revision
    }

    /// Structural invariants: a partition table, when present, is non-empty,
    /// and every partition index (master or replica) that is assigned must
    /// reference an existing node.
    pub fn validate(&self) -> TopologyResult<()> {
        let node_count = self.nodes.len();
        if let Some(map) = &self.partitions {
            if map.partition_count() == 0 {
                return Err(TopologyError::malformed("partition table is empty"));
            }
            for (pidx, partition) in map.iter().enumerate() {
                let check = |index: i32| -> TopologyResult<()> {
                    if index >= 0 && index as usize >= node_count {
                        return Err(TopologyError::InvalidReference {
                            partition: pidx,
                            index,
                            nodes: node_count,
                        });
                    }
                    Ok(())
                };
                check(partition.master)?;
                for &replica in &partition.replicas {
                    check(replica)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(host: &str) -> NodeInfo {
        let mut n = NodeInfo::new(host);
        n.services.insert(ServiceType::KeyValue, 11210);
        n
    }

    #[test]
    fn validate_accepts_in_range_references() {
        let map = ClusterMap::new(
            1,
            "default",
            vec![node("a"), node("b")],
            Some(PartitionMap::new(vec![
                Partition { master: 0, replicas: vec![1] },
                Partition { master: 1, replicas: vec![NO_NODE] },
            ])),
        );
        assert!(map.validate().is_ok());
    }

    #[test]
    fn newer_is_strictly_by_revision() {
        let old = ClusterMap::new(4, "default", vec![node("a")], None);
        let same = ClusterMap::new(4, "default", vec![node("a")], None);
        let new = ClusterMap::new(5, "default", vec![node("a")], None);
        assert!(new.is_newer_than(&old));
        assert!(!same.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));
    }

    #[test]
    fn validate_rejects_out_of_range_master() {
        let map = ClusterMap::new(
            1,
            "default",
            vec![node("a")],
            Some(PartitionMap::new(vec![Partition {
                master: 3,
                replicas: vec![],
            }])),
        );
        assert_eq!(
            map.validate(),
            Err(TopologyError::InvalidReference {
                partition: 0,
                index: 3,
                nodes: 1,
            })
        );
    }

    #[test]
    fn validate_rejects_empty_partition_table() {
        // Some(empty) is not the same as None: a keyed dispatch against an
        // empty table has no partition to land on.
        let map = ClusterMap::new(
            1,
            "default",
            vec![node("a")],
            Some(PartitionMap::new(vec![])),
        );
        assert!(map.validate().is_err());
    }

    #[test]
    fn vacant_master_is_structurally_valid() {
        // Mid-rebalance entries carry -1; that is a routing concern, not a
        // structural one.
        let map = ClusterMap::new(
            1,
            "default",
            vec![node("a")],
            Some(PartitionMap::new(vec![Partition {
                master: NO_NODE,
                replicas: vec![],
            }])),
        );
        assert!(map.validate().is_ok());
    }
}
