//! Ketama-style consistent hash ring for non-partitioned services.
//!
//! Each physical node contributes a fixed number of virtual points; a key
//! routes to the first point at or after its own hash, wrapping at the top
//! of the ring. The ring is rebuilt only when the node set changes, never
//! per request; lookups against a built ring are read-only.

use parking_lot::Mutex;
use reef_types::{ClusterMap, ServiceType};
use std::collections::HashMap;
use std::sync::Arc;

/// Virtual points placed on the ring per physical node.
const POINTS_PER_NODE: usize = 40;

/// Immutable hash ring over the nodes exposing one service.
#[derive(Debug)]
pub struct KetamaRing {
    /// Sorted (point hash, node index) pairs
    points: Vec<(u32, usize)>,
}

impl KetamaRing {
    /// Build a ring from the nodes of a snapshot that expose `service`.
    pub fn build(map: &ClusterMap, service: ServiceType) -> Self {
        let mut points = Vec::new();
        for (index, node, _port) in map.nodes_for_service(service) {
            for vnode in 0..POINTS_PER_NODE {
                let point = crc32fast::hash(format!("{}-{}", node.host, vnode).as_bytes());
                points.push((point, index));
            }
        }
        points.sort_unstable();
        Self { points }
    }

    /// Node index owning the given key, or `None` on an empty ring.
    pub fn node_for_key(&self, key: &[u8]) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let hash = crc32fast::hash(key);
        let position = self
            .points
            .partition_point(|&(point, _)| point < hash);
        // Wrap past the highest point back to the start of the ring.
        let (_, index) = self.points[position % self.points.len()];
        Some(index)
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Debug)]
struct CachedRing {
    revision: u64,
    ring: Arc<KetamaRing>,
}

/// Per-bucket ring cache keyed by service, invalidated by snapshot revision.
///
/// Keeps `locate` pure with respect to the supplied snapshot while avoiding
/// a rebuild on every request: a cached ring is reused as long as the
/// snapshot revision it was built from is still installed.
#[derive(Debug, Default)]
pub struct RingCache {
    rings: Mutex<HashMap<ServiceType, CachedRing>>,
}

impl RingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ring for `service` built from `map`, reusing the cached instance when
    /// the revision matches.
    pub fn ring_for(&self, map: &ClusterMap, service: ServiceType) -> Arc<KetamaRing> {
        let mut rings = self.rings.lock();
        if let Some(cached) = rings.get(&service) {
            if cached.revision == map.revision() {
                return Arc::clone(&cached.ring);
            }
        }
        let ring = Arc::new(KetamaRing::build(map, service));
        rings.insert(
            service,
            CachedRing {
                revision: map.revision(),
                ring: Arc::clone(&ring),
            },
        );
        ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reef_types::NodeInfo;

    fn map_with_hosts(revision: u64, hosts: &[&str]) -> ClusterMap {
        let nodes = hosts
            .iter()
            .map(|h| {
                let mut n = NodeInfo::new(*h);
                n.services.insert(ServiceType::Query, 8093);
                n
            })
            .collect();
        ClusterMap::new(revision, "default", nodes, None)
    }

    #[test]
    fn lookup_is_deterministic() {
        let map = map_with_hosts(1, &["a", "b", "c"]);
        let ring = KetamaRing::build(&map, ServiceType::Query);
        let first = ring.node_for_key(b"some-key").unwrap();
        for _ in 0..100 {
            assert_eq!(ring.node_for_key(b"some-key"), Some(first));
        }
    }

    #[test]
    fn empty_ring_yields_none() {
        let map = map_with_hosts(1, &[]);
        let ring = KetamaRing::build(&map, ServiceType::Query);
        assert!(ring.is_empty());
        assert_eq!(ring.node_for_key(b"k"), None);
    }

    #[test]
    fn removing_a_node_only_moves_its_keys() {
        let full = KetamaRing::build(&map_with_hosts(1, &["a", "b", "c"]), ServiceType::Query);
        let reduced = KetamaRing::build(&map_with_hosts(2, &["a", "b"]), ServiceType::Query);

        let mut moved = 0;
        let total = 1000;
        for i in 0..total {
            let key = format!("key-{i}");
            let before = full.node_for_key(key.as_bytes()).unwrap();
            let after = reduced.node_for_key(key.as_bytes()).unwrap();
            if before != 2 {
                // Keys not owned by the removed node mostly stay put.
                if before != after {
                    moved += 1;
                }
            }
        }
        // Consistent hashing: far less churn than a full rehash would cause.
        assert!(moved < total / 4, "moved {moved} of {total}");
    }

    #[test]
    fn cache_rebuilds_only_on_revision_change() {
        let cache = RingCache::new();
        let map_v1 = map_with_hosts(1, &["a", "b"]);

        let r1 = cache.ring_for(&map_v1, ServiceType::Query);
        let r2 = cache.ring_for(&map_v1, ServiceType::Query);
        assert!(Arc::ptr_eq(&r1, &r2));

        let map_v2 = map_with_hosts(2, &["a", "b", "c"]);
        let r3 = cache.ring_for(&map_v2, ServiceType::Query);
        assert!(!Arc::ptr_eq(&r1, &r3));
    }
}
