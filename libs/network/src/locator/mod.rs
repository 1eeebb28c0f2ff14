//! Request Locator
//!
//! Maps (request, topology snapshot) to a target node. Two strategies:
//! partition-map lookup for the keyspace-sharded service, ketama ring for
//! everything else. Both are pure functions of the supplied snapshot, so
//! any number of dispatch threads can locate concurrently against one
//! immutable map.

use crate::error::{ClientError, Result};
use crate::request::Request;
use reef_types::ClusterMap;

pub mod partition;
pub mod ring;

pub use partition::partition_for_key;
pub use ring::{KetamaRing, RingCache};

/// A resolved dispatch target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    /// Index into the snapshot's node list
    pub index: usize,
    pub host: String,
    pub port: u16,
    /// Partition the request resolved through, when partitioned
    pub partition: Option<u16>,
}

/// Resolve the target node for a request against a snapshot.
///
/// Keyed requests against a partitioned bucket go through the partition
/// map; keyless requests and non-partitioned buckets go through the ring.
pub fn locate(request: &Request, map: &ClusterMap, rings: &RingCache) -> Result<NodeRef> {
    let partitioned = request.service.is_partitioned()
        && map.has_partitions()
        && (request.kind.key().is_some() || request.partition_hint.is_some());

    if partitioned {
        partition::locate_partitioned(request, map)
    } else {
        locate_ring(request, map, rings)
    }
}

fn locate_ring(request: &Request, map: &ClusterMap, rings: &RingCache) -> Result<NodeRef> {
    let ring = rings.ring_for(map, request.service);
    let ring_key = match request.kind.key() {
        Some(key) => key.to_vec(),
        // Keyless operations spread by statement/operation identity.
        None => format!("{:?}", request.kind).into_bytes(),
    };
    let index = ring
        .node_for_key(&ring_key)
        .ok_or_else(|| ClientError::NoHealthyEndpoint {
            host: "<none>".to_string(),
            service: request.service,
        })?;

    let node = map.node_at(index).ok_or_else(|| ClientError::NoHealthyEndpoint {
        host: "<none>".to_string(),
        service: request.service,
    })?;
    let port = node
        .port_for(request.service, false)
        .ok_or_else(|| ClientError::NoService {
            host: node.host.clone(),
            service: request.service,
        })?;

    Ok(NodeRef {
        index,
        host: node.host.clone(),
        port,
        partition: None,
    })
}
