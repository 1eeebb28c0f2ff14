//! Partition-map lookup for keyed requests.
//!
//! Keys hash to a fixed partition of the keyspace; the partition entry names
//! the master (and replica) node indices. Lookup is a pure function of the
//! snapshot, so concurrent dispatches share one immutable map without locks.

use crate::error::{ClientError, Result};
use crate::locator::NodeRef;
use crate::request::Request;
use reef_types::ClusterMap;

/// Deterministic partition index for a key.
///
/// CRC32 of the key, upper half-word, masked to 15 bits, modulo the
/// partition count. Stable across processes for identical inputs.
pub fn partition_for_key(key: &[u8], partition_count: usize) -> u16 {
    debug_assert!(partition_count > 0);
    let hash = crc32fast::hash(key);
    (((hash >> 16) & 0x7fff) as usize % partition_count) as u16
}

/// Locate the node serving the request's partition.
pub fn locate_partitioned(request: &Request, map: &ClusterMap) -> Result<NodeRef> {
    let partitions = map.partition_map().ok_or_else(|| {
        ClientError::protocol("partitioned locate against a non-partitioned snapshot")
    })?;

    let partition_count = partitions.partition_count();
    if partition_count == 0 {
        return Err(ClientError::protocol(
            "snapshot carries an empty partition table",
        ));
    }

    let partition = match request.partition_hint {
        Some(hint) => hint % partition_count as u16,
        None => {
            let key = request.kind.key().ok_or_else(|| {
                ClientError::protocol("partitioned request carries neither key nor partition hint")
            })?;
            partition_for_key(key, partition_count)
        }
    };

    let entry = partitions
        .get(partition as usize)
        .ok_or(ClientError::NoMasterForPartition { partition })?;

    let node_index = match request.replica {
        Some(slot) => entry
            .replica(slot)
            .ok_or(ClientError::NoMasterForPartition { partition })?,
        None => {
            if !entry.has_master() {
                return Err(ClientError::NoMasterForPartition { partition });
            }
            entry.master
        }
    } as usize;

    // validate() guarantees in-range indices for any installed snapshot.
    let node = map
        .node_at(node_index)
        .ok_or(ClientError::NoMasterForPartition { partition })?;
    let port = node
        .port_for(request.service, false)
        .ok_or_else(|| ClientError::NoService {
            host: node.host.clone(),
            service: request.service,
        })?;

    Ok(NodeRef {
        index: node_index,
        host: node.host.clone(),
        port,
        partition: Some(partition),
    })
}
