//! Configuration payload parsing.
//!
//! The configuration service emits a JSON document per bucket:
//!
//! ```json
//! {
//!   "rev": 27,
//!   "name": "default",
//!   "nodesExt": [
//!     { "hostname": "10.0.0.1",
//!       "services": { "kv": 11210, "kvSSL": 11207, "mgmt": 8091 } }
//!   ],
//!   "vBucketServerMap": {
//!     "serverList": ["10.0.0.1:11210"],
//!     "vBucketMap": [[0, 1], [1, 0]]
//!   }
//! }
//! ```
//!
//! Some sources return the literal token `$HOST` instead of their own
//! address; it is substituted with the connected host before parsing.
//! Non-partitioned buckets simply omit `vBucketServerMap`.

use crate::cluster::{ClusterMap, Partition, PartitionMap};
use crate::error::{TopologyError, TopologyResult};
use crate::node::NodeInfo;
use crate::service::ServiceType;
use crate::HOST_PLACEHOLDER;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
struct RawConfig {
    rev: u64,
    name: String,
    #[serde(rename = "nodesExt", default)]
    nodes_ext: Vec<RawNode>,
    #[serde(rename = "vBucketServerMap", default)]
    vbucket_server_map: Option<RawServerMap>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    /// Absent when the payload refers to the origin host
    hostname: Option<String>,
    #[serde(default)]
    services: HashMap<String, u16>,
}

#[derive(Debug, Deserialize)]
struct RawServerMap {
    #[serde(rename = "serverList")]
    server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
}

/// Parse a raw configuration payload into a validated [`ClusterMap`].
///
/// `origin_host` replaces the `$HOST` placeholder and stands in for nodes
/// that omit their hostname.
pub fn parse_payload(raw: &str, origin_host: &str) -> TopologyResult<ClusterMap> {
    let substituted;
    let raw = if raw.contains(HOST_PLACEHOLDER) {
        substituted = raw.replace(HOST_PLACEHOLDER, origin_host);
        substituted.as_str()
    } else {
        raw
    };

    let config: RawConfig = serde_json::from_str(raw)?;
    if config.nodes_ext.is_empty() {
        return Err(TopologyError::malformed("payload contains no nodes"));
    }

    let mut nodes = Vec::with_capacity(config.nodes_ext.len());
    for raw_node in &config.nodes_ext {
        let host = raw_node
            .hostname
            .clone()
            .unwrap_or_else(|| origin_host.to_string());
        let mut node = NodeInfo::new(host);
        // Unknown service names are skipped, not fatal: newer clusters may
        // advertise services this client does not speak.
        for (name, &port) in &raw_node.services {
            for service in ServiceType::ALL {
                if name == service.payload_name() {
                    node.services.insert(service, port);
                } else if name == service.payload_ssl_name() {
                    node.ssl_services.insert(service, port);
                }
            }
        }
        nodes.push(node);
    }

    let partitions = match config.vbucket_server_map {
        Some(server_map) => Some(build_partition_map(&server_map, &nodes)?),
        None => None,
    };

    let map = ClusterMap::new(config.rev, config.name, nodes, partitions);
    map.validate()?;
    Ok(map)
}

/// Translate serverList-relative indices in the vBucketMap into node-list
/// indices, then build the partition table.
fn build_partition_map(server_map: &RawServerMap, nodes: &[NodeInfo]) -> TopologyResult<PartitionMap> {
    let mut translation = Vec::with_capacity(server_map.server_list.len());
    for server in &server_map.server_list {
        let host = server.rsplit_once(':').map(|(h, _)| h).unwrap_or(server);
        let index = nodes
            .iter()
            .position(|n| n.host == host)
            .ok_or_else(|| TopologyError::UnknownServer(server.clone()))?;
        translation.push(index as i32);
    }

    let translate = |raw: i32| -> TopologyResult<i32> {
        if raw < 0 {
            return Ok(crate::cluster::NO_NODE);
        }
        translation
            .get(raw as usize)
            .copied()
            .ok_or_else(|| TopologyError::malformed(format!("vBucketMap index {raw} out of range")))
    };

    let mut partitions = Vec::with_capacity(server_map.vbucket_map.len());
    for row in &server_map.vbucket_map {
        let (master, replicas) = match row.split_first() {
            Some((m, rest)) => (*m, rest),
            None => return Err(TopologyError::malformed("empty vBucketMap row")),
        };
        partitions.push(Partition {
            master: translate(master)?,
            replicas: replicas
                .iter()
                .map(|&r| translate(r))
                .collect::<TopologyResult<Vec<_>>>()?,
        });
    }
    Ok(PartitionMap::new(partitions))
}
