//! Service type enumeration.
//!
//! Each cluster node can expose any subset of these services, each on its own
//! port. Routing decisions are always made per (node, service) pair.

use serde::{Deserialize, Serialize};

/// Logical service a node may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    /// Binary key/value service (partitioned keyspace)
    KeyValue,
    /// Query service (non-partitioned, hash-ring routed)
    Query,
    /// View/index service
    Views,
    /// Cluster management / configuration service
    Config,
    /// Full-text search service
    Search,
}

impl ServiceType {
    /// Whether requests for this service route through the partition map.
    ///
    /// Non-partitioned services fall back to ketama ring lookup.
    pub fn is_partitioned(&self) -> bool {
        matches!(self, ServiceType::KeyValue)
    }

    /// The payload key used for this service's plain port.
    pub(crate) fn payload_name(&self) -> &'static str {
        match self {
            ServiceType::KeyValue => "kv",
            ServiceType::Query => "n1ql",
            ServiceType::Views => "capi",
            ServiceType::Config => "mgmt",
            ServiceType::Search => "fts",
        }
    }

    /// The payload key used for this service's TLS port.
    pub(crate) fn payload_ssl_name(&self) -> &'static str {
        match self {
            ServiceType::KeyValue => "kvSSL",
            ServiceType::Query => "n1qlSSL",
            ServiceType::Views => "capiSSL",
            ServiceType::Config => "mgmtSSL",
            ServiceType::Search => "ftsSSL",
        }
    }

    /// All service types, in a stable order.
    pub const ALL: [ServiceType; 5] = [
        ServiceType::KeyValue,
        ServiceType::Query,
        ServiceType::Views,
        ServiceType::Config,
        ServiceType::Search,
    ];
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceType::KeyValue => "kv",
            ServiceType::Query => "query",
            ServiceType::Views => "views",
            ServiceType::Config => "config",
            ServiceType::Search => "search",
        };
        f.write_str(name)
    }
}
