//! Node identity and per-service port information.

use crate::service::ServiceType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// One cluster node as seen by a configuration snapshot.
///
/// Identity is the host address alone. Equality and hashing deliberately
/// ignore port/service state so that reconnect logic can diff old and new
/// node sets across topology changes that only move services around.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Host address (name or IP) of the node
    pub host: String,
    /// Plain port per exposed service
    pub services: HashMap<ServiceType, u16>,
    /// TLS port per exposed service
    pub ssl_services: HashMap<ServiceType, u16>,
}

impl NodeInfo {
    /// Create a node with no services registered yet.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            services: HashMap::new(),
            ssl_services: HashMap::new(),
        }
    }

    /// Port for the given service, honoring the TLS flag.
    pub fn port_for(&self, service: ServiceType, tls: bool) -> Option<u16> {
        if tls {
            self.ssl_services.get(&service).copied()
        } else {
            self.services.get(&service).copied()
        }
    }

    /// Whether the node exposes the given service at all.
    pub fn has_service(&self, service: ServiceType) -> bool {
        self.services.contains_key(&service) || self.ssl_services.contains_key(&service)
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
    }
}

impl Eq for NodeInfo {}

impl Hash for NodeInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
    }
}
