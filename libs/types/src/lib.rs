//! # Reef Cluster Topology Types
//!
//! Pure data structures shared across the Reef client core:
//! - Immutable cluster snapshots ([`ClusterMap`]) used for routing decisions
//! - Node identity ([`NodeInfo`]) with equality by host address
//! - Partition tables ([`PartitionMap`]) for keyspace sharding
//! - Configuration payload parsing (JSON, with `$HOST` substitution)
//!
//! ## Architecture Role
//!
//! ```text
//! reef-types → reef-codec → reef-network
//!     ↑             ↓            ↓
//! Pure Data    Wire Envelope  Transport/Dispatch
//! ```
//!
//! Nothing in this crate performs I/O. Snapshots are immutable once built;
//! the network crate publishes them through an atomic handle swap and reads
//! them lock-free from any number of dispatch threads.

pub mod cluster;
pub mod error;
pub mod node;
pub mod payload;
pub mod service;

pub use cluster::{ClusterMap, Partition, PartitionMap};
pub use error::{TopologyError, TopologyResult};
pub use node::NodeInfo;
pub use payload::parse_payload;
pub use service::ServiceType;

/// Placeholder token some configuration sources emit for "the host you are
/// connected to". Substituted with the origin host before parsing.
pub const HOST_PLACEHOLDER: &str = "$HOST";
