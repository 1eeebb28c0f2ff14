//! Topology and payload parsing errors.

use thiserror::Error;

/// Errors produced while parsing or validating cluster configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TopologyError {
    /// Payload could not be parsed into a cluster snapshot
    #[error("Malformed configuration payload: {reason}")]
    Malformed { reason: String },

    /// A partition entry references a node index outside the node list
    #[error("Partition {partition} references node index {index}, but only {nodes} nodes are present")]
    InvalidReference {
        partition: usize,
        index: i32,
        nodes: usize,
    },

    /// The partition table's server list names a host absent from the node list
    #[error("Server list entry '{0}' does not match any configured node")]
    UnknownServer(String),
}

/// Result type alias for topology operations
pub type TopologyResult<T> = std::result::Result<T, TopologyError>;

impl TopologyError {
    /// Create a malformed-payload error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for TopologyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed {
            reason: e.to_string(),
        }
    }
}
