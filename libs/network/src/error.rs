//! Client Core Error Types
//!
//! Error taxonomy for dispatch, endpoint and configuration failures. The
//! dispatcher's retry policy keys off [`ClientError::is_retryable`]: only
//! transient topology states qualify, everything else surfaces immediately.

use reef_types::{ServiceType, TopologyError};
use thiserror::Error;

/// Main error type of the client core
#[derive(Debug, Error)]
pub enum ClientError {
    /// The partition's master slot is vacant, typically mid-rebalance
    #[error("No master for partition {partition}")]
    NoMasterForPartition { partition: u16 },

    /// No endpoint of the target service is currently connected
    #[error("No healthy {service} endpoint on {host}")]
    NoHealthyEndpoint { host: String, service: ServiceType },

    /// The node does not expose the requested service at all
    #[error("Node {host} does not expose the {service} service")]
    NoService { host: String, service: ServiceType },

    /// The connection carrying this request went away
    #[error("Connection dropped: {message}")]
    ConnectionDropped { message: String },

    /// One response frame was malformed; the connection survived
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// The byte stream can no longer be framed; the connection is torn down
    #[error("Framing desynchronized: {message}")]
    Desync { message: String },

    /// The request's bucket has not been opened
    #[error("Bucket '{bucket}' is not open")]
    BucketNotOpen { bucket: String },

    /// No topology snapshot has been installed for the bucket yet
    #[error("No topology installed for bucket '{bucket}' yet")]
    NoTopology { bucket: String },

    /// The request's deadline passed before a response arrived
    #[error("Request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The caller cancelled the request
    #[error("Request cancelled by caller")]
    Cancelled,

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        field: Option<String>,
    },

    /// Configuration payload errors from the topology layer
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Retry budget exhausted; carries the last transient failure
    #[error("Gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<ClientError>,
    },
}

/// Result type alias for client core operations
pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// Create a connection-dropped error
    pub fn dropped(message: impl Into<String>) -> Self {
        Self::ConnectionDropped {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Config {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create an I/O error with source
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Transient topology states the dispatcher retries with backoff.
    ///
    /// Everything else is terminal: retrying a malformed frame or a decode
    /// failure cannot change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::NoMasterForPartition { .. } | ClientError::NoHealthyEndpoint { .. }
        )
    }
}

impl From<reef_codec::CodecError> for ClientError {
    fn from(e: reef_codec::CodecError) -> Self {
        if e.is_recoverable() {
            Self::Protocol {
                message: e.to_string(),
            }
        } else {
            Self::Desync {
                message: e.to_string(),
            }
        }
    }
}
