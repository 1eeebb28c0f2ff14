//! # Reef Network Core
//!
//! Transport, dispatch and topology engine of the Reef cluster client. This
//! crate multiplexes many in-flight requests over few persistent
//! connections, correlates asynchronously arriving responses back to their
//! originating requests, and keeps a live view of cluster topology via
//! streamed configuration updates.
//!
//! ## Data Flow
//!
//! ```text
//! caller → Core (dispatcher) → locator → Service → Endpoint → wire
//!                    ↑                                  │
//!              ConfigRefresher ←──── config service     └→ responses
//! ```
//!
//! The single public entry point is [`Core::submit`]; it never blocks the
//! caller and resolves through a [`request::CompletionHandle`]. Topology
//! snapshots are immutable and swapped atomically, so routing reads are
//! lock-free. Every outstanding request resolves exactly once, on
//! response, connection drop, timeout, cancellation or retry exhaustion.

pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod locator;
pub mod refresher;
pub mod request;
pub mod service;
pub mod transport;

pub use config::{CoreConfig, FallbackPolicy, RefresherConfig, RetryConfig};
pub use dispatcher::{Core, TopologySink};
pub use endpoint::{DispatchEntry, Endpoint, Lifecycle};
pub use error::{ClientError, Result};
pub use locator::{locate, NodeRef, RingCache};
pub use refresher::{
    ConfigPayload, ConfigRefresher, ConfigSource, Credentials, HttpConfigSource, MonitorState,
    StreamMode,
};
pub use request::{completion, CompletionHandle, CompletionSink, Request, RequestKind, Response};
pub use service::{Service, ServiceHealth};
pub use transport::{ByteTransport, Connector, FramedTransport, TcpConnector};

// Re-export the sibling crates so consumers need only one dependency.
pub use reef_codec as codec;
pub use reef_types as types;
