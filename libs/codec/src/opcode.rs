//! Operation codes carried in the envelope.
//!
//! Bodies are opaque at this layer; the opcode only tells a peer which
//! decoder to hand the body to.

/// Fetch a document by key
pub const GET: u8 = 0x00;
/// Store a document by key
pub const SET: u8 = 0x01;
/// Execute a query statement
pub const QUERY: u8 = 0x10;
/// Retrieve server statistics
pub const STAT: u8 = 0x20;
/// Request a configuration snapshot out-of-band
pub const CONFIG: u8 = 0x30;
/// Liveness probe
pub const NOOP: u8 = 0xf0;
