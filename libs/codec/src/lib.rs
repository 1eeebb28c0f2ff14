//! # Reef Wire Envelope
//!
//! The generic frame format every Reef service speaks on the wire. Concrete
//! per-operation message bodies are opaque to this crate; it only defines the
//! envelope, its incremental decoder, and the distinction between a single
//! bad frame (recoverable) and a desynchronized stream (fatal).
//!
//! ## Frame Layout
//!
//! ```text
//! ┌─────────┬────────┬───────┬────────┬──────────┬──────────────┐
//! │ magic   │ opcode │ flags │ status │ body_len │ body         │
//! │ u32 BE  │ u8     │ u8    │ u16 BE │ u32 BE   │ body_len B   │
//! └─────────┴────────┴───────┴────────┴──────────┴──────────────┘
//! ```
//!
//! Responses to one request may span multiple frames; every frame except the
//! last carries [`Frame::FLAG_PARTIAL`]. The decoder is incremental: feed it
//! a growing buffer and it yields zero or more complete frames per call.

pub mod error;
pub mod frame;
pub mod opcode;

pub use error::{CodecError, CodecResult};
pub use frame::{decode_frame, encode_frame, Frame, FrameStatus, FRAME_HEADER_LEN, FRAME_MAGIC};
