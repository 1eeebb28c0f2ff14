//! Envelope-level errors.
//!
//! The split matters to the endpoint: a recoverable error fails only the one
//! correlated request, an unrecoverable one means the byte stream can no
//! longer be framed and the connection must be torn down.

use thiserror::Error;

/// Frame encoding/decoding errors with diagnostic context.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame magic did not match; the stream is desynchronized.
    #[error("Invalid frame magic: expected {expected:#010x}, got {actual:#010x}")]
    InvalidMagic { expected: u32, actual: u32 },

    /// Declared body length exceeds the configured maximum. The remainder of
    /// the stream cannot be skipped reliably, so this is fatal.
    #[error("Frame body of {size} bytes exceeds maximum {max}")]
    OversizedFrame { size: usize, max: usize },

    /// Reserved flag bits were set. The frame itself was consumed cleanly,
    /// so only the correlated request is affected.
    #[error("Frame carries reserved flag bits {flags:#04x}")]
    ReservedFlags { flags: u8 },
}

/// Result type alias for codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;

impl CodecError {
    /// Whether the stream remains usable after this error.
    ///
    /// Recoverable errors consumed a well-framed but invalid frame; the
    /// decoder stays aligned on the next frame boundary.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::ReservedFlags { .. })
    }
}
