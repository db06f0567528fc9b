//! Wire protocol errors

use crate::frame::{FrameKind, PROTOCOL_VERSION};

/// Errors produced while encoding, decoding or checking wire messages
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Fewer bytes than the frame header or declared length require
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Frame written by an incompatible protocol revision
    #[error("unsupported protocol version {0} (expected {PROTOCOL_VERSION})")]
    UnsupportedVersion(u16),

    /// Frame kind does not match what the reader expects
    #[error("unexpected frame kind {actual} (expected {expected:?})")]
    UnexpectedKind { expected: FrameKind, actual: u16 },

    /// Declared payload length exceeds the frame ceiling
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u64),

    /// Bytes left over after a complete frame
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),

    /// Payload is not a valid message (missing required field, bad JSON)
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A filename inside a message is unsafe to resolve
    #[error("invalid filename {name:?}: {reason}")]
    InvalidFilename { name: String, reason: &'static str },

    /// Underlying stream failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Check if the error means the peer sent bytes that violate the protocol
    #[inline]
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}
