//! Length-prefixed frames
//!
//! Wire layout, big-endian header:
//!
//! ```text
//! len: u32 | version: u16 | kind: u16 | payload (len bytes, JSON)
//! ```
//!
//! One frame per stream direction per invocation. Readers reject frames of
//! another version or kind, and anything after the frame.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::WireError;

/// Protocol revision written into every frame
pub const PROTOCOL_VERSION: u16 = 1;

/// Header size: len(4) + version(2) + kind(2)
pub const FRAME_HEADER_BYTES: usize = 8;

/// Largest payload accepted; requests carry module source text
pub const FRAME_MAX_PAYLOAD_BYTES: u32 = 64 * 1024 * 1024;

/// Frame discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Orchestrator → worker: code plus request
    WorkerInvocation,
    /// Worker → orchestrator: result or failure
    InvocationResponse,
}

impl FrameKind {
    /// Wire discriminant value
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::WorkerInvocation => 1,
            Self::InvocationResponse => 2,
        }
    }

    /// Parse a wire discriminant
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::WorkerInvocation),
            2 => Some(Self::InvocationResponse),
            _ => None,
        }
    }
}

/// Serialize `message` into a complete frame
///
/// # Errors
///
/// Fails if the message cannot be serialized or exceeds
/// [`FRAME_MAX_PAYLOAD_BYTES`].
pub fn encode_frame<T: Serialize>(kind: FrameKind, message: &T) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(message)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= FRAME_MAX_PAYLOAD_BYTES)
        .ok_or(WireError::FrameTooLarge(payload.len() as u64))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    frame.extend_from_slice(&kind.to_u16().to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parsed header fields
#[derive(Debug, Clone, Copy)]
struct Header {
    len: usize,
}

fn parse_header(header: &[u8; FRAME_HEADER_BYTES], expected: FrameKind) -> Result<Header, WireError> {
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let version = u16::from_be_bytes([header[4], header[5]]);
    let kind = u16::from_be_bytes([header[6], header[7]]);

    if version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    if FrameKind::from_u16(kind) != Some(expected) {
        return Err(WireError::UnexpectedKind {
            expected,
            actual: kind,
        });
    }
    if len > FRAME_MAX_PAYLOAD_BYTES {
        return Err(WireError::FrameTooLarge(u64::from(len)));
    }
    Ok(Header { len: len as usize })
}

/// Decode exactly one frame occupying all of `bytes`
///
/// # Errors
///
/// Fails on a short buffer, a header mismatch, trailing bytes, or a payload
/// that is not a valid `T` (including missing required fields).
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8], expected: FrameKind) -> Result<T, WireError> {
    let header: &[u8; FRAME_HEADER_BYTES] = bytes
        .get(..FRAME_HEADER_BYTES)
        .and_then(|h| h.try_into().ok())
        .ok_or(WireError::Truncated {
            expected: FRAME_HEADER_BYTES,
            actual: bytes.len(),
        })?;
    let Header { len } = parse_header(header, expected)?;

    let total = FRAME_HEADER_BYTES + len;
    if bytes.len() < total {
        return Err(WireError::Truncated {
            expected: total,
            actual: bytes.len(),
        });
    }
    if bytes.len() > total {
        return Err(WireError::TrailingBytes(bytes.len() - total));
    }
    Ok(serde_json::from_slice(&bytes[FRAME_HEADER_BYTES..])?)
}

/// Write one frame to a blocking stream
///
/// # Errors
///
/// Propagates encoding and I/O failures.
pub fn write_frame<W: Write, T: Serialize>(
    writer: &mut W,
    kind: FrameKind,
    message: &T,
) -> Result<(), WireError> {
    let frame = encode_frame(kind, message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame from a blocking stream
///
/// Reads the header, then exactly the declared payload; the caller decides
/// whether more data on the stream is an error.
///
/// # Errors
///
/// Fails on EOF inside the frame, a header mismatch, or a malformed payload.
pub fn read_frame<R: Read, T: DeserializeOwned>(
    reader: &mut R,
    expected: FrameKind,
) -> Result<T, WireError> {
    let mut header = [0u8; FRAME_HEADER_BYTES];
    read_full(reader, &mut header)?;
    let Header { len } = parse_header(&header, expected)?;

    let mut payload = vec![0u8; len];
    read_full(reader, &mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(WireError::Truncated {
                    expected: buf.len(),
                    actual: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
