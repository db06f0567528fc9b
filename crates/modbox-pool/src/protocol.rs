//! Broker control protocol
//!
//! Messages are `len: u32 BE | JSON`, one request then one reply. A
//! `Spawned` reply carries the worker's four pipe ends as `SCM_RIGHTS`
//! ancillary data on its first byte.
//!
//! Each reaped worker gets a 5-byte status record on its status pipe:
//! `kind: u8` (0 exited, 1 signaled) then `value: i32 BE`.

use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Largest control message accepted
pub const MAX_CONTROL_MESSAGE_BYTES: usize = 64 * 1024;

/// Most descriptors one message may carry
pub const MAX_PASSED_FDS: usize = 4;

/// Host to broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Fork a worker confined to `scratch_dir`
    SpawnWorker {
        /// Name the worker shows in the process table
        process_name: String,
        /// The only directory the worker may touch
        scratch_dir: PathBuf,
    },
    /// SIGKILL a live worker
    KillWorker {
        /// Worker pid
        pid: i32,
    },
    /// Kill every worker and exit
    Shutdown,
}

/// Broker to host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    /// Worker forked; pipe ends attached
    Spawned {
        /// Worker pid
        pid: i32,
    },
    /// Kill request handled
    KillResult {
        /// False when the pid was already reaped or never ours
        delivered: bool,
    },
    /// Request failed inside the broker
    Error {
        /// What went wrong
        message: String,
    },
}

/// How a worker ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WorkerExit {
    /// Exited with a status code
    Exited(i32),
    /// Killed by a signal number
    Signaled(i32),
}

impl WorkerExit {
    /// Size of the status record
    pub const RECORD_BYTES: usize = 5;

    /// Encode as a status record
    #[must_use]
    pub fn to_record(self) -> [u8; Self::RECORD_BYTES] {
        let (kind, value) = match self {
            Self::Exited(code) => (0u8, code),
            Self::Signaled(signal) => (1u8, signal),
        };
        let mut record = [0u8; Self::RECORD_BYTES];
        record[0] = kind;
        record[1..].copy_from_slice(&value.to_be_bytes());
        record
    }

    /// Decode a status record
    #[must_use]
    pub fn from_record(record: [u8; Self::RECORD_BYTES]) -> Option<Self> {
        let value = i32::from_be_bytes([record[1], record[2], record[3], record[4]]);
        match record[0] {
            0 => Some(Self::Exited(value)),
            1 => Some(Self::Signaled(value)),
            _ => None,
        }
    }

    /// Check for a clean exit
    #[inline]
    #[must_use]
    pub fn success(self) -> bool {
        self == Self::Exited(0)
    }
}

/// Send `message`, attaching `fds` to its first byte
///
/// # Errors
///
/// Fails on encoding or socket errors.
pub fn send_message<T: Serialize>(
    stream: &UnixStream,
    message: &T,
    fds: &[RawFd],
) -> Result<(), PoolError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_CONTROL_MESSAGE_BYTES {
        return Err(PoolError::Protocol(format!("control message of {} bytes", payload.len())));
    }
    let len = u32::try_from(payload.len()).map_err(|_| PoolError::Protocol("length overflow".into()))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);

    let rights = [ControlMessage::ScmRights(fds)];
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };
    let sent = loop {
        match sendmsg::<()>(stream.as_raw_fd(), &[IoSlice::new(&frame)], cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
            Err(nix::errno::Errno::EINTR) => continue,
            other => break other?,
        }
    };
    if sent < frame.len() {
        let mut writer = stream;
        writer.write_all(&frame[sent..])?;
    }
    Ok(())
}

/// Receive one message and any descriptors attached to it
///
/// Returns `None` on a clean EOF before the first byte. Received
/// descriptors are close-on-exec.
///
/// # Errors
///
/// Fails on socket errors, EOF inside a message, oversize or malformed
/// payloads, and more than [`MAX_PASSED_FDS`] descriptors.
pub fn recv_message<T: DeserializeOwned>(
    stream: &UnixStream,
) -> Result<Option<(T, Vec<OwnedFd>)>, PoolError> {
    let mut header = [0u8; 4];
    let (read, fds) = recv_with_fds(stream, &mut header)?;
    if read == 0 {
        return Ok(None);
    }

    let mut reader = stream;
    if read < header.len() {
        reader.read_exact(&mut header[read..]).map_err(eof_is_gone)?;
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_CONTROL_MESSAGE_BYTES {
        return Err(PoolError::Protocol(format!("control message of {len} bytes")));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(eof_is_gone)?;
    Ok(Some((serde_json::from_slice(&payload)?, fds)))
}

fn recv_with_fds(stream: &UnixStream, buf: &mut [u8]) -> Result<(usize, Vec<OwnedFd>), PoolError> {
    let mut raw: Vec<RawFd> = Vec::new();
    let (read, truncated) = loop {
        let mut iov = [IoSliceMut::new(buf)];
        let mut space = nix::cmsg_space!([RawFd; MAX_PASSED_FDS]);
        let msg = match recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut space),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Err(nix::errno::Errno::EINTR) => continue,
            other => other?,
        };
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                raw.extend(fds);
            }
        }
        break (msg.bytes, msg.flags.contains(MsgFlags::MSG_CTRUNC));
    };

    // SAFETY: SCM_RIGHTS installed these descriptors in this process and
    // nothing else refers to them yet.
    let fds: Vec<OwnedFd> = raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }).collect();
    if truncated {
        return Err(PoolError::Protocol("ancillary data truncated".into()));
    }
    if fds.len() > MAX_PASSED_FDS {
        return Err(PoolError::Protocol(format!("{} descriptors in one message", fds.len())));
    }
    Ok((read, fds))
}

fn eof_is_gone(error: std::io::Error) -> PoolError {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        PoolError::BrokerGone
    } else {
        PoolError::Io(error)
    }
}
