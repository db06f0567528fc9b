//! Error types for the process pool

use crate::worker::WorkerState;

/// Process pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Broker process could not be started
    #[error("failed to start forkserver: {0}")]
    StartFailed(std::io::Error),

    /// Broker closed the control channel or exited
    #[error("forkserver is gone")]
    BrokerGone,

    /// Broker answered with something the request does not allow
    #[error("forkserver protocol violation: {0}")]
    Protocol(String),

    /// Broker could not fork a worker
    #[error("worker spawn failed: {0}")]
    SpawnFailed(String),

    /// Worker state machine misuse
    #[error("illegal worker transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current state
        from: WorkerState,
        /// Requested state
        to: WorkerState,
    },

    /// Sandbox setup failed in a child
    #[error("sandbox setup failed: {0}")]
    Sandbox(String),

    /// Control message encoding
    #[error("control message encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    /// System call failure
    #[error("system error: {0}")]
    Sys(#[from] nix::Error),

    /// I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// Check if the broker itself is unusable and must be restarted
    #[inline]
    #[must_use]
    pub fn is_broker_failure(&self) -> bool {
        matches!(self, Self::BrokerGone | Self::Protocol(_) | Self::StartFailed(_))
    }
}
