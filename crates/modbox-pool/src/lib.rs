//! modbox Process Pool
//!
//! One long-lived broker process holds a pre-initialized [`Zygote`] and
//! forks a fresh worker per invocation:
//! - [`Forkserver`]: host-side handle that starts the broker and asks it for
//!   workers over a Unix control socket
//! - [`run_broker`]: the broker loop (fork-on-request, SIGCHLD reaper)
//! - [`sandbox`]: what a freshly forked child applies before module code runs
//! - [`WorkerHandle`]: one worker's pipes and lifecycle state machine
//!
//! The broker parses nothing but its own control messages. Request payloads
//! flow from the host straight into the worker's stdin.

// fork(2), fd inheritance and SCM_RIGHTS need raw descriptors.
#![allow(unsafe_code)]
#![warn(unreachable_pub)]

pub mod broker;
pub mod client;
pub mod error;
pub mod policy;
pub mod protocol;
pub mod sandbox;
pub mod worker;

pub use broker::{control_from_inherited_fd, run_broker, Zygote, CONTROL_FD};
pub use client::{Forkserver, ForkserverConfig};
pub use error::PoolError;
pub use policy::{Confinement, Credentials, ResourceLimits, SandboxPolicy};
pub use protocol::{ControlReply, ControlRequest, WorkerExit};
pub use sandbox::SANDBOX_FAILURE_EXIT_CODE;
pub use worker::{
    allowed_transitions, validate_transition, OutputLimits, WorkerHandle, WorkerOutput, WorkerState,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
