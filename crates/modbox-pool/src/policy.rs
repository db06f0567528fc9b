//! Sandbox policy
//!
//! Fixed when the broker starts; every worker it forks gets the same one.

use serde::{Deserialize, Serialize};

/// OS resource ceilings applied with setrlimit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU time, seconds
    pub cpu_seconds: u64,
    /// Address space, bytes
    pub memory_bytes: u64,
    /// Open file descriptors
    pub open_files: u64,
    /// Processes and threads for the worker's user
    pub processes: u64,
    /// Largest file the worker may write, bytes
    pub file_size_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_seconds: 30,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            open_files: 64,
            processes: 1,
            file_size_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// How strictly filesystem confinement is enforced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confinement {
    /// Abort the worker when the kernel cannot confine it
    Required,
    /// Confine as far as the kernel allows
    #[default]
    BestEffort,
    /// No filesystem confinement
    Disabled,
}

/// Unprivileged identity workers switch to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
}

impl Credentials {
    /// The conventional `nobody:nogroup`
    pub const NOBODY: Self = Self { uid: 65534, gid: 65534 };

    /// Check for uid or gid 0
    #[inline]
    #[must_use]
    pub fn is_root(self) -> bool {
        self.uid == 0 || self.gid == 0
    }
}

/// Everything a worker applies to itself before running module code
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    /// setrlimit ceilings
    pub limits: ResourceLimits,
    /// Filesystem confinement mode
    pub confinement: Confinement,
    /// Identity to drop to; `None` keeps the broker's, which must not be root
    pub run_as: Option<Credentials>,
}
