//! Error types for the modbox kernel
//!
//! Every way an invocation can fail is an [`InvokeError`] variant; none of
//! them takes the host process down. Callers decide what to do through
//! the predicates:
//! - [`InvokeError::is_module_fault`]: the module misbehaved
//! - [`InvokeError::is_package_broken`]: the published package is unusable
//! - [`InvokeError::is_retryable`]: a fresh call may succeed

use std::path::PathBuf;
use std::time::Duration;

use modbox_package::LoadError;
use modbox_pool::{PoolError, WorkerExit};
use modbox_table::ValidationError;
use modbox_wire::WireError;

/// Invocation failures
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// Worker ended abnormally or answered with a failure
    #[error("module exited: {diagnostic}")]
    ModuleExited {
        /// Exit status, if the broker reported one
        exit: Option<WorkerExit>,
        /// What happened, with the worker's log output
        diagnostic: String,
    },

    /// Deadline exceeded; the worker was killed
    #[error("module timed out after {}ms", timeout.as_millis())]
    ModuleTimeout {
        /// Deadline that expired
        timeout: Duration,
        /// Process id the killed worker had
        pid: i32,
        /// Worker log output collected before the kill
        log: String,
    },

    /// Package cannot run until it is republished
    #[error("module is broken: {0}")]
    ModuleBroken(String),

    /// Output table failed certification
    #[error("module output failed validation: {0}")]
    Validation(#[from] ValidationError),

    /// Package could not be loaded
    #[error("package load failed: {0}")]
    Load(#[from] LoadError),

    /// Broker or worker plumbing failed
    #[error("process pool error: {0}")]
    Pool(#[from] PoolError),

    /// Request could not be encoded
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Scratch directory could not be prepared
    #[error("scratch directory error: {0}")]
    Scratch(std::io::Error),

    /// Kernel configuration is unusable
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Kernel no longer accepts invocations
    #[error("kernel is shut down")]
    ShutDown,
}

impl InvokeError {
    /// Check if the module itself is at fault
    #[inline]
    #[must_use]
    pub fn is_module_fault(&self) -> bool {
        matches!(
            self,
            Self::ModuleExited { .. } | Self::ModuleTimeout { .. } | Self::Validation(_)
        )
    }

    /// Check if the package is unusable until republished
    #[inline]
    #[must_use]
    pub fn is_package_broken(&self) -> bool {
        match self {
            Self::ModuleBroken(_) => true,
            Self::Load(e) => e.is_package_broken(),
            _ => false,
        }
    }

    /// Check if a fresh call might succeed
    ///
    /// Only timeouts and infrastructure failures qualify.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ModuleTimeout { .. } | Self::Pool(_) | Self::Scratch(_) => true,
            Self::Load(LoadError::Io(_)) => true,
            _ => false,
        }
    }
}

/// Configuration failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying failure
        source: std::io::Error,
    },

    /// Not valid TOML for the config schema
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Parsed, but a value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use modbox_package::CompileError;

    #[test]
    fn predicates() {
        let exited = InvokeError::ModuleExited {
            exit: Some(WorkerExit::Signaled(11)),
            diagnostic: "killed by signal 11".into(),
        };
        assert!(exited.is_module_fault());
        assert!(!exited.is_retryable());
        assert!(!exited.is_package_broken());

        let timeout = InvokeError::ModuleTimeout {
            timeout: Duration::from_millis(500),
            pid: 4242,
            log: String::new(),
        };
        assert!(timeout.is_module_fault());
        assert!(timeout.is_retryable());
        assert_eq!(timeout.to_string(), "module timed out after 500ms");

        let broken = InvokeError::Load(LoadError::Compile(CompileError::unpositioned("nope")));
        assert!(broken.is_package_broken());
        assert!(!broken.is_retryable());

        assert!(InvokeError::Pool(PoolError::BrokerGone).is_retryable());
        assert!(!InvokeError::ShutDown.is_module_fault());
    }
}
