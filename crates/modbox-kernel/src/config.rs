//! Kernel configuration
//!
//! Loaded once from TOML. Every section and field is optional; missing
//! values take their defaults. Resource limits are handed to the broker
//! when it starts and cannot change for the life of the kernel.
//!
//! ```toml
//! scratch_root = "/var/lib/modbox/scratch"
//! max_concurrent_invocations = 8
//!
//! [limits]
//! max_timeout_ms = 300000
//! memory_bytes = 2147483648
//!
//! [table]
//! metadata_policy = "downgrade"
//!
//! [sandbox]
//! confinement = "required"
//! run_as = { uid = 65534, gid = 65534 }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use modbox_package::LoaderConfig;
use modbox_pool::{Confinement, Credentials, ForkserverConfig, OutputLimits, ResourceLimits, SandboxPolicy};
use modbox_table::{MetadataPolicy, ValidatorConfig};
use nix::unistd::Uid;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Time and OS resource ceilings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Longest wall-clock time any invocation may run, milliseconds
    pub max_timeout_ms: u64,
    /// How long to wait for a killed worker's exit status, milliseconds
    pub kill_grace_ms: u64,
    /// CPU time, seconds
    pub cpu_seconds: u64,
    /// Address space, bytes
    pub memory_bytes: u64,
    /// Open file descriptors
    pub open_files: u64,
    /// Processes and threads
    pub processes: u64,
    /// Largest file a worker may write, bytes
    pub file_size_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let os = ResourceLimits::default();
        Self {
            max_timeout_ms: 300_000,
            kill_grace_ms: 5_000,
            cpu_seconds: os.cpu_seconds,
            memory_bytes: os.memory_bytes,
            open_files: os.open_files,
            processes: os.processes,
            file_size_bytes: os.file_size_bytes,
        }
    }
}

impl LimitsConfig {
    /// Ceiling on the caller's deadline
    #[inline]
    #[must_use]
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    /// Wait for a killed worker's status
    #[inline]
    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// The setrlimit part
    #[must_use]
    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_seconds: self.cpu_seconds,
            memory_bytes: self.memory_bytes,
            open_files: self.open_files,
            processes: self.processes,
            file_size_bytes: self.file_size_bytes,
        }
    }
}

/// Confinement and identity for workers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Filesystem confinement mode
    pub confinement: Confinement,
    /// Identity workers drop to; a root broker defaults to `nobody`
    pub run_as: Option<Credentials>,
}

impl SandboxConfig {
    /// Identity workers actually run as, given the broker's effective uid
    ///
    /// `None` means the broker is unprivileged and workers keep its uid.
    #[must_use]
    pub fn worker_identity(&self, broker_uid: Uid) -> Option<Credentials> {
        self.run_as
            .or_else(|| broker_uid.is_root().then_some(Credentials::NOBODY))
    }
}

/// Everything the kernel needs to start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Time and resource ceilings
    pub limits: LimitsConfig,
    /// Table Validator limits and metadata policy
    pub table: ValidatorConfig,
    /// Worker confinement
    pub sandbox: SandboxConfig,
    /// Worker output ceilings
    pub buffers: OutputLimits,
    /// Where scratch directories are created
    pub scratch_root: PathBuf,
    /// Invocations allowed to run at once
    pub max_concurrent_invocations: usize,
    /// How to start the broker
    pub forkserver: ForkserverConfig,
    /// Package loader settings
    pub packages: LoaderConfig,
    /// Logging for the binary
    pub log: LogConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            limits: LimitsConfig::default(),
            table: ValidatorConfig::default(),
            sandbox: SandboxConfig::default(),
            buffers: OutputLimits::default(),
            scratch_root: std::env::temp_dir(),
            max_concurrent_invocations: 8,
            forkserver: ForkserverConfig::default(),
            packages: LoaderConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl KernelConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and validate a TOML file
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read, does not parse, or holds
    /// invalid values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate TOML text
    ///
    /// # Errors
    ///
    /// Fails when the text does not parse or holds invalid values.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.limits.max_timeout_ms == 0, "limits.max_timeout_ms must be positive"),
            (self.limits.cpu_seconds == 0, "limits.cpu_seconds must be positive"),
            (self.limits.memory_bytes == 0, "limits.memory_bytes must be positive"),
            (self.limits.open_files < 4, "limits.open_files must leave room for stdio"),
            (self.limits.processes == 0, "limits.processes must be positive"),
            (self.max_concurrent_invocations == 0, "max_concurrent_invocations must be positive"),
            (self.buffers.output_buffer_max_bytes == 0, "buffers.output_buffer_max_bytes must be positive"),
            (self.table.max_columns == 0, "table.max_columns must be positive"),
            (self.table.max_file_bytes == 0, "table.max_file_bytes must be positive"),
            (
                self.sandbox.run_as.is_some_and(Credentials::is_root),
                "sandbox.run_as must not be root",
            ),
            (self.packages.cache_capacity == 0, "packages.cache_capacity must be positive"),
        ];
        match checks.into_iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(ConfigError::Invalid(message.to_string())),
            None => Ok(()),
        }
    }

    /// Sandbox policy every worker gets from a broker running as `broker_uid`
    #[must_use]
    pub fn sandbox_policy(&self, broker_uid: Uid) -> SandboxPolicy {
        SandboxPolicy {
            limits: self.limits.resource_limits(),
            confinement: self.sandbox.confinement,
            run_as: self.sandbox.worker_identity(broker_uid),
        }
    }

    /// With a CPU-time ceiling for workers
    #[inline]
    #[must_use]
    pub fn with_cpu_seconds(mut self, cpu_seconds: u64) -> Self {
        self.limits.cpu_seconds = cpu_seconds;
        self
    }

    /// With a deadline ceiling
    #[inline]
    #[must_use]
    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.limits.max_timeout_ms = u64::try_from(max_timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With an address-space ceiling
    #[inline]
    #[must_use]
    pub fn with_memory_bytes(mut self, memory_bytes: u64) -> Self {
        self.limits.memory_bytes = memory_bytes;
        self
    }

    /// With a concurrency bound
    #[inline]
    #[must_use]
    pub fn with_max_concurrent_invocations(mut self, max: usize) -> Self {
        self.max_concurrent_invocations = max;
        self
    }

    /// With a scratch root
    #[inline]
    #[must_use]
    pub fn with_scratch_root(mut self, scratch_root: impl Into<PathBuf>) -> Self {
        self.scratch_root = scratch_root.into();
        self
    }

    /// With a broker executable
    #[inline]
    #[must_use]
    pub fn with_forkserver_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.forkserver = self.forkserver.with_program(program);
        self
    }

    /// With a package root
    #[inline]
    #[must_use]
    pub fn with_package_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.packages = self.packages.with_root(root);
        self
    }

    /// With a confinement mode
    #[inline]
    #[must_use]
    pub fn with_confinement(mut self, confinement: Confinement) -> Self {
        self.sandbox.confinement = confinement;
        self
    }

    /// With an unprivileged worker identity
    #[inline]
    #[must_use]
    pub fn with_run_as(mut self, run_as: Credentials) -> Self {
        self.sandbox.run_as = Some(run_as);
        self
    }

    /// With a metadata policy for the validator
    #[inline]
    #[must_use]
    pub fn with_metadata_policy(mut self, policy: MetadataPolicy) -> Self {
        self.table = self.table.with_metadata_policy(policy);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_toml_is_the_default() {
        assert_eq!(KernelConfig::from_toml("").unwrap(), KernelConfig::default());
    }

    #[test]
    fn sections_override_defaults() {
        let config = KernelConfig::from_toml(
            r#"
            scratch_root = "/srv/scratch"
            max_concurrent_invocations = 2

            [limits]
            max_timeout_ms = 1500
            memory_bytes = 536870912

            [table]
            max_rows = 10
            metadata_policy = "reject"

            [sandbox]
            confinement = "required"
            run_as = { uid = 65534, gid = 65534 }

            [buffers]
            log_buffer_max_bytes = 4096

            [packages]
            root = "/srv/modules"
            "#,
        )
        .unwrap();

        assert_eq!(config.scratch_root, PathBuf::from("/srv/scratch"));
        assert_eq!(config.limits.max_timeout(), Duration::from_millis(1500));
        assert_eq!(config.limits.cpu_seconds, LimitsConfig::default().cpu_seconds);
        assert_eq!(config.table.max_rows, 10);
        assert_eq!(config.table.metadata_policy, MetadataPolicy::Reject);
        assert_eq!(config.buffers.log_buffer_max_bytes, 4096);
        assert_eq!(config.buffers.output_buffer_max_bytes, OutputLimits::default().output_buffer_max_bytes);
        assert_eq!(config.packages.root, PathBuf::from("/srv/modules"));

        let policy = config.sandbox_policy(Uid::from_raw(1000));
        assert_eq!(policy.limits.memory_bytes, 536_870_912);
        assert_eq!(policy.confinement, Confinement::Required);
        assert_eq!(policy.run_as, Some(Credentials::NOBODY));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for text in [
            "max_concurrent_invocations = 0",
            "[limits]\nmax_timeout_ms = 0",
            "[limits]\nopen_files = 2",
            "[table]\nmax_file_bytes = 0",
            "[sandbox]\nrun_as = { uid = 0, gid = 0 }",
            "[sandbox]\nrun_as = { uid = 1000, gid = 0 }",
        ] {
            assert!(matches!(KernelConfig::from_toml(text), Err(ConfigError::Invalid(_))), "{text}");
        }
        assert!(matches!(KernelConfig::from_toml("limits = 3"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn root_brokers_default_workers_to_nobody() {
        let sandbox = SandboxConfig::default();
        assert_eq!(sandbox.worker_identity(Uid::from_raw(0)), Some(Credentials::NOBODY));
        assert_eq!(sandbox.worker_identity(Uid::from_raw(1000)), None);

        let chosen = Credentials { uid: 2000, gid: 2000 };
        let sandbox = SandboxConfig {
            run_as: Some(chosen),
            ..SandboxConfig::default()
        };
        assert_eq!(sandbox.worker_identity(Uid::from_raw(0)), Some(chosen));
        assert_eq!(
            KernelConfig::new().sandbox_policy(Uid::from_raw(0)).run_as,
            Some(Credentials::NOBODY)
        );
    }

    #[test]
    fn builders() {
        let config = KernelConfig::new()
            .with_max_timeout(Duration::from_secs(2))
            .with_max_concurrent_invocations(3)
            .with_confinement(Confinement::Disabled)
            .with_package_root("/m");
        assert_eq!(config.limits.max_timeout_ms, 2000);
        assert_eq!(config.max_concurrent_invocations, 3);
        assert_eq!(config.sandbox.confinement, Confinement::Disabled);
        assert_eq!(config.packages.root, PathBuf::from("/m"));
        assert!(config.validate().is_ok());
    }
}
