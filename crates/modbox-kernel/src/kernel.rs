//! Kernel orchestrator
//!
//! Lifecycle of one `invoke`:
//! 1. fail fast if the package is known broken
//! 2. take a concurrency permit
//! 3. ask the broker for a fresh worker confined to the scratch directory
//! 4. send the code and request, collect output until exit or deadline
//! 5. map the outcome; certify any output table
//! 6. delete the scratch directory
//!
//! The worker is reaped by the broker and its handle is dropped before
//! `invoke` returns, on every path.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use modbox_package::{ModulePackage, PackageLoader, DEVELOP_VERSION};
use modbox_pool::{
    Credentials, Forkserver, PoolError, WorkerExit, WorkerHandle, WorkerOutput, WorkerState, SANDBOX_FAILURE_EXIT_CODE,
};
use modbox_runtime::RESPONSE_WRITE_FAILED_EXIT_CODE;
use modbox_table::{CertifiedTable, TableValidator, ValidationError};
use modbox_wire::{
    decode_frame, encode_frame, resolve_in, CallKind, FailureKind, FrameKind, InvocationOutput, InvocationRequest,
    InvocationResponse as WireResponse, WorkerInvocation,
};
use nix::sys::signal::Signal;
use nix::unistd::Uid;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::KernelConfig;
use crate::error::InvokeError;
use crate::invocation::Invocation;
use crate::response::{FetchOutcome, InvocationResponse, RenderOutcome};
use crate::scratch::ScratchDir;

/// Identity of a package that must not run again
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BrokenKey {
    id: String,
    version: String,
    /// `None` when the archive never loaded
    content_hash: Option<String>,
}

impl BrokenKey {
    fn of(package: &ModulePackage) -> Self {
        Self {
            id: package.id().to_string(),
            version: package.version().to_string(),
            content_hash: Some(package.content_hash().to_string()),
        }
    }

    fn unloadable(id: &str, version: &str) -> Self {
        Self {
            id: id.to_string(),
            version: version.to_string(),
            content_hash: None,
        }
    }
}

/// The entry point the rest of the host calls
#[derive(Debug)]
pub struct Kernel {
    config: KernelConfig,
    forkserver: Arc<Forkserver>,
    loader: PackageLoader,
    validator: TableValidator,
    permits: Semaphore,
    broken: DashMap<BrokenKey, String>,
    /// Worker identity scratch directories are handed to
    run_as: Option<Credentials>,
}

impl Kernel {
    /// Validate `config`, prepare the scratch root and start the broker
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or when the broker cannot start.
    #[instrument(skip_all)]
    pub fn start(config: KernelConfig) -> Result<Self, InvokeError> {
        config.validate()?;
        let policy = config.sandbox_policy(Uid::effective());
        if policy.run_as.is_none() {
            warn!("no sandbox.run_as and not root; workers keep the host's uid");
        }
        prepare_scratch_root(&config.scratch_root, policy.run_as).map_err(InvokeError::Scratch)?;
        let forkserver = Forkserver::start(&config.forkserver, &policy)?;
        info!(
            broker = forkserver.pid(),
            scratch_root = %config.scratch_root.display(),
            max_concurrent = config.max_concurrent_invocations,
            run_as = ?policy.run_as,
            "kernel started"
        );
        Ok(Self {
            run_as: policy.run_as,
            loader: PackageLoader::new(&config.packages),
            validator: TableValidator::new(config.table.clone()),
            permits: Semaphore::new(config.max_concurrent_invocations),
            broken: DashMap::new(),
            forkserver: Arc::new(forkserver),
            config,
        })
    }

    /// Stop accepting invocations and stop the broker
    ///
    /// Workers still running are killed by the broker.
    ///
    /// # Errors
    ///
    /// Fails only if the broker cannot be waited for.
    #[instrument(skip_all)]
    pub fn shutdown(&self) -> Result<(), InvokeError> {
        self.permits.close();
        self.forkserver.shutdown()?;
        info!("kernel stopped");
        Ok(())
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Package loader
    #[inline]
    #[must_use]
    pub fn loader(&self) -> &PackageLoader {
        &self.loader
    }

    /// Check whether the broker is still running
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.forkserver.is_alive()
    }

    /// Create a scratch directory for one invocation
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be created or handed to `run_as`.
    pub fn scratch_dir(&self) -> Result<ScratchDir, InvokeError> {
        ScratchDir::new_in(&self.config.scratch_root, self.run_as).map_err(InvokeError::Scratch)
    }

    /// Load `(id, version)` and invoke it
    ///
    /// A package that fails to load because its archive, spec or code is
    /// bad is remembered; later calls for the same published version fail
    /// with [`InvokeError::ModuleBroken`] without touching the disk.
    ///
    /// # Errors
    ///
    /// As [`Kernel::invoke`], plus load failures.
    pub async fn invoke_module(
        &self,
        id: &str,
        version: &str,
        invocation: Invocation,
        timeout: Duration,
    ) -> Result<InvocationResponse, InvokeError> {
        let unloadable = BrokenKey::unloadable(id, version);
        if let Some(reason) = self.broken.get(&unloadable) {
            return Err(InvokeError::ModuleBroken(reason.clone()));
        }
        let package = match self.loader.load(id, version).await {
            Ok(package) => package,
            Err(e) if e.is_package_broken() => {
                warn!(id, version, error = %e, "package is broken");
                if version != DEVELOP_VERSION {
                    self.broken.insert(unloadable, e.to_string());
                }
                return Err(InvokeError::ModuleBroken(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        self.invoke(&package, invocation, timeout).await
    }

    /// Run `invocation` against `package` in a fresh worker
    ///
    /// The effective deadline is the smaller of `timeout` and the
    /// configured ceiling.
    ///
    /// # Errors
    ///
    /// - [`InvokeError::ModuleTimeout`] when the deadline passes
    /// - [`InvokeError::ModuleExited`] for a crash, a non-zero exit, a
    ///   module failure, or a response that breaks the protocol
    /// - [`InvokeError::ModuleBroken`] when the code does not compile
    /// - [`InvokeError::Validation`] when the output table is rejected
    /// - infrastructure errors from the pool or the scratch directory
    #[instrument(
        skip_all,
        fields(
            module = package.id(),
            version = package.version(),
            kind = %invocation.call_kind(),
            invocation_id = %Uuid::new_v4(),
        )
    )]
    pub async fn invoke(
        &self,
        package: &ModulePackage,
        invocation: Invocation,
        timeout: Duration,
    ) -> Result<InvocationResponse, InvokeError> {
        let key = BrokenKey::of(package);
        if let Some(reason) = self.broken.get(&key) {
            return Err(InvokeError::ModuleBroken(reason.clone()));
        }

        let (scratch, request) = invocation.into_parts();
        let kind = request.call_kind();
        if !package.has_entry_point(kind) {
            if let InvocationRequest::MigrateParams(migrate) = request {
                debug!("no migrate_params(); parameters unchanged");
                return Ok(InvocationResponse::MigrateParams(migrate.params));
            }
            return Err(InvokeError::ModuleExited {
                exit: None,
                diagnostic: format!("module defines no {kind}() function"),
            });
        }
        let expected_output = request.output_filename().map(str::to_string);
        let payload = encode_frame(
            FrameKind::WorkerInvocation,
            &WorkerInvocation {
                code: package.code_unit(),
                request,
            },
        )?;

        let _permit = self.permits.acquire().await.map_err(|_| InvokeError::ShutDown)?;
        let timeout = timeout.min(self.config.limits.max_timeout());
        let output = {
            let mut worker = self.spawn(package.id(), scratch.path()).await?;
            let deadline = Instant::now() + timeout;
            worker
                .run(&payload, deadline, self.config.buffers, self.config.limits.kill_grace())
                .await?
        };
        debug!(
            state = ?output.state,
            exit = ?output.exit,
            elapsed_ms = u64::try_from(output.elapsed.as_millis()).unwrap_or(u64::MAX),
            "worker finished"
        );

        let result = self
            .collect(&key, kind, expected_output.as_deref(), &scratch, &output, timeout)
            .await;
        // A failed cleanup is logged inside close(); the invocation result stands.
        let _ = scratch.close();
        result
    }

    #[instrument(skip_all, fields(module = module_id))]
    async fn spawn(&self, module_id: &str, scratch: &Path) -> Result<WorkerHandle, InvokeError> {
        let forkserver = Arc::clone(&self.forkserver);
        let process_name = format!("modbox:{module_id}");
        let scratch = scratch.to_path_buf();
        let spawned = tokio::task::spawn_blocking(move || forkserver.spawn_worker(&process_name, &scratch))
            .await
            .map_err(|e| PoolError::SpawnFailed(format!("spawn task failed: {e}")))?;
        spawned.map_err(|e| {
            if e.is_broker_failure() {
                error!(error = %e, "forkserver failure");
            }
            InvokeError::from(e)
        })
    }

    async fn collect(
        &self,
        key: &BrokenKey,
        kind: CallKind,
        expected_output: Option<&str>,
        scratch: &ScratchDir,
        output: &WorkerOutput,
        timeout: Duration,
    ) -> Result<InvocationResponse, InvokeError> {
        match output.state {
            WorkerState::TimedOut => {
                return Err(InvokeError::ModuleTimeout {
                    timeout,
                    pid: output.pid,
                    log: output.stderr_text(),
                })
            }
            WorkerState::Completed if !output.stdout_overflowed => {}
            _ => return Err(exited(output, describe_exit(output))),
        }

        let response: WireResponse = decode_frame(&output.stdout, FrameKind::InvocationResponse)
            .map_err(|e| exited(output, format!("invalid response frame: {e}")))?;
        let produced = match response {
            WireResponse::Ok { output: produced } => produced,
            WireResponse::Failed(failure) if failure.error_kind == FailureKind::CompileError => {
                warn!(error = %failure, "module does not compile; marking broken");
                self.broken.insert(key.clone(), failure.diagnostic_message.clone());
                return Err(InvokeError::ModuleBroken(failure.diagnostic_message));
            }
            WireResponse::Failed(failure) => return Err(exited(output, failure.to_string())),
        };
        if produced.call_kind() != kind {
            return Err(exited(
                output,
                format!("answered a {kind} request with {} output", produced.call_kind()),
            ));
        }

        match produced {
            InvocationOutput::Render(result) => {
                let certified = self.certify(scratch, expected_output, &result.table_filename, output).await?;
                Ok(InvocationResponse::Render(RenderOutcome {
                    table: certified.table,
                    errors: result.errors,
                    json: result.json,
                    warnings: certified.warnings,
                }))
            }
            InvocationOutput::Fetch(result) => {
                let certified = self.certify(scratch, expected_output, &result.filename, output).await?;
                Ok(InvocationResponse::Fetch(FetchOutcome {
                    table: certified.table,
                    errors: result.errors,
                    warnings: certified.warnings,
                }))
            }
            InvocationOutput::MigrateParams(result) => Ok(InvocationResponse::MigrateParams(result.params)),
        }
    }

    async fn certify(
        &self,
        scratch: &ScratchDir,
        expected: Option<&str>,
        reported: &str,
        output: &WorkerOutput,
    ) -> Result<CertifiedTable, InvokeError> {
        if expected != Some(reported) {
            return Err(exited(
                output,
                format!("reported output {reported:?}, expected {expected:?}"),
            ));
        }
        let path = resolve_in(scratch.path(), reported)?;
        let validator = self.validator.clone();
        let certified = tokio::task::spawn_blocking(move || validator.certify(&path))
            .await
            .map_err(|e| ValidationError::DecoderPanicked(e.to_string()))??;
        for warning in &certified.warnings {
            warn!(%warning, "output metadata dropped");
        }
        Ok(certified)
    }
}

/// Create `root` and let `run_as` search it, so workers reach their own directories
fn prepare_scratch_root(root: &Path, run_as: Option<Credentials>) -> std::io::Result<()> {
    std::fs::create_dir_all(root)?;
    if run_as.is_none() {
        return Ok(());
    }
    let mut permissions = std::fs::metadata(root)?.permissions();
    let mode = permissions.mode();
    if mode & 0o001 == 0 {
        permissions.set_mode(mode | 0o001);
        std::fs::set_permissions(root, permissions)?;
    }
    Ok(())
}

fn exited(output: &WorkerOutput, what: String) -> InvokeError {
    let log = output.stderr_text();
    let log = log.trim_end();
    let diagnostic = if log.is_empty() { what } else { format!("{what}\n{log}") };
    InvokeError::ModuleExited {
        exit: output.exit,
        diagnostic,
    }
}

fn describe_exit(output: &WorkerOutput) -> String {
    if output.stdout_overflowed {
        return "response exceeded the output buffer".to_string();
    }
    match output.exit {
        Some(WorkerExit::Exited(SANDBOX_FAILURE_EXIT_CODE)) => "sandbox setup failed".to_string(),
        Some(WorkerExit::Exited(RESPONSE_WRITE_FAILED_EXIT_CODE)) => "worker could not write its response".to_string(),
        Some(WorkerExit::Exited(code)) => format!("exited with code {code}"),
        Some(WorkerExit::Signaled(signal)) => match Signal::try_from(signal) {
            Ok(Signal::SIGSYS) => "killed by SIGSYS: disallowed system call".to_string(),
            Ok(Signal::SIGXCPU) => "killed by SIGXCPU: CPU time limit exceeded".to_string(),
            Ok(name) => format!("killed by {name}"),
            Err(_) => format!("killed by signal {signal}"),
        },
        None => "exit status lost".to_string(),
    }
}
