//! Host side of the forkserver
//!
//! [`Forkserver::start`] re-executes a program (by default the current
//! executable) as the broker, passing one end of a socketpair on
//! [`CONTROL_FD`]. Requests are blocking and serialized by a mutex; async
//! callers run them on the blocking pool.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::dup2;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::broker::CONTROL_FD;
use crate::error::PoolError;
use crate::policy::SandboxPolicy;
use crate::protocol::{recv_message, send_message, ControlReply, ControlRequest};
use crate::worker::WorkerHandle;

/// How to start the broker process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkserverConfig {
    /// Broker executable; `None` means the current executable
    pub program: Option<PathBuf>,
    /// Arguments selecting broker mode; `--policy <json>` is appended
    pub args: Vec<String>,
}

impl Default for ForkserverConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["forkserver".to_string()],
        }
    }
}

impl ForkserverConfig {
    /// Use `program` as the broker executable
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }
}

/// Connection to a running broker, shared with its workers
#[derive(Debug)]
pub(crate) struct BrokerLink {
    control: Mutex<UnixStream>,
}

impl BrokerLink {
    pub(crate) fn new(control: UnixStream) -> Self {
        Self {
            control: Mutex::new(control),
        }
    }

    fn request(&self, request: &ControlRequest) -> Result<(ControlReply, Vec<OwnedFd>), PoolError> {
        let control = self.control.lock();
        send_message(&control, request, &[]).map_err(gone_on_pipe)?;
        recv_message(&control)?.ok_or(PoolError::BrokerGone)
    }

    /// SIGKILL a worker; `false` if the broker no longer tracks it
    pub(crate) fn kill_worker(&self, pid: i32) -> Result<bool, PoolError> {
        match self.request(&ControlRequest::KillWorker { pid })? {
            (ControlReply::KillResult { delivered }, fds) if fds.is_empty() => Ok(delivered),
            (reply, _) => Err(PoolError::Protocol(format!("unexpected reply to kill: {reply:?}"))),
        }
    }
}

/// Running broker process
#[derive(Debug)]
pub struct Forkserver {
    link: Arc<BrokerLink>,
    process: Mutex<Child>,
    pid: u32,
}

impl Forkserver {
    /// Start a broker that applies `policy` to every worker
    ///
    /// # Errors
    ///
    /// Fails when the program cannot be located or spawned.
    #[instrument(skip_all)]
    pub fn start(config: &ForkserverConfig, policy: &SandboxPolicy) -> Result<Self, PoolError> {
        let program = match &config.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(PoolError::StartFailed)?,
        };
        let (host, broker) = UnixStream::pair()?;
        let broker_fd = broker.as_raw_fd();

        let mut command = Command::new(&program);
        command
            .args(&config.args)
            .arg("--policy")
            .arg(serde_json::to_string(policy)?)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        // SAFETY: the hook only calls dup2/fcntl, which are async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                if broker_fd == CONTROL_FD {
                    fcntl(CONTROL_FD, FcntlArg::F_SETFD(FdFlag::empty()))?;
                } else {
                    dup2(broker_fd, CONTROL_FD)?;
                }
                Ok(())
            });
        }
        let process = command.spawn().map_err(PoolError::StartFailed)?;
        drop(broker);

        let pid = process.id();
        info!(pid, program = %program.display(), "forkserver started");
        Ok(Self {
            link: Arc::new(BrokerLink::new(host)),
            process: Mutex::new(process),
            pid,
        })
    }

    /// Broker process id
    #[inline]
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Fork a worker confined to `scratch_dir`
    ///
    /// Blocking; call from a blocking context inside a Tokio runtime, since
    /// the returned handle registers its pipes with the reactor.
    ///
    /// # Errors
    ///
    /// Fails when the broker cannot fork or has gone away.
    #[instrument(skip(self, scratch_dir), fields(scratch = %scratch_dir.display()))]
    pub fn spawn_worker(&self, process_name: &str, scratch_dir: &Path) -> Result<WorkerHandle, PoolError> {
        let request = ControlRequest::SpawnWorker {
            process_name: process_name.to_string(),
            scratch_dir: scratch_dir.to_path_buf(),
        };
        match self.link.request(&request)? {
            (ControlReply::Spawned { pid }, fds) => {
                let [stdin, stdout, stderr, status]: [OwnedFd; 4] = fds
                    .try_into()
                    .map_err(|fds: Vec<OwnedFd>| PoolError::Protocol(format!("spawn reply carried {} descriptors", fds.len())))?;
                debug!(pid, "worker spawned");
                WorkerHandle::new(pid, Arc::clone(&self.link), stdin, stdout, stderr, status)
            }
            (ControlReply::Error { message }, _) => Err(PoolError::SpawnFailed(message)),
            (reply, _) => Err(PoolError::Protocol(format!("unexpected reply to spawn: {reply:?}"))),
        }
    }

    /// SIGKILL a worker by pid
    ///
    /// # Errors
    ///
    /// Fails when the broker has gone away.
    pub fn kill_worker(&self, pid: i32) -> Result<bool, PoolError> {
        self.link.kill_worker(pid)
    }

    /// Check whether the broker process is still running
    #[must_use]
    pub fn is_alive(&self) -> bool {
        matches!(self.process.lock().try_wait(), Ok(None))
    }

    /// Ask the broker to kill its workers and exit, then wait for it
    ///
    /// # Errors
    ///
    /// Fails only if waiting on the broker fails.
    #[instrument(skip(self), fields(pid = self.pid))]
    pub fn shutdown(&self) -> Result<(), PoolError> {
        let mut process = self.process.lock();
        if process.try_wait()?.is_some() {
            return Ok(());
        }
        {
            let control = self.link.control.lock();
            if let Err(e) = send_message(&control, &ControlRequest::Shutdown, &[]) {
                warn!(error = %e, "shutdown request failed; killing forkserver");
                process.kill()?;
            }
        }
        let status = process.wait()?;
        info!(%status, "forkserver exited");
        Ok(())
    }
}

impl Drop for Forkserver {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "forkserver shutdown failed");
        }
    }
}

fn gone_on_pipe(error: PoolError) -> PoolError {
    match error {
        PoolError::Sys(nix::errno::Errno::EPIPE | nix::errno::Errno::ECONNRESET) => PoolError::BrokerGone,
        PoolError::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe => PoolError::BrokerGone,
        other => other,
    }
}
