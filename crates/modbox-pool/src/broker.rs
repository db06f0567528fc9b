//! Forkserver broker
//!
//! Single-threaded loop run by the `forkserver` process. It waits on two
//! descriptors: the control socket and a signalfd for `SIGCHLD`. Spawn
//! requests fork the zygote; `SIGCHLD` drains every exited child and writes
//! its status record. Control EOF or `Shutdown` kills and reaps all live
//! workers, then returns.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, fork, getpid, pipe2, ForkResult, Pid};
use tracing::{debug, error, info, instrument, warn};

use crate::error::PoolError;
use crate::policy::SandboxPolicy;
use crate::protocol::{recv_message, send_message, ControlReply, ControlRequest, WorkerExit};
use crate::sandbox::{enter_sandbox, SANDBOX_FAILURE_EXIT_CODE};

/// Descriptor the broker finds its control socket on
pub const CONTROL_FD: RawFd = 3;

/// Pre-initialized process image
///
/// Built once in the broker. Each forked child calls [`Zygote::run_worker`]
/// exactly once, after its sandbox is in place, with the request on stdin
/// and the response channel on stdout.
pub trait Zygote {
    /// Serve one request; the return value is the worker's exit code
    fn run_worker(&self) -> i32;
}

/// Adopt the control socket inherited on [`CONTROL_FD`]
///
/// # Errors
///
/// Fails when no descriptor is open there.
pub fn control_from_inherited_fd() -> Result<UnixStream, PoolError> {
    fcntl(CONTROL_FD, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| PoolError::Protocol(format!("control socket not inherited on fd {CONTROL_FD}: {e}")))?;
    // SAFETY: fd 3 is open (checked above) and handed to us by the host for
    // exclusive use as the control socket.
    Ok(unsafe { UnixStream::from_raw_fd(CONTROL_FD) })
}

/// Parent-side ends of one worker's pipes, as sent to the host
struct HostEnds {
    stdin: OwnedFd,
    stdout: OwnedFd,
    stderr: OwnedFd,
    status: OwnedFd,
}

/// Child-side ends, moved onto 0/1/2 after fork
struct ChildEnds {
    stdin: OwnedFd,
    stdout: OwnedFd,
    stderr: OwnedFd,
}

struct Broker<'z, Z: Zygote> {
    control: UnixStream,
    signals: SignalFd,
    policy: SandboxPolicy,
    zygote: &'z Z,
    /// Live workers and the write end of their status pipes
    live: HashMap<Pid, File>,
}

/// Serve control requests until the host goes away
///
/// # Errors
///
/// Returns on a control-channel failure; the caller should exit and let
/// the host start a fresh broker.
#[instrument(skip_all, fields(pid = getpid().as_raw()))]
pub fn run_broker<Z: Zygote>(control: UnixStream, policy: SandboxPolicy, zygote: &Z) -> Result<(), PoolError> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.thread_block()?;
    let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)?;

    let mut broker = Broker {
        control,
        signals,
        policy,
        zygote,
        live: HashMap::new(),
    };
    info!("forkserver ready");
    let result = broker.serve();
    broker.shutdown();
    result
}

impl<Z: Zygote> Broker<'_, Z> {
    fn serve(&mut self) -> Result<(), PoolError> {
        loop {
            let (control_ready, child_ready) = {
                let mut fds = [
                    PollFd::new(self.control.as_fd(), PollFlags::POLLIN),
                    PollFd::new(self.signals.as_fd(), PollFlags::POLLIN),
                ];
                match poll(&mut fds, PollTimeout::NONE) {
                    Err(Errno::EINTR) => continue,
                    other => other?,
                };
                let ready = |fd: &PollFd<'_>| {
                    fd.revents()
                        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
                };
                (ready(&fds[0]), ready(&fds[1]))
            };

            if child_ready {
                while self.signals.read_signal()?.is_some() {}
                self.reap();
            }
            if control_ready && !self.handle_request()? {
                return Ok(());
            }
        }
    }

    /// Handle one request; `false` means stop serving
    fn handle_request(&mut self) -> Result<bool, PoolError> {
        let Some((request, fds)) = recv_message::<ControlRequest>(&self.control)? else {
            info!("control channel closed");
            return Ok(false);
        };
        if !fds.is_empty() {
            return Err(PoolError::Protocol("host sent descriptors".into()));
        }

        match request {
            ControlRequest::SpawnWorker {
                process_name,
                scratch_dir,
            } => match self.spawn(&process_name, &scratch_dir) {
                Ok((pid, ends)) => {
                    let raw = [
                        ends.stdin.as_raw_fd(),
                        ends.stdout.as_raw_fd(),
                        ends.stderr.as_raw_fd(),
                        ends.status.as_raw_fd(),
                    ];
                    send_message(&self.control, &ControlReply::Spawned { pid: pid.as_raw() }, &raw)?;
                }
                Err(e) => {
                    warn!(error = %e, "worker spawn failed");
                    send_message(&self.control, &ControlReply::Error { message: e.to_string() }, &[])?;
                }
            },
            ControlRequest::KillWorker { pid } => {
                let pid = Pid::from_raw(pid);
                let delivered = self.live.contains_key(&pid) && kill(pid, Signal::SIGKILL).is_ok();
                debug!(pid = pid.as_raw(), delivered, "kill requested");
                send_message(&self.control, &ControlReply::KillResult { delivered }, &[])?;
            }
            ControlRequest::Shutdown => {
                info!("shutdown requested");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn spawn(&mut self, process_name: &str, scratch_dir: &Path) -> Result<(Pid, HostEnds), PoolError> {
        let (stdin_r, stdin_w) = pipe2(OFlag::O_CLOEXEC)?;
        let (stdout_r, stdout_w) = pipe2(OFlag::O_CLOEXEC)?;
        let (stderr_r, stderr_w) = pipe2(OFlag::O_CLOEXEC)?;
        let (status_r, status_w) = pipe2(OFlag::O_CLOEXEC)?;
        let host = HostEnds {
            stdin: stdin_w,
            stdout: stdout_r,
            stderr: stderr_r,
            status: status_r,
        };
        let child = ChildEnds {
            stdin: stdin_r,
            stdout: stdout_w,
            stderr: stderr_w,
        };
        let broker_pid = getpid();

        // SAFETY: the broker is single-threaded, so the child inherits no
        // lock held by another thread.
        match unsafe { fork() }? {
            ForkResult::Child => self.become_worker(&host, &child, &status_w, process_name, scratch_dir, broker_pid),
            ForkResult::Parent { child: pid } => {
                drop(child);
                self.live.insert(pid, File::from(status_w));
                debug!(pid = pid.as_raw(), process_name, "worker forked");
                Ok((pid, host))
            }
        }
    }

    /// Child side of fork: detach from the broker, confine, run the zygote
    fn become_worker(
        &self,
        host: &HostEnds,
        child: &ChildEnds,
        status_w: &OwnedFd,
        process_name: &str,
        scratch_dir: &Path,
        broker_pid: Pid,
    ) -> ! {
        let mut inherited: Vec<RawFd> = vec![
            self.control.as_raw_fd(),
            self.signals.as_fd().as_raw_fd(),
            host.stdin.as_raw_fd(),
            host.stdout.as_raw_fd(),
            host.stderr.as_raw_fd(),
            host.status.as_raw_fd(),
            status_w.as_raw_fd(),
        ];
        inherited.extend(self.live.values().map(AsRawFd::as_raw_fd));
        for fd in inherited {
            let _ = close(fd);
        }

        let redirected = [(&child.stdin, 0), (&child.stdout, 1), (&child.stderr, 2)]
            .into_iter()
            .try_for_each(|(fd, target)| dup2(fd.as_raw_fd(), target).map(drop));
        for fd in [&child.stdin, &child.stdout, &child.stderr] {
            if fd.as_raw_fd() > 2 {
                let _ = close(fd.as_raw_fd());
            }
        }
        if redirected.is_err() {
            std::process::exit(SANDBOX_FAILURE_EXIT_CODE);
        }

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        if let Err(e) = mask
            .thread_unblock()
            .map_err(PoolError::from)
            .and_then(|()| enter_sandbox(&self.policy, process_name, scratch_dir, broker_pid))
        {
            eprintln!("modbox: {e}");
            std::process::exit(SANDBOX_FAILURE_EXIT_CODE);
        }

        let code = self.zygote.run_worker();
        let _ = std::io::stdout().flush();
        std::process::exit(code)
    }

    /// Collect every exited child and report it on its status pipe
    fn reap(&mut self) {
        loop {
            let (pid, exit) = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => (pid, WorkerExit::Exited(code)),
                Ok(WaitStatus::Signaled(pid, signal, _)) => (pid, WorkerExit::Signaled(signal as i32)),
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return,
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!(error = %e, "waitpid failed");
                    return;
                }
            };
            self.report(pid, exit);
        }
    }

    fn report(&mut self, pid: Pid, exit: WorkerExit) {
        let Some(mut status) = self.live.remove(&pid) else {
            debug!(pid = pid.as_raw(), ?exit, "reaped unknown child");
            return;
        };
        debug!(pid = pid.as_raw(), ?exit, "worker reaped");
        // The host may have stopped listening; the record is then moot.
        if let Err(e) = status.write_all(&exit.to_record()) {
            debug!(pid = pid.as_raw(), error = %e, "status record not delivered");
        }
    }

    fn shutdown(&mut self) {
        let pids: Vec<Pid> = self.live.keys().copied().collect();
        for pid in &pids {
            let _ = kill(*pid, Signal::SIGKILL);
        }
        for pid in pids {
            let exit = loop {
                match waitpid(pid, None) {
                    Ok(WaitStatus::Exited(_, code)) => break Some(WorkerExit::Exited(code)),
                    Ok(WaitStatus::Signaled(_, signal, _)) => break Some(WorkerExit::Signaled(signal as i32)),
                    Err(Errno::EINTR) | Ok(_) => continue,
                    Err(_) => break None,
                }
            };
            match exit {
                Some(exit) => self.report(pid, exit),
                None => {
                    self.live.remove(&pid);
                }
            }
        }
        info!("forkserver stopped");
    }
}
