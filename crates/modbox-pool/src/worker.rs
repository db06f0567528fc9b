//! Worker handle
//!
//! One sandboxed process, used for exactly one invocation. The handle owns
//! the host ends of the worker's pipes and tracks its lifecycle:
//!
//! ```text
//! Spawned -> Running -> { Completed | TimedOut | Crashed | Killed }
//! Spawned -> Killed
//! ```
//!
//! Terminal states are final. A handle dropped before reaching one kills
//! its worker.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::client::BrokerLink;
use crate::error::PoolError;
use crate::protocol::WorkerExit;

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Forked, request not yet sent
    Spawned,
    /// Request sent, waiting for completion
    Running,
    /// Exited cleanly
    Completed,
    /// Killed at the deadline
    TimedOut,
    /// Exited non-zero or died from a signal
    Crashed,
    /// Killed on request
    Killed,
}

impl WorkerState {
    /// Check if no further transition is possible
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        allowed_transitions(self).is_empty()
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: WorkerState) -> &'static [WorkerState] {
    use WorkerState::{Completed, Crashed, Killed, Running, Spawned, TimedOut};
    match from {
        Spawned => &[Running, Killed],
        Running => &[Completed, TimedOut, Crashed, Killed],
        Completed | TimedOut | Crashed | Killed => &[],
    }
}

/// Check one transition
///
/// # Errors
///
/// Returns [`PoolError::IllegalTransition`] when `to` is not reachable.
pub fn validate_transition(from: WorkerState, to: WorkerState) -> Result<(), PoolError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(PoolError::IllegalTransition { from, to })
    }
}

/// Byte ceilings on what a worker may send back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputLimits {
    /// Response channel (stdout)
    pub output_buffer_max_bytes: usize,
    /// Log channel (stderr)
    pub log_buffer_max_bytes: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            output_buffer_max_bytes: 2 * 1024 * 1024,
            log_buffer_max_bytes: 100 * 1024,
        }
    }
}

/// Everything collected from one worker run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutput {
    /// Worker process id
    pub pid: i32,
    /// Terminal state reached
    pub state: WorkerState,
    /// Exit status, if the broker reported one
    pub exit: Option<WorkerExit>,
    /// Response channel bytes, up to the limit
    pub stdout: Vec<u8>,
    /// Response channel exceeded its limit
    pub stdout_overflowed: bool,
    /// Log channel bytes, up to the limit
    pub stderr: Vec<u8>,
    /// Log channel exceeded its limit
    pub stderr_overflowed: bool,
    /// Wall-clock time from request to completion
    pub elapsed: Duration,
}

impl WorkerOutput {
    /// Log output as text, with a marker when it was cut short
    #[must_use]
    pub fn stderr_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_overflowed {
            text.push_str("\n[log truncated]");
        }
        text
    }
}

/// Buffer that keeps the first `limit` bytes and drops the rest
#[derive(Debug)]
struct CappedBuffer {
    data: Vec<u8>,
    limit: usize,
    overflowed: bool,
}

impl CappedBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            overflowed: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if bytes.len() > room {
            self.overflowed = true;
        }
        self.data.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }
}

/// Host-side handle for one worker
#[derive(Debug)]
pub struct WorkerHandle {
    pid: i32,
    state: WorkerState,
    link: Arc<BrokerLink>,
    stdin: Option<pipe::Sender>,
    stdout: pipe::Receiver,
    stderr: pipe::Receiver,
    status: pipe::Receiver,
}

impl WorkerHandle {
    pub(crate) fn new(
        pid: i32,
        link: Arc<BrokerLink>,
        stdin: OwnedFd,
        stdout: OwnedFd,
        stderr: OwnedFd,
        status: OwnedFd,
    ) -> Result<Self, PoolError> {
        Ok(Self {
            pid,
            state: WorkerState::Spawned,
            link,
            stdin: Some(pipe::Sender::from_owned_fd(stdin)?),
            stdout: pipe::Receiver::from_owned_fd(stdout)?,
            stderr: pipe::Receiver::from_owned_fd(stderr)?,
            status: pipe::Receiver::from_owned_fd(status)?,
        })
    }

    /// Worker process id
    #[inline]
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, to: WorkerState) -> Result<(), PoolError> {
        validate_transition(self.state, to)?;
        debug!(pid = self.pid, from = ?self.state, ?to, "worker transition");
        self.state = to;
        Ok(())
    }

    /// Send `payload`, collect output until exit or `deadline`
    ///
    /// On deadline the worker is killed through the broker and its exit
    /// status is awaited for at most `grace`.
    ///
    /// # Errors
    ///
    /// Fails only on state-machine misuse; worker misbehaviour is reported
    /// through the returned [`WorkerOutput`].
    #[instrument(skip(self, payload, limits, grace), fields(pid = self.pid, bytes = payload.len()))]
    pub async fn run(
        &mut self,
        payload: &[u8],
        deadline: Instant,
        limits: OutputLimits,
        grace: Duration,
    ) -> Result<WorkerOutput, PoolError> {
        self.transition(WorkerState::Running)?;
        let started = Instant::now();
        let mut stdout = CappedBuffer::new(limits.output_buffer_max_bytes);
        let mut stderr = CappedBuffer::new(limits.log_buffer_max_bytes);

        let finished = {
            let io = async {
                tokio::join!(
                    feed(self.stdin.take(), payload),
                    drain(&mut self.stdout, &mut stdout),
                    drain(&mut self.stderr, &mut stderr),
                    read_status(&mut self.status),
                )
            };
            tokio::time::timeout_at(deadline, io).await
        };

        let (state, exit) = match finished {
            Ok((fed, out, err, status)) => {
                for (channel, result) in [("stdin", fed), ("stdout", out), ("stderr", err)] {
                    if let Err(e) = result {
                        debug!(pid = self.pid, channel, error = %e, "worker pipe error");
                    }
                }
                let exit = status.unwrap_or_else(|e| {
                    warn!(pid = self.pid, error = %e, "status pipe failed");
                    None
                });
                let state = match exit {
                    Some(exit) if exit.success() => WorkerState::Completed,
                    _ => WorkerState::Crashed,
                };
                (state, exit)
            }
            Err(_) => {
                warn!(pid = self.pid, "deadline exceeded; killing worker");
                (WorkerState::TimedOut, self.kill_and_collect(grace).await)
            }
        };
        self.transition(state)?;

        Ok(WorkerOutput {
            pid: self.pid,
            state,
            exit,
            stdout: stdout.data,
            stdout_overflowed: stdout.overflowed,
            stderr: stderr.data,
            stderr_overflowed: stderr.overflowed,
            elapsed: started.elapsed(),
        })
    }

    /// Kill the worker before it finishes
    ///
    /// # Errors
    ///
    /// Fails when the worker is already in a terminal state.
    pub async fn kill(&mut self, grace: Duration) -> Result<Option<WorkerExit>, PoolError> {
        validate_transition(self.state, WorkerState::Killed)?;
        let exit = self.kill_and_collect(grace).await;
        self.transition(WorkerState::Killed)?;
        Ok(exit)
    }

    async fn kill_and_collect(&mut self, grace: Duration) -> Option<WorkerExit> {
        let link = Arc::clone(&self.link);
        let pid = self.pid;
        match tokio::task::spawn_blocking(move || link.kill_worker(pid)).await {
            Ok(Ok(delivered)) => debug!(pid, delivered, "kill sent"),
            Ok(Err(e)) => warn!(pid, error = %e, "kill request failed"),
            Err(e) => warn!(pid, error = %e, "kill task failed"),
        }
        match tokio::time::timeout(grace, read_status(&mut self.status)).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => {
                warn!(pid, error = %e, "status pipe failed");
                None
            }
            Err(_) => {
                warn!(pid, ?grace, "worker not reaped within grace period");
                None
            }
        }
    }
}

// The kill is a blocking broker round trip, so inside a runtime it goes to
// the blocking pool rather than stalling whichever task dropped us.
impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        warn!(pid = self.pid, state = ?self.state, "dropping live worker; killing it");
        let link = Arc::clone(&self.link);
        let pid = self.pid;
        let kill = move || {
            if let Err(e) = link.kill_worker(pid) {
                warn!(pid, error = %e, "kill on drop failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => drop(runtime.spawn_blocking(kill)),
            Err(_) => kill(),
        }
    }
}

async fn feed(stdin: Option<pipe::Sender>, payload: &[u8]) -> std::io::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    match stdin.write_all(payload).await {
        // The worker exited without reading; its status says why.
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

async fn drain(reader: &mut pipe::Receiver, buffer: &mut CappedBuffer) -> std::io::Result<()> {
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.push(&chunk[..n]);
    }
}

async fn read_status(status: &mut pipe::Receiver) -> std::io::Result<Option<WorkerExit>> {
    let mut record = [0u8; WorkerExit::RECORD_BYTES];
    match status.read_exact(&mut record).await {
        Ok(_) => Ok(WorkerExit::from_record(record)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{recv_message, send_message, ControlReply, ControlRequest};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::os::unix::net::UnixStream;

    const ALL: [WorkerState; 6] = [
        WorkerState::Spawned,
        WorkerState::Running,
        WorkerState::Completed,
        WorkerState::TimedOut,
        WorkerState::Crashed,
        WorkerState::Killed,
    ];

    #[test]
    fn lifecycle_transitions() {
        assert!(validate_transition(WorkerState::Spawned, WorkerState::Running).is_ok());
        assert!(validate_transition(WorkerState::Running, WorkerState::TimedOut).is_ok());
        assert!(validate_transition(WorkerState::Spawned, WorkerState::Killed).is_ok());

        assert!(validate_transition(WorkerState::Spawned, WorkerState::Completed).is_err());
        assert!(validate_transition(WorkerState::Completed, WorkerState::Running).is_err());
        assert!(validate_transition(WorkerState::Killed, WorkerState::Killed).is_err());
    }

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![WorkerState::Completed, WorkerState::TimedOut, WorkerState::Crashed, WorkerState::Killed]
        );
    }

    #[test]
    fn capped_buffer_keeps_prefix() {
        let mut buffer = CappedBuffer::new(5);
        buffer.push(b"abc");
        assert!(!buffer.overflowed);
        buffer.push(b"defg");
        buffer.push(b"h");
        assert!(buffer.overflowed);
        assert_eq!(buffer.data, b"abcde");
    }

    #[tokio::test]
    async fn drain_flags_overflow_but_reads_to_eof() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut receiver = pipe::Receiver::from_owned_fd(read_end).unwrap();
        let writer = std::thread::spawn(move || {
            let mut file = std::fs::File::from(write_end);
            std::io::Write::write_all(&mut file, &vec![b'x'; 200_000]).unwrap();
        });

        let mut buffer = CappedBuffer::new(1024);
        drain(&mut receiver, &mut buffer).await.unwrap();
        writer.join().unwrap();
        assert_eq!(buffer.data.len(), 1024);
        assert!(buffer.overflowed);
    }

    #[tokio::test]
    async fn status_record_or_eof() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut receiver = pipe::Receiver::from_owned_fd(read_end).unwrap();
        nix::unistd::write(&write_end, &WorkerExit::Signaled(9).to_record()).unwrap();
        drop(write_end);
        assert_eq!(read_status(&mut receiver).await.unwrap(), Some(WorkerExit::Signaled(9)));
        assert_eq!(read_status(&mut receiver).await.unwrap(), None);
    }

    #[tokio::test]
    async fn dropping_a_live_worker_kills_it_off_the_runtime_thread() {
        let (host, broker) = UnixStream::pair().unwrap();
        let (stdin_r, stdin_w) = nix::unistd::pipe().unwrap();
        let (stdout_r, _stdout_w) = nix::unistd::pipe().unwrap();
        let (stderr_r, _stderr_w) = nix::unistd::pipe().unwrap();
        let (status_r, _status_w) = nix::unistd::pipe().unwrap();
        drop(stdin_r);
        let handle = WorkerHandle::new(4242, Arc::new(BrokerLink::new(host)), stdin_w, stdout_r, stderr_r, status_r)
            .unwrap();

        // Nothing answers the kill yet; on this single-threaded runtime an
        // inline round trip would never return.
        drop(handle);

        let request = tokio::task::spawn_blocking(move || {
            let (request, _) = recv_message::<ControlRequest>(&broker).unwrap().unwrap();
            send_message(&broker, &ControlReply::KillResult { delivered: true }, &[]).unwrap();
            request
        })
        .await
        .unwrap();
        assert_eq!(request, ControlRequest::KillWorker { pid: 4242 });
    }

    proptest! {
        #[test]
        fn prop_transitions_match_table(from in 0usize..6, to in 0usize..6) {
            let (from, to) = (ALL[from], ALL[to]);
            let allowed = allowed_transitions(from).contains(&to);
            prop_assert_eq!(validate_transition(from, to).is_ok(), allowed);
            if from.is_terminal() {
                prop_assert!(!allowed);
            }
        }
    }
}
