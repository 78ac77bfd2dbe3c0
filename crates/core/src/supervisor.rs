//! Supervised execution of the test-driver.
//!
//! The driver spawns many descendants (VM setup helpers, log shippers,
//! ...). [`ProcessSupervisor`] starts it as the leader of a fresh process
//! group so the whole tree can be signalled at once, waits for it with a
//! timeout, and always sends `SIGTERM` to the group afterwards so that no
//! stray descendant outlives the run. A timed-out or cancelled group is
//! finished off with `SIGKILL` once its leader has been reaped.
//!
//! Cancellation is token based: the supervisor fires its
//! [`CancellationToken`] when the timeout elapses, and an external
//! cancel (e.g. Ctrl-C) fires the same token from outside.

use std::io;
use std::time::Duration;

use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use crate::command::{exit_code, CommandSpec};
use crate::names::TIMEOUT_EXIT_CODE;

/// Time the group leader gets to exit after `SIGTERM` before the whole
/// group is sent `SIGKILL`.
const DEFAULT_REAP_GRACE: Duration = Duration::from_secs(10);

/// Exit code reported when the run was cancelled from outside.
pub const CANCELLED_EXIT_CODE: i32 = 130;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisedExit {
    /// The process exited by itself with this code.
    Exited(i32),
    /// The timeout elapsed first.
    TimedOut,
    /// The cancellation token fired before the timeout.
    Cancelled,
}

impl SupervisedExit {
    /// Exit code as reported to the rest of the run.
    pub fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::TimedOut => TIMEOUT_EXIT_CODE,
            Self::Cancelled => CANCELLED_EXIT_CODE,
        }
    }
}

/// Result of signalling a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Signalled,
    /// No process is left in the group.
    AlreadyExited,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Spawned process has no pid (already reaped)")]
    MissingPid,

    #[error("Failed waiting for the supervised process: {0}")]
    Wait(#[source] io::Error),
}

// ---------------------------------------------------------------------------
// Process groups
// ---------------------------------------------------------------------------

/// Send `signal` to every process in group `pgid`.
///
/// A group that no longer exists (`ESRCH`) is reported as
/// [`KillOutcome::AlreadyExited`], not as an error: the group may exit
/// between the wait finishing and the signal being sent.
pub fn try_kill_group(pgid: i32, signal: i32) -> io::Result<KillOutcome> {
    if pgid <= 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {pgid}"),
        ));
    }
    // SAFETY: killpg takes plain integers and has no memory-safety
    // preconditions.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        return Ok(KillOutcome::Signalled);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(KillOutcome::AlreadyExited)
    } else {
        Err(err)
    }
}

/// A spawned child that leads its own process group.
pub struct ProcessHandle {
    child: Child,
    pgid: i32,
}

impl ProcessHandle {
    /// Spawn `spec` as the leader of a new process group.
    pub fn spawn(spec: &CommandSpec) -> Result<Self, SupervisorError> {
        let mut cmd = spec.to_command();
        cmd.process_group(0).kill_on_drop(true);
        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        // With process_group(0) the group id equals the leader's pid.
        let pgid = child.id().ok_or(SupervisorError::MissingPid)? as i32;
        Ok(Self { child, pgid })
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Signal the whole group, logging instead of failing.
    fn signal_group(&self, signal: i32) {
        match try_kill_group(self.pgid, signal) {
            Ok(KillOutcome::Signalled) => {
                tracing::debug!(pgid = self.pgid, signal, "Signalled process group");
            }
            Ok(KillOutcome::AlreadyExited) => {
                tracing::debug!(pgid = self.pgid, "Process group already exited");
            }
            Err(e) => {
                tracing::warn!(pgid = self.pgid, signal, error = %e, "Failed to signal process group");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Runs one command with a timeout and group-wide termination.
pub struct ProcessSupervisor {
    timeout: Duration,
    cancel: CancellationToken,
    reap_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            timeout,
            cancel,
            reap_grace: DEFAULT_REAP_GRACE,
        }
    }

    pub fn with_reap_grace(mut self, grace: Duration) -> Self {
        self.reap_grace = grace;
        self
    }

    /// Token fired on timeout; firing it externally cancels the run.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Spawn `spec` and supervise it until it exits, times out or is
    /// cancelled. The process group is terminated in every case.
    pub async fn run(&self, spec: &CommandSpec) -> Result<SupervisedExit, SupervisorError> {
        let mut handle = ProcessHandle::spawn(spec)?;
        tracing::debug!(pgid = handle.pgid, command = %spec, "Spawned supervised process");

        let outcome = tokio::select! {
            status = handle.child.wait() => {
                SupervisedExit::Exited(exit_code(status.map_err(SupervisorError::Wait)?))
            }
            _ = tokio::time::sleep(self.timeout) => {
                tracing::warn!(
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Supervised process timed out",
                );
                self.cancel.cancel();
                SupervisedExit::TimedOut
            }
            _ = self.cancel.cancelled() => {
                tracing::warn!("Supervised process cancelled");
                SupervisedExit::Cancelled
            }
        };

        // Descendants may outlive a leader that exited on its own.
        handle.signal_group(libc::SIGTERM);

        if !matches!(outcome, SupervisedExit::Exited(_)) {
            self.reap(&mut handle).await;
            // The leader is gone, but descendants that ignore SIGTERM are
            // still in the group.
            handle.signal_group(libc::SIGKILL);
        }

        Ok(outcome)
    }

    /// Wait for a terminated leader, escalating to `SIGKILL` after the
    /// grace period.
    async fn reap(&self, handle: &mut ProcessHandle) {
        match tokio::time::timeout(self.reap_grace, handle.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(code = exit_code(status), "Reaped supervised process");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to reap supervised process");
            }
            Err(_) => {
                tracing::warn!(
                    pgid = handle.pgid,
                    "Process group ignored SIGTERM, sending SIGKILL",
                );
                handle.signal_group(libc::SIGKILL);
                if let Err(e) = handle.child.wait().await {
                    tracing::warn!(error = %e, "Failed to reap supervised process");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
