//! Process signaling for cooperative cancellation.
//!
//! Termination is staged ("progressive kill"): send SIGTERM, wait a bounded
//! interval for a graceful stop, then SIGKILL if the process is still
//! alive. A process that is already gone is a quiet no-op, never an error.

use std::time::Duration;

/// Outcome of a progressive kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// A signal was delivered.
    Terminated,
    /// The process did not exist (already exited, or pid reused and gone).
    AlreadyGone,
    /// The pid was refused (non-positive, or this process itself).
    Refused,
}

/// Staged process terminator.
#[derive(Debug, Clone, Copy)]
pub struct ProcessKiller {
    term_wait: Duration,
}

impl Default for ProcessKiller {
    fn default() -> Self {
        Self {
            term_wait: Duration::from_secs(5),
        }
    }
}

impl ProcessKiller {
    /// Creates a killer with a custom grace interval between TERM and KILL.
    #[must_use]
    pub const fn new(term_wait: Duration) -> Self {
        Self { term_wait }
    }

    /// Terminates `pid` in stages: TERM, bounded wait, KILL.
    ///
    /// Refuses non-positive pids and this process's own pid. A pid that no
    /// longer exists returns [`KillOutcome::AlreadyGone`].
    pub async fn progressive_kill(&self, pid: i32) -> KillOutcome {
        if pid <= 1 || is_own_pid(pid) {
            tracing::warn!(pid, "refusing to signal this pid");
            return KillOutcome::Refused;
        }
        if !process_exists(pid) {
            tracing::info!(pid, "pid no longer exists");
            return KillOutcome::AlreadyGone;
        }

        tracing::info!(pid, "sending SIGTERM");
        if !send_signal(pid, libc::SIGTERM) {
            return KillOutcome::AlreadyGone;
        }
        tokio::time::sleep(self.term_wait).await;

        if process_exists(pid) {
            tracing::info!(pid, "still alive, sending SIGKILL");
            send_signal(pid, libc::SIGKILL);
        }
        KillOutcome::Terminated
    }
}

fn is_own_pid(pid: i32) -> bool {
    u32::try_from(pid).is_ok_and(|p| p == std::process::id())
}

/// Probes for process existence with the null signal.
fn process_exists(pid: i32) -> bool {
    send_signal(pid, 0)
}

/// Sends a signal; returns false if the process does not exist.
#[allow(unsafe_code)]
fn send_signal(pid: i32, signal: i32) -> bool {
    // SAFETY: kill(2) with a validated positive pid; the only effect is
    // signal delivery, no memory is touched.
    unsafe { libc::kill(pid, signal) == 0 }
}
