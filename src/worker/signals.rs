//! Exit analysis for replica processes.
//!
//! Maps a `WaitStatus` onto what the replica actually did, using the exit
//! codes the replica entry point reserves.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Exit code of a replica whose body returned.
pub const EXIT_COMPLETED: i32 = 0;

/// Exit code of a replica whose private setup (logging) failed before the body ran.
pub const EXIT_SETUP_FAILED: i32 = 70;

/// Exit code of a replica whose body panicked outside any unit of work.
pub const EXIT_PANICKED: i32 = 101;

/// Reason why a replica process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// The body returned and the replica exited cleanly.
    Completed,
    /// Per-process setup failed; the body never ran.
    SetupFailed,
    /// The body panicked.
    Panicked,
    /// Exited with an unreserved status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Whether the replica reached its normal end.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Completed => "completed".to_string(),
            Self::SetupFailed => "setup failed".to_string(),
            Self::Panicked => "panicked".to_string(),
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, EXIT_COMPLETED) => TerminationReason::Completed,
        WaitStatus::Exited(_, EXIT_SETUP_FAILED) => TerminationReason::SetupFailed,
        WaitStatus::Exited(_, EXIT_PANICKED) => TerminationReason::Panicked,
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// How one replica of a pool ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaExit {
    /// Name of the worker the replica belonged to.
    pub worker: String,
    /// Replica index within its pool.
    pub replica: usize,
    /// Process ID the replica ran as.
    pub pid: i32,
    pub reason: TerminationReason,
}

impl ReplicaExit {
    pub fn is_clean(&self) -> bool {
        self.reason.is_clean()
    }
}

impl std::fmt::Display for ReplicaExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{}] (pid {}) {}",
            self.worker, self.replica, self.pid, self.reason
        )
    }
}
