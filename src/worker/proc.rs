//! Process handle for replica processes.

use crate::error::{ProcflowError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::Duration;

/// Handle to one forked replica.
#[derive(Debug)]
pub struct Proc {
    /// Process ID
    pid: Pid,
    /// Replica index within its pool
    replica: usize,
    /// Whether the process has been reaped
    reaped: bool,
}

impl Proc {
    pub fn new(pid: Pid, replica: usize) -> Self {
        Self {
            pid,
            replica,
            reaped: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn replica(&self) -> usize {
        self.replica
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if self.reaped {
            return Err(ProcflowError::Wait(format!(
                "replica {} (pid {}) already reaped",
                self.replica, self.pid
            )));
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    self.reaped = true;
                    return Ok(status);
                }
                Err(nix::errno::Errno::EINTR) => continue, // Retry on interrupt
                Err(e) => return Err(ProcflowError::Wait(format!("waitpid failed: {}", e))),
            }
        }
    }

    /// Try to wait for the process (non-blocking).
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if self.reaped {
            return Err(ProcflowError::Wait(format!(
                "replica {} (pid {}) already reaped",
                self.replica, self.pid
            )));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.reaped = true;
                Ok(Some(status))
            }
            Err(e) => Err(ProcflowError::Wait(format!("waitpid failed: {}", e))),
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| ProcflowError::Wait(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| ProcflowError::Wait(format!("Failed to send SIGKILL: {}", e)))?;
        self.wait()?;
        Ok(())
    }
}

/// Replicas are reaped cooperatively through `WorkerPool::join_workers`.
/// A handle dropped while its process still runs means the owner bailed out
/// early; the process is terminated so it does not outlive the run.
impl Drop for Proc {
    fn drop(&mut self) {
        if !self.reaped {
            tracing::warn!(
                replica = self.replica,
                pid = self.pid.as_raw(),
                "Replica handle dropped without join, terminating"
            );
            let _ = self.terminate();
            std::thread::sleep(Duration::from_millis(10));

            if let Ok(Some(_)) = self.try_wait() {
                return;
            }

            if let Err(e) = self.kill() {
                tracing::warn!(pid = self.pid.as_raw(), error = %e, "Failed to kill replica");
            }
        }
    }
}
