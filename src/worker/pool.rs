//! Process pool for one worker type.
//!
//! A pool owns the handles of every replica it forked. Replicas exist only
//! between [`WorkerPool::start_workers`] and [`WorkerPool::join_workers`].

use super::proc::Proc;
use super::signals::{ReplicaExit, TerminationReason, analyze_wait_status};
use super::spawn::spawn_replica;
use super::spec::WorkerSpec;
use crate::control::deadline_after;
use crate::error::{ProcflowError, Result};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Interval between non-blocking reaps in a bounded join.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of [`WorkerPool::join_workers_timeout`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinReport {
    /// Replicas that exited before the deadline.
    pub exited: Vec<ReplicaExit>,
    /// PIDs still running at the deadline. They stay tracked by the pool.
    pub still_running: Vec<i32>,
}

impl JoinReport {
    pub fn is_complete(&self) -> bool {
        self.still_running.is_empty()
    }
}

/// Pool operations that do not depend on the message types, so one owner
/// can hold pools of different workers side by side.
pub trait ManagedPool {
    fn name(&self) -> &str;

    /// Configured replica count.
    fn replica_count(&self) -> usize;

    fn start_workers(&mut self) -> Result<()>;

    fn join_workers(&mut self) -> Vec<ReplicaExit>;

    fn join_workers_timeout(&mut self, timeout: Duration) -> JoinReport;
}

/// Replicas of one [`WorkerSpec`], each a forked OS process.
pub struct WorkerPool<A, I, O> {
    spec: WorkerSpec<A, I, O>,
    procs: Vec<Proc>,
    /// Replicas reaped by a status poll before the owner joined.
    finished: Vec<ReplicaExit>,
}

impl<A, I, O> WorkerPool<A, I, O> {
    /// Create a pool for a validated spec.
    ///
    /// Room for every replica handle is reserved up front; failing to get
    /// it is the only way creation fails.
    pub fn create(spec: WorkerSpec<A, I, O>) -> Result<Self> {
        let mut procs = Vec::new();
        if let Err(e) = procs.try_reserve_exact(spec.count()) {
            tracing::error!(worker = spec.name(), count = spec.count(), error = %e, "Cannot allocate replica handles");
            return Err(ProcflowError::Spawn(format!(
                "{}: cannot allocate {} replica handles: {}",
                spec.name(),
                spec.count(),
                e
            )));
        }
        Ok(Self {
            spec,
            procs,
            finished: Vec::new(),
        })
    }

    pub fn spec(&self) -> &WorkerSpec<A, I, O> {
        &self.spec
    }

    pub fn name(&self) -> &str {
        self.spec.name()
    }

    /// Fork `count` replicas of the spec's body.
    ///
    /// Calling this twice without a join in between forks a second set of
    /// replicas. Both sets stay tracked and are reaped by the next join, but
    /// they run concurrently against the same channels.
    #[instrument(level = "debug", skip(self), fields(worker = self.spec.name(), count = self.spec.count()))]
    pub fn start_workers(&mut self) -> Result<()> {
        if !self.procs.is_empty() {
            warn!(
                live = self.procs.len(),
                "start_workers called on a pool that is already running"
            );
        }
        for replica in 0..self.spec.count() {
            // Replicas forked before a failure stay tracked and are joined later.
            let proc = spawn_replica(&self.spec, replica)?;
            self.procs.push(proc);
        }
        info!(pids = ?self.pids(), "Started replicas");
        Ok(())
    }

    /// PIDs of the replicas not yet reaped, in spawn order.
    pub fn pids(&self) -> Vec<i32> {
        self.procs.iter().map(|p| p.pid().as_raw()).collect()
    }

    /// Number of replicas still running.
    ///
    /// Replicas found exited are reaped; their exits are kept and returned
    /// by the next join.
    pub fn running_count(&mut self) -> usize {
        self.reap_finished();
        self.procs.len()
    }

    /// Block until every replica has exited.
    ///
    /// Only call this once every channel the pool touches has been drained;
    /// a replica blocked on a channel otherwise never exits.
    #[instrument(level = "debug", skip(self), fields(worker = self.spec.name()))]
    pub fn join_workers(&mut self) -> Vec<ReplicaExit> {
        let mut exits = std::mem::take(&mut self.finished);
        for mut proc in self.procs.drain(..) {
            let reason = match proc.wait() {
                Ok(status) => analyze_wait_status(status),
                Err(e) => {
                    warn!(pid = proc.pid().as_raw(), error = %e, "Failed to reap replica");
                    TerminationReason::Unknown
                }
            };
            exits.push(exit_record(self.spec.name(), &proc, reason));
        }
        log_exits(&exits);
        exits
    }

    /// Like [`join_workers`](Self::join_workers) but gives up at `timeout`.
    ///
    /// Stragglers are reported, not killed; they remain in the pool.
    pub fn join_workers_timeout(&mut self, timeout: Duration) -> JoinReport {
        let deadline = deadline_after(timeout);
        loop {
            self.reap_finished();
            if self.procs.is_empty() || deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            std::thread::sleep(JOIN_POLL_INTERVAL);
        }

        let exited = std::mem::take(&mut self.finished);
        log_exits(&exited);
        let still_running = self.pids();
        if !still_running.is_empty() {
            warn!(
                worker = self.spec.name(),
                pids = ?still_running,
                "Replicas still running after join timeout"
            );
        }
        JoinReport {
            exited,
            still_running,
        }
    }

    fn reap_finished(&mut self) {
        let name = self.spec.name();
        let finished = &mut self.finished;
        self.procs.retain_mut(|proc| match proc.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                finished.push(exit_record(name, proc, analyze_wait_status(status)));
                false
            }
            Err(e) => {
                warn!(pid = proc.pid().as_raw(), error = %e, "Failed to poll replica");
                finished.push(exit_record(name, proc, TerminationReason::Unknown));
                false
            }
        });
    }
}

fn exit_record(worker: &str, proc: &Proc, reason: TerminationReason) -> ReplicaExit {
    ReplicaExit {
        worker: worker.to_string(),
        replica: proc.replica(),
        pid: proc.pid().as_raw(),
        reason,
    }
}

fn log_exits(exits: &[ReplicaExit]) {
    for exit in exits {
        if exit.is_clean() {
            debug!(%exit, "Replica joined");
        } else {
            warn!(%exit, "Replica ended abnormally");
        }
    }
}

impl<A, I, O> ManagedPool for WorkerPool<A, I, O> {
    fn name(&self) -> &str {
        self.spec.name()
    }

    fn replica_count(&self) -> usize {
        self.spec.count()
    }

    fn start_workers(&mut self) -> Result<()> {
        WorkerPool::start_workers(self)
    }

    fn join_workers(&mut self) -> Vec<ReplicaExit> {
        WorkerPool::join_workers(self)
    }

    fn join_workers_timeout(&mut self, timeout: Duration) -> JoinReport {
        WorkerPool::join_workers_timeout(self, timeout)
    }
}

impl<A, I, O> std::fmt::Debug for WorkerPool<A, I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("spec", &self.spec)
            .field("pids", &self.pids())
            .finish()
    }
}

/// Replica handles terminate their process on drop; this only reports it.
impl<A, I, O> Drop for WorkerPool<A, I, O> {
    fn drop(&mut self) {
        if !self.procs.is_empty() {
            warn!(
                worker = self.spec.name(),
                live = self.procs.len(),
                "Pool dropped with replicas still tracked"
            );
        }
    }
}
