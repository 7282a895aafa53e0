//! Owning-process side of a run.
//!
//! A [`Pipeline`] holds the control signal, the channels in data-flow order
//! and the pools. [`Pipeline::shutdown`] performs the teardown in the only
//! order that cannot deadlock:
//!
//! 1. request exit
//! 2. drain every channel, last-consumed first
//! 3. join every pool

use crate::channel::{BoundedChannel, Capacity, DrainReport};
use crate::control::{ControlSignal, deadline_after};
use crate::error::Result;
use crate::worker::{JoinReport, ManagedPool, ReplicaExit};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Channel operations needed at teardown, independent of the message type.
pub trait Drainable {
    fn fill_and_drain(&self) -> Result<DrainReport>;

    fn reopen(&self) -> Result<DrainReport>;
}

impl<T> Drainable for BoundedChannel<T>
where
    T: Serialize + DeserializeOwned,
{
    fn fill_and_drain(&self) -> Result<DrainReport> {
        BoundedChannel::fill_and_drain(self)
    }

    fn reopen(&self) -> Result<DrainReport> {
        BoundedChannel::reopen(self)
    }
}

/// What a shutdown did.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// One entry per channel, in the order they were drained.
    pub drained: Vec<(String, DrainReport)>,
    /// One entry per reaped replica, pools in registration order.
    pub exits: Vec<ReplicaExit>,
    /// Replicas still alive when a bounded shutdown gave up.
    pub still_running: Vec<i32>,
}

impl ShutdownReport {
    /// Every replica was reaped and completed normally.
    pub fn is_clean(&self) -> bool {
        self.still_running.is_empty() && self.exits.iter().all(ReplicaExit::is_clean)
    }

    /// Data messages thrown away across all channels.
    pub fn discarded(&self) -> usize {
        self.drained.iter().map(|(_, r)| r.discarded).sum()
    }
}

/// Control signal, channels and pools of one run.
pub struct Pipeline {
    control: ControlSignal,
    channels: Vec<(String, Box<dyn Drainable>)>,
    pools: Vec<Box<dyn ManagedPool>>,
}

impl Pipeline {
    pub fn new() -> Result<Self> {
        Ok(Self {
            control: ControlSignal::new()?,
            channels: Vec::new(),
            pools: Vec::new(),
        })
    }

    pub fn control(&self) -> &ControlSignal {
        &self.control
    }

    /// Create a channel and register it.
    ///
    /// Register channels in data-flow order: first-produced first.
    pub fn channel<T>(
        &mut self,
        name: impl Into<String>,
        capacity: impl Into<Capacity>,
    ) -> Result<BoundedChannel<T>>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        let channel = BoundedChannel::new(capacity)?;
        self.register_channel(name, &channel);
        Ok(channel)
    }

    /// Register a channel created elsewhere.
    pub fn register_channel<T>(&mut self, name: impl Into<String>, channel: &BoundedChannel<T>)
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        self.channels.push((name.into(), Box::new(channel.clone())));
    }

    pub fn add_pool<P>(&mut self, pool: P)
    where
        P: ManagedPool + 'static,
    {
        self.pools.push(Box::new(pool));
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Total configured replicas across all pools.
    pub fn replica_count(&self) -> usize {
        self.pools.iter().map(|p| p.replica_count()).sum()
    }

    /// Start every pool in registration order.
    ///
    /// If one pool fails to start, the run is torn down before the error is
    /// returned so no replica is left behind.
    #[instrument(level = "debug", skip(self))]
    pub fn start(&mut self) -> Result<()> {
        for index in 0..self.pools.len() {
            if let Err(e) = self.pools[index].start_workers() {
                error!(
                    worker = self.pools[index].name(),
                    error = %e,
                    "Failed to start pool, shutting down"
                );
                self.shutdown();
                return Err(e);
            }
        }
        info!(
            pools = self.pools.len(),
            replicas = self.replica_count(),
            "Pipeline started"
        );
        Ok(())
    }

    /// Request exit, drain in reverse data-flow order, join every pool.
    #[instrument(level = "debug", skip(self))]
    pub fn shutdown(&mut self) -> ShutdownReport {
        let mut report = self.request_and_drain();
        for pool in &mut self.pools {
            report.exits.extend(pool.join_workers());
        }
        log_report(&report);
        report
    }

    /// Like [`shutdown`](Self::shutdown) but stops waiting for replicas at
    /// `timeout`. Stragglers are listed in the report and stay tracked.
    pub fn shutdown_within(&mut self, timeout: Duration) -> ShutdownReport {
        let deadline = deadline_after(timeout);
        let mut report = self.request_and_drain();
        for pool in &mut self.pools {
            let remaining =
                deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()));
            let JoinReport {
                exited,
                still_running,
            } = pool.join_workers_timeout(remaining);
            report.exits.extend(exited);
            report.still_running.extend(still_running);
        }
        log_report(&report);
        report
    }

    /// Clear the exit flag and reopen every channel so the pools can be
    /// started again. Only valid after a complete shutdown.
    pub fn reset(&mut self) -> Result<()> {
        self.control.clear_exit();
        for (name, channel) in &self.channels {
            let leftovers = channel.reopen()?;
            if leftovers.discarded > 0 {
                warn!(channel = %name, discarded = leftovers.discarded, "Discarded messages on reopen");
            }
        }
        info!("Pipeline reset");
        Ok(())
    }

    fn request_and_drain(&mut self) -> ShutdownReport {
        self.control.request_exit();
        let mut report = ShutdownReport::default();
        for (name, channel) in self.channels.iter().rev() {
            match channel.fill_and_drain() {
                Ok(drain) => report.drained.push((name.clone(), drain)),
                // The closed flag is already set, so blocked peers still observe the drain.
                Err(e) => warn!(channel = %name, error = %e, "Channel drain incomplete"),
            }
        }
        report
    }
}

fn log_report(report: &ShutdownReport) {
    info!(
        channels = report.drained.len(),
        discarded = report.discarded(),
        replicas = report.exits.len(),
        stragglers = report.still_running.len(),
        "Pipeline shut down"
    );
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("control", &self.control)
            .field("channels", &self.channel_names())
            .field(
                "pools",
                &self.pools.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
