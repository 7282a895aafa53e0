//! Worker bodies of the vehicle pipeline.
//!
//! Each body runs inside one forked replica and drives
//! [`run_until_exit`] with its own unit of work.

use super::decision::{Decider, DeciderConfig, Decision, HeartbeatMonitor, HeartbeatState};
use super::link::{SimulatedLink, TelemetryData};
use procflow::{BoundedChannel, ControlSignal, Message, Step, run_until_exit};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSenderArgs {
    pub link: SimulatedLink,
    pub period: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatReceiverArgs {
    pub link: SimulatedLink,
    pub period: Duration,
    pub disconnect_threshold: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct TelemetryArgs {
    pub link: SimulatedLink,
    pub period: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandArgs {
    pub decider: DeciderConfig,
    pub telemetry_period: Duration,
}

/// Announce liveness to the vehicle once per period.
pub fn heartbeat_sender(
    args: &HeartbeatSenderArgs,
    _inputs: &[BoundedChannel<()>],
    _outputs: &[BoundedChannel<()>],
    control: &ControlSignal,
) {
    let mut sent = 0u64;
    let exit = run_until_exit(control, || {
        sent += 1;
        trace!(sent, at_ms = args.link.elapsed().as_millis() as u64, "Heartbeat sent");
        control.wait_for_exit(args.period);
        Ok(Step::Continue)
    });
    info!(sent, cause = ?exit.cause, "Heartbeat sender stopped");
}

/// Watch the vehicle's heartbeats and report the link state once per period.
pub fn heartbeat_receiver(
    args: &HeartbeatReceiverArgs,
    _inputs: &[BoundedChannel<()>],
    outputs: &[BoundedChannel<HeartbeatState>],
    control: &ControlSignal,
) {
    let mut monitor = HeartbeatMonitor::new(args.disconnect_threshold);
    let mut last = None;
    let exit = run_until_exit(control, || {
        let received = args.link.heartbeat_at(args.link.elapsed());
        let state = monitor.observe(received);
        if last != Some(state) {
            info!(%state, missed = monitor.missed(), "Link state changed");
            last = Some(state);
        }
        for output in outputs {
            output.put(state)?;
        }
        control.wait_for_exit(args.period);
        Ok(Step::Continue)
    });
    info!(cause = ?exit.cause, failures = exit.failures, "Heartbeat receiver stopped");
}

/// Sample position and attitude once per period.
pub fn telemetry(
    args: &TelemetryArgs,
    _inputs: &[BoundedChannel<()>],
    outputs: &[BoundedChannel<TelemetryData>],
    control: &ControlSignal,
) {
    let exit = run_until_exit(control, || {
        if control.wait_for_exit(args.period) {
            return Ok(Step::Continue);
        }
        let data = args.link.telemetry_at(args.link.elapsed());
        trace!(t = data.time_since_boot, z = data.z, "Telemetry sampled");
        for output in outputs {
            output.put(data)?;
        }
        Ok(Step::Continue)
    });
    info!(units = exit.units, cause = ?exit.cause, "Telemetry stopped");
}

/// Turn telemetry into altitude and yaw commands.
pub fn command(
    args: &CommandArgs,
    inputs: &[BoundedChannel<TelemetryData>],
    outputs: &[BoundedChannel<Decision>],
    control: &ControlSignal,
) {
    let Some(input) = inputs.first() else {
        warn!("Command worker has no telemetry input");
        return;
    };
    let mut decider = Decider::new(args.decider);
    let period_s = args.telemetry_period.as_secs_f64();
    // A bounded wait keeps the exit check live even if the producer stalls.
    let poll = args.telemetry_period.saturating_mul(2).max(Duration::from_millis(50));

    let exit = run_until_exit(control, || {
        let data = match input.get(Some(poll))? {
            None => return Ok(Step::Continue),
            Some(Message::EndOfStream) => return Ok(Step::EndOfStream),
            Some(Message::Item(data)) => data,
        };
        if let Some(decision) = decider.decide(&data, period_s) {
            debug!(%decision, "Decision made");
            for output in outputs {
                output.put(decision)?;
            }
        }
        Ok(Step::Continue)
    });

    if let Some([vx, vy, vz]) = decider.average_velocity() {
        info!(vx, vy, vz, "Average velocity");
    }
    info!(cause = ?exit.cause, failures = exit.failures, "Command worker stopped");
}
