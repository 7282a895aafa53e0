//! Simulated vehicle pipeline driven by the `run` command.
//!
//! ```text
//!   heartbeat sender
//!   heartbeat receiver ──(heartbeats)──────────────────────┐
//!   telemetry ──(telemetry)──> command ──(commands)──> main
//! ```

pub mod decision;
pub mod link;
pub mod workers;

use crate::cli::RunArgs;
use anyhow::{Context, Result};
use decision::{DeciderConfig, Decision, HeartbeatState, Position};
use link::{SimulatedLink, TelemetryData};
use procflow::logging::WorkerLogging;
use procflow::{BoundedChannel, Message, Pipeline, ShutdownReport, WorkerPool, WorkerSpec};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use workers::{CommandArgs, HeartbeatReceiverArgs, HeartbeatSenderArgs, TelemetryArgs};

/// Outcome of one run.
#[derive(Debug)]
pub struct RunSummary {
    /// Last link state the owning process read.
    pub final_state: Option<HeartbeatState>,
    pub decisions: usize,
    pub elapsed: Duration,
    pub shutdown: ShutdownReport,
}

/// Channels that terminate at the owning process.
struct MainInputs {
    heartbeats: BoundedChannel<HeartbeatState>,
    commands: BoundedChannel<Decision>,
}

/// Build, run and tear down the pipeline.
///
/// `on_state` and `on_decision` see every state change and decision as the
/// owning process reads them.
pub fn run(
    args: &RunArgs,
    logging: WorkerLogging,
    mut on_state: impl FnMut(HeartbeatState),
    mut on_decision: impl FnMut(&Decision),
) -> Result<RunSummary> {
    let started = Instant::now();
    let mut pipeline = Pipeline::new().context("Failed to create control signal")?;
    let inputs = build(&mut pipeline, args, logging)?;

    pipeline.start().context("Failed to start worker pools")?;
    info!(replicas = pipeline.replica_count(), "Started");

    let deadline = started.checked_add(args.duration);
    let heartbeat_wait = args.heartbeat_period.saturating_mul(2);
    let mut final_state = None;
    let mut decisions = 0;

    while deadline.is_none_or(|d| Instant::now() < d) {
        let remaining =
            deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()));
        match inputs.heartbeats.get(Some(heartbeat_wait.min(remaining)))? {
            Some(Message::Item(state)) => {
                if final_state != Some(state) {
                    on_state(state);
                }
                final_state = Some(state);
                if state == HeartbeatState::Disconnected {
                    info!("Link disconnected, stopping");
                    break;
                }
            }
            Some(Message::EndOfStream) => break,
            None => debug!("No heartbeat state within two periods"),
        }
        while let Some(Message::Item(decision)) = inputs.commands.try_get()? {
            on_decision(&decision);
            decisions += 1;
        }
    }

    info!("Requesting exit");
    let shutdown = pipeline.shutdown();
    // The signal could now be reused for another run.
    pipeline.reset().context("Failed to reset pipeline")?;

    Ok(RunSummary {
        final_state,
        decisions,
        elapsed: started.elapsed(),
        shutdown,
    })
}

/// Create channels in data-flow order and one pool per worker type.
fn build(pipeline: &mut Pipeline, args: &RunArgs, logging: WorkerLogging) -> Result<MainInputs> {
    let link = SimulatedLink::new(args.disconnect_after);

    let telemetry: BoundedChannel<TelemetryData> = pipeline
        .channel("telemetry_to_command", args.telemetry_queue)
        .context("Failed to create telemetry channel")?;
    let commands: BoundedChannel<Decision> = pipeline
        .channel("command_to_main", args.command_queue)
        .context("Failed to create command channel")?;
    let heartbeats: BoundedChannel<HeartbeatState> = pipeline
        .channel("heartbeat_to_main", args.heartbeat_queue)
        .context("Failed to create heartbeat channel")?;

    let sender = WorkerSpec::builder(
        "heartbeat_sender",
        HeartbeatSenderArgs {
            link,
            period: args.heartbeat_period,
        },
    )
    .count(usize::from(args.heartbeat_senders))
    .body(workers::heartbeat_sender)
    .control(pipeline.control())
    .logging(logging.clone())
    .build()?;

    let receiver = WorkerSpec::builder(
        "heartbeat_receiver",
        HeartbeatReceiverArgs {
            link,
            period: args.heartbeat_period,
            disconnect_threshold: args.disconnect_threshold,
        },
    )
    .count(usize::from(args.heartbeat_receivers))
    .body(workers::heartbeat_receiver)
    .output(heartbeats.clone())
    .control(pipeline.control())
    .logging(logging.clone())
    .build()?;

    let sampler = WorkerSpec::builder(
        "telemetry",
        TelemetryArgs {
            link,
            period: args.telemetry_period,
        },
    )
    .count(usize::from(args.telemetry_workers))
    .body(workers::telemetry)
    .output(telemetry.clone())
    .control(pipeline.control())
    .logging(logging.clone())
    .build()?;

    let decider = WorkerSpec::builder(
        "command",
        CommandArgs {
            decider: DeciderConfig {
                target: Position::from(args.target),
                z_speed: args.z_speed,
                angle_tolerance_deg: args.angle_tolerance,
                height_tolerance: args.height_tolerance,
            },
            telemetry_period: args.telemetry_period,
        },
    )
    .count(usize::from(args.command_workers))
    .body(workers::command)
    .input(telemetry)
    .output(commands.clone())
    .control(pipeline.control())
    .logging(logging)
    .build()?;

    pipeline.add_pool(WorkerPool::create(sender)?);
    pipeline.add_pool(WorkerPool::create(receiver)?);
    pipeline.add_pool(WorkerPool::create(sampler)?);
    pipeline.add_pool(WorkerPool::create(decider)?);

    Ok(MainInputs {
        heartbeats,
        commands,
    })
}
