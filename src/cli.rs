//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use procflow::logging::LogFormat;
use std::path::PathBuf;
use std::time::Duration;

/// Run and tear down multi-process worker pipelines.
#[derive(Parser, Debug)]
#[command(name = "procflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true, value_parser = clap::builder::FalseyValueParser::new())]
    pub no_color: bool,

    /// Log output format (pretty, compact, json).
    #[arg(long, env = "PROCFLOW_LOG_FORMAT", global = true)]
    pub log_format: Option<LogFormat>,

    /// Also write the main process log to this file.
    #[arg(long, env = "PROCFLOW_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the simulated vehicle pipeline.
    Run(RunArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// How long the owning process keeps reading before shutting down (seconds).
    #[arg(long, env = "PROCFLOW_DURATION", default_value = "100", value_parser = parse_seconds)]
    pub duration: Duration,

    /// Heartbeat sender replicas.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub heartbeat_senders: u16,

    /// Heartbeat receiver replicas.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub heartbeat_receivers: u16,

    /// Telemetry sampler replicas.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub telemetry_workers: u16,

    /// Command decision replicas.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub command_workers: u16,

    /// Capacity of the telemetry -> command channel (0 for unbounded).
    #[arg(long, env = "PROCFLOW_TELEMETRY_QUEUE", default_value_t = 32)]
    pub telemetry_queue: usize,

    /// Capacity of the heartbeat -> main channel (0 for unbounded).
    #[arg(long, env = "PROCFLOW_HEARTBEAT_QUEUE", default_value_t = 64)]
    pub heartbeat_queue: usize,

    /// Capacity of the command -> main channel (0 for unbounded).
    #[arg(long, env = "PROCFLOW_COMMAND_QUEUE", default_value_t = 64)]
    pub command_queue: usize,

    /// Heartbeat period (seconds).
    #[arg(long, default_value = "1", value_parser = parse_seconds)]
    pub heartbeat_period: Duration,

    /// Consecutive missed heartbeats before the link counts as disconnected.
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub disconnect_threshold: u32,

    /// Telemetry period (seconds).
    #[arg(long, default_value = "1", value_parser = parse_seconds)]
    pub telemetry_period: Duration,

    /// Climb/descent speed used for altitude decisions (m/s).
    #[arg(long, default_value_t = 1.0)]
    pub z_speed: f64,

    /// Yaw error tolerated before a turn is commanded (degrees).
    #[arg(long, default_value_t = 5.0)]
    pub angle_tolerance: f64,

    /// Height error tolerated before a climb is commanded (metres).
    #[arg(long, default_value_t = 0.5)]
    pub height_tolerance: f64,

    /// Target position as x,y,z (metres).
    #[arg(long, default_value = "10,20,30", value_parser = parse_position)]
    pub target: [f64; 3],

    /// Simulated link stops sending heartbeats after this long (seconds).
    #[arg(long, value_parser = parse_seconds)]
    pub disconnect_after: Option<Duration>,

    /// Directory for per-replica log files (<worker>_<pid>.log).
    #[arg(long, env = "PROCFLOW_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

/// Parse a non-negative number of seconds, fractions allowed.
fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", s))?;
    Duration::try_from_secs_f64(secs).map_err(|_| format!("'{}' is not a valid duration", s))
}

/// Parse `x,y,z`.
fn parse_position(s: &str) -> Result<[f64; 3], String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [x, y, z] = parts.as_slice() else {
        return Err(format!("expected x,y,z but got '{}'", s));
    };
    let parse = |v: &str| {
        v.parse::<f64>()
            .map_err(|_| format!("'{}' is not a number", v))
    };
    Ok([parse(x)?, parse(y)?, parse(z)?])
}

/// Verbosity level for output control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Default: warnings, errors and results.
    Normal,
    /// -v: include progress info.
    Info,
    /// -vv: include debug info (replica spawn, channel drains).
    Debug,
}

impl From<u8> for Verbosity {
    fn from(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            _ => Verbosity::Debug,
        }
    }
}

impl Cli {
    /// Get the verbosity level based on -v flags.
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from(self.verbose)
    }
}
