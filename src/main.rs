//! procflow - multi-process worker pipelines

mod cli;
mod demo;

use anyhow::{Result, bail};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr, Stream::Stdout};
use procflow::logging::{self, LogConfig, WorkerLogging};
use tracing::Level;

use cli::{Cli, Commands, RunArgs, Verbosity};

/// Program entry point: parses CLI arguments, dispatches the selected command,
/// and on error prints a colored error header followed by each cause in the
/// error chain before exiting with status code 1.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbosity() {
            Verbosity::Normal => Level::WARN,
            Verbosity::Info => Level::INFO,
            Verbosity::Debug => Level::DEBUG,
        }
    };

    let mut config = LogConfig::new().with_level(level).with_env_overrides();
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }
    logging::init(config);
}

/// Run the simulated vehicle pipeline and print what the owning process saw.
fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let worker_logging = WorkerLogging {
        log_dir: args.log_dir.clone(),
        format: cli.log_format.unwrap_or_default(),
    };

    let summary = demo::run(
        args,
        worker_logging,
        |state| {
            if !cli.quiet {
                println!("heartbeat: {}", state);
            }
        },
        |decision| {
            if !cli.quiet {
                println!("command: {}", decision);
            }
        },
    )?;

    let report = &summary.shutdown;
    if cli.verbosity() >= Verbosity::Info {
        for (channel, drain) in &report.drained {
            eprintln!(
                "Drained {}: {} sentinel(s), {} discarded",
                channel, drain.filled, drain.discarded
            );
        }
    }

    if !cli.quiet {
        let state = summary
            .final_state
            .map(|s| s.to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        println!(
            "{} after {:.1}s: link {}, {} command(s), {} replica(s) joined, {} message(s) discarded",
            "Stopped".if_supports_color(Stdout, |text| text.green()),
            summary.elapsed.as_secs_f64(),
            state,
            summary.decisions,
            report.exits.len(),
            report.discarded()
        );
    }

    let failed: Vec<String> = report
        .exits
        .iter()
        .filter(|exit| !exit.is_clean())
        .map(|exit| exit.to_string())
        .collect();
    if !failed.is_empty() {
        bail!("{} replica(s) ended abnormally: {}", failed.len(), failed.join(", "));
    }
    if !report.still_running.is_empty() {
        bail!("replicas still running: {:?}", report.still_running);
    }
    Ok(())
}
