//! CLI entrypoint for the memfault sweep harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use memfault_core::{OverlayConfig, global_overlay_with, global_slot, global_system_table};
use memfault_harness::structured_log::LogEmitter;
use memfault_harness::workloads::WORKLOAD_NAMES;
use memfault_harness::{FaultSweep, HarnessError, SweepOptions, workload_by_name};

/// Fault sweep tooling for memfault.
#[derive(Debug, Parser)]
#[command(name = "memfault-harness")]
#[command(about = "Deterministic allocation-failure sweeps")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sweep a workload through every allocation-failure point.
    Sweep {
        /// Workload name (see `workloads`).
        #[arg(long)]
        workload: String,
        /// Highest delay tried.
        #[arg(long, default_value_t = 256)]
        max_delay: i64,
        /// Consecutive failures injected per step.
        #[arg(long, default_value_t = 1)]
        repeat: i64,
        /// Structured JSONL log output path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Report JSON output path (if omitted, prints to stdout).
        #[arg(long)]
        report: Option<PathBuf>,
        /// Record allocation sites and include them in the report. The CLI
        /// captures no stack frames, so every call lands on one site.
        #[arg(long)]
        sites: bool,
        /// Fail on malformed MEMFAULT_* environment values instead of
        /// falling back to defaults.
        #[arg(long)]
        strict_env: bool,
        /// Lifecycle journal capacity (overrides MEMFAULT_JOURNAL_CAPACITY).
        #[arg(long)]
        journal_capacity: Option<usize>,
    },
    /// List built-in workloads.
    Workloads,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Sweep {
            workload,
            max_delay,
            repeat,
            log,
            report,
            sites,
            strict_env,
            journal_capacity,
        } => {
            let mut runner =
                workload_by_name(&workload).ok_or_else(|| HarnessError::UnknownWorkload(workload.clone()))?;
            let mut emitter = match &log {
                Some(path) => Some(LogEmitter::to_file(path, &format!("sweep-{workload}"))?),
                None => None,
            };
            let options = SweepOptions {
                max_delay,
                repeat,
                record_sites: sites,
            };
            let mut config = if strict_env {
                OverlayConfig::from_env_strict()?
            } else {
                OverlayConfig::from_env()
            };
            if let Some(capacity) = journal_capacity {
                config = config.with_journal_capacity(capacity);
            }
            let sweep = FaultSweep::new(
                global_overlay_with(config),
                global_slot(),
                global_system_table().clone(),
                options,
            );
            let result = sweep.run(runner.as_mut(), emitter.as_mut())?;

            let json = result.to_json()?;
            match &report {
                Some(path) => {
                    std::fs::write(path, &json)?;
                    eprintln!("Report written to {}", path.display());
                }
                None => println!("{json}"),
            }
            eprintln!(
                "{workload}: {} steps, {} defects, digest {}",
                result.summary.steps,
                result.summary.defects(),
                result.digest()?
            );
            if !result.is_clean() {
                return Err(format!("sweep of {workload} found defects").into());
            }
        }
        Command::Workloads => {
            for name in WORKLOAD_NAMES {
                if let Some(workload) = workload_by_name(name) {
                    println!("{name:<14} {}", workload.description());
                }
            }
        }
    }

    Ok(())
}
