//! Run command handler

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use gantry_controller::{ConsoleSink, JsonFileSink, Orchestrator, RunOptions, Scenario};
use std::path::PathBuf;
use std::time::Duration;

/// Arguments of `run`
#[derive(Args)]
pub struct RunArgs {
    /// Scenario file (JSON)
    #[arg(long)]
    scenario: PathBuf,

    /// Number of iterations
    #[arg(long, default_value_t = 1)]
    iterations: u32,

    /// Repeat iterations for this many seconds instead
    #[arg(long, conflicts_with = "iterations")]
    span: Option<u64>,

    /// First service restarted between iterations
    #[arg(long)]
    repeat_from: Option<String>,

    /// Flush measurements of kept services between iterations
    #[arg(long)]
    auto_flush: bool,

    /// Seconds to keep services running when none exits on its own
    #[arg(long)]
    hold: Option<u64>,

    /// Write results as JSON to this file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Directory for downloaded traces
    #[arg(long, default_value = ".")]
    trace_dir: PathBuf,
}

impl RunArgs {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            iterations: self.iterations,
            span: self.span.map(Duration::from_secs),
            repeat_from: self.repeat_from.clone(),
            auto_flush: self.auto_flush,
            hold: self.hold.map(Duration::from_secs),
            trace_directory: self.trace_dir.clone(),
        }
    }
}

/// Loads the scenario and runs it to completion
pub async fn handle_run_command(args: RunArgs) -> Result<()> {
    let scenario = Scenario::load(&args.scenario)
        .with_context(|| format!("Invalid scenario {}", args.scenario.display()))?;

    let mut orchestrator =
        Orchestrator::new(scenario, args.run_options()).with_sink(Box::new(ConsoleSink));
    if let Some(output) = &args.output {
        orchestrator = orchestrator.with_sink(Box::new(JsonFileSink::new(output.clone())));
    }

    println!("{}", format!("Run {}", orchestrator.run_id()).bold());

    let summary = orchestrator.run().await?;

    println!();
    if summary.skipped {
        println!("{}", "Scenario skipped: not supported by the agents.".yellow());
    } else {
        println!(
            "{} {} iteration(s), {} deadlock retries",
            "✓".green(),
            summary.iterations,
            summary.deadlock_retries
        );
    }

    Ok(())
}
