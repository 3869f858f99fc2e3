//! Results sinks
//!
//! Receive the final job documents of every iteration once it is torn down.

use anyhow::{Context, Result};
use colored::*;
use gantry_core::domain::job::Job;
use gantry_core::domain::measurement::names;
use serde::Serialize;
use std::path::PathBuf;

/// Final document of one job
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub service: String,
    pub endpoint: String,
    pub job: Job,
}

impl JobResult {
    /// Largest recorded value of a measurement
    pub fn max(&self, name: &str) -> Option<f64> {
        self.job
            .measurements
            .iter()
            .filter(|m| m.name == name)
            .filter_map(|m| m.value.as_f64())
            .reduce(f64::max)
    }
}

/// Results of one start, run and teardown cycle
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationResults {
    pub run_id: String,
    pub iteration: u32,
    pub jobs: Vec<JobResult>,
}

/// Destination for iteration results
pub trait ResultsSink: Send + Sync {
    fn write(&mut self, results: &IterationResults) -> Result<()>;
}

/// Prints a colored summary per job
pub struct ConsoleSink;

impl ResultsSink for ConsoleSink {
    fn write(&mut self, results: &IterationResults) -> Result<()> {
        println!();
        println!(
            "{}",
            format!("Iteration {} (run {})", results.iteration, results.run_id).bold()
        );

        for result in &results.jobs {
            println!(
                "  {} {} on {}",
                "▸".cyan(),
                result.service.bold(),
                result.endpoint.dimmed()
            );
            println!("    State:        {}", result.job.state);

            let metric = |value: Option<f64>, unit: &str| {
                value
                    .map(|v| format!("{}{}", v, unit))
                    .unwrap_or_else(|| "-".to_string())
            };
            println!("    Max CPU:      {}", metric(result.max(names::CPU), " %"));
            println!(
                "    Max memory:   {}",
                metric(result.max(names::WORKING_SET), " MB")
            );
            println!("    Measurements: {}", result.job.measurements.len());

            if let Some(error) = &result.job.error {
                println!("    Error:        {}", error.red());
            }
        }

        Ok(())
    }
}

/// Writes every iteration seen so far as a pretty JSON array
pub struct JsonFileSink {
    path: PathBuf,
    iterations: Vec<IterationResults>,
}

impl JsonFileSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            iterations: Vec::new(),
        }
    }
}

impl ResultsSink for JsonFileSink {
    fn write(&mut self, results: &IterationResults) -> Result<()> {
        self.iterations.push(results.clone());

        let json = serde_json::to_string_pretty(&self.iterations)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write results to {}", self.path.display()))?;

        tracing::info!("Results written to {}", self.path.display());
        Ok(())
    }
}
