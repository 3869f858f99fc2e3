//! Trace collector service
//!
//! Collects a trace of a running or stopped workload into a file the
//! controller can download.

use anyhow::{Context, Result};
use async_trait::async_trait;
use gantry_core::domain::job::Job;
use std::path::{Path, PathBuf};
use tracing::info;

/// Service trait for trace collection
#[async_trait]
pub trait TraceCollector: Send + Sync {
    /// Collects a trace for `job` and returns the path of the artifact
    async fn collect(&self, job: &Job, working_directory: &Path) -> Result<PathBuf>;
}

/// Writes the job's measurements and metadata as a JSON artifact
///
/// Used when no native tracer is available on the host.
pub struct SnapshotTraceCollector;

#[async_trait]
impl TraceCollector for SnapshotTraceCollector {
    async fn collect(&self, job: &Job, working_directory: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(working_directory)
            .await
            .context("Failed to create trace directory")?;

        let path = working_directory.join(format!("trace-{}.json", job.id));
        let snapshot = serde_json::json!({
            "service": job.service,
            "runId": job.run_id,
            "measurements": job.measurements,
            "metadata": job.metadata,
        });

        tokio::fs::write(&path, serde_json::to_vec_pretty(&snapshot)?)
            .await
            .with_context(|| format!("Failed to write trace {}", path.display()))?;

        info!("Trace for job {} written to {}", job.id, path.display());
        Ok(path)
    }
}
