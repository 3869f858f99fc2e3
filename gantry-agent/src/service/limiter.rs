//! Resource limiter service
//!
//! Applies CPU and memory limits to a launched workload and releases them
//! when the workload stops.

use anyhow::Result;
use async_trait::async_trait;
use gantry_core::domain::job::Job;
use tracing::{debug, warn};

/// Service trait for OS-level resource limiting
#[async_trait]
pub trait ResourceLimiter: Send + Sync {
    /// Applies `job.limits` to the process `pid`
    async fn apply(&self, job: &Job, pid: Option<u32>) -> Result<()>;

    /// Releases whatever `apply` set up for `job`
    async fn release(&self, job: &Job) -> Result<()>;
}

/// Limiter used when the host has no limiting mechanism configured
///
/// Requested limits are reported and otherwise ignored.
pub struct NoopResourceLimiter;

#[async_trait]
impl ResourceLimiter for NoopResourceLimiter {
    async fn apply(&self, job: &Job, pid: Option<u32>) -> Result<()> {
        if !job.limits.is_empty() {
            warn!(
                "Job {} requested resource limits {:?} but no limiter is configured (pid {:?})",
                job.id, job.limits, pid
            );
        }
        Ok(())
    }

    async fn release(&self, job: &Job) -> Result<()> {
        debug!("No resource limits to release for job {}", job.id);
        Ok(())
    }
}
