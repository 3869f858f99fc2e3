//! Workload start task
//!
//! Runs in the background while a job is `Starting`: build and launch through
//! the runner, apply resource limits, then wait for the workload to become
//! ready. The scheduler polls the task handle each tick.

use anyhow::{Context, Result};
use gantry_core::domain::job::Job;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::service::{LaunchedWorkload, ResourceLimiter, Runner};

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Timeouts bounding the start task
#[derive(Debug, Clone, Copy)]
pub(crate) struct StartTimeouts {
    pub build: Duration,
    pub start: Duration,
    pub stop_grace: Duration,
}

pub(crate) async fn start_workload(
    runner: Arc<dyn Runner>,
    limiter: Arc<dyn ResourceLimiter>,
    job: Job,
    timeouts: StartTimeouts,
) -> Result<LaunchedWorkload> {
    let mut launched = time::timeout(timeouts.build, runner.build_and_launch(&job))
        .await
        .map_err(|_| {
            anyhow::anyhow!("Build and launch exceeded the timeout of {:?}", timeouts.build)
        })?
        .context("Failed to build and launch the application")?;

    let readiness = async {
        limiter
            .apply(&job, launched.process.pid())
            .await
            .context("Failed to apply resource limits")?;
        wait_until_ready(&mut launched, &job, timeouts.start).await
    }
    .await;

    if let Err(e) = readiness {
        if let Err(stop_error) = launched.process.stop(timeouts.stop_grace).await {
            warn!("Failed to stop job {} after start failure: {:#}", job.id, stop_error);
        }
        if let Err(release_error) = limiter.release(&job).await {
            warn!("Failed to release limits of job {}: {:#}", job.id, release_error);
        }
        return Err(e);
    }

    Ok(launched)
}

async fn wait_until_ready(launched: &mut LaunchedWorkload, job: &Job, timeout: Duration) -> Result<()> {
    if job.is_console_app {
        debug!("Job {} is a console app, ready immediately", job.id);
        return Ok(());
    }

    let deadline = Instant::now() + timeout;

    loop {
        if let Some(code) = launched.process.try_exit_code()? {
            anyhow::bail!("Application exited with code {} before becoming ready", code);
        }

        let ready = match (&job.ready_state_text, &job.readiness_address) {
            (Some(text), _) => launched.process.output().contains(text.as_str()),
            (None, Some(address)) => probe(address).await,
            (None, None) => true,
        };

        if ready {
            info!("Job {} is ready", job.id);
            return Ok(());
        }

        if Instant::now() >= deadline {
            anyhow::bail!("Application failed to become ready within {:?}", timeout);
        }

        time::sleep(READINESS_POLL_INTERVAL).await;
    }
}

async fn probe(address: &str) -> bool {
    matches!(
        time::timeout(PROBE_TIMEOUT, TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}
