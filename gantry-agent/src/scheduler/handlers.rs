//! Per-state job handlers
//!
//! One handler per [`JobState`](gantry_core::domain::job::JobState) that has
//! work to do. Handlers never block on the workload build: it runs as a
//! background task that `on_starting` polls.

use anyhow::{Context, Result};
use gantry_core::domain::job::{Job, JobEvent};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::Scheduler;
use super::context::RunContext;
use super::start::{StartTimeouts, start_workload};
use crate::heartbeat::HeartbeatMonitor;

impl Scheduler {
    pub(super) async fn on_new(&mut self, job: &Job) -> Result<()> {
        self.transition(job.id, JobEvent::DriverContacted).await;
        Ok(())
    }

    /// Nothing to do until the controller posts `/start`
    pub(super) async fn on_initializing(&mut self, _job: &Job) -> Result<()> {
        Ok(())
    }

    pub(super) async fn on_waiting(&mut self, job: &Job) -> Result<()> {
        if !job.platform.is_satisfied_by(&self.platform) {
            let error = format!(
                "Requested platform (os: {}, arch: {}) is not supported by this agent ({}/{})",
                job.platform.os.as_deref().unwrap_or("any"),
                job.platform.arch.as_deref().unwrap_or("any"),
                self.platform.os,
                self.platform.arch
            );
            warn!("Job {}: {}", job.id, error);
            self.transition_with_error(job.id, JobEvent::PlatformUnsupported, Some(error))
                .await;
            return Ok(());
        }

        let timeouts = StartTimeouts {
            build: self.config.build_timeout,
            start: self.config.start_timeout,
            stop_grace: self.config.stop_grace,
        };
        let task = tokio::spawn(start_workload(
            Arc::clone(&self.runner),
            Arc::clone(&self.limiter),
            job.clone(),
            timeouts,
        ));
        self.contexts.entry(job.id).or_default().start_task = Some(task);

        self.transition(job.id, JobEvent::PlatformSupported).await;
        Ok(())
    }

    pub(super) async fn on_starting(&mut self, job: &Job) -> Result<()> {
        let context = self.contexts.entry(job.id).or_default();
        let Some(task) = context.start_task.take_if(|task| task.is_finished()) else {
            if context.start_task.is_none() {
                let error = "Start task was lost".to_string();
                self.transition_with_error(job.id, JobEvent::StartFailed, Some(error))
                    .await;
            }
            return Ok(());
        };

        match task.await {
            Ok(Ok(launched)) => {
                let context = self.contexts.entry(job.id).or_default();
                let workload = context.adopt(launched);
                context.heartbeat = Some(HeartbeatMonitor::start(
                    job.id,
                    workload,
                    (self.sampler)(),
                    Arc::clone(&self.repository),
                    self.events_tx.clone(),
                    self.config.heartbeat_interval,
                ));

                self.transition(job.id, JobEvent::Ready).await;
            }
            Ok(Err(e)) => {
                error!("Job {} failed to start: {:#}", job.id, e);
                self.transition_with_error(job.id, JobEvent::StartFailed, Some(format!("{:#}", e)))
                    .await;
            }
            Err(e) => {
                error!("Start task of job {} did not complete: {}", job.id, e);
                let error = format!("Start task did not complete: {}", e);
                self.transition_with_error(job.id, JobEvent::StartFailed, Some(error))
                    .await;
            }
        }

        Ok(())
    }

    /// The heartbeat monitor owns a running job until it is stopped
    pub(super) async fn on_running(&mut self, _job: &Job) -> Result<()> {
        Ok(())
    }

    pub(super) async fn on_stopping(&mut self, job: &Job) -> Result<()> {
        let mut context = self.contexts.remove(&job.id).unwrap_or_default();
        let result = self.stop_context(&mut context, job).await;
        self.contexts.insert(job.id, context);
        result?;

        self.transition(job.id, JobEvent::StopCompleted).await;
        Ok(())
    }

    pub(super) async fn on_trace_collecting(&mut self, job: &Job) -> Result<()> {
        let context = self.contexts.entry(job.id).or_default();

        if context.trace_task.is_none() {
            let directory = context
                .working_directory
                .clone()
                .unwrap_or_else(|| self.config.work_dir.join(job.id.to_string()));
            let tracer = Arc::clone(&self.tracer);
            let snapshot = job.clone();

            info!("Collecting trace for job {}", job.id);
            context.trace_task = Some(tokio::spawn(async move {
                tracer.collect(&snapshot, &directory).await
            }));
            return Ok(());
        }

        let Some(task) = context.trace_task.take_if(|task| task.is_finished()) else {
            return Ok(());
        };

        let path = task
            .await
            .context("Trace collection task did not complete")?
            .context("Failed to collect trace")?;

        self.repository
            .update(job.id, |j| j.trace_artifact = Some(path.display().to_string()))
            .await;
        self.transition(job.id, JobEvent::TraceCompleted).await;
        Ok(())
    }

    pub(super) async fn on_deleting(&mut self, job: &Job) -> Result<()> {
        // Teardown problems must not keep the job from being deleted
        if let Err(e) = self.teardown(job).await {
            warn!("Teardown of job {} was incomplete: {:#}", job.id, e);
        }

        self.transition(job.id, JobEvent::TeardownCompleted).await;
        Ok(())
    }

    /// Cancels background work, stops the workload if needed and removes
    /// temporary directories
    pub(super) async fn teardown(&mut self, job: &Job) -> Result<()> {
        let mut context = self.contexts.remove(&job.id).unwrap_or_default();

        if let Some(task) = context.trace_task.take() {
            task.abort();
        }

        if let Some(task) = context.start_task.take() {
            if !task.is_finished() {
                task.abort();
            }
            if let Ok(Ok(launched)) = task.await {
                context.adopt(launched);
            }
        }

        let result = self.stop_context(&mut context, job).await;

        if context.remove_working_directory {
            if let Some(directory) = &context.working_directory {
                remove_directory(directory).await;
            }
        }
        remove_directory(&self.config.work_dir.join(job.id.to_string())).await;

        result
    }

    /// Stop sequence: heartbeat, resource limits, process, after-script
    ///
    /// Runs at most once per job.
    async fn stop_context(&self, context: &mut RunContext, job: &Job) -> Result<()> {
        if context.stopped {
            return Ok(());
        }

        if let Some(heartbeat) = context.heartbeat.take() {
            heartbeat.stop().await;
        }

        let Some(workload) = context.workload.clone() else {
            context.stopped = true;
            return Ok(());
        };

        if let Err(e) = self.limiter.release(job).await {
            warn!("Failed to release resource limits of job {}: {:#}", job.id, e);
        }

        workload
            .lock()
            .await
            .stop(self.config.stop_grace)
            .await
            .context("Failed to stop the application")?;

        if let Some(directory) = &context.working_directory {
            if let Err(e) = self.runner.run_after_script(job, directory).await {
                warn!("After-script of job {} failed: {:#}", job.id, e);
            }
        }

        context.stopped = true;
        info!("Job {} application stopped", job.id);
        Ok(())
    }
}

async fn remove_directory(directory: &Path) {
    match tokio::fs::remove_dir_all(directory).await {
        Ok(()) => info!("Removed {}", directory.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", directory.display(), e),
    }
}
