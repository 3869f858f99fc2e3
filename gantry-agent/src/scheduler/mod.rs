//! Scheduler layer for the agent
//!
//! A single cooperative poll loop advances the state of every job. Each tick
//! garbage-collects old records, applies heartbeat reports, resolves the
//! active run group and dispatches every job of that group to the handler of
//! its current state.
//!
//! Only one run group (jobs sharing a run id) is processed at a time; jobs of
//! other runs stay `New` until every job of the active group is finished.

mod context;
mod handlers;
mod start;

use chrono::{DateTime, Utc};
use gantry_core::domain::job::{Job, JobEvent, JobState};
use gantry_core::domain::platform::PlatformInfo;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::heartbeat::{HeartbeatEvent, SamplerFactory, SysinfoSampler};
use crate::repository::JobRepository;
use crate::service::{
    NoopResourceLimiter, ResourceLimiter, Runner, SnapshotTraceCollector, TraceCollector,
};

use context::RunContext;

/// Agent scheduler driving job state transitions
pub struct Scheduler {
    config: AgentConfig,
    repository: Arc<JobRepository>,
    runner: Arc<dyn Runner>,
    limiter: Arc<dyn ResourceLimiter>,
    tracer: Arc<dyn TraceCollector>,
    sampler: SamplerFactory,
    platform: PlatformInfo,
    /// Run id of the group currently being processed
    active_run: Option<String>,
    contexts: HashMap<u64, RunContext>,
    events_tx: mpsc::UnboundedSender<HeartbeatEvent>,
    events_rx: mpsc::UnboundedReceiver<HeartbeatEvent>,
}

impl Scheduler {
    /// Creates a scheduler with the default limiter, trace collector and
    /// sampler for this host
    pub fn new(config: AgentConfig, repository: Arc<JobRepository>, runner: Arc<dyn Runner>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            config,
            repository,
            runner,
            limiter: Arc::new(NoopResourceLimiter),
            tracer: Arc::new(SnapshotTraceCollector),
            sampler: SysinfoSampler::factory(),
            platform: PlatformInfo::current(),
            active_run: None,
            contexts: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn ResourceLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_trace_collector(mut self, tracer: Arc<dyn TraceCollector>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerFactory) -> Self {
        self.sampler = sampler;
        self
    }

    /// Overrides the platform jobs are matched against
    pub fn with_platform(mut self, platform: PlatformInfo) -> Self {
        self.platform = platform;
        self
    }

    /// Run id of the group currently being processed
    pub fn active_run(&self) -> Option<&str> {
        self.active_run.as_deref()
    }

    /// Runs the poll loop until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Starting scheduler (tick: {:?}, driver timeout: {:?})",
            self.config.tick_interval, self.config.driver_timeout
        );

        let mut ticker = time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.shutdown().await;
        info!("Scheduler stopped");
    }

    /// Performs a single scheduling pass
    pub async fn tick(&mut self) {
        self.collect_garbage().await;
        self.apply_heartbeat_events().await;
        self.finish_queued_deletions().await;

        let Some(group) = self.resolve_group().await else {
            return;
        };

        for id in group {
            if let Err(e) = self.process(id).await {
                self.fault(id, e).await;
            }
        }
    }

    /// Removes terminal jobs nobody has contacted for `deleted_timeout`
    async fn collect_garbage(&mut self) {
        for job in self.repository.list().await {
            if job.state.is_terminal()
                && elapsed_since(job.last_driver_communication_utc) > self.config.deleted_timeout
            {
                info!("Removing job {} ({}) from the repository", job.id, job.state);
                self.repository.remove(job.id).await;
                self.contexts.remove(&job.id);
            }
        }
    }

    /// Completes deletion of jobs removed while their run was still queued
    ///
    /// Such jobs were never dispatched, so only their upload directory is
    /// left to clean up.
    async fn finish_queued_deletions(&mut self) {
        for job in self.repository.list().await {
            if job.state != JobState::Deleting
                || self.active_run.as_deref() == Some(job.run_id.as_str())
                || self.contexts.contains_key(&job.id)
            {
                continue;
            }

            info!("Job {} (run '{}') was deleted while queued", job.id, job.run_id);
            if let Err(e) = self.on_deleting(&job).await {
                warn!("Failed to finish deletion of job {}: {:#}", job.id, e);
            }
        }
    }

    async fn apply_heartbeat_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                HeartbeatEvent::Exited { job_id, code } => {
                    let error = (code != 0).then(|| format!("Application exited with code {}", code));
                    self.transition_with_error(job_id, JobEvent::ProcessExited { code }, error)
                        .await;
                }
            }
        }
    }

    /// Returns the ids of the active run group, activating the oldest
    /// waiting run if none is active
    async fn resolve_group(&mut self) -> Option<Vec<u64>> {
        let jobs = self.repository.list().await;

        if let Some(run_id) = self.active_run.clone() {
            let members: Vec<&Job> = jobs.iter().filter(|j| j.run_id == run_id).collect();

            if members.iter().all(|j| j.state.is_terminal()) {
                info!("Run group '{}' completed", run_id);
                self.active_run = None;
            } else {
                return Some(members.iter().map(|j| j.id).collect());
            }
        }

        let oldest = jobs.iter().find(|j| j.state == JobState::New)?;
        let run_id = oldest.run_id.clone();
        info!("Activating run group '{}'", run_id);

        let group = jobs
            .iter()
            .filter(|j| j.run_id == run_id)
            .map(|j| j.id)
            .collect();
        self.active_run = Some(run_id);
        Some(group)
    }

    /// Dispatches one job to the handler of its current state
    async fn process(&mut self, id: u64) -> anyhow::Result<()> {
        let Some(job) = self.repository.get(id).await else {
            self.contexts.remove(&id);
            return Ok(());
        };

        if job.state.is_driver_watched()
            && elapsed_since(job.last_driver_communication_utc) > self.config.driver_timeout
        {
            warn!(
                "Driver timeout for job {} ({}), last contact {}",
                job.id, job.state, job.last_driver_communication_utc
            );
            self.transition(id, JobEvent::DriverTimeout).await;
            return Ok(());
        }

        match job.state {
            JobState::New => self.on_new(&job).await,
            JobState::Initializing => self.on_initializing(&job).await,
            JobState::Waiting => self.on_waiting(&job).await,
            JobState::Starting => self.on_starting(&job).await,
            JobState::Running => self.on_running(&job).await,
            JobState::Stopping => self.on_stopping(&job).await,
            JobState::TraceCollecting => self.on_trace_collecting(&job).await,
            JobState::Deleting => self.on_deleting(&job).await,
            JobState::Failed
            | JobState::Stopped
            | JobState::TraceCollected
            | JobState::Deleted
            | JobState::NotSupported => Ok(()),
        }
    }

    /// Forces a job to `Failed` after an unexpected processing error
    async fn fault(&mut self, id: u64, e: anyhow::Error) {
        error!("Error while processing job {}: {:#}", id, e);
        self.transition_with_error(id, JobEvent::Faulted, Some(format!("{:#}", e)))
            .await;
    }

    async fn transition(&self, id: u64, event: JobEvent) -> Option<JobState> {
        self.transition_with_error(id, event, None).await
    }

    /// Applies `event` and records `error` if the transition happened
    async fn transition_with_error(&self, id: u64, event: JobEvent, error: Option<String>) -> Option<JobState> {
        let outcome = self
            .repository
            .update(id, |job| {
                let previous = job.apply(event)?;
                if error.is_some() {
                    job.error = error;
                }
                Some((previous, job.state, job.run_id.clone()))
            })
            .await
            .flatten();

        match outcome {
            Some((previous, next, run_id)) => {
                info!("Job {} (run '{}'): {} -> {}", id, run_id, previous, next);
                Some(next)
            }
            None => {
                debug!("Event {:?} ignored for job {}", event, id);
                None
            }
        }
    }

    /// Stops every workload still running when the agent shuts down
    async fn shutdown(&mut self) {
        let ids: Vec<u64> = self.contexts.keys().copied().collect();
        for id in ids {
            let Some(job) = self.repository.get(id).await else {
                continue;
            };
            if let Err(e) = self.teardown(&job).await {
                warn!("Failed to tear down job {} on shutdown: {:#}", id, e);
            }
        }
    }
}

/// Time elapsed since `instant`, zero if it lies in the future
fn elapsed_since(instant: DateTime<Utc>) -> Duration {
    (Utc::now() - instant).to_std().unwrap_or(Duration::ZERO)
}
