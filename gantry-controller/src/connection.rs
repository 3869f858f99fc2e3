//! Job connection
//!
//! Controller-side handle on one job hosted by one agent. A connection
//! submits the job, drives it to `Running`, keeps it alive while it runs and
//! tears it down. Its [`Job`] mirror is refreshed by every poll.

use anyhow::{Context, Result};
use gantry_client::AgentClient;
use gantry_core::MIN_AGENT_PROTOCOL_VERSION;
use gantry_core::domain::job::{Job, JobState};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

/// Connection tunables
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Delay between two state polls
    pub poll_interval: Duration,
    /// Delay between two `/touch` calls
    pub keep_alive_interval: Duration,
    /// How long a stop may take before the job is deleted anyway
    pub stop_grace: Duration,
    /// How long trace collection may take
    pub trace_timeout: Duration,
    /// Delay between failed state queries; one attempt per entry
    pub state_retry_delays: Vec<Duration>,
    /// Oldest agent protocol version accepted
    pub min_protocol_version: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            keep_alive_interval: Duration::from_secs(2),
            stop_grace: Duration::from_secs(30),
            trace_timeout: Duration::from_secs(60),
            state_retry_delays: vec![
                Duration::from_millis(100),
                Duration::from_millis(500),
                Duration::from_millis(1000),
            ],
            min_protocol_version: MIN_AGENT_PROTOCOL_VERSION,
        }
    }
}

/// One job on one agent
pub struct JobConnection {
    client: AgentClient,
    options: ConnectionOptions,
    attachments: Vec<PathBuf>,
    /// Submitted template, then the last job document fetched
    mirror: Job,
    job_id: Option<u64>,
    url: Option<String>,
    keep_alive: Option<KeepAlive>,
}

impl JobConnection {
    /// Creates a connection that will submit `template` to `client`'s agent
    pub fn new(client: AgentClient, template: Job, options: ConnectionOptions) -> Self {
        Self {
            client,
            options,
            attachments: Vec::new(),
            mirror: template,
            job_id: None,
            url: None,
            keep_alive: None,
        }
    }

    /// Local files uploaded to the agent before the job is started
    pub fn with_attachments(mut self, attachments: Vec<PathBuf>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn client(&self) -> &AgentClient {
        &self.client
    }

    pub fn endpoint(&self) -> &str {
        self.client.base_url()
    }

    pub fn job_id(&self) -> Option<u64> {
        self.job_id
    }

    /// Job URL, once submitted
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Last known job document
    pub fn job(&self) -> &Job {
        &self.mirror
    }

    pub fn state(&self) -> JobState {
        self.mirror.state
    }

    pub fn wait_for_exit(&self) -> bool {
        self.mirror.wait_for_exit
    }

    // =============================================================================
    // Lifecycle
    // =============================================================================

    /// Submits the job and drives it until it runs
    ///
    /// # Returns
    /// The job URL once the job is `Running` (or `Stopped` for a
    /// wait-for-exit job), `None` if the job failed or is not supported by
    /// the agent.
    pub async fn start(&mut self, name: &str) -> Result<Option<String>> {
        self.mirror.service = name.to_string();

        let submitted = self
            .client
            .submit_job(&self.mirror)
            .await
            .with_context(|| format!("Failed to submit '{}' to {}", name, self.endpoint()))?;
        let job_id = submitted.job.id;
        info!("Job for '{}' submitted: {}", name, submitted.url);

        self.mirror = submitted.job;
        self.job_id = Some(job_id);
        self.url = Some(submitted.url.clone());

        self.wait_for_initializing(name).await?;

        let job = self.refresh().await?;
        if job.server_version < self.options.min_protocol_version {
            anyhow::bail!(
                "Agent {} speaks protocol version {}, at least {} is required",
                self.endpoint(),
                job.server_version,
                self.options.min_protocol_version
            );
        }

        self.keep_alive = Some(KeepAlive::start(
            self.client.clone(),
            job_id,
            self.options.keep_alive_interval,
        ));

        self.upload_attachments(job_id).await?;

        self.client
            .start_job(job_id)
            .await
            .with_context(|| format!("Failed to start '{}'", name))?;

        loop {
            match self.get_state().await {
                JobState::Running => {
                    if let (Some(keep_alive), Some(timeout)) = (&self.keep_alive, self.mirror.timeout()) {
                        keep_alive.arm(timeout);
                    }
                    info!("'{}' is running: {}", name, submitted.url);
                    return Ok(Some(submitted.url));
                }
                JobState::Stopped if self.mirror.wait_for_exit => {
                    info!("'{}' already completed: {}", name, submitted.url);
                    return Ok(Some(submitted.url));
                }
                JobState::Stopped => {
                    anyhow::bail!("'{}' stopped before it was reported running", name);
                }
                JobState::Failed => {
                    let reason = self.failure_reason().await;
                    error!("'{}' failed to start: {}", name, reason);
                    return Ok(None);
                }
                JobState::NotSupported => {
                    let reason = self.failure_reason().await;
                    warn!("'{}' is not supported by {}: {}", name, self.endpoint(), reason);
                    return Ok(None);
                }
                JobState::Deleting | JobState::Deleted => {
                    anyhow::bail!("'{}' was deleted by the agent while starting", name);
                }
                state => debug!("'{}' is {}", name, state),
            }

            time::sleep(self.options.poll_interval).await;
        }
    }

    /// Polls until the agent schedules the job's run group
    async fn wait_for_initializing(&mut self, name: &str) -> Result<()> {
        loop {
            match self.get_state().await {
                JobState::New => debug!("'{}' is queued", name),
                JobState::Initializing => return Ok(()),
                JobState::Failed => {
                    let reason = self.failure_reason().await;
                    anyhow::bail!("'{}' failed while queued: {}", name, reason);
                }
                state @ (JobState::Deleting | JobState::Deleted | JobState::NotSupported) => {
                    anyhow::bail!("'{}' became {} while queued", name, state);
                }
                state => anyhow::bail!("'{}' is unexpectedly {} while queued", name, state),
            }

            time::sleep(self.options.poll_interval).await;
        }
    }

    async fn upload_attachments(&self, job_id: u64) -> Result<()> {
        for path in &self.attachments {
            let name = attachment_name(path)?;
            let content = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read attachment {}", path.display()))?;

            info!("Uploading {} ({} bytes) to job {}", path.display(), content.len(), job_id);
            self.client
                .upload_attachment(job_id, name, content)
                .await
                .with_context(|| format!("Failed to upload {}", path.display()))?;
        }

        Ok(())
    }

    /// Polls a wait-for-exit job until it completes
    pub async fn wait_until_exited(&mut self) -> JobState {
        loop {
            let state = self.get_state().await;
            if matches!(
                state,
                JobState::Stopped
                    | JobState::Failed
                    | JobState::NotSupported
                    | JobState::Deleting
                    | JobState::Deleted
            ) {
                return state;
            }

            time::sleep(self.options.poll_interval).await;
        }
    }

    /// Stops the job, waiting up to the stop grace period
    ///
    /// A job the agent no longer knows counts as stopped.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(job_id) = self.job_id else {
            return Ok(());
        };

        if let Some(keep_alive) = self.keep_alive.take() {
            keep_alive.stop().await;
        }

        match self.client.stop_job(job_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!("Job {} on {} was already removed", job_id, self.endpoint());
                self.mirror.state = JobState::Deleted;
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stop job {}", job_id));
            }
        }

        let deadline = Instant::now() + self.options.stop_grace;
        loop {
            let state = self.get_state().await;
            if matches!(
                state,
                JobState::Stopped | JobState::Failed | JobState::NotSupported | JobState::Deleted
            ) {
                debug!("Job {} on {} is {}", job_id, self.endpoint(), state);
                return Ok(());
            }

            if Instant::now() >= deadline {
                warn!(
                    "Job {} on {} did not stop within {:?}, deleting it anyway",
                    job_id,
                    self.endpoint(),
                    self.options.stop_grace
                );
                return Ok(());
            }

            time::sleep(self.options.poll_interval).await;
        }
    }

    /// Deletes the job; a job already gone is not an error
    pub async fn delete(&mut self) -> Result<()> {
        let Some(job_id) = self.job_id else {
            return Ok(());
        };

        if let Some(keep_alive) = self.keep_alive.take() {
            keep_alive.stop().await;
        }

        match self.client.delete_job(job_id).await {
            Ok(()) => {
                info!("Job {} on {} deleted", job_id, self.endpoint());
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!("Job {} on {} was already removed", job_id, self.endpoint());
                self.mirror.state = JobState::Deleted;
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to delete job {}", job_id)),
        }
    }

    /// Deletes the job, logging failures instead of returning them
    pub async fn abandon(&mut self) {
        if let Err(e) = self.delete().await {
            warn!("Failed to abandon job on {}: {:#}", self.endpoint(), e);
        }
    }

    // =============================================================================
    // Queries
    // =============================================================================

    /// Current state of the job
    ///
    /// Transient failures (no answer, 5xx) are retried once per configured
    /// delay. A job that stays unreachable, or whose query the agent rejects,
    /// is reported as `Failed`; a job the agent no longer knows as `Deleted`.
    pub async fn get_state(&mut self) -> JobState {
        let Some(job_id) = self.job_id else {
            return self.mirror.state;
        };

        let attempts = self.options.state_retry_delays.len();
        let mut state = JobState::Failed;
        for (attempt, delay) in self.options.state_retry_delays.iter().enumerate() {
            match self.client.get_state(job_id).await {
                Ok(current) => {
                    state = current;
                    break;
                }
                Err(e) if e.is_not_found() => {
                    state = JobState::Deleted;
                    break;
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "State query {} for job {} on {} failed: {}",
                        attempt + 1,
                        job_id,
                        self.endpoint(),
                        e
                    );
                    if attempt + 1 < attempts {
                        time::sleep(*delay).await;
                    }
                }
                Err(e) => {
                    error!(
                        "State query for job {} on {} was rejected: {}",
                        job_id,
                        self.endpoint(),
                        e
                    );
                    break;
                }
            }
        }

        self.mirror.state = state;
        state
    }

    /// Fetches the full job document into the mirror
    pub async fn refresh(&mut self) -> Result<Job> {
        let job_id = self.submitted_id()?;
        let job = self
            .client
            .get_job(job_id)
            .await
            .with_context(|| format!("Failed to fetch job {}", job_id))?;

        self.mirror = job.clone();
        Ok(job)
    }

    /// Clears measurements before a new iteration
    pub async fn reset_stats(&self) -> Result<()> {
        let job_id = self.submitted_id()?;
        self.client.reset_stats(job_id).await?;
        Ok(())
    }

    /// Drops delivered measurements
    pub async fn flush(&self) -> Result<()> {
        let job_id = self.submitted_id()?;
        self.client.flush_measurements(job_id).await?;
        Ok(())
    }

    /// Requests a trace, waits for it and writes it into `directory`
    pub async fn download_trace(&mut self, directory: &Path) -> Result<PathBuf> {
        let job_id = self.submitted_id()?;
        self.client
            .request_trace(job_id)
            .await
            .with_context(|| format!("Failed to request a trace for job {}", job_id))?;

        let deadline = Instant::now() + self.options.trace_timeout;
        loop {
            match self.get_state().await {
                JobState::TraceCollected => break,
                JobState::TraceCollecting => {}
                state => anyhow::bail!("Trace of job {} was interrupted in state {}", job_id, state),
            }

            if Instant::now() >= deadline {
                anyhow::bail!("Trace of job {} not collected within {:?}", job_id, self.options.trace_timeout);
            }
            time::sleep(self.options.poll_interval).await;
        }

        let bytes = self.client.download_trace(job_id).await?;
        tokio::fs::create_dir_all(directory).await?;
        let path = directory.join(format!("{}-{}.trace", self.mirror.service, job_id));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!("Trace of job {} saved to {}", job_id, path.display());
        Ok(path)
    }

    fn submitted_id(&self) -> Result<u64> {
        self.job_id
            .ok_or_else(|| anyhow::anyhow!("Job for '{}' was never submitted", self.mirror.service))
    }

    async fn failure_reason(&mut self) -> String {
        match self.refresh().await {
            Ok(job) => job.error.unwrap_or_else(|| "no error reported".to_string()),
            Err(e) => format!("{:#}", e),
        }
    }
}

fn attachment_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow::anyhow!("Attachment {} has no file name", path.display()))
}

/// Background `/touch` loop of one connection
///
/// Once armed with a timeout, stops the job when the timeout expires and
/// exits. Cancelled when dropped.
struct KeepAlive {
    cancel: CancellationToken,
    deadline: watch::Sender<Option<Instant>>,
    handle: JoinHandle<()>,
    _guard: DropGuard,
}

impl KeepAlive {
    fn start(client: AgentClient, job_id: u64, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let (deadline, deadline_rx) = watch::channel(None::<Instant>);

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let expired = deadline_rx.borrow().is_some_and(|d| Instant::now() >= d);
                if expired {
                    warn!("Job {} exceeded its timeout, stopping it", job_id);
                    if let Err(e) = client.stop_job(job_id).await {
                        warn!("Failed to stop job {} after timeout: {}", job_id, e);
                    }
                    break;
                }

                if let Err(e) = client.touch(job_id).await {
                    warn!("Keep-alive for job {} failed: {}", job_id, e);
                }
            }
        });

        Self {
            _guard: cancel.clone().drop_guard(),
            cancel,
            deadline,
            handle,
        }
    }

    /// Stops the job once `timeout` has elapsed from now
    fn arm(&self, timeout: Duration) {
        self.deadline.send_replace(Some(Instant::now() + timeout));
    }

    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Keep-alive task failed: {}", e);
        }
    }
}
