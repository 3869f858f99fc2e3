//! Orchestrator
//!
//! Runs a scenario across agents: starts services in dependency order, lets
//! them run, tears them down in reverse order and publishes the results.
//! Repeats this per iteration or span.
//!
//! Each agent runs one run group at a time, so two runs spanning the same
//! agents can wait on each other. Before and while starting a service the
//! orchestrator looks for that cycle in the agents' queues. Of the two runs,
//! the one with the greater run id yields: it tears its own run down, lets
//! the other run through and restarts the whole start sequence after a
//! random delay that grows with each retry. The other run keeps waiting, and
//! only yields itself when the cycle outlives its patience.

use anyhow::Context;
use futures::future::join_all;
use gantry_client::{AgentClient, ClientError};
use gantry_core::domain::job::JobState;
use gantry_core::domain::platform::PlatformRequirement;
use gantry_core::dto::job::JobSummary;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{ConnectionOptions, JobConnection};
use crate::results::{IterationResults, JobResult, ResultsSink};
use crate::scenario::{RunOptions, Scenario, ServiceDefinition};

/// Orchestrator tunables
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// How long to wait for the other run to leave the queue after yielding
    pub deadlock_unblock_wait: Duration,
    /// Deadlock recoveries allowed before the run is aborted
    pub max_deadlock_retries: u32,
    /// Upper bound of the random delay before the first restart after a
    /// deadlock; multiplied by the retry number for later ones
    pub restart_jitter: Duration,
    /// How long a run that should not yield waits on a deadlock before
    /// yielding anyway
    pub deadlock_patience: Duration,
    pub connection: ConnectionOptions,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            deadlock_unblock_wait: Duration::from_secs(3),
            max_deadlock_retries: 10,
            restart_jitter: Duration::from_secs(2),
            deadlock_patience: Duration::from_secs(30),
            connection: ConnectionOptions::default(),
        }
    }
}

/// Errors that abort a run
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Another run waits on an agent this run occupies, and the reverse
    #[error("Deadlock detected with run '{other_run}'")]
    Deadlock { other_run: String },

    #[error("Deadlock could not be resolved after {retries} retries")]
    DeadlockUnresolved { retries: u32 },

    #[error("Service '{service}' failed: {error}")]
    ServiceFailed { service: String, error: String },

    #[error("Service '{service}' is not supported: {reason}")]
    Unsupported { service: String, reason: String },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of a completed run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Iterations whose results were published
    pub iterations: u32,
    pub deadlock_retries: u32,
    /// The scenario could not run on the configured agents
    pub skipped: bool,
}

/// Started replicas of one service
struct ServiceGroup {
    name: String,
    wait_for_exit: bool,
    collect_trace: bool,
    connections: Vec<JobConnection>,
}

/// Runs one scenario
pub struct Orchestrator {
    scenario: Scenario,
    run: RunOptions,
    options: OrchestratorOptions,
    run_id: String,
    sinks: Vec<Box<dyn ResultsSink>>,
}

impl Orchestrator {
    /// Creates an orchestrator with a fresh run id
    pub fn new(scenario: Scenario, run: RunOptions) -> Self {
        Self {
            scenario,
            run,
            options: OrchestratorOptions::default(),
            run_id: Uuid::new_v4().to_string(),
            sinks: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn ResultsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Runs every iteration of the scenario
    pub async fn run(&mut self) -> Result<RunSummary, OrchestratorError> {
        let boundary = self.run.repeat_boundary(&self.scenario)?;
        let mut summary = RunSummary::default();

        if let Some(reason) = self.check_platforms().await? {
            warn!("Skipping scenario '{}': {}", self.scenario.name, reason);
            summary.skipped = true;
            return Ok(summary);
        }

        info!("Running scenario '{}' as run {}", self.scenario.name, self.run_id);

        let started = Instant::now();
        let mut active: Vec<ServiceGroup> = Vec::new();

        loop {
            let iteration = summary.iterations + 1;
            info!("Starting iteration {}", iteration);

            match self.start_with_recovery(&mut active, &mut summary).await {
                Ok(()) => {}
                Err(OrchestratorError::Unsupported { service, reason }) => {
                    warn!("Skipping scenario '{}': '{}' is not supported: {}", self.scenario.name, service, reason);
                    self.teardown(&mut active, 0).await;
                    summary.skipped = true;
                    return Ok(summary);
                }
                Err(e) => {
                    error!("Iteration {} failed: {}", iteration, e);
                    self.teardown(&mut active, 0).await;
                    return Err(e);
                }
            }

            self.hold().await;

            let last = match self.run.span {
                Some(span) => started.elapsed() >= span,
                None => iteration >= self.run.iterations.max(1),
            };
            let keep = if last { 0 } else { boundary };

            let mut jobs = self.teardown(&mut active, keep).await;
            jobs.extend(self.refresh_kept(&mut active).await);

            summary.iterations = iteration;
            self.publish(IterationResults {
                run_id: self.run_id.clone(),
                iteration,
                jobs,
            })?;

            if last {
                break;
            }
        }

        info!(
            "Run {} completed: {} iteration(s), {} deadlock retries",
            self.run_id, summary.iterations, summary.deadlock_retries
        );
        Ok(summary)
    }

    /// Confirms every constrained service can run on its agents
    ///
    /// Returns the reason when one cannot.
    async fn check_platforms(&self) -> Result<Option<String>, OrchestratorError> {
        for service in self.scenario.ordered_services() {
            let requirement = &service.job.platform;
            if *requirement == PlatformRequirement::default() {
                continue;
            }

            for endpoint in &service.endpoints {
                let info = AgentClient::new(endpoint.as_str()).info().await?;
                if !requirement.is_satisfied_by(&info.platform()) {
                    return Ok(Some(format!(
                        "'{}' requires {}/{} but {} is {}/{}",
                        service.name,
                        requirement.os.as_deref().unwrap_or("any"),
                        requirement.arch.as_deref().unwrap_or("any"),
                        endpoint,
                        info.os,
                        info.arch
                    )));
                }
            }
        }

        Ok(None)
    }

    // =============================================================================
    // Start
    // =============================================================================

    /// Runs the start sequence, restarting it after each deadlock recovery
    async fn start_with_recovery(
        &self,
        active: &mut Vec<ServiceGroup>,
        summary: &mut RunSummary,
    ) -> Result<(), OrchestratorError> {
        loop {
            match self.start_services(active).await {
                Err(OrchestratorError::Deadlock { other_run }) => {
                    summary.deadlock_retries += 1;
                    if summary.deadlock_retries > self.options.max_deadlock_retries {
                        return Err(OrchestratorError::DeadlockUnresolved {
                            retries: self.options.max_deadlock_retries,
                        });
                    }

                    let delay = self.jitter(summary.deadlock_retries);
                    warn!(
                        "Yielded to run '{}', restarting in {:?} (retry {})",
                        other_run, delay, summary.deadlock_retries
                    );
                    time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Starts every service not already running, in dependency order
    async fn start_services(&self, active: &mut Vec<ServiceGroup>) -> Result<(), OrchestratorError> {
        for (index, service) in self.scenario.ordered_services().into_iter().enumerate() {
            if index < active.len() {
                debug!("Reusing running service '{}'", service.name);
                continue;
            }

            let mut connections = self.connections_for(service);

            if let Some(other_run) = self.detect_deadlock(service, active).await {
                if self.yields_to(&other_run) {
                    self.recover_from_deadlock(active, &mut connections, &other_run).await;
                    return Err(OrchestratorError::Deadlock { other_run });
                }
                info!("Waiting for run '{}' to yield", other_run);
            }

            info!("Starting '{}' on {} agent(s)", service.name, connections.len());
            let results = {
                let starts = join_all(connections.iter_mut().map(|c| c.start(&service.name)));
                tokio::select! {
                    results = starts => Ok(results),
                    other_run = self.watch_for_deadlock(service, active) => Err(other_run),
                }
            };

            let results = match results {
                Ok(results) => results,
                Err(other_run) => {
                    self.recover_from_deadlock(active, &mut connections, &other_run).await;
                    return Err(OrchestratorError::Deadlock { other_run });
                }
            };

            let mut unsupported = None;
            let mut failure = None;
            for (connection, result) in connections.iter().zip(results) {
                match result {
                    Ok(Some(_)) => {}
                    Ok(None) if connection.state() == JobState::NotSupported => {
                        unsupported = connection.job().error.clone();
                    }
                    Ok(None) => {
                        failure = Some(
                            connection
                                .job()
                                .error
                                .clone()
                                .unwrap_or_else(|| format!("failed to start on {}", connection.endpoint())),
                        );
                    }
                    Err(e) => failure = Some(format!("{:#}", e)),
                }
            }

            let mut group = ServiceGroup {
                name: service.name.clone(),
                wait_for_exit: service.job.wait_for_exit,
                collect_trace: service.job.collect_trace,
                connections,
            };

            if failure.is_none() && unsupported.is_none() && group.wait_for_exit {
                info!("Waiting for '{}' to exit", service.name);
                join_all(group.connections.iter_mut().map(|c| c.wait_until_exited())).await;

                for connection in &mut group.connections {
                    if connection.state() != JobState::Stopped {
                        let reason = connection
                            .refresh()
                            .await
                            .ok()
                            .and_then(|job| job.error)
                            .unwrap_or_else(|| format!("ended as {}", connection.state()));
                        failure = Some(reason);
                    }
                }
            }

            active.push(group);

            if let Some(reason) = unsupported {
                return Err(OrchestratorError::Unsupported {
                    service: service.name.clone(),
                    reason,
                });
            }
            if let Some(error) = failure {
                return Err(OrchestratorError::ServiceFailed {
                    service: service.name.clone(),
                    error,
                });
            }
        }

        Ok(())
    }

    fn connections_for(&self, service: &ServiceDefinition) -> Vec<JobConnection> {
        service
            .endpoints
            .iter()
            .map(|endpoint| {
                let mut template = service.job.clone();
                template.run_id = self.run_id.clone();
                template.service = service.name.clone();

                JobConnection::new(
                    AgentClient::new(endpoint.as_str()),
                    template,
                    self.options.connection.clone(),
                )
                .with_attachments(service.attachments.clone())
            })
            .collect()
    }

    // =============================================================================
    // Deadlock
    // =============================================================================

    /// Looks for a run that occupies one of `service`'s agents while waiting
    /// on an agent this run occupies
    ///
    /// Returns the id of that run.
    async fn detect_deadlock(&self, service: &ServiceDefinition, active: &[ServiceGroup]) -> Option<String> {
        // (target agent, run occupying it)
        let mut occupants: Vec<(String, String)> = Vec::new();
        for endpoint in &service.endpoints {
            let target = normalize(endpoint);
            for job in self.queue(&target).await {
                if job.run_id != self.run_id && job.state == JobState::Running {
                    occupants.push((target.clone(), job.run_id));
                }
            }
        }

        if occupants.is_empty() {
            return None;
        }

        for agent in used_agents(active) {
            let queue = self.queue(&agent).await;
            let we_block = queue.iter().any(|j| {
                j.run_id == self.run_id && j.state == JobState::Running && !j.wait_for_exit
            });
            if !we_block {
                continue;
            }

            for (target, other_run) in &occupants {
                if *target == agent {
                    continue;
                }

                let other_waits = queue
                    .iter()
                    .any(|j| &j.run_id == other_run && j.state == JobState::New);
                if other_waits {
                    warn!(
                        "Deadlock: run '{}' occupies {} and waits on {}, which run {} occupies",
                        other_run, target, agent, self.run_id
                    );
                    return Some(other_run.clone());
                }
            }
        }

        None
    }

    /// Whether this run gives way when deadlocked with `other_run`
    fn yields_to(&self, other_run: &str) -> bool {
        self.run_id.as_str() > other_run
    }

    /// Re-runs deadlock detection every poll interval until this run has to
    /// yield
    ///
    /// Returns the run to yield to.
    async fn watch_for_deadlock(&self, service: &ServiceDefinition, active: &[ServiceGroup]) -> String {
        let mut since: Option<Instant> = None;
        loop {
            time::sleep(self.options.connection.poll_interval).await;
            let Some(other_run) = self.detect_deadlock(service, active).await else {
                since = None;
                continue;
            };

            if self.yields_to(&other_run) {
                return other_run;
            }

            let waited = since.get_or_insert_with(Instant::now).elapsed();
            if waited >= self.options.deadlock_patience {
                warn!(
                    "Run '{}' did not yield within {:?}",
                    other_run, self.options.deadlock_patience
                );
                return other_run;
            }
        }
    }

    /// Removes this run from every agent and waits for `other_run` to be
    /// scheduled
    async fn recover_from_deadlock(
        &self,
        active: &mut Vec<ServiceGroup>,
        pending: &mut [JobConnection],
        other_run: &str,
    ) {
        warn!("Run {} yields to run '{}'", self.run_id, other_run);

        let mut agents = used_agents(active);
        for connection in pending.iter() {
            let endpoint = normalize(connection.endpoint());
            if !agents.contains(&endpoint) {
                agents.push(endpoint);
            }
        }

        join_all(pending.iter_mut().map(|c| c.abandon())).await;

        while let Some(mut group) = active.pop() {
            info!("Releasing '{}'", group.name);
            let wait_for_exit = group.wait_for_exit;
            join_all(group.connections.iter_mut().map(|c| async move {
                if !wait_for_exit {
                    if let Err(e) = c.stop().await {
                        warn!("Failed to stop job on {}: {:#}", c.endpoint(), e);
                    }
                }
                c.abandon().await;
            }))
            .await;
        }

        let deadline = Instant::now() + self.options.deadlock_unblock_wait;
        loop {
            let mut waiting = false;
            for agent in &agents {
                if self
                    .queue(agent)
                    .await
                    .iter()
                    .any(|j| j.run_id == other_run && j.state == JobState::New)
                {
                    waiting = true;
                    break;
                }
            }

            if !waiting {
                info!("Run '{}' is no longer waiting on our agents", other_run);
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Run '{}' still waiting after {:?}",
                    other_run, self.options.deadlock_unblock_wait
                );
                return;
            }

            time::sleep(self.options.connection.poll_interval).await;
        }
    }

    /// Random restart delay for the given retry
    fn jitter(&self, retry: u32) -> Duration {
        let max = self.options.restart_jitter.saturating_mul(retry.max(1)).as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(0..=max))
    }

    /// Queue of an agent; empty when the agent cannot be reached
    async fn queue(&self, endpoint: &str) -> Vec<JobSummary> {
        match AgentClient::new(endpoint).list_jobs().await {
            Ok(queue) => queue,
            Err(e) => {
                debug!("Failed to read the queue of {}: {}", endpoint, e);
                Vec::new()
            }
        }
    }

    // =============================================================================
    // Run and Teardown
    // =============================================================================

    /// Lets long-running services run when nothing exits on its own
    async fn hold(&self) {
        if self.scenario.has_wait_for_exit() {
            return;
        }

        if let Some(hold) = self.run.hold {
            info!("Holding services for {:?}", hold);
            time::sleep(hold).await;
        }
    }

    /// Tears down services in reverse start order, keeping the first `keep`
    async fn teardown(&self, active: &mut Vec<ServiceGroup>, keep: usize) -> Vec<JobResult> {
        let mut jobs = Vec::new();

        while active.len() > keep {
            let Some(mut group) = active.pop() else {
                break;
            };

            info!("Stopping '{}'", group.name);
            let name = group.name.clone();
            let collect_trace = group.collect_trace;
            let results = join_all(
                group
                    .connections
                    .iter_mut()
                    .map(|c| self.teardown_connection(c, &name, collect_trace)),
            )
            .await;
            jobs.extend(results);
        }

        jobs
    }

    async fn teardown_connection(
        &self,
        connection: &mut JobConnection,
        service: &str,
        collect_trace: bool,
    ) -> JobResult {
        if let Err(e) = connection.stop().await {
            warn!("Failed to stop '{}' on {}: {:#}", service, connection.endpoint(), e);
        }

        if connection.job_id().is_some() {
            if let Err(e) = connection.refresh().await {
                warn!("Failed to fetch '{}' from {}: {:#}", service, connection.endpoint(), e);
            }
        }

        if let Some(job_error) = &connection.job().error {
            error!("'{}' on {} reported: {}", service, connection.endpoint(), job_error);
        }

        let result = JobResult {
            service: service.to_string(),
            endpoint: connection.endpoint().to_string(),
            job: connection.job().clone(),
        };

        if collect_trace && matches!(connection.state(), JobState::Running | JobState::Stopped) {
            if let Err(e) = connection.download_trace(&self.run.trace_directory).await {
                warn!("Failed to collect the trace of '{}': {:#}", service, e);
            }
        }

        connection.abandon().await;
        result
    }

    /// Captures the results of kept services and clears their measurements
    async fn refresh_kept(&self, active: &mut [ServiceGroup]) -> Vec<JobResult> {
        let mut jobs = Vec::new();

        for group in active.iter_mut() {
            for connection in &mut group.connections {
                if let Err(e) = connection.refresh().await {
                    warn!("Failed to fetch '{}' from {}: {:#}", group.name, connection.endpoint(), e);
                }

                jobs.push(JobResult {
                    service: group.name.clone(),
                    endpoint: connection.endpoint().to_string(),
                    job: connection.job().clone(),
                });

                let cleared = if self.run.auto_flush || self.run.span.is_some() {
                    connection.flush().await
                } else {
                    connection.reset_stats().await
                };
                if let Err(e) = cleared {
                    warn!("Failed to clear measurements of '{}': {:#}", group.name, e);
                }
            }
        }

        jobs
    }

    fn publish(&mut self, results: IterationResults) -> Result<(), OrchestratorError> {
        for sink in &mut self.sinks {
            sink.write(&results)
                .with_context(|| format!("Failed to publish iteration {}", results.iteration))?;
        }

        Ok(())
    }
}

fn normalize(endpoint: &str) -> String {
    endpoint.trim_end_matches('/').to_string()
}

/// Agents hosting started services, in start order
fn used_agents(active: &[ServiceGroup]) -> Vec<String> {
    let mut agents: Vec<String> = Vec::new();
    for connection in active.iter().flat_map(|g| g.connections.iter()) {
        let endpoint = normalize(connection.endpoint());
        if !agents.contains(&endpoint) {
            agents.push(endpoint);
        }
    }
    agents
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator(run_id: &str) -> Orchestrator {
        let options = OrchestratorOptions {
            restart_jitter: Duration::from_millis(10),
            ..OrchestratorOptions::default()
        };
        Orchestrator::new(Scenario::default(), RunOptions::default())
            .with_options(options)
            .with_run_id(run_id)
    }

    #[test]
    fn test_greater_run_id_yields() {
        assert!(orchestrator("run-y").yields_to("run-x"));
        assert!(!orchestrator("run-x").yields_to("run-y"));
    }

    #[test]
    fn test_jitter_grows_with_retries() {
        let orchestrator = orchestrator("run-1");
        for _ in 0..100 {
            assert!(orchestrator.jitter(0) <= Duration::from_millis(10));
            assert!(orchestrator.jitter(1) <= Duration::from_millis(10));
            assert!(orchestrator.jitter(4) <= Duration::from_millis(40));
        }
        assert!((0..200).any(|_| orchestrator.jitter(4) > Duration::from_millis(10)));
    }
}
