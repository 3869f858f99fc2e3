//! Job repository
//!
//! In-memory store of the job records owned by this agent. Job ids are
//! assigned on insert and are unique for the lifetime of the process.

use chrono::Utc;
use gantry_core::AGENT_PROTOCOL_VERSION;
use gantry_core::domain::job::{Job, JobState};
use gantry_core::dto::job::JobSummary;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Thread-safe store of job records
#[derive(Debug)]
pub struct JobRepository {
    jobs: RwLock<BTreeMap<u64, Job>>,
    next_id: AtomicU64,
}

impl JobRepository {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Stores a submitted job as `New` and returns the stored record
    ///
    /// Agent-owned fields (id, state, error, protocol version, driver
    /// contact) are overwritten regardless of what was submitted.
    pub async fn insert(&self, mut job: Job) -> Job {
        job.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        job.state = JobState::New;
        job.error = None;
        job.trace_artifact = None;
        job.attachments.clear();
        job.server_version = AGENT_PROTOCOL_VERSION;
        job.last_driver_communication_utc = Utc::now();

        self.jobs.write().await.insert(job.id, job.clone());
        job
    }

    pub async fn get(&self, id: u64) -> Option<Job> {
        self.jobs.read().await.get(&id).cloned()
    }

    /// All jobs, oldest first
    pub async fn list(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Queue view of all jobs, oldest first
    pub async fn summaries(&self) -> Vec<JobSummary> {
        self.jobs
            .read()
            .await
            .values()
            .map(JobSummary::from)
            .collect()
    }

    /// Mutates a job in place
    ///
    /// Returns `None` if the job does not exist.
    pub async fn update<R>(&self, id: u64, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let mut jobs = self.jobs.write().await;
        jobs.get_mut(&id).map(f)
    }

    pub async fn remove(&self, id: u64) -> Option<Job> {
        self.jobs.write().await.remove(&id)
    }

    /// Records driver contact for a job
    ///
    /// Returns `false` if the job does not exist.
    pub async fn touch(&self, id: u64) -> bool {
        self.update(id, |job| job.touch(Utc::now())).await.is_some()
    }
}

impl Default for JobRepository {
    fn default() -> Self {
        Self::new()
    }
}
