//! In-process agents with fake workloads

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use gantry_agent::api::{AgentState, create_router};
use gantry_agent::heartbeat::{ResourceSample, ResourceSampler};
use gantry_agent::service::{LaunchedWorkload, Runner, WorkloadProcess};
use gantry_agent::{AgentConfig, JobRepository, Scheduler};
use gantry_controller::{ConnectionOptions, OrchestratorOptions};
use gantry_core::domain::job::Job;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

/// How long a wait-for-exit workload runs before exiting with 0
pub const CLIENT_RUNTIME: Duration = Duration::from_millis(150);

/// Launches and stops recorded by service name, across agents
#[derive(Clone, Default)]
pub struct Journal {
    pub launched: Arc<Mutex<Vec<String>>>,
    pub stopped: Arc<Mutex<Vec<String>>>,
    /// Services whose first launch waits until all of them are launching
    rendezvous: Arc<Mutex<HashSet<String>>>,
    barrier: Option<Arc<Barrier>>,
}

impl Journal {
    /// Journal whose first launches of `services` complete together
    pub fn with_rendezvous(services: &[&str]) -> Self {
        Self {
            rendezvous: Arc::new(Mutex::new(services.iter().map(|s| s.to_string()).collect())),
            barrier: Some(Arc::new(Barrier::new(services.len()))),
            ..Default::default()
        }
    }

    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn launches_of(&self, service: &str) -> usize {
        self.launched().iter().filter(|s| *s == service).count()
    }
}

struct FakeProcess {
    service: String,
    exits_at: Option<Instant>,
    journal: Journal,
}

#[async_trait]
impl WorkloadProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(1)
    }

    fn try_exit_code(&mut self) -> Result<Option<i32>> {
        Ok(self.exits_at.filter(|at| Instant::now() >= *at).map(|_| 0))
    }

    fn output(&self) -> String {
        String::new()
    }

    async fn stop(&mut self, _grace: Duration) -> Result<()> {
        self.journal.stopped.lock().unwrap().push(self.service.clone());
        Ok(())
    }
}

/// Fails services named "broken"; wait-for-exit jobs exit on their own
struct FakeRunner {
    journal: Journal,
    work_dir: PathBuf,
}

#[async_trait]
impl Runner for FakeRunner {
    async fn build_and_launch(&self, job: &Job) -> Result<LaunchedWorkload> {
        if job.service == "broken" {
            anyhow::bail!("compilation failed");
        }

        let meets = self.journal.rendezvous.lock().unwrap().remove(&job.service);
        if let (true, Some(barrier)) = (meets, &self.journal.barrier) {
            barrier.wait().await;
        }

        self.journal.launched.lock().unwrap().push(job.service.clone());
        Ok(LaunchedWorkload {
            process: Box::new(FakeProcess {
                service: job.service.clone(),
                exits_at: job.wait_for_exit.then(|| Instant::now() + CLIENT_RUNTIME),
                journal: self.journal.clone(),
            }),
            working_directory: self.work_dir.join(format!("job-{}", job.id)),
            remove_working_directory: false,
        })
    }
}

struct IdleSampler;

impl ResourceSampler for IdleSampler {
    fn sample(&mut self, _pid: u32) -> Result<ResourceSample> {
        Ok(ResourceSample {
            cpu_percent: 25.0,
            working_set_bytes: 32 * 1024 * 1024,
            swap_bytes: None,
        })
    }
}

static AGENTS: AtomicUsize = AtomicUsize::new(0);

/// Agent served on a random local port with its scheduler running
pub struct TestAgent {
    pub url: String,
    pub repository: Arc<JobRepository>,
    shutdown: CancellationToken,
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn spawn_agent(journal: &Journal) -> TestAgent {
    let work_dir = std::env::temp_dir().join(format!(
        "gantry-controller-{}-{}",
        std::process::id(),
        AGENTS.fetch_add(1, Ordering::SeqCst)
    ));
    let config = AgentConfig {
        tick_interval: Duration::from_millis(10),
        driver_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_millis(20),
        stop_grace: Duration::from_millis(50),
        work_dir: work_dir.clone(),
        ..Default::default()
    };

    let repository = Arc::new(JobRepository::new());
    let runner = FakeRunner {
        journal: journal.clone(),
        work_dir: work_dir.join("apps"),
    };
    let scheduler = Scheduler::new(config, Arc::clone(&repository), Arc::new(runner))
        .with_sampler(Arc::new(|| Box::new(IdleSampler) as Box<dyn ResourceSampler>));

    let shutdown = CancellationToken::new();
    tokio::spawn(scheduler.run(shutdown.clone()));

    let app = create_router(AgentState::new(Arc::clone(&repository), work_dir));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let token = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .unwrap();
    });

    TestAgent {
        url: format!("http://{}", address),
        repository,
        shutdown,
    }
}

pub fn connection_options() -> ConnectionOptions {
    ConnectionOptions {
        poll_interval: Duration::from_millis(20),
        keep_alive_interval: Duration::from_millis(50),
        stop_grace: Duration::from_secs(3),
        trace_timeout: Duration::from_secs(3),
        state_retry_delays: vec![Duration::from_millis(20), Duration::from_millis(50)],
        ..Default::default()
    }
}

pub fn orchestrator_options() -> OrchestratorOptions {
    OrchestratorOptions {
        deadlock_unblock_wait: Duration::from_secs(3),
        max_deadlock_retries: 5,
        restart_jitter: Duration::from_millis(50),
        deadlock_patience: Duration::from_secs(10),
        connection: connection_options(),
    }
}

/// Job template of a long-running service
pub fn server_job() -> Job {
    Job {
        executable: "server".to_string(),
        ..Default::default()
    }
}

/// Job template of a service that exits by itself
pub fn client_job() -> Job {
    Job {
        executable: "client".to_string(),
        wait_for_exit: true,
        ..Default::default()
    }
}
