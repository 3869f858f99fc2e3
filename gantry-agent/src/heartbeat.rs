//! Heartbeat monitor
//!
//! Samples a running job once per interval: CPU and memory are appended to
//! the job's measurements, and process exit is reported back to the
//! scheduler over a channel.
//!
//! At most one sample is in flight per job. A tick that finds the job's
//! workload lock held (a previous sample, or the scheduler stopping the
//! process) is skipped, not queued.

use anyhow::Result;
use gantry_core::domain::measurement::{Measurement, MeasurementMetadata, names};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::repository::JobRepository;
use crate::service::WorkloadProcess;

/// Workload handle shared between the scheduler and the heartbeat
pub type SharedWorkload = Arc<Mutex<Box<dyn WorkloadProcess>>>;

/// Creates one sampler per monitored job
pub type SamplerFactory = Arc<dyn Fn() -> Box<dyn ResourceSampler> + Send + Sync>;

/// Reported by a heartbeat to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// The workload exited on its own
    Exited { job_id: u64, code: i32 },
}

/// One resource sample of a process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    /// CPU usage normalized to 0-100 across all cores
    pub cpu_percent: f64,
    pub working_set_bytes: u64,
    pub swap_bytes: Option<u64>,
}

/// Source of process resource usage
pub trait ResourceSampler: Send {
    fn sample(&mut self, pid: u32) -> Result<ResourceSample>;
}

/// Samples through OS process accounting
pub struct SysinfoSampler {
    system: System,
    cores: usize,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }

    pub fn factory() -> SamplerFactory {
        Arc::new(|| Box::new(SysinfoSampler::new()) as Box<dyn ResourceSampler>)
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&mut self, pid: u32) -> Result<ResourceSample> {
        let pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );

        let process = self
            .system
            .process(pid)
            .ok_or_else(|| anyhow::anyhow!("Process {} not found", pid))?;

        let cpu_percent = (f64::from(process.cpu_usage()) / self.cores as f64).clamp(0.0, 100.0);
        let working_set_bytes = process.memory();

        self.system
            .refresh_memory_specifics(MemoryRefreshKind::nothing().with_swap());
        let swap_bytes = Some(self.system.used_swap());

        Ok(ResourceSample {
            cpu_percent,
            working_set_bytes,
            swap_bytes,
        })
    }
}

/// Recurring sampler attached to one running job
#[derive(Debug)]
pub struct HeartbeatMonitor {
    job_id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HeartbeatMonitor {
    /// Starts sampling `workload` every `interval`
    pub fn start(
        job_id: u64,
        workload: SharedWorkload,
        mut sampler: Box<dyn ResourceSampler>,
        repository: Arc<JobRepository>,
        events: mpsc::UnboundedSender<HeartbeatEvent>,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            // Missed ticks are dropped while a sample runs
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Ok(mut process) = workload.try_lock() else {
                    debug!("Heartbeat for job {} skipped, workload busy", job_id);
                    continue;
                };

                if let Some(code) = beat(job_id, process.as_mut(), sampler.as_mut(), &repository).await {
                    info!("Job {} process exited with code {}", job_id, code);
                    if events.send(HeartbeatEvent::Exited { job_id, code }).is_err() {
                        debug!("Scheduler is gone, exit of job {} not reported", job_id);
                    }
                    break;
                }
            }

            debug!("Heartbeat for job {} finished", job_id);
        });

        Self {
            job_id,
            cancel,
            handle,
        }
    }

    /// Stops the timer and waits for an in-flight sample to complete
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Heartbeat task for job {} failed: {}", self.job_id, e);
        }
    }
}

/// Samples once; returns the exit code if the process has exited
async fn beat(
    job_id: u64,
    process: &mut dyn WorkloadProcess,
    sampler: &mut dyn ResourceSampler,
    repository: &JobRepository,
) -> Option<i32> {
    match process.try_exit_code() {
        Ok(Some(code)) => return Some(code),
        Ok(None) => {}
        Err(e) => warn!("Failed to check process of job {}: {:#}", job_id, e),
    }

    let Some(pid) = process.pid() else {
        return None;
    };

    let sample = match sampler.sample(pid) {
        Ok(sample) => sample,
        Err(e) => {
            debug!("Failed to sample job {} (pid {}): {:#}", job_id, pid, e);
            return None;
        }
    };

    repository
        .update(job_id, |job| {
            for metadata in MeasurementMetadata::host_process() {
                if !job.metadata.iter().any(|m| m.name == metadata.name) {
                    job.metadata.push(metadata);
                }
            }

            job.measurements
                .push(Measurement::new(names::CPU, sample.cpu_percent.round()));
            job.measurements.push(Measurement::new(
                names::WORKING_SET,
                sample.working_set_bytes / 1024 / 1024,
            ));
            if let Some(swap) = sample.swap_bytes {
                job.measurements
                    .push(Measurement::new(names::SWAP, swap / 1024 / 1024));
            }
        })
        .await;

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gantry_core::domain::job::Job;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProcess {
        exit_after: usize,
        checks: usize,
    }

    #[async_trait]
    impl WorkloadProcess for ScriptedProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn try_exit_code(&mut self) -> Result<Option<i32>> {
            self.checks += 1;
            Ok((self.checks > self.exit_after).then_some(7))
        }

        fn output(&self) -> String {
            String::new()
        }

        async fn stop(&mut self, _grace: Duration) -> Result<()> {
            Ok(())
        }
    }

    struct FixedSampler(Arc<AtomicUsize>);

    impl ResourceSampler for FixedSampler {
        fn sample(&mut self, _pid: u32) -> Result<ResourceSample> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(ResourceSample {
                cpu_percent: 12.4,
                working_set_bytes: 64 * 1024 * 1024,
                swap_bytes: None,
            })
        }
    }

    fn workload(exit_after: usize) -> SharedWorkload {
        Arc::new(Mutex::new(Box::new(ScriptedProcess {
            exit_after,
            checks: 0,
        })))
    }

    #[tokio::test]
    async fn test_records_measurements_and_reports_exit() {
        let repository = Arc::new(JobRepository::new());
        let job = repository.insert(Job::default()).await;
        let samples = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let monitor = HeartbeatMonitor::start(
            job.id,
            workload(2),
            Box::new(FixedSampler(Arc::clone(&samples))),
            Arc::clone(&repository),
            tx,
            Duration::from_millis(10),
        );

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(HeartbeatEvent::Exited { job_id: job.id, code: 7 }));
        monitor.stop().await;

        assert_eq!(samples.load(Ordering::SeqCst), 2);
        let job = repository.get(job.id).await.unwrap();
        let cpu: Vec<_> = job
            .measurements
            .iter()
            .filter(|m| m.name == names::CPU)
            .collect();
        assert_eq!(cpu.len(), 2);
        assert_eq!(cpu[0].value, serde_json::json!(12.0));
        assert!(job.metadata.iter().any(|m| m.name == names::WORKING_SET));
    }

    #[tokio::test]
    async fn test_skips_ticks_while_workload_is_locked() {
        let repository = Arc::new(JobRepository::new());
        let job = repository.insert(Job::default()).await;
        let samples = Arc::new(AtomicUsize::new(0));
        let (tx, _rx) = mpsc::unbounded_channel();
        let shared = workload(usize::MAX);

        let guard = shared.lock().await;
        let monitor = HeartbeatMonitor::start(
            job.id,
            Arc::clone(&shared),
            Box::new(FixedSampler(Arc::clone(&samples))),
            Arc::clone(&repository),
            tx,
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(samples.load(Ordering::SeqCst), 0);

        drop(guard);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(samples.load(Ordering::SeqCst) > 0);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_exit_without_scheduler_ends_monitor() {
        let repository = Arc::new(JobRepository::new());
        let job = repository.insert(Job::default()).await;
        let samples = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let monitor = HeartbeatMonitor::start(
            job.id,
            workload(1),
            Box::new(FixedSampler(Arc::clone(&samples))),
            Arc::clone(&repository),
            tx,
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(monitor.handle.is_finished());
        assert_eq!(samples.load(Ordering::SeqCst), 1);
        monitor.stop().await;
    }
}
