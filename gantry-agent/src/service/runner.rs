//! Runner service
//!
//! Builds and launches the benchmarked workload. The scheduler only sees the
//! [`Runner`] and [`WorkloadProcess`] traits; [`LocalProcessRunner`] is the
//! implementation the agent binary ships with.

use anyhow::{Context, Result};
use async_trait::async_trait;
use gantry_core::domain::job::Job;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Maximum amount of workload output kept for ready-text matching
const OUTPUT_CAPACITY: usize = 64 * 1024;

/// A workload the runner has launched
pub struct LaunchedWorkload {
    pub process: Box<dyn WorkloadProcess>,
    pub working_directory: PathBuf,
    /// Whether the working directory is temporary and removed on delete
    pub remove_working_directory: bool,
}

/// Handle on a running workload process
#[async_trait]
pub trait WorkloadProcess: Send {
    /// OS process id, if the process is still known to the OS
    fn pid(&self) -> Option<u32>;

    /// Exit code if the process has exited
    fn try_exit_code(&mut self) -> Result<Option<i32>>;

    /// Output captured so far
    fn output(&self) -> String;

    /// Terminates the process, gracefully first and forcefully after `grace`
    ///
    /// Stopping an already exited process succeeds.
    async fn stop(&mut self, grace: Duration) -> Result<()>;
}

/// Service trait for building and launching workloads
#[async_trait]
pub trait Runner: Send + Sync {
    /// Builds the job's application and launches it
    async fn build_and_launch(&self, job: &Job) -> Result<LaunchedWorkload>;

    /// Runs the job's after-script once the workload is stopped
    async fn run_after_script(&self, job: &Job, working_directory: &Path) -> Result<()> {
        let _ = (job, working_directory);
        Ok(())
    }
}

/// Runner that launches `job.executable` directly on this machine
pub struct LocalProcessRunner {
    work_dir: PathBuf,
}

impl LocalProcessRunner {
    /// Creates a runner rooted at `work_dir`
    ///
    /// Each job gets its own `<work_dir>/<job id>/app` directory.
    pub fn new(work_dir: PathBuf) -> Self {
        Self { work_dir }
    }
}

#[async_trait]
impl Runner for LocalProcessRunner {
    async fn build_and_launch(&self, job: &Job) -> Result<LaunchedWorkload> {
        if job.executable.is_empty() {
            anyhow::bail!("Job {} does not define an executable", job.id);
        }

        let working_directory = self.work_dir.join(job.id.to_string()).join("app");
        tokio::fs::create_dir_all(&working_directory)
            .await
            .with_context(|| {
                format!(
                    "Failed to create working directory {}",
                    working_directory.display()
                )
            })?;

        info!(
            "Launching '{} {}' for job {}",
            job.executable,
            job.arguments.join(" "),
            job.id
        );

        let mut child = Command::new(&job.executable)
            .args(&job.arguments)
            .envs(&job.environment)
            .current_dir(&working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to launch '{}'", job.executable))?;

        let output = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(capture_output(job.id, stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(capture_output(job.id, stderr, Arc::clone(&output)));
        }

        Ok(LaunchedWorkload {
            process: Box::new(LocalProcess {
                child,
                output,
                readers,
            }),
            working_directory,
            remove_working_directory: true,
        })
    }

    async fn run_after_script(&self, job: &Job, working_directory: &Path) -> Result<()> {
        let Some(script) = job.after_script.as_deref() else {
            return Ok(());
        };

        info!("Running after-script for job {}", job.id);

        let (shell, flag) = if cfg!(windows) {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };

        let status = Command::new(shell)
            .arg(flag)
            .arg(script)
            .current_dir(working_directory)
            .envs(&job.environment)
            .status()
            .await
            .context("Failed to run after-script")?;

        if !status.success() {
            anyhow::bail!("After-script exited with {}", status);
        }

        Ok(())
    }
}

/// Local OS process launched by [`LocalProcessRunner`]
struct LocalProcess {
    child: Child,
    output: Arc<Mutex<String>>,
    readers: Vec<JoinHandle<()>>,
}

#[async_trait]
impl WorkloadProcess for LocalProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit_code(&mut self) -> Result<Option<i32>> {
        let status = self
            .child
            .try_wait()
            .context("Failed to query workload status")?;

        // Killed by a signal: no code, report as failure
        Ok(status.map(|s| s.code().unwrap_or(-1)))
    }

    fn output(&self) -> String {
        self.output
            .lock()
            .map(|output| output.clone())
            .unwrap_or_default()
    }

    async fn stop(&mut self, grace: Duration) -> Result<()> {
        if self.child.try_wait()?.is_none() {
            if request_termination(&self.child)
                && tokio::time::timeout(grace, self.child.wait()).await.is_ok()
            {
                debug!("Workload exited gracefully");
            } else {
                warn!("Workload did not exit within {:?}, killing it", grace);
                self.child
                    .kill()
                    .await
                    .context("Failed to kill workload")?;
            }
        }

        for reader in self.readers.drain(..) {
            reader.abort();
        }

        Ok(())
    }
}

/// Asks the process to exit; returns `false` when no graceful signal exists
#[cfg(unix)]
fn request_termination(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!("Failed to send SIGTERM to {}: {}", pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn request_termination(_child: &Child) -> bool {
    false
}

fn capture_output<R>(job_id: u64, stream: R, output: Arc<Mutex<String>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[job {}] {}", job_id, line);

            let Ok(mut buffer) = output.lock() else {
                break;
            };
            buffer.push_str(&line);
            buffer.push('\n');
            if buffer.len() > OUTPUT_CAPACITY {
                let excess = buffer.len() - OUTPUT_CAPACITY;
                let cut = (excess..buffer.len())
                    .find(|i| buffer.is_char_boundary(*i))
                    .unwrap_or(buffer.len());
                buffer.drain(..cut);
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn job(executable: &str, arguments: &[&str]) -> Job {
        Job {
            id: 1,
            executable: executable.to_string(),
            arguments: arguments.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_launch_captures_output_and_exit_code() {
        let dir = std::env::temp_dir().join(format!("gantry-runner-{}", std::process::id()));
        let runner = LocalProcessRunner::new(dir.clone());

        let mut launched = runner
            .build_and_launch(&job("sh", &["-c", "echo Application started; exit 3"]))
            .await
            .unwrap();

        let mut code = None;
        for _ in 0..50 {
            code = launched.process.try_exit_code().unwrap();
            if code.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(code, Some(3));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(launched.process.output().contains("Application started"));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_stop_terminates_long_running_process() {
        let dir = std::env::temp_dir().join(format!("gantry-runner-stop-{}", std::process::id()));
        let runner = LocalProcessRunner::new(dir.clone());

        let mut launched = runner
            .build_and_launch(&job("sleep", &["30"]))
            .await
            .unwrap();
        assert!(launched.process.try_exit_code().unwrap().is_none());

        launched.process.stop(Duration::from_secs(2)).await.unwrap();
        assert!(launched.process.try_exit_code().unwrap().is_some());

        // Stopping twice is harmless
        launched.process.stop(Duration::from_secs(2)).await.unwrap();

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_missing_executable_is_rejected() {
        let runner = LocalProcessRunner::new(std::env::temp_dir());
        let result = runner.build_and_launch(&job("", &[])).await;
        assert!(result.is_err());
    }
}
