//! Agent configuration
//!
//! Defines the timeouts and intervals that drive the scheduler, along with
//! the bind address and working directory.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
///
/// All timeouts and intervals are configurable so tests and slow machines can
/// tune them independently.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Address the HTTP API listens on
    pub bind_addr: String,

    /// Delay between two scheduler ticks
    pub tick_interval: Duration,

    /// How long the controller may stay silent before its jobs are reclaimed
    pub driver_timeout: Duration,

    /// How long deleted jobs stay listed before being garbage-collected
    pub deleted_timeout: Duration,

    /// Maximum time for the runner to build and launch a workload
    pub build_timeout: Duration,

    /// Maximum time for a launched workload to become ready
    pub start_timeout: Duration,

    /// Time a workload gets to exit gracefully before being killed
    pub stop_grace: Duration,

    /// Interval between two heartbeat samples of a running job
    pub heartbeat_interval: Duration,

    /// Root directory for job working directories and uploads
    pub work_dir: PathBuf,
}

impl AgentConfig {
    /// Creates configuration from environment variables
    ///
    /// Every variable is optional:
    /// - GANTRY_BIND_ADDR (default: 0.0.0.0:5010)
    /// - GANTRY_TICK_INTERVAL_MS (default: 1000)
    /// - GANTRY_DRIVER_TIMEOUT (seconds, default: 10)
    /// - GANTRY_DELETED_TIMEOUT (seconds, default: 64800)
    /// - GANTRY_BUILD_TIMEOUT (seconds, default: 600)
    /// - GANTRY_START_TIMEOUT (seconds, default: 180)
    /// - GANTRY_STOP_GRACE (seconds, default: 10)
    /// - GANTRY_HEARTBEAT_INTERVAL_MS (default: 1000)
    /// - GANTRY_WORK_DIR (default: <temp>/gantry)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let millis = |name: &str, default: Duration| -> anyhow::Result<Duration> {
            env_number(name).map(|v| v.map(Duration::from_millis).unwrap_or(default))
        };
        let seconds = |name: &str, default: Duration| -> anyhow::Result<Duration> {
            env_number(name).map(|v| v.map(Duration::from_secs).unwrap_or(default))
        };

        Ok(Self {
            bind_addr: std::env::var("GANTRY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            tick_interval: millis("GANTRY_TICK_INTERVAL_MS", defaults.tick_interval)?,
            driver_timeout: seconds("GANTRY_DRIVER_TIMEOUT", defaults.driver_timeout)?,
            deleted_timeout: seconds("GANTRY_DELETED_TIMEOUT", defaults.deleted_timeout)?,
            build_timeout: seconds("GANTRY_BUILD_TIMEOUT", defaults.build_timeout)?,
            start_timeout: seconds("GANTRY_START_TIMEOUT", defaults.start_timeout)?,
            stop_grace: seconds("GANTRY_STOP_GRACE", defaults.stop_grace)?,
            heartbeat_interval: millis("GANTRY_HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval)?,
            work_dir: std::env::var("GANTRY_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.parse::<SocketAddr>().is_err() {
            anyhow::bail!("bind_addr '{}' is not a valid socket address", self.bind_addr);
        }

        if self.tick_interval.is_zero() {
            anyhow::bail!("tick_interval must be greater than 0");
        }

        if self.heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeat_interval must be greater than 0");
        }

        // A tick slower than the driver timeout would reclaim live jobs
        if self.driver_timeout <= self.tick_interval {
            anyhow::bail!("driver_timeout must be longer than tick_interval");
        }

        if self.work_dir.as_os_str().is_empty() {
            anyhow::bail!("work_dir cannot be empty");
        }

        Ok(())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5010".to_string(),
            tick_interval: Duration::from_secs(1),
            driver_timeout: Duration::from_secs(10),
            deleted_timeout: Duration::from_secs(18 * 60 * 60),
            build_timeout: Duration::from_secs(10 * 60),
            start_timeout: Duration::from_secs(3 * 60),
            stop_grace: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(1),
            work_dir: std::env::temp_dir().join("gantry"),
        }
    }
}

fn env_number(name: &str) -> anyhow::Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} must be a positive integer, got '{}'", name, value)),
        Err(_) => Ok(None),
    }
}
