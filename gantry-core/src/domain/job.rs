//! Job domain types
//!
//! A [`Job`] is the record an agent keeps for one benchmarked workload. Its
//! [`JobState`] only moves through [`JobState::next`], which is the complete
//! transition table for the agent lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::measurement::{Measurement, MeasurementMetadata};
use crate::domain::platform::{PlatformRequirement, ResourceLimits};

/// Job record
///
/// Owned by the agent that hosts it (persisted in its repository, advanced by
/// its scheduler). Controllers hold a read-only mirror obtained by polling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Job {
    /// Unique per agent, assigned on submission
    pub id: u64,
    /// Groups every job of one scenario execution, across agents
    pub run_id: String,
    pub service: String,
    pub state: JobState,
    pub error: Option<String>,
    pub last_driver_communication_utc: DateTime<Utc>,
    /// The workload is expected to terminate on its own (e.g. a load client)
    pub wait_for_exit: bool,
    /// Maximum running duration, enforced by the controller
    pub timeout_seconds: Option<u64>,
    pub server_version: u32,

    pub executable: String,
    pub arguments: Vec<String>,
    pub environment: HashMap<String, String>,
    /// Console apps are considered ready as soon as they are launched
    pub is_console_app: bool,
    pub ready_state_text: Option<String>,
    /// `host:port` probed for readiness when no ready text is configured
    pub readiness_address: Option<String>,
    pub platform: PlatformRequirement,
    pub limits: ResourceLimits,
    pub collect_trace: bool,
    pub after_script: Option<String>,
    pub attachments: Vec<String>,
    pub trace_artifact: Option<String>,

    pub measurements: Vec<Measurement>,
    pub metadata: Vec<MeasurementMetadata>,
}

impl Job {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    /// Records driver contact, never moving the timestamp backwards
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_driver_communication_utc {
            self.last_driver_communication_utc = now;
        }
    }

    /// Applies `event` if the transition table allows it
    ///
    /// Returns the previous state when the state changed.
    pub fn apply(&mut self, event: JobEvent) -> Option<JobState> {
        let next = self.state.next(event)?;
        let previous = self.state;
        self.state = next;
        Some(previous)
    }

    /// Clears collected measurements and their descriptions
    pub fn reset_stats(&mut self) {
        self.measurements.clear();
        self.metadata.clear();
    }

    /// Drops collected measurements but keeps their descriptions, so a
    /// long-running job keeps reporting under the same metadata
    pub fn flush_measurements(&mut self) {
        self.measurements.clear();
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    #[default]
    New,
    Initializing,
    Waiting,
    Starting,
    Running,
    Failed,
    Stopping,
    Stopped,
    TraceCollecting,
    TraceCollected,
    Deleting,
    Deleted,
    NotSupported,
}

/// Something that happened to a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// The scheduler saw the job with a live driver
    DriverContacted,
    /// The driver has been silent for longer than the driver timeout
    DriverTimeout,
    /// Controller posted `/start`
    StartRequested,
    PlatformSupported,
    PlatformUnsupported,
    /// Build, launch or readiness failed
    StartFailed,
    Ready,
    /// Controller posted `/stop`
    StopRequested,
    StopCompleted,
    /// The workload exited on its own
    ProcessExited { code: i32 },
    TraceRequested,
    TraceCompleted,
    /// Controller sent `DELETE`
    DeleteRequested,
    TeardownCompleted,
    /// An unexpected error while processing the job
    Faulted,
}

impl JobState {
    pub const ALL: [JobState; 13] = [
        JobState::New,
        JobState::Initializing,
        JobState::Waiting,
        JobState::Starting,
        JobState::Running,
        JobState::Failed,
        JobState::Stopping,
        JobState::Stopped,
        JobState::TraceCollecting,
        JobState::TraceCollected,
        JobState::Deleting,
        JobState::Deleted,
        JobState::NotSupported,
    ];

    /// No transition leaves a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Deleted | JobState::NotSupported)
    }

    /// States in which driver silence reclaims the job
    pub fn is_driver_watched(self) -> bool {
        !matches!(
            self,
            JobState::Stopping | JobState::Deleting | JobState::Deleted | JobState::NotSupported
        )
    }

    /// The state reached from `self` on `event`, or `None` if the event is
    /// ignored in this state.
    pub fn next(self, event: JobEvent) -> Option<JobState> {
        use JobEvent as E;
        use JobState as S;

        if self.is_terminal() {
            return None;
        }

        let next = match (self, event) {
            (S::New, E::DriverContacted) => S::Initializing,

            (S::Running, E::DriverTimeout) => S::Stopping,
            (state, E::DriverTimeout) if state.is_driver_watched() => S::Deleting,

            (S::Initializing, E::StartRequested) => S::Waiting,

            (S::Waiting, E::PlatformUnsupported) => S::NotSupported,
            (S::Waiting, E::PlatformSupported) => S::Starting,

            (S::Starting, E::StartFailed) => S::Failed,
            (S::Starting, E::Ready) => S::Running,

            (S::Running, E::StopRequested) => S::Stopping,
            (S::Running, E::ProcessExited { code: 0 }) => S::Stopped,
            (S::Running, E::ProcessExited { .. }) => S::Failed,
            (S::Stopping, E::StopCompleted) => S::Stopped,

            (S::Running | S::Stopped, E::TraceRequested) => S::TraceCollecting,
            (S::TraceCollecting, E::TraceCompleted) => S::TraceCollected,

            (S::Deleting, E::TeardownCompleted) => S::Deleted,
            (S::Deleting, _) => return None,
            (_, E::DeleteRequested) => S::Deleting,

            (
                S::New
                | S::Initializing
                | S::Waiting
                | S::Starting
                | S::Running
                | S::Stopping
                | S::Stopped
                | S::TraceCollecting
                | S::TraceCollected,
                E::Faulted,
            ) => S::Failed,

            _ => return None,
        };

        Some(next)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::New => "New",
            JobState::Initializing => "Initializing",
            JobState::Waiting => "Waiting",
            JobState::Starting => "Starting",
            JobState::Running => "Running",
            JobState::Failed => "Failed",
            JobState::Stopping => "Stopping",
            JobState::Stopped => "Stopped",
            JobState::TraceCollecting => "TraceCollecting",
            JobState::TraceCollected => "TraceCollected",
            JobState::Deleting => "Deleting",
            JobState::Deleted => "Deleted",
            JobState::NotSupported => "NotSupported",
        };
        f.write_str(name)
    }
}

/// Error returned when parsing an unknown state name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownState(pub String);

impl fmt::Display for UnknownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown job state '{}'", self.0)
    }
}

impl std::error::Error for UnknownState {}

impl FromStr for JobState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches('"');
        JobState::ALL
            .into_iter()
            .find(|state| state.to_string().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}
