//! Per-job runtime context
//!
//! State that must survive across scheduler ticks but does not belong on the
//! serializable job record: process handles, background tasks, directories.

use anyhow::Result;
use std::path::PathBuf;
use tokio::task::JoinHandle;

use crate::heartbeat::{HeartbeatMonitor, SharedWorkload};
use crate::service::LaunchedWorkload;

/// Runtime context of one job, keyed by job id in the scheduler
#[derive(Default)]
pub(crate) struct RunContext {
    /// Build, launch and readiness wait, polled by the `Starting` handler
    pub start_task: Option<JoinHandle<Result<LaunchedWorkload>>>,
    pub trace_task: Option<JoinHandle<Result<PathBuf>>>,
    pub workload: Option<SharedWorkload>,
    pub heartbeat: Option<HeartbeatMonitor>,
    pub working_directory: Option<PathBuf>,
    pub remove_working_directory: bool,
    /// Set once the stop sequence has run, so it runs at most once
    pub stopped: bool,
}

impl RunContext {
    pub fn adopt(&mut self, launched: LaunchedWorkload) -> SharedWorkload {
        let workload: SharedWorkload = std::sync::Arc::new(tokio::sync::Mutex::new(launched.process));
        self.workload = Some(workload.clone());
        self.working_directory = Some(launched.working_directory);
        self.remove_working_directory = launched.remove_working_directory;
        workload
    }
}
