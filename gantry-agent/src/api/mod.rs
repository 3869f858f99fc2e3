//! API Module
//!
//! HTTP API layer for the agent.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod info;
pub mod job;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use gantry_core::AGENT_PROTOCOL_VERSION;
use gantry_core::domain::platform::PlatformInfo;
use gantry_core::dto::agent::AgentInfo;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::repository::JobRepository;

/// Largest attachment accepted in one upload
const MAX_ATTACHMENT_BYTES: usize = 512 * 1024 * 1024;

/// State shared by all handlers
#[derive(Clone)]
pub struct AgentState {
    pub repository: Arc<JobRepository>,
    pub info: AgentInfo,
    /// Root of the per-job upload directories
    pub work_dir: PathBuf,
}

impl AgentState {
    /// Creates handler state describing the platform of this process
    pub fn new(repository: Arc<JobRepository>, work_dir: PathBuf) -> Self {
        let platform = PlatformInfo::current();

        Self {
            repository,
            info: AgentInfo {
                os: platform.os,
                arch: platform.arch,
                cpu_count: std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1),
                version: AGENT_PROTOCOL_VERSION,
            },
            work_dir,
        }
    }
}

/// Create the main API router with all endpoints
pub fn create_router(state: AgentState) -> Router {
    Router::new()
        // Agent endpoints
        .route("/info", get(info::get_info))
        // Job endpoints
        .route("/jobs", post(job::create_job).get(job::list_jobs))
        .route("/jobs/{id}", get(job::get_job).delete(job::delete_job))
        .route("/jobs/{id}/state", get(job::get_state))
        .route("/jobs/{id}/touch", get(job::touch_job))
        .route("/jobs/{id}/start", post(job::start_job))
        .route("/jobs/{id}/stop", post(job::stop_job))
        .route("/jobs/{id}/resetstats", post(job::reset_stats))
        .route("/jobs/{id}/measurements/flush", post(job::flush_measurements))
        .route("/jobs/{id}/trace", post(job::request_trace).get(job::download_trace))
        .route(
            "/jobs/{id}/attachments/{name}",
            post(job::upload_attachment).layer(DefaultBodyLimit::max(MAX_ATTACHMENT_BYTES)),
        )
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
