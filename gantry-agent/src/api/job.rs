//! Job API Handlers
//!
//! HTTP endpoints the controller drives a job through. Handlers only request
//! transitions; the scheduler does the actual work on its next tick.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use chrono::Utc;
use gantry_core::domain::job::{Job, JobEvent, JobState};
use gantry_core::dto::job::JobSummary;

use crate::api::AgentState;
use crate::api::error::{ApiError, ApiResult};
use crate::repository::JobRepository;

/// Outcome of a transition requested over HTTP
enum Requested {
    Applied { from: JobState, to: JobState },
    Ignored(JobState),
}

/// Applies `event` to a job, counting the request as driver contact
async fn request(repository: &JobRepository, id: u64, event: JobEvent) -> ApiResult<Requested> {
    repository
        .update(id, |job| {
            job.touch(Utc::now());
            match job.apply(event) {
                Some(from) => Requested::Applied { from, to: job.state },
                None => Requested::Ignored(job.state),
            }
        })
        .await
        .ok_or_else(|| ApiError::job_not_found(id))
}

// =============================================================================
// Queue Endpoints
// =============================================================================

/// POST /jobs
/// Submit a job; it waits in `New` until its run group is scheduled
pub async fn create_job(
    State(state): State<AgentState>,
    Json(job): Json<Job>,
) -> ApiResult<impl IntoResponse> {
    if job.run_id.trim().is_empty() {
        return Err(ApiError::BadRequest("runId is required".to_string()));
    }

    let job = state.repository.insert(job).await;
    tracing::info!(
        "Job {} created for service '{}' (run '{}')",
        job.id,
        job.service,
        job.run_id
    );

    let location = format!("/jobs/{}", job.id);
    Ok((StatusCode::CREATED, [(header::LOCATION, location)], Json(job)))
}

/// GET /jobs
/// List every job known to this agent, oldest first
pub async fn list_jobs(State(state): State<AgentState>) -> Json<Vec<JobSummary>> {
    Json(state.repository.summaries().await)
}

// =============================================================================
// Job Endpoints
// =============================================================================

/// GET /jobs/{id}
/// Full job document
pub async fn get_job(State(state): State<AgentState>, Path(id): Path<u64>) -> ApiResult<Json<Job>> {
    let job = state
        .repository
        .update(id, |job| {
            job.touch(Utc::now());
            job.clone()
        })
        .await
        .ok_or_else(|| ApiError::job_not_found(id))?;

    Ok(Json(job))
}

/// GET /jobs/{id}/state
/// Plain-text state name
pub async fn get_state(State(state): State<AgentState>, Path(id): Path<u64>) -> ApiResult<String> {
    let current = state
        .repository
        .update(id, |job| {
            job.touch(Utc::now());
            job.state
        })
        .await
        .ok_or_else(|| ApiError::job_not_found(id))?;

    Ok(current.to_string())
}

/// GET /jobs/{id}/touch
/// Keep-alive from the controller
pub async fn touch_job(State(state): State<AgentState>, Path(id): Path<u64>) -> ApiResult<StatusCode> {
    if !state.repository.touch(id).await {
        return Err(ApiError::job_not_found(id));
    }

    Ok(StatusCode::OK)
}

/// POST /jobs/{id}/start
pub async fn start_job(State(state): State<AgentState>, Path(id): Path<u64>) -> ApiResult<StatusCode> {
    match request(&state.repository, id, JobEvent::StartRequested).await? {
        Requested::Applied { from, to } => {
            tracing::info!("Job {} start requested: {} -> {}", id, from, to);
            Ok(StatusCode::OK)
        }
        Requested::Ignored(current) => {
            tracing::warn!("Job {} cannot be started from {}", id, current);
            Err(ApiError::Conflict(format!(
                "Job {} cannot be started from state {}",
                id, current
            )))
        }
    }
}

/// POST /jobs/{id}/stop
/// Ignored when the job is not running
pub async fn stop_job(State(state): State<AgentState>, Path(id): Path<u64>) -> ApiResult<StatusCode> {
    match request(&state.repository, id, JobEvent::StopRequested).await? {
        Requested::Applied { from, to } => {
            tracing::info!("Job {} stop requested: {} -> {}", id, from, to);
        }
        Requested::Ignored(current) => {
            tracing::warn!("Stop request for job {} ignored in state {}", id, current);
        }
    }

    Ok(StatusCode::OK)
}

/// DELETE /jobs/{id}
/// Ignored when the job is already being deleted
pub async fn delete_job(State(state): State<AgentState>, Path(id): Path<u64>) -> ApiResult<StatusCode> {
    match request(&state.repository, id, JobEvent::DeleteRequested).await? {
        Requested::Applied { from, to } => {
            tracing::info!("Job {} delete requested: {} -> {}", id, from, to);
        }
        Requested::Ignored(current) => {
            tracing::warn!("Delete request for job {} ignored in state {}", id, current);
        }
    }

    Ok(StatusCode::OK)
}

/// POST /jobs/{id}/resetstats
/// Clear measurements and metadata
pub async fn reset_stats(State(state): State<AgentState>, Path(id): Path<u64>) -> ApiResult<StatusCode> {
    state
        .repository
        .update(id, |job| {
            job.touch(Utc::now());
            job.reset_stats();
        })
        .await
        .ok_or_else(|| ApiError::job_not_found(id))?;

    tracing::info!("Job {} statistics reset", id);
    Ok(StatusCode::OK)
}

/// POST /jobs/{id}/measurements/flush
/// Drop delivered measurements, keeping metadata
pub async fn flush_measurements(
    State(state): State<AgentState>,
    Path(id): Path<u64>,
) -> ApiResult<StatusCode> {
    state
        .repository
        .update(id, |job| {
            job.touch(Utc::now());
            job.flush_measurements();
        })
        .await
        .ok_or_else(|| ApiError::job_not_found(id))?;

    tracing::debug!("Job {} measurements flushed", id);
    Ok(StatusCode::OK)
}

// =============================================================================
// Artifact Endpoints
// =============================================================================

/// POST /jobs/{id}/trace
/// Request trace collection for a running or stopped job
pub async fn request_trace(
    State(state): State<AgentState>,
    Path(id): Path<u64>,
) -> ApiResult<StatusCode> {
    match request(&state.repository, id, JobEvent::TraceRequested).await? {
        Requested::Applied { from, to } => {
            tracing::info!("Job {} trace requested: {} -> {}", id, from, to);
            Ok(StatusCode::OK)
        }
        Requested::Ignored(JobState::TraceCollecting | JobState::TraceCollected) => Ok(StatusCode::OK),
        Requested::Ignored(current) => Err(ApiError::Conflict(format!(
            "Cannot collect a trace for job {} in state {}",
            id, current
        ))),
    }
}

/// GET /jobs/{id}/trace
/// Download the collected trace artifact
pub async fn download_trace(
    State(state): State<AgentState>,
    Path(id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    let job = state
        .repository
        .get(id)
        .await
        .ok_or_else(|| ApiError::job_not_found(id))?;

    let Some(artifact) = job.trace_artifact else {
        return Err(ApiError::NotFound(format!("Job {} has no trace", id)));
    };

    let bytes = match tokio::fs::read(&artifact).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound(format!("Trace of job {} was removed", id)));
        }
        Err(e) => return Err(e.into()),
    };

    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes))
}

/// POST /jobs/{id}/attachments/{name}
/// Store a file the runner receives with the job
///
/// Only accepted before the job is started.
pub async fn upload_attachment(
    State(state): State<AgentState>,
    Path((id, name)): Path<(u64, String)>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let file_name = attachment_file_name(&name)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid attachment name '{}'", name)))?;

    let job = state
        .repository
        .get(id)
        .await
        .ok_or_else(|| ApiError::job_not_found(id))?;
    if !matches!(job.state, JobState::New | JobState::Initializing) {
        return Err(ApiError::Conflict(format!(
            "Attachments cannot be added to job {} in state {}",
            id, job.state
        )));
    }

    let directory = state.work_dir.join(id.to_string()).join("attachments");
    tokio::fs::create_dir_all(&directory).await?;
    let path = directory.join(file_name);
    tokio::fs::write(&path, &body).await?;

    let recorded = path.display().to_string();
    tracing::info!("Job {} received attachment {} ({} bytes)", id, recorded, body.len());

    state
        .repository
        .update(id, |job| {
            job.touch(Utc::now());
            if !job.attachments.contains(&recorded) {
                job.attachments.push(recorded);
            }
        })
        .await
        .ok_or_else(|| ApiError::job_not_found(id))?;

    Ok(StatusCode::OK)
}

/// Accepts plain file names only, no path components
fn attachment_file_name(name: &str) -> Option<&str> {
    let file_name = std::path::Path::new(name).file_name()?.to_str()?;
    (file_name == name && !name.contains('\\')).then_some(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_names() {
        assert_eq!(attachment_file_name("payload.bin"), Some("payload.bin"));
        assert_eq!(attachment_file_name("../etc/passwd"), None);
        assert_eq!(attachment_file_name(".."), None);
        assert_eq!(attachment_file_name("dir/file"), None);
        assert_eq!(attachment_file_name("dir\\file"), None);
        assert_eq!(attachment_file_name(""), None);
    }
}
