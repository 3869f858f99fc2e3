//! Job-related API endpoints

use crate::AgentClient;
use crate::error::{ClientError, Result};
use gantry_core::domain::job::{Job, JobState};
use gantry_core::dto::job::JobSummary;
use reqwest::header::LOCATION;

/// A job accepted by an agent
#[derive(Debug, Clone)]
pub struct SubmittedJob {
    /// The job as stored by the agent, with its assigned id
    pub job: Job,
    /// Absolute URL from the `Location` header
    pub url: String,
}

impl AgentClient {
    // =============================================================================
    // Queue
    // =============================================================================

    /// Submit a job to the agent's queue
    ///
    /// # Arguments
    /// * `job` - The job document; agent-owned fields are ignored
    ///
    /// # Returns
    /// The stored job and its location
    pub async fn submit_job(&self, job: &Job) -> Result<SubmittedJob> {
        let url = format!("{}/jobs", self.base_url);
        let response = self.client.post(&url).json(job).send().await?;
        let response = self.check_status(response).await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ClientError::ParseError("Missing Location header".to_string()))?;

        let job: Job = response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))?;

        let url = if location.starts_with("http://") || location.starts_with("https://") {
            location
        } else {
            format!("{}{}", self.base_url, location)
        };

        Ok(SubmittedJob { job, url })
    }

    /// List the agent's queue, oldest first
    pub async fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        let url = format!("{}/jobs", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Job Lifecycle
    // =============================================================================

    /// Get the full job document
    ///
    /// # Arguments
    /// * `job_id` - The id assigned by the agent
    pub async fn get_job(&self, job_id: u64) -> Result<Job> {
        let response = self.client.get(self.job_url(job_id)).send().await?;

        self.handle_response(response).await
    }

    /// Get the current state of a job
    ///
    /// # Arguments
    /// * `job_id` - The id assigned by the agent
    ///
    /// # Returns
    /// The state parsed from the plain-text response
    pub async fn get_state(&self, job_id: u64) -> Result<JobState> {
        let url = format!("{}/state", self.job_url(job_id));
        let response = self.client.get(&url).send().await?;
        let text = self.check_status(response).await?.text().await?;

        text.parse()
            .map_err(|e| ClientError::ParseError(format!("Invalid job state: {}", e)))
    }

    /// Refresh the job's driver contact time
    pub async fn touch(&self, job_id: u64) -> Result<()> {
        let url = format!("{}/touch", self.job_url(job_id));
        let response = self.client.get(&url).send().await?;

        self.handle_empty_response(response).await
    }

    /// Ask the agent to build and launch the job's workload
    pub async fn start_job(&self, job_id: u64) -> Result<()> {
        let url = format!("{}/start", self.job_url(job_id));
        let response = self.client.post(&url).send().await?;

        self.handle_empty_response(response).await
    }

    /// Ask the agent to stop the job's workload
    pub async fn stop_job(&self, job_id: u64) -> Result<()> {
        let url = format!("{}/stop", self.job_url(job_id));
        let response = self.client.post(&url).send().await?;

        self.handle_empty_response(response).await
    }

    /// Ask the agent to tear the job down
    pub async fn delete_job(&self, job_id: u64) -> Result<()> {
        let response = self.client.delete(self.job_url(job_id)).send().await?;

        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Measurements and Artifacts
    // =============================================================================

    /// Clear measurements and metadata
    pub async fn reset_stats(&self, job_id: u64) -> Result<()> {
        let url = format!("{}/resetstats", self.job_url(job_id));
        let response = self.client.post(&url).send().await?;

        self.handle_empty_response(response).await
    }

    /// Drop delivered measurements, keeping metadata
    pub async fn flush_measurements(&self, job_id: u64) -> Result<()> {
        let url = format!("{}/measurements/flush", self.job_url(job_id));
        let response = self.client.post(&url).send().await?;

        self.handle_empty_response(response).await
    }

    /// Request trace collection
    pub async fn request_trace(&self, job_id: u64) -> Result<()> {
        let url = format!("{}/trace", self.job_url(job_id));
        let response = self.client.post(&url).send().await?;

        self.handle_empty_response(response).await
    }

    /// Download the collected trace artifact
    pub async fn download_trace(&self, job_id: u64) -> Result<Vec<u8>> {
        let url = format!("{}/trace", self.job_url(job_id));
        let response = self.client.get(&url).send().await?;
        let bytes = self.check_status(response).await?.bytes().await?;

        Ok(bytes.to_vec())
    }

    /// Upload a file the runner receives with the job
    ///
    /// # Arguments
    /// * `job_id` - The id assigned by the agent
    /// * `name` - Plain file name, without path components
    /// * `content` - File contents
    pub async fn upload_attachment(&self, job_id: u64, name: &str, content: Vec<u8>) -> Result<()> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(ClientError::InvalidRequest(format!(
                "Invalid attachment name '{}'",
                name
            )));
        }

        let url = format!("{}/attachments/{}", self.job_url(job_id), name);
        let response = self.client.post(&url).body(content).send().await?;

        self.handle_empty_response(response).await
    }
}
