//! Gantry HTTP Client
//!
//! A type-safe HTTP client for the agent API, used by the controller to
//! submit jobs and drive them through their lifecycle.
//!
//! # Example
//!
//! ```no_run
//! use gantry_client::AgentClient;
//! use gantry_core::domain::job::Job;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), gantry_client::ClientError> {
//!     let client = AgentClient::new("http://localhost:5010");
//!
//!     let submitted = client.submit_job(&Job {
//!         run_id: "run-1".to_string(),
//!         service: "application".to_string(),
//!         ..Default::default()
//!     }).await?;
//!
//!     println!("Submitted job: {}", submitted.url);
//!     Ok(())
//! }
//! ```

pub mod error;
mod info;
mod jobs;

// Re-export commonly used types
pub use error::{ClientError, Result};
pub use jobs::SubmittedJob;

use reqwest::Client;
use serde::de::DeserializeOwned;

/// HTTP client for one agent
///
/// Methods are organized into logical groups:
/// - Queue (submit, list)
/// - Job lifecycle (state, touch, start, stop, delete)
/// - Measurements and artifacts (reset, flush, trace, attachments)
/// - Agent info
#[derive(Debug, Clone)]
pub struct AgentClient {
    /// Base URL of the agent (e.g., "http://localhost:5010")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl AgentClient {
    /// Create a new agent client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the agent API (e.g., "http://localhost:5010")
    ///
    /// # Example
    /// ```
    /// use gantry_client::AgentClient;
    ///
    /// let client = AgentClient::new("http://localhost:5010");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new agent client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the agent API
    /// * `client` - A configured reqwest Client
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the agent
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of a job's document on this agent
    pub fn job_url(&self, job_id: u64) -> String {
        format!("{}/jobs/{}", self.base_url, job_id)
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = self.check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response that returns no content
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        self.check_status(response).await.map(|_| ())
    }

    /// Turns a non-success status into a [`ClientError::ApiError`]
    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(response)
    }
}
