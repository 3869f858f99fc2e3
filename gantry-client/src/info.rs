//! Agent info endpoint

use crate::AgentClient;
use crate::error::Result;
use gantry_core::dto::agent::AgentInfo;

impl AgentClient {
    /// Get the platform and protocol version of the agent
    pub async fn info(&self) -> Result<AgentInfo> {
        let url = format!("{}/info", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }
}
