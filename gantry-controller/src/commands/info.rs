//! Info command handler

use anyhow::Result;
use colored::*;
use gantry_client::AgentClient;

/// Print an agent's platform
pub async fn show_info(agent: &str) -> Result<()> {
    let client = AgentClient::new(agent);
    let info = client.info().await?;

    println!("{}", format!("Agent {}", client.base_url()).bold());
    println!("  Platform:  {}/{}", info.os, info.arch);
    println!("  CPUs:      {}", info.cpu_count);
    println!("  Protocol:  {}", info.version.to_string().dimmed());

    Ok(())
}
