//! Queue command handler

use anyhow::Result;
use colored::*;
use gantry_client::AgentClient;
use gantry_core::domain::job::JobState;
use gantry_core::dto::job::JobSummary;

/// List the jobs an agent holds
pub async fn show_queue(agent: &str) -> Result<()> {
    let client = AgentClient::new(agent);
    let jobs = client.list_jobs().await?;

    if jobs.is_empty() {
        println!("{}", format!("No jobs on {}.", client.base_url()).yellow());
    } else {
        println!(
            "{}",
            format!("Found {} job(s) on {}:", jobs.len(), client.base_url()).bold()
        );
        println!();
        for job in jobs {
            print_job_summary(&job);
        }
    }

    Ok(())
}

fn print_job_summary(job: &JobSummary) {
    println!("  {} Job {}", "▸".cyan(), job.id.to_string().bold());
    println!("    Service: {}", job.service);
    println!("    Run:     {}", job.run_id.dimmed());
    println!("    State:   {}", colorize_state(job.state));
    if job.wait_for_exit {
        println!("    {}", "waits for exit".dimmed());
    }
    println!();
}

/// Colorize job state for display
fn colorize_state(state: JobState) -> ColoredString {
    let text = state.to_string();
    match state {
        JobState::Running | JobState::Stopped | JobState::TraceCollected => text.green(),
        JobState::Failed | JobState::NotSupported => text.red(),
        JobState::Deleting | JobState::Deleted => text.dimmed(),
        _ => text.yellow(),
    }
}
