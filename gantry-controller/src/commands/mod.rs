//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod info;
mod queue;
mod run;

use anyhow::Result;
use clap::Subcommand;

pub use run::RunArgs;

/// Default agent endpoint for the inspection commands
const DEFAULT_AGENT_URL: &str = "http://localhost:5010";

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a scenario
    Run(RunArgs),
    /// Show the job queue of an agent
    Queue {
        /// Agent URL
        #[arg(long, env = "GANTRY_AGENT_URL", default_value = DEFAULT_AGENT_URL)]
        agent: String,
    },
    /// Show the platform of an agent
    Info {
        /// Agent URL
        #[arg(long, env = "GANTRY_AGENT_URL", default_value = DEFAULT_AGENT_URL)]
        agent: String,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run(args) => run::handle_run_command(args).await,
        Commands::Queue { agent } => queue::show_queue(&agent).await,
        Commands::Info { agent } => info::show_info(&agent).await,
    }
}
