//! Gantry Agent
//!
//! Hosts benchmark jobs submitted by controllers. The HTTP API and the
//! scheduler loop run side by side until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gantry_agent::api::{self, AgentState};
use gantry_agent::service::LocalProcessRunner;
use gantry_agent::{AgentConfig, JobRepository, Scheduler};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_agent=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Gantry Agent");

    let config = load_config()?;
    info!(
        "Loaded configuration: bind_addr={}, work_dir={}",
        config.bind_addr,
        config.work_dir.display()
    );

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.work_dir.display()))?;

    let repository = Arc::new(JobRepository::new());
    let runner = Arc::new(LocalProcessRunner::new(config.work_dir.clone()));
    let scheduler = Scheduler::new(config.clone(), Arc::clone(&repository), runner);

    let state = AgentState::new(Arc::clone(&repository), config.work_dir.clone());
    info!("Agent platform: {}/{}", state.info.os, state.info.arch);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    info!("Listening on {}", config.bind_addr);

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
        info!("Shutdown requested");
        token.cancel();
    });

    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("HTTP server failed")?;

    // The server may stop on its own; make sure the scheduler follows
    shutdown.cancel();
    scheduler_task.await.context("Scheduler task panicked")?;

    info!("Gantry Agent stopped");
    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<AgentConfig> {
    match AgentConfig::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            info!("Failed to load config from environment ({:#}), using defaults", e);
            let config = AgentConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}
