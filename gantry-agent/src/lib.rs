//! Gantry Agent
//!
//! Hosts benchmark jobs on one machine.
//!
//! Architecture:
//! - Repository: in-memory store of job records
//! - Scheduler: single cooperative poll loop that advances job state
//! - Heartbeat: per-job sampler for CPU/memory and process exit
//! - Services: collaborators that build, launch, limit and trace workloads
//! - API: HTTP surface the controller drives jobs through
//!
//! The controller submits jobs over HTTP and keeps touching them; a job whose
//! controller goes silent is stopped and deleted by the scheduler.

pub mod api;
pub mod config;
pub mod heartbeat;
pub mod repository;
pub mod scheduler;
pub mod service;

pub use config::AgentConfig;
pub use repository::JobRepository;
pub use scheduler::Scheduler;
