//! Gantry Controller
//!
//! Drives benchmark scenarios across gantry agents: one [`JobConnection`]
//! per job, coordinated by an [`Orchestrator`].

pub mod connection;
pub mod orchestrator;
pub mod results;
pub mod scenario;

pub use connection::{ConnectionOptions, JobConnection};
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorOptions, RunSummary};
pub use results::{ConsoleSink, IterationResults, JobResult, JsonFileSink, ResultsSink};
pub use scenario::{RunOptions, Scenario, ServiceDefinition};
