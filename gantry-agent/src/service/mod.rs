//! Service layer
//!
//! Collaborators the scheduler delegates to: building and launching the
//! workload, applying resource limits, and collecting traces.
//!
//! All services are trait-based so the scheduler can be driven by fakes in
//! tests and by platform-specific implementations in production.

mod limiter;
mod runner;
mod trace;

// Re-export traits
pub use limiter::ResourceLimiter;
pub use runner::{LaunchedWorkload, Runner, WorkloadProcess};
pub use trace::TraceCollector;

// Re-export implementations
pub use limiter::NoopResourceLimiter;
pub use runner::LocalProcessRunner;
pub use trace::SnapshotTraceCollector;
