//! Data Transfer Objects for agent/controller communication
//!
//! Lightweight payloads used by the agent HTTP API where the full job
//! document would be wasteful.

pub mod agent;
pub mod job;
