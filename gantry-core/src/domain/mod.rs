//! Core domain types
//!
//! The job record and everything attached to it. Agents own the records;
//! controllers only hold mirrors fetched over HTTP.

pub mod job;
pub mod measurement;
pub mod platform;
