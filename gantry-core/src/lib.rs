//! Gantry Core
//!
//! Core types shared by the Gantry agent and controller.
//!
//! This crate contains:
//! - Domain types: the job record, its state machine and measurements
//! - DTOs: lightweight payloads exchanged over the agent HTTP API

pub mod domain;
pub mod dto;

/// Protocol version advertised by agents in every job document.
pub const AGENT_PROTOCOL_VERSION: u32 = 3;

/// Oldest agent protocol version a controller accepts.
pub const MIN_AGENT_PROTOCOL_VERSION: u32 = 3;
