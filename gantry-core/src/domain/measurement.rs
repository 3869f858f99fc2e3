//! Measurement domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known measurement names produced by the agent heartbeat.
pub mod names {
    pub const CPU: &str = "gantry/cpu";
    pub const WORKING_SET: &str = "gantry/working-set";
    pub const SWAP: &str = "gantry/swap";
}

/// A single sampled value produced while a job is running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub value: serde_json::Value,
}

impl Measurement {
    pub fn new(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
            value: value.into(),
        }
    }
}

/// How a series of measurements is reduced to one number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    First,
    Last,
    Avg,
    Sum,
    Max,
    Min,
}

/// Describes a measurement series so results can be rendered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementMetadata {
    pub source: String,
    pub name: String,
    pub aggregate: Operation,
    pub reduce: Operation,
    pub short_description: String,
    pub long_description: String,
    pub format: String,
}

impl MeasurementMetadata {
    /// Metadata for the series the agent samples on its own
    pub fn host_process() -> Vec<MeasurementMetadata> {
        let entry = |name: &str, short: &str, long: &str, format: &str| MeasurementMetadata {
            source: "Host Process".to_string(),
            name: name.to_string(),
            aggregate: Operation::Max,
            reduce: Operation::Max,
            short_description: short.to_string(),
            long_description: long.to_string(),
            format: format.to_string(),
        };

        vec![
            entry(
                names::CPU,
                "CPU Usage (%)",
                "Amount of time the process is utilizing the CPU out of 100%",
                "n0",
            ),
            entry(
                names::WORKING_SET,
                "Working Set (MB)",
                "Amount of working set used by the process (MB)",
                "n0",
            ),
            entry(
                names::SWAP,
                "Swap (MB)",
                "Amount of swap used by the host (MB)",
                "n0",
            ),
        ]
    }
}
