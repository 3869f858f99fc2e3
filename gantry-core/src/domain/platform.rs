//! Platform and resource constraint types

use serde::{Deserialize, Serialize};

/// Operating system and architecture an agent reports on `/info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
}

impl PlatformInfo {
    /// Platform of the running process
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Constraint a job places on the agent that hosts it
///
/// Empty fields accept any value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformRequirement {
    pub os: Option<String>,
    pub arch: Option<String>,
}

impl PlatformRequirement {
    pub fn is_satisfied_by(&self, info: &PlatformInfo) -> bool {
        let matches = |wanted: &Option<String>, actual: &str| {
            wanted
                .as_deref()
                .is_none_or(|w| w.eq_ignore_ascii_case(actual))
        };

        matches(&self.os, &info.os) && matches(&self.arch, &info.arch)
    }
}

/// Resource limits applied to the workload process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Fraction of the machine's CPU (e.g. 0.5 for half the cores)
    pub cpu_ratio: Option<f64>,
    /// Explicit list of logical cores the workload may run on
    pub cpu_set: Vec<usize>,
    pub memory_limit_bytes: Option<u64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.cpu_ratio.is_none() && self.cpu_set.is_empty() && self.memory_limit_bytes.is_none()
    }
}
