//! Agent DTOs

use serde::{Deserialize, Serialize};

use crate::domain::platform::PlatformInfo;

/// Response of `GET /info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub os: String,
    pub arch: String,
    pub cpu_count: usize,
    pub version: u32,
}

impl AgentInfo {
    pub fn platform(&self) -> PlatformInfo {
        PlatformInfo {
            os: self.os.clone(),
            arch: self.arch.clone(),
        }
    }
}
