//! Scenario definition
//!
//! A scenario names the services of one benchmark, the agents each service
//! runs on and the order they are started in. It is loaded from JSON:
//!
//! ```json
//! {
//!   "name": "plaintext",
//!   "services": [
//!     { "name": "application", "endpoints": ["http://agent1:5010"],
//!       "job": { "executable": "./server", "readyStateText": "listening" } },
//!     { "name": "load", "endpoints": ["http://agent2:5010"],
//!       "job": { "executable": "./client", "waitForExit": true } }
//!   ],
//!   "dependencies": ["application", "load"]
//! }
//! ```

use anyhow::{Context, Result};
use gantry_core::domain::job::Job;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Services of one benchmark
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Scenario {
    pub name: String,
    pub services: Vec<ServiceDefinition>,
    /// Start order; all services in declaration order when empty
    pub dependencies: Vec<String>,
}

/// One service, replicated on every endpoint
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub name: String,
    /// Agent base URLs, one replica each
    pub endpoints: Vec<String>,
    /// Job template submitted to every endpoint
    pub job: Job,
    /// Local files uploaded with every replica
    pub attachments: Vec<PathBuf>,
}

impl Scenario {
    /// Loads and validates a scenario file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        let scenario: Scenario = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse scenario {}", path.display()))?;

        scenario.validate()?;
        Ok(scenario)
    }

    /// Validates service names, endpoints and dependencies
    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            anyhow::bail!("Scenario defines no services");
        }

        let mut names = HashSet::new();
        for service in &self.services {
            if service.name.is_empty() {
                anyhow::bail!("Service names cannot be empty");
            }
            if !names.insert(service.name.as_str()) {
                anyhow::bail!("Service '{}' is defined twice", service.name);
            }
            if service.endpoints.is_empty() {
                anyhow::bail!("Service '{}' has no endpoints", service.name);
            }
        }

        let mut seen = HashSet::new();
        for dependency in &self.dependencies {
            if !names.contains(dependency.as_str()) {
                anyhow::bail!("Dependency '{}' is not a defined service", dependency);
            }
            if !seen.insert(dependency.as_str()) {
                anyhow::bail!("Dependency '{}' is listed twice", dependency);
            }
        }

        Ok(())
    }

    /// Services in start order
    pub fn ordered_services(&self) -> Vec<&ServiceDefinition> {
        if self.dependencies.is_empty() {
            return self.services.iter().collect();
        }

        self.dependencies
            .iter()
            .filter_map(|name| self.service(name))
            .collect()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Whether any started service terminates on its own
    pub fn has_wait_for_exit(&self) -> bool {
        self.ordered_services().iter().any(|s| s.job.wait_for_exit)
    }
}

/// How a scenario is repeated and for how long it runs
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Number of start, run and teardown cycles
    pub iterations: u32,
    /// Repeat until this much time has elapsed, instead of `iterations`
    pub span: Option<Duration>,
    /// First service restarted between iterations; earlier services keep
    /// running. Every service restarts when unset.
    pub repeat_from: Option<String>,
    /// Flush measurements of kept services instead of resetting them
    pub auto_flush: bool,
    /// How long to let services run when none of them exits on its own
    pub hold: Option<Duration>,
    /// Where downloaded traces are written
    pub trace_directory: PathBuf,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            iterations: 1,
            span: None,
            repeat_from: None,
            auto_flush: false,
            hold: None,
            trace_directory: PathBuf::from("."),
        }
    }
}

impl RunOptions {
    /// Number of leading services kept alive between iterations
    pub fn repeat_boundary(&self, scenario: &Scenario) -> Result<usize> {
        let Some(name) = &self.repeat_from else {
            return Ok(0);
        };

        scenario
            .ordered_services()
            .iter()
            .position(|s| &s.name == name)
            .ok_or_else(|| anyhow::anyhow!("Repeat boundary '{}' is not a started service", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(json: &str) -> Scenario {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_minimal_scenario() {
        let scenario = scenario(r#"{ "services": [{ "name": "app", "endpoints": ["http://agent1"] }] }"#);

        assert!(scenario.validate().is_ok());
        let ordered = scenario.ordered_services();
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].endpoints, vec!["http://agent1"]);
        assert!(!scenario.has_wait_for_exit());
    }

    #[test]
    fn test_dependencies_define_order() {
        let scenario = scenario(
            r#"{
                "services": [
                    { "name": "load", "endpoints": ["http://b"], "job": { "waitForExit": true } },
                    { "name": "db", "endpoints": ["http://a"] },
                    { "name": "app", "endpoints": ["http://a"] }
                ],
                "dependencies": ["db", "app", "load"]
            }"#,
        );

        let names: Vec<&str> = scenario
            .ordered_services()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["db", "app", "load"]);
        assert!(scenario.has_wait_for_exit());
    }

    #[test]
    fn test_validation_errors() {
        let unknown = scenario(
            r#"{ "services": [{ "name": "app", "endpoints": ["http://a"] }], "dependencies": ["db"] }"#,
        );
        assert!(unknown.validate().is_err());

        let no_endpoint = scenario(r#"{ "services": [{ "name": "app" }] }"#);
        assert!(no_endpoint.validate().is_err());

        let duplicate = scenario(
            r#"{ "services": [{ "name": "app", "endpoints": ["http://a"] }, { "name": "app", "endpoints": ["http://b"] }] }"#,
        );
        assert!(duplicate.validate().is_err());

        assert!(Scenario::default().validate().is_err());
    }

    #[test]
    fn test_repeat_boundary() {
        let scenario = scenario(
            r#"{
                "services": [
                    { "name": "db", "endpoints": ["http://a"] },
                    { "name": "app", "endpoints": ["http://a"] },
                    { "name": "load", "endpoints": ["http://b"] }
                ]
            }"#,
        );

        let mut options = RunOptions::default();
        assert_eq!(options.repeat_boundary(&scenario).unwrap(), 0);

        options.repeat_from = Some("load".to_string());
        assert_eq!(options.repeat_boundary(&scenario).unwrap(), 2);

        options.repeat_from = Some("missing".to_string());
        assert!(options.repeat_boundary(&scenario).is_err());
    }
}
