//! Job DTOs

use serde::{Deserialize, Serialize};

use crate::domain::job::{Job, JobState};

/// One entry of an agent's job queue (`GET /jobs`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: u64,
    pub run_id: String,
    pub service: String,
    pub state: JobState,
    pub wait_for_exit: bool,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            run_id: job.run_id.clone(),
            service: job.service.clone(),
            state: job.state,
            wait_for_exit: job.wait_for_exit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_conversion() {
        let job = Job {
            id: 7,
            run_id: "run-1".to_string(),
            service: "server".to_string(),
            state: JobState::Running,
            wait_for_exit: true,
            ..Default::default()
        };

        let summary = JobSummary::from(&job);
        assert_eq!(summary.id, 7);
        assert_eq!(summary.run_id, "run-1");
        assert_eq!(summary.state, JobState::Running);
        assert!(summary.wait_for_exit);
    }

    #[test]
    fn test_summary_wire_format() {
        let summary = JobSummary {
            id: 1,
            run_id: "r".to_string(),
            service: "s".to_string(),
            state: JobState::New,
            wait_for_exit: false,
        };

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["runId"], "r");
        assert_eq!(json["state"], "New");
        assert_eq!(json["waitForExit"], false);
    }
}
