//! Build records and the build status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BuildId, Error, JobId, PipelineId, Result, TeamId};

/// Lifecycle status of a build.
///
/// ```text
/// Pending ──▶ Started ──▶ Succeeded | Failed | Errored | Aborted
///    │
///    └──────▶ Aborted | Errored
/// ```
///
/// Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    pub const ALL: [BuildStatus; 6] = [
        BuildStatus::Pending,
        BuildStatus::Started,
        BuildStatus::Succeeded,
        BuildStatus::Failed,
        BuildStatus::Errored,
        BuildStatus::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Errored | BuildStatus::Aborted
        )
    }

    /// Statuses a build may be finished with once it has started.
    pub fn is_finish_status(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Errored
        )
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        match self {
            BuildStatus::Pending => matches!(
                next,
                BuildStatus::Started | BuildStatus::Aborted | BuildStatus::Errored
            ),
            BuildStatus::Started => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "started" => Ok(BuildStatus::Started),
            "succeeded" => Ok(BuildStatus::Succeeded),
            "failed" => Ok(BuildStatus::Failed),
            "errored" => Ok(BuildStatus::Errored),
            "aborted" => Ok(BuildStatus::Aborted),
            other => Err(Error::UnknownStatus(other.to_string())),
        }
    }
}

/// A single execution of a job, or a standalone one-off run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    /// Unique within its job; one-off builds share a global counter.
    pub name: String,
    pub status: BuildStatus,
    pub team_id: TeamId,
    /// Set for job builds, `None` for one-off builds.
    pub job: Option<JobRef>,
    pub engine: Option<String>,
    pub engine_metadata: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub reap_time: Option<DateTime<Utc>>,
}

/// Link from a build to the job and pipeline it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub job_id: JobId,
    pub job_name: String,
    pub pipeline_id: PipelineId,
    pub pipeline_name: String,
}

impl Build {
    pub fn is_one_off(&self) -> bool {
        self.job.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
