//! Pipeline configuration documents.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{PipelineId, TeamId};

/// A pipeline's configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl PipelineConfig {
    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }
}

/// A resource declared by a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source: BTreeMap<String, String>,
}

/// A job declared by a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    /// Run at most one build of this job at a time.
    #[serde(default)]
    pub serial: bool,
    #[serde(default)]
    pub plan: Vec<PlanStep>,
}

impl JobConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            serial: false,
            plan: Vec::new(),
        }
    }

    /// Names of resources this job declares as outputs.
    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.plan.iter().filter_map(|step| match step {
            PlanStep::Put { resource } => Some(resource.as_str()),
            _ => None,
        })
    }
}

/// One step of a job's build plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PlanStep {
    /// Fetch a version of a resource.
    Get {
        resource: String,
        #[serde(default)]
        trigger: bool,
        /// Only use versions that passed through these jobs.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        passed: Vec<String>,
    },
    /// Produce a new version of a resource.
    Put { resource: String },
    /// Run a task.
    Task {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
    },
}

/// Monotonic counter bumped by exactly one on every saved config change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct ConfigVersion(pub i64);

impl ConfigVersion {
    /// Version assigned to a freshly created pipeline.
    pub const INITIAL: ConfigVersion = ConfigVersion(1);

    pub fn next(self) -> Self {
        ConfigVersion(self.0 + 1)
    }
}

/// Whether a pipeline is scheduling new builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PausedState {
    Paused,
    Unpaused,
}

impl PausedState {
    pub fn is_paused(self) -> bool {
        matches!(self, PausedState::Paused)
    }
}

/// A pipeline as stored, without its config document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedPipeline {
    pub id: PipelineId,
    pub team_id: TeamId,
    pub name: String,
    pub version: ConfigVersion,
    pub paused: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_version_next() {
        assert_eq!(ConfigVersion::INITIAL.next(), ConfigVersion(2));
    }

    #[test]
    fn test_plan_step_json_shape() {
        let job = JobConfig {
            name: "unit".to_string(),
            serial: true,
            plan: vec![
                PlanStep::Get {
                    resource: "repo".to_string(),
                    trigger: true,
                    passed: vec![],
                },
                PlanStep::Put {
                    resource: "image".to_string(),
                },
            ],
        };

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(
            value["plan"],
            json!([
                { "step": "get", "resource": "repo", "trigger": true },
                { "step": "put", "resource": "image" },
            ])
        );
        assert_eq!(job.outputs().collect::<Vec<_>>(), vec!["image"]);
    }

    #[test]
    fn test_missing_sections_default_to_empty() {
        let config: PipelineConfig = serde_json::from_value(json!({})).unwrap();
        assert!(config.jobs.is_empty());
        assert!(config.resources.is_empty());
    }
}
