//! Pipeline configuration parsing.

use crate::{ConfigError, ConfigResult};
use keel_core::pipeline::{JobConfig, PipelineConfig, PlanStep, ResourceConfig};
use kdl::{KdlDocument, KdlNode};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Read and parse a pipeline configuration file.
pub fn read_pipeline_config(path: impl AsRef<Path>) -> ConfigResult<PipelineConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_pipeline_config(&content)
}

/// Parse a pipeline configuration from KDL text.
///
/// ```kdl
/// resource "repo" type="git" {
///     source {
///         uri "https://example.com/repo.git"
///     }
/// }
///
/// job "unit" serial=#true {
///     get "repo" trigger=#true
///     task "run-tests" file="ci/unit.yml"
///     put "repo"
/// }
/// ```
pub fn parse_pipeline_config(kdl: &str) -> ConfigResult<PipelineConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut resources = Vec::new();
    let mut jobs = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "resource" => resources.push(parse_resource(node)?),
            "job" => jobs.push(parse_job(node)?),
            _ => {} // Ignore unknown nodes
        }
    }

    let config = PipelineConfig { resources, jobs };
    validate(&config)?;
    Ok(config)
}

fn parse_resource(node: &KdlNode) -> ConfigResult<ResourceConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("resource name".to_string()))?;

    let resource_type = get_string_prop(node, "type")
        .ok_or_else(|| ConfigError::MissingField(format!("type for resource '{}'", name)))?;

    let mut source = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() != "source" {
                continue;
            }
            if let Some(entries) = child.children() {
                for entry in entries.nodes() {
                    let key = entry.name().value().to_string();
                    if let Some(val) = get_first_string_arg(entry) {
                        source.insert(key, val);
                    }
                }
            }
        }
    }

    Ok(ResourceConfig {
        name,
        resource_type,
        source,
    })
}

fn parse_job(node: &KdlNode) -> ConfigResult<JobConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;
    let serial = get_bool_prop(node, "serial").unwrap_or(false);

    let mut plan = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            plan.push(parse_step(&name, child)?);
        }
    }

    Ok(JobConfig { name, serial, plan })
}

fn parse_step(job: &str, node: &KdlNode) -> ConfigResult<PlanStep> {
    let kind = node.name().value();
    let target = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("{} target in job '{}'", kind, job)))?;

    match kind {
        "get" => Ok(PlanStep::Get {
            resource: target,
            trigger: get_bool_prop(node, "trigger").unwrap_or(false),
            passed: get_string_list_prop(node, "passed"),
        }),
        "put" => Ok(PlanStep::Put { resource: target }),
        "task" => Ok(PlanStep::Task {
            name: target,
            file: get_string_prop(node, "file"),
        }),
        other => Err(ConfigError::InvalidValue {
            field: format!("step in job '{}'", job),
            message: format!("unknown step type: {}", other),
        }),
    }
}

/// Check names are unique and every reference resolves.
fn validate(config: &PipelineConfig) -> ConfigResult<()> {
    let mut resource_names = HashSet::new();
    for resource in &config.resources {
        if !resource_names.insert(resource.name.as_str()) {
            return Err(ConfigError::Duplicate(format!(
                "resource '{}'",
                resource.name
            )));
        }
    }

    let mut job_names = HashSet::new();
    for job in &config.jobs {
        if !job_names.insert(job.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("job '{}'", job.name)));
        }
    }

    for job in &config.jobs {
        for step in &job.plan {
            match step {
                PlanStep::Get {
                    resource, passed, ..
                } => {
                    check_resource(&resource_names, &job.name, resource)?;
                    for upstream in passed {
                        if !job_names.contains(upstream.as_str()) {
                            return Err(ConfigError::InvalidReference(format!(
                                "job '{}' requires unknown job '{}' to have passed",
                                job.name, upstream
                            )));
                        }
                    }
                }
                PlanStep::Put { resource } => {
                    check_resource(&resource_names, &job.name, resource)?;
                }
                PlanStep::Task { .. } => {}
            }
        }
    }

    Ok(())
}

fn check_resource(known: &HashSet<&str>, job: &str, resource: &str) -> ConfigResult<()> {
    if known.contains(resource) {
        Ok(())
    } else {
        Err(ConfigError::InvalidReference(format!(
            "job '{}' uses unknown resource '{}'",
            job, resource
        )))
    }
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

/// Collects repeated properties, e.g. `passed="a" passed="b"`.
fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resources_and_jobs() {
        let kdl = r#"
            resource "some-resource" type="git" {
                source {
                    uri "https://example.com/repo.git"
                    branch "main"
                }
            }

            resource "some-image" type="registry-image"

            job "some-job" serial=#true {
                get "some-resource" trigger=#true
                task "unit" file="ci/unit.yml"
                put "some-image"
            }

            job "some-other-job" {
                get "some-image" passed="some-job"
            }
        "#;

        let config = parse_pipeline_config(kdl).unwrap();
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.resources[0].resource_type, "git");
        assert_eq!(
            config.resources[0].source.get("branch").map(String::as_str),
            Some("main")
        );

        let job = config.job("some-job").unwrap();
        assert!(job.serial);
        assert_eq!(job.plan.len(), 3);
        assert_eq!(job.outputs().collect::<Vec<_>>(), vec!["some-image"]);

        let other = config.job("some-other-job").unwrap();
        assert_eq!(
            other.plan[0],
            PlanStep::Get {
                resource: "some-image".to_string(),
                trigger: false,
                passed: vec!["some-job".to_string()],
            }
        );
    }

    #[test]
    fn test_empty_document_is_valid() {
        let config = parse_pipeline_config("").unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_resource_requires_type() {
        let result = parse_pipeline_config(r#"resource "untyped""#);
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_detect_duplicate_job() {
        let kdl = r#"
            job "build"
            job "build"
        "#;

        let result = parse_pipeline_config(kdl);
        assert!(matches!(result, Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn test_detect_unknown_resource() {
        let kdl = r#"
            job "build" {
                get "nonexistent"
            }
        "#;

        let result = parse_pipeline_config(kdl);
        assert!(matches!(result, Err(ConfigError::InvalidReference(_))));
    }

    #[test]
    fn test_detect_unknown_passed_job() {
        let kdl = r#"
            resource "repo" type="git"

            job "deploy" {
                get "repo" passed="nonexistent"
            }
        "#;

        let result = parse_pipeline_config(kdl);
        assert!(matches!(result, Err(ConfigError::InvalidReference(_))));
    }

    #[test]
    fn test_unknown_step_type() {
        let kdl = r#"
            job "build" {
                teleport "somewhere"
            }
        "#;

        let result = parse_pipeline_config(kdl);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
