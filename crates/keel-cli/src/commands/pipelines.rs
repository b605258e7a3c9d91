//! Pipeline commands.

use anyhow::{Context, Result, bail};
use keel_config::read_pipeline_config;
use keel_core::{ConfigVersion, PausedState};
use keel_db::{DbError, TeamDb};
use std::path::Path;

pub async fn set(
    team: &TeamDb,
    name: &str,
    path: &Path,
    expected_version: i64,
    paused: bool,
) -> Result<()> {
    let config = read_pipeline_config(path)
        .with_context(|| format!("Failed to parse pipeline config: {}", path.display()))?;

    let paused = if paused {
        PausedState::Paused
    } else {
        PausedState::Unpaused
    };

    match team
        .save_config(name, &config, ConfigVersion(expected_version), paused)
        .await
    {
        Ok((pipeline, true)) => {
            println!("Created pipeline {} at version {}", pipeline.name, pipeline.version);
        }
        Ok((pipeline, false)) => {
            println!("Updated pipeline {} to version {}", pipeline.name, pipeline.version);
        }
        Err(DbError::ConfigConflict { expected, actual }) => {
            bail!(
                "Pipeline {} changed since version {} (now at {}); fetch it and retry",
                name,
                expected,
                actual
            );
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

pub async fn get(team: &TeamDb, name: &str) -> Result<()> {
    let pipeline = team.get_pipeline_by_name(name).await?;
    let (config, version) = team.get_config(name).await?;

    println!("Pipeline: {}", pipeline.name);
    println!("Version:  {}", version);
    println!("Paused:   {}", pipeline.paused);
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

pub async fn list(team: &TeamDb) -> Result<()> {
    let pipelines = team.list_pipelines().await?;
    if pipelines.is_empty() {
        println!("No pipelines in team {}", team.name());
        return Ok(());
    }

    println!("{:<30} {:>8}  PAUSED", "NAME", "VERSION");
    for pipeline in pipelines {
        println!(
            "{:<30} {:>8}  {}",
            pipeline.name,
            pipeline.version.to_string(),
            pipeline.paused
        );
    }
    Ok(())
}

pub async fn set_paused(team: &TeamDb, name: &str, paused: bool) -> Result<()> {
    let pipeline = team.pipeline(name).await?;
    if paused {
        pipeline.pause().await?;
        println!("Paused pipeline {}", name);
    } else {
        pipeline.unpause().await?;
        println!("Unpaused pipeline {}", name);
    }
    Ok(())
}

pub fn validate(path: &Path) -> Result<()> {
    let config = read_pipeline_config(path)
        .with_context(|| format!("Configuration error in {}", path.display()))?;

    println!(
        "Configuration is valid: {} resources, {} jobs",
        config.resources.len(),
        config.jobs.len()
    );
    Ok(())
}
