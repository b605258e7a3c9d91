//! Shared fixtures for database integration tests.

#![allow(dead_code)]

use keel_core::{
    Build, ConfigVersion, JobConfig, MetadataField, PausedState, PipelineConfig, PlanStep,
    ResourceConfig, SavedPipeline, Version, VersionedResource,
};
use keel_db::{BusConfig, Database, DbError, DbResult, PipelineDb};
use sqlx::PgPool;
use std::time::Duration;

pub async fn database(pool: PgPool) -> Database {
    let config = BusConfig {
        poll_interval: Duration::from_millis(200),
        ..BusConfig::default()
    };
    Database::from_pool(pool, config).await.unwrap()
}

pub fn some_config() -> PipelineConfig {
    PipelineConfig {
        resources: vec![ResourceConfig {
            name: "some-resource".to_string(),
            resource_type: "some-type".to_string(),
            source: [("some".to_string(), "source".to_string())].into(),
        }],
        jobs: vec![JobConfig {
            name: "some-job".to_string(),
            serial: false,
            plan: vec![
                PlanStep::Get {
                    resource: "some-resource".to_string(),
                    trigger: true,
                    passed: vec![],
                },
                PlanStep::Put {
                    resource: "some-resource".to_string(),
                },
            ],
        }],
    }
}

pub async fn some_pipeline(db: &Database) -> (SavedPipeline, PipelineDb) {
    let (saved, created) = db
        .team("main")
        .save_config(
            "some-pipeline",
            &some_config(),
            ConfigVersion::INITIAL,
            PausedState::Unpaused,
        )
        .await
        .unwrap();
    assert!(created);
    let pipeline = db.pipeline(saved.clone());
    (saved, pipeline)
}

pub async fn some_job_build(db: &Database) -> (PipelineDb, Build) {
    let (_, pipeline) = some_pipeline(db).await;
    let build = pipeline.create_job_build("some-job").await.unwrap();
    (pipeline, build)
}

pub fn versioned_resource(pipeline: &SavedPipeline, version: &str) -> VersionedResource {
    version_of(pipeline, "some-resource", version)
}

pub fn version_of(pipeline: &SavedPipeline, resource: &str, version: &str) -> VersionedResource {
    VersionedResource {
        resource: resource.to_string(),
        resource_type: "some-type".to_string(),
        version: Version::new().with("ver", version),
        metadata: vec![MetadataField::new("some", "metadata")],
        pipeline_id: pipeline.id,
    }
}

pub async fn next_within(events: &keel_db::BuildEvents) -> DbResult<keel_db::BuildEvent> {
    tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .map_err(|_| DbError::InvalidInput("timed out waiting for event".to_string()))?
}
