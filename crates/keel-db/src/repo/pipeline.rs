//! Pipeline-scoped access: job builds, pausing and resource versions.

use keel_core::{
    Build, BuildId, BuildInput, ConfigVersion, PipelineConfig, PipelineId, SavedPipeline,
    SavedVersionedResource, VersionedResource,
};
use sqlx::PgPool;
use tracing::info;

use crate::bus::NotificationBus;
use crate::repo::build::{BuildDb, fetch_build};
use crate::repo::ledger::{PgResourceLedger, ResourceLedger};
use crate::repo::team::{fetch_config, fetch_pipeline};
use crate::{DbError, DbResult};

/// Handle on one saved pipeline.
///
/// Holds the pipeline as last read; call [`PipelineDb::reload`] to refresh it.
#[derive(Clone)]
pub struct PipelineDb {
    pipeline: SavedPipeline,
    pool: PgPool,
    bus: NotificationBus,
}

impl PipelineDb {
    pub fn new(pipeline: SavedPipeline, pool: PgPool, bus: NotificationBus) -> Self {
        Self {
            pipeline,
            pool,
            bus,
        }
    }

    pub fn id(&self) -> PipelineId {
        self.pipeline.id
    }

    pub fn name(&self) -> &str {
        &self.pipeline.name
    }

    pub fn saved(&self) -> &SavedPipeline {
        &self.pipeline
    }

    pub async fn reload(&mut self) -> DbResult<()> {
        self.pipeline = fetch_pipeline(&self.pool, self.pipeline.id).await?;
        Ok(())
    }

    pub async fn get_config(&self) -> DbResult<(PipelineConfig, ConfigVersion)> {
        fetch_config(&self.pool, self.pipeline.id).await
    }

    pub async fn pause(&self) -> DbResult<()> {
        self.set_paused(true).await
    }

    pub async fn unpause(&self) -> DbResult<()> {
        self.set_paused(false).await
    }

    async fn set_paused(&self, paused: bool) -> DbResult<()> {
        let result =
            sqlx::query("UPDATE pipelines SET paused = $2, updated_at = NOW() WHERE id = $1")
                .bind(self.pipeline.id.get())
                .bind(paused)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("pipeline {}", self.pipeline.name)));
        }

        info!(pipeline = %self.pipeline.name, paused, "Updated pipeline paused state");
        Ok(())
    }

    /// Create the next pending build of an active job.
    ///
    /// Builds are named by a per-job counter starting at 1.
    pub async fn create_job_build(&self, job_name: &str) -> DbResult<Build> {
        let mut tx = self.pool.begin().await?;

        let (job_id, number): (i64, i64) = sqlx::query_as(
            r#"
            UPDATE jobs SET build_number_seq = build_number_seq + 1
            WHERE pipeline_id = $1 AND name = $2 AND active
            RETURNING id, build_number_seq
            "#,
        )
        .bind(self.pipeline.id.get())
        .bind(job_name)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            DbError::NotFound(format!(
                "job {} in pipeline {}",
                job_name, self.pipeline.name
            ))
        })?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO builds (name, team_id, job_id)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(number.to_string())
        .bind(self.pipeline.team_id.get())
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        let build = fetch_build(&mut *tx, BuildId::new(id))
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        tx.commit().await?;

        info!(
            pipeline = %self.pipeline.name,
            job = job_name,
            build_id = %build.id,
            name = %build.name,
            "Created job build"
        );
        Ok(build)
    }

    /// Handle on a build, e.g. one returned by [`PipelineDb::create_job_build`].
    pub fn build(&self, id: BuildId) -> BuildDb {
        BuildDb::new(id, self.pool.clone(), self.bus.clone())
    }

    /// Record a version `build` consumed from this pipeline.
    pub async fn save_input(
        &self,
        build: BuildId,
        input: &BuildInput,
    ) -> DbResult<SavedVersionedResource> {
        self.check_owned(&input.versioned_resource)?;
        PgResourceLedger::new(self.pool.clone())
            .save_input(build, input)
            .await
    }

    /// Record a version `build` produced in this pipeline.
    pub async fn save_output(
        &self,
        build: BuildId,
        resource: &VersionedResource,
        explicit: bool,
    ) -> DbResult<SavedVersionedResource> {
        self.check_owned(resource)?;
        PgResourceLedger::new(self.pool.clone())
            .save_output(build, resource, explicit)
            .await
    }

    fn check_owned(&self, resource: &VersionedResource) -> DbResult<()> {
        if resource.pipeline_id != self.pipeline.id {
            return Err(DbError::InvalidInput(format!(
                "resource {} belongs to pipeline {}, not {}",
                resource.resource, resource.pipeline_id, self.pipeline.id
            )));
        }
        Ok(())
    }
}
