//! Team-scoped access: pipeline configs and one-off builds.

use keel_core::{
    Build, BuildId, ConfigVersion, PausedState, PipelineConfig, PipelineId, SavedPipeline, TeamId,
};
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor, PgPool};
use tracing::info;

use crate::bus::NotificationBus;
use crate::repo::build::fetch_build;
use crate::repo::pipeline::PipelineDb;
use crate::{DbError, DbResult};

/// Database row for pipelines, without the config document.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PipelineRow {
    pub id: i64,
    pub team_id: i64,
    pub name: String,
    pub version: i64,
    pub paused: bool,
}

impl From<PipelineRow> for SavedPipeline {
    fn from(row: PipelineRow) -> Self {
        SavedPipeline {
            id: PipelineId::new(row.id),
            team_id: TeamId::new(row.team_id),
            name: row.name,
            version: ConfigVersion(row.version),
            paused: row.paused,
        }
    }
}

pub(crate) async fn fetch_pipeline<'e, E: PgExecutor<'e>>(
    executor: E,
    id: PipelineId,
) -> DbResult<SavedPipeline> {
    sqlx::query_as::<_, PipelineRow>(
        "SELECT id, team_id, name, version, paused FROM pipelines WHERE id = $1",
    )
    .bind(id.get())
    .fetch_optional(executor)
    .await?
    .map(SavedPipeline::from)
    .ok_or_else(|| DbError::NotFound(format!("pipeline {}", id)))
}

pub(crate) async fn fetch_config<'e, E: PgExecutor<'e>>(
    executor: E,
    id: PipelineId,
) -> DbResult<(PipelineConfig, ConfigVersion)> {
    let (Json(config), version): (Json<PipelineConfig>, i64) =
        sqlx::query_as("SELECT config, version FROM pipelines WHERE id = $1")
            .bind(id.get())
            .fetch_optional(executor)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", id)))?;
    Ok((config, ConfigVersion(version)))
}

/// Make the jobs and resources named by `config` the active set of the pipeline.
async fn register_contents(
    conn: &mut PgConnection,
    pipeline: PipelineId,
    config: &PipelineConfig,
) -> DbResult<()> {
    sqlx::query("UPDATE jobs SET active = FALSE WHERE pipeline_id = $1")
        .bind(pipeline.get())
        .execute(&mut *conn)
        .await?;

    let job_names: Vec<String> = config.jobs.iter().map(|j| j.name.clone()).collect();
    sqlx::query(
        r#"
        INSERT INTO jobs (pipeline_id, name)
        SELECT $1, name FROM UNNEST($2::text[]) AS t(name)
        ON CONFLICT (pipeline_id, name) DO UPDATE SET active = TRUE
        "#,
    )
    .bind(pipeline.get())
    .bind(&job_names)
    .execute(&mut *conn)
    .await?;

    sqlx::query("UPDATE resources SET active = FALSE WHERE pipeline_id = $1")
        .bind(pipeline.get())
        .execute(&mut *conn)
        .await?;

    let (names, types): (Vec<String>, Vec<String>) = config
        .resources
        .iter()
        .map(|r| (r.name.clone(), r.resource_type.clone()))
        .unzip();
    sqlx::query(
        r#"
        INSERT INTO resources (pipeline_id, name, type)
        SELECT $1, name, type FROM UNNEST($2::text[], $3::text[]) AS t(name, type)
        ON CONFLICT (pipeline_id, name) DO UPDATE SET type = EXCLUDED.type, active = TRUE
        "#,
    )
    .bind(pipeline.get())
    .bind(&names)
    .bind(&types)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Handle on one team's pipelines and builds.
#[derive(Clone)]
pub struct TeamDb {
    name: String,
    pool: PgPool,
    bus: NotificationBus,
}

impl TeamDb {
    pub fn new(name: impl Into<String>, pool: PgPool, bus: NotificationBus) -> Self {
        Self {
            name: name.into(),
            pool,
            bus,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn id(&self) -> DbResult<TeamId> {
        let id: i64 = sqlx::query_scalar("SELECT id FROM teams WHERE name = $1")
            .bind(&self.name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("team {}", self.name)))?;
        Ok(TeamId::new(id))
    }

    /// Create or update a pipeline config with optimistic concurrency.
    ///
    /// A new pipeline is created at [`ConfigVersion::INITIAL`] whatever
    /// `expected` says. An existing one is only updated if its stored
    /// version equals `expected`, and then moves to `expected.next()`.
    /// `paused` only applies on creation; an update keeps the stored flag.
    /// Returns the saved pipeline and whether it was created.
    pub async fn save_config(
        &self,
        pipeline_name: &str,
        config: &PipelineConfig,
        expected: ConfigVersion,
        paused: PausedState,
    ) -> DbResult<(SavedPipeline, bool)> {
        let team_id = self.id().await?;
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, PipelineRow>(
            r#"
            INSERT INTO pipelines (team_id, name, config, version, paused)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (team_id, name) DO NOTHING
            RETURNING id, team_id, name, version, paused
            "#,
        )
        .bind(team_id.get())
        .bind(pipeline_name)
        .bind(Json(config))
        .bind(ConfigVersion::INITIAL.0)
        .bind(paused.is_paused())
        .fetch_optional(&mut *tx)
        .await?;

        let (row, created) = match created {
            Some(row) => (row, true),
            None => {
                let updated = sqlx::query_as::<_, PipelineRow>(
                    r#"
                    UPDATE pipelines
                    SET config = $3, version = version + 1, updated_at = NOW()
                    WHERE team_id = $1 AND name = $2 AND version = $4
                    RETURNING id, team_id, name, version, paused
                    "#,
                )
                .bind(team_id.get())
                .bind(pipeline_name)
                .bind(Json(config))
                .bind(expected.0)
                .fetch_optional(&mut *tx)
                .await?;

                match updated {
                    Some(row) => (row, false),
                    None => {
                        let actual: i64 = sqlx::query_scalar(
                            "SELECT version FROM pipelines WHERE team_id = $1 AND name = $2",
                        )
                        .bind(team_id.get())
                        .bind(pipeline_name)
                        .fetch_optional(&mut *tx)
                        .await?
                        .ok_or_else(|| DbError::NotFound(format!("pipeline {}", pipeline_name)))?;

                        return Err(DbError::ConfigConflict {
                            expected,
                            actual: ConfigVersion(actual),
                        });
                    }
                }
            }
        };

        let pipeline = SavedPipeline::from(row);
        register_contents(&mut tx, pipeline.id, config).await?;
        tx.commit().await?;

        info!(
            team = %self.name,
            pipeline = %pipeline.name,
            version = %pipeline.version,
            created,
            "Saved pipeline config"
        );
        Ok((pipeline, created))
    }

    pub async fn get_pipeline_by_name(&self, name: &str) -> DbResult<SavedPipeline> {
        sqlx::query_as::<_, PipelineRow>(
            r#"
            SELECT p.id, p.team_id, p.name, p.version, p.paused
            FROM pipelines p
            JOIN teams t ON t.id = p.team_id
            WHERE t.name = $1 AND p.name = $2
            "#,
        )
        .bind(&self.name)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .map(SavedPipeline::from)
        .ok_or_else(|| DbError::NotFound(format!("pipeline {}", name)))
    }

    pub async fn get_config(
        &self,
        pipeline_name: &str,
    ) -> DbResult<(PipelineConfig, ConfigVersion)> {
        let pipeline = self.get_pipeline_by_name(pipeline_name).await?;
        fetch_config(&self.pool, pipeline.id).await
    }

    /// Scope to the named pipeline.
    pub async fn pipeline(&self, name: &str) -> DbResult<PipelineDb> {
        let pipeline = self.get_pipeline_by_name(name).await?;
        Ok(PipelineDb::new(pipeline, self.pool.clone(), self.bus.clone()))
    }

    pub async fn list_pipelines(&self) -> DbResult<Vec<SavedPipeline>> {
        let rows = sqlx::query_as::<_, PipelineRow>(
            r#"
            SELECT p.id, p.team_id, p.name, p.version, p.paused
            FROM pipelines p
            JOIN teams t ON t.id = p.team_id
            WHERE t.name = $1
            ORDER BY p.name ASC
            "#,
        )
        .bind(&self.name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(SavedPipeline::from).collect())
    }

    /// Create a pending build that belongs to no job.
    pub async fn create_one_off_build(&self) -> DbResult<Build> {
        let team_id = self.id().await?;
        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO builds (name, team_id)
            VALUES (nextval('one_off_build_name')::text, $1)
            RETURNING id
            "#,
        )
        .bind(team_id.get())
        .fetch_one(&mut *tx)
        .await?;

        let build = fetch_build(&mut *tx, BuildId::new(id))
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        tx.commit().await?;

        info!(
            team = %self.name,
            build_id = %build.id,
            name = %build.name,
            "Created one-off build"
        );
        Ok(build)
    }

    /// Look up a build owned by this team.
    pub async fn get_build(&self, id: BuildId) -> DbResult<Option<Build>> {
        let team_id = self.id().await?;
        let build = fetch_build(&self.pool, id).await?;
        Ok(build.filter(|b| b.team_id == team_id))
    }
}
