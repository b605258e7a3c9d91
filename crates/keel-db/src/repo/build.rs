//! Build repository: lifecycle transitions, event log access and resources.

use chrono::{DateTime, Utc};
use keel_core::{
    Build, BuildId, BuildInput, BuildOutput, BuildStatus, ConfigVersion, Event, JobId, JobRef,
    PipelineConfig, PipelineId, SavedVersionedResource, TeamId,
};
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor, PgPool};
use std::sync::Arc;
use tracing::info;

use crate::bus::NotificationBus;
use crate::events::{BuildEvents, PgEventLog, append_event};
use crate::repo::ledger::{PgResourceLedger, ResourceLedger};
use crate::{DbError, DbResult};

/// Database row for builds, joined with the owning job and pipeline.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildRow {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub team_id: i64,
    pub job_id: Option<i64>,
    pub job_name: Option<String>,
    pub pipeline_id: Option<i64>,
    pub pipeline_name: Option<String>,
    pub engine: Option<String>,
    pub engine_metadata: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub reap_time: Option<DateTime<Utc>>,
}

impl TryFrom<BuildRow> for Build {
    type Error = DbError;

    fn try_from(row: BuildRow) -> Result<Self, Self::Error> {
        let job = match (row.job_id, row.job_name, row.pipeline_id, row.pipeline_name) {
            (Some(job_id), Some(job_name), Some(pipeline_id), Some(pipeline_name)) => Some(JobRef {
                job_id: JobId::new(job_id),
                job_name,
                pipeline_id: PipelineId::new(pipeline_id),
                pipeline_name,
            }),
            _ => None,
        };

        Ok(Build {
            id: BuildId::new(row.id),
            name: row.name,
            status: row.status.parse()?,
            team_id: TeamId::new(row.team_id),
            job,
            engine: row.engine,
            engine_metadata: row.engine_metadata,
            start_time: row.start_time,
            end_time: row.end_time,
            reap_time: row.reap_time,
        })
    }
}

const BUILD_SELECT: &str = r#"
    SELECT b.id, b.name, b.status, b.team_id, b.job_id,
           j.name AS job_name, p.id AS pipeline_id, p.name AS pipeline_name,
           b.engine, b.engine_metadata, b.start_time, b.end_time, b.reap_time
    FROM builds b
    LEFT JOIN jobs j ON j.id = b.job_id
    LEFT JOIN pipelines p ON p.id = j.pipeline_id
"#;

pub(crate) async fn fetch_build<'e, E: PgExecutor<'e>>(
    executor: E,
    id: BuildId,
) -> DbResult<Option<Build>> {
    let sql = format!("{BUILD_SELECT} WHERE b.id = $1");
    let row = sqlx::query_as::<_, BuildRow>(&sql)
        .bind(id.get())
        .fetch_optional(executor)
        .await?;
    row.map(Build::try_from).transpose()
}

async fn current_status(conn: &mut PgConnection, id: BuildId) -> DbResult<Option<BuildStatus>> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM builds WHERE id = $1")
        .bind(id.get())
        .fetch_optional(conn)
        .await?;
    Ok(status.map(|s| s.parse::<BuildStatus>()).transpose()?)
}

/// Stored names of the statuses in `from` that may move to `to`.
fn sources(to: BuildStatus, from: impl IntoIterator<Item = BuildStatus>) -> Vec<&'static str> {
    from.into_iter()
        .filter(|status| status.can_transition_to(to))
        .map(|status| status.as_str())
        .collect()
}

/// Handle on a single build.
///
/// Every lifecycle transition is one transaction: the conditional status
/// update, the status event and its notification commit together.
#[derive(Clone)]
pub struct BuildDb {
    id: BuildId,
    pool: PgPool,
    bus: NotificationBus,
}

impl BuildDb {
    pub fn new(id: BuildId, pool: PgPool, bus: NotificationBus) -> Self {
        Self { id, pool, bus }
    }

    pub fn id(&self) -> BuildId {
        self.id
    }

    /// Re-read the build.
    pub async fn get(&self) -> DbResult<Option<Build>> {
        fetch_build(&self.pool, self.id).await
    }

    /// Append an event to the build's log, returning its sequence number.
    ///
    /// Fails with [`DbError::BuildCompleted`] once the build has finished.
    pub async fn save_event(&self, event: &Event) -> DbResult<i64> {
        let mut tx = self.pool.begin().await?;
        let event_id = append_event(&mut tx, self.id, event).await?;
        tx.commit().await?;
        Ok(event_id)
    }

    /// Subscribe to the build's log starting at event `from`.
    pub async fn events(&self, from: i64) -> DbResult<BuildEvents> {
        let log = Arc::new(PgEventLog::new(self.pool.clone()));
        BuildEvents::subscribe(self.id, from, log, &self.bus).await
    }

    /// Move Pending -> Started.
    ///
    /// Returns `false` without changing anything if the build was not
    /// pending, e.g. because a concurrent caller started it first.
    pub async fn start(&self, engine: &str, engine_metadata: &str) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let start_time: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            UPDATE builds SET status = 'started', start_time = NOW(), engine = $2, engine_metadata = $3
            WHERE id = $1 AND status = ANY($4)
            RETURNING start_time
            "#,
        )
        .bind(self.id.get())
        .bind(engine)
        .bind(engine_metadata)
        .bind(sources(BuildStatus::Started, BuildStatus::ALL))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(start_time) = start_time else {
            return match current_status(&mut tx, self.id).await? {
                Some(_) => Ok(false),
                None => Err(DbError::NotFound(format!("build {}", self.id))),
            };
        };

        let event = Event::Status {
            status: BuildStatus::Started,
            time: start_time.timestamp(),
        };
        append_event(&mut tx, self.id, &event).await?;
        tx.commit().await?;

        info!(build_id = %self.id, engine, "Build started");
        Ok(true)
    }

    /// Move Started -> `status` and end the event stream.
    pub async fn finish(&self, status: BuildStatus) -> DbResult<()> {
        if !status.is_finish_status() {
            return Err(DbError::InvalidInput(format!(
                "cannot finish a build as {}",
                status
            )));
        }

        self.complete(status, [BuildStatus::Started], None).await
    }

    /// Move Pending or Started -> Aborted and end the event stream.
    pub async fn abort(&self) -> DbResult<()> {
        self.complete(BuildStatus::Aborted, BuildStatus::ALL, None)
            .await
    }

    /// Move Pending or Started -> Errored, recording why.
    ///
    /// Appends an `Error` event carrying `cause` before the status event.
    pub async fn mark_as_failed(&self, cause: impl std::fmt::Display) -> DbResult<()> {
        let error = Event::error(cause.to_string());
        self.complete(BuildStatus::Errored, BuildStatus::ALL, Some(error))
            .await
    }

    /// Move to the terminal `status` from any of `from` the lifecycle allows.
    ///
    /// The final events are appended before `completed` is set, all under the
    /// row lock taken by the status update.
    async fn complete(
        &self,
        status: BuildStatus,
        from: impl IntoIterator<Item = BuildStatus>,
        preceding: Option<Event>,
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let end_time: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            UPDATE builds SET status = $2, end_time = NOW()
            WHERE id = $1 AND status = ANY($3)
            RETURNING end_time
            "#,
        )
        .bind(self.id.get())
        .bind(status.as_str())
        .bind(sources(status, from))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(end_time) = end_time else {
            return Err(match current_status(&mut tx, self.id).await? {
                Some(from) => DbError::InvalidTransition {
                    build: self.id,
                    from,
                    to: status,
                },
                None => DbError::NotFound(format!("build {}", self.id)),
            });
        };

        if let Some(event) = preceding {
            append_event(&mut tx, self.id, &event).await?;
        }
        let event = Event::Status {
            status,
            time: end_time.timestamp(),
        };
        append_event(&mut tx, self.id, &event).await?;

        sqlx::query("UPDATE builds SET completed = TRUE WHERE id = $1")
            .bind(self.id.get())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(build_id = %self.id, status = %status, "Build completed");
        Ok(())
    }

    /// Inputs and explicit outputs of the build.
    pub async fn get_resources(&self) -> DbResult<(Vec<BuildInput>, Vec<BuildOutput>)> {
        let ledger = PgResourceLedger::new(self.pool.clone());

        let inputs = ledger
            .inputs_for_build(self.id)
            .await?
            .into_iter()
            .map(|input| BuildInput {
                name: input.name,
                versioned_resource: input.resource.versioned_resource,
            })
            .collect();

        let outputs = ledger
            .outputs_for_build(self.id)
            .await?
            .into_iter()
            .filter(|output| output.explicit)
            .map(|output| BuildOutput {
                versioned_resource: output.resource.versioned_resource,
                explicit: true,
            })
            .collect();

        Ok((inputs, outputs))
    }

    /// Inputs followed by explicit outputs, as stored in the ledger.
    pub async fn get_versioned_resources(&self) -> DbResult<Vec<SavedVersionedResource>> {
        let ledger = PgResourceLedger::new(self.pool.clone());

        let mut resources: Vec<_> = ledger
            .inputs_for_build(self.id)
            .await?
            .into_iter()
            .map(|input| input.resource)
            .collect();
        resources.extend(
            ledger
                .outputs_for_build(self.id)
                .await?
                .into_iter()
                .filter(|output| output.explicit)
                .map(|output| output.resource),
        );

        Ok(resources)
    }

    /// Config of the pipeline the build's job belongs to; `None` for one-off builds.
    pub async fn get_config(&self) -> DbResult<Option<(PipelineConfig, ConfigVersion)>> {
        let row: Option<(Json<PipelineConfig>, i64)> = sqlx::query_as(
            r#"
            SELECT p.config, p.version
            FROM builds b
            JOIN jobs j ON j.id = b.job_id
            JOIN pipelines p ON p.id = j.pipeline_id
            WHERE b.id = $1
            "#,
        )
        .bind(self.id.get())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((Json(config), version)) => Ok(Some((config, ConfigVersion(version)))),
            None if self.get().await?.is_some() => Ok(None),
            None => Err(DbError::NotFound(format!("build {}", self.id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_follow_lifecycle() {
        assert_eq!(sources(BuildStatus::Started, BuildStatus::ALL), vec!["pending"]);
        assert_eq!(
            sources(BuildStatus::Aborted, BuildStatus::ALL),
            vec!["pending", "started"]
        );
        assert_eq!(
            sources(BuildStatus::Errored, BuildStatus::ALL),
            vec!["pending", "started"]
        );
        assert_eq!(sources(BuildStatus::Succeeded, BuildStatus::ALL), vec!["started"]);
    }

    #[test]
    fn test_finish_is_limited_to_started_builds() {
        assert_eq!(
            sources(BuildStatus::Errored, [BuildStatus::Started]),
            vec!["started"]
        );
        assert!(sources(BuildStatus::Succeeded, [BuildStatus::Pending]).is_empty());
        assert!(sources(BuildStatus::Pending, BuildStatus::ALL).is_empty());
    }
}
