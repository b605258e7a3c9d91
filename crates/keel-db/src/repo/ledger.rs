//! Versioned-resource ledger: which versions each build consumed and produced.

use async_trait::async_trait;
use keel_core::{
    BuildId, BuildInput, MetadataField, PipelineId, SavedVersionedResource, Version,
    VersionedResource,
};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};

use crate::{DbError, DbResult};

/// A build input as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerInput {
    pub name: String,
    pub resource: SavedVersionedResource,
}

/// A build output as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerOutput {
    pub explicit: bool,
    pub resource: SavedVersionedResource,
}

/// Repository for build inputs and outputs.
#[async_trait]
pub trait ResourceLedger: Send + Sync {
    /// Record `input` under its name for `build`, replacing any earlier
    /// input of the same name.
    async fn save_input(
        &self,
        build: BuildId,
        input: &BuildInput,
    ) -> DbResult<SavedVersionedResource>;

    /// Record `resource` as an output of `build`. Saving the same output
    /// twice is a no-op.
    async fn save_output(
        &self,
        build: BuildId,
        resource: &VersionedResource,
        explicit: bool,
    ) -> DbResult<SavedVersionedResource>;

    /// Inputs of `build`, ordered by name.
    async fn inputs_for_build(&self, build: BuildId) -> DbResult<Vec<LedgerInput>>;

    /// Implicit and explicit outputs of `build`, in the order saved.
    async fn outputs_for_build(&self, build: BuildId) -> DbResult<Vec<LedgerOutput>>;
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    id: i64,
    check_order: i64,
    resource: String,
    #[sqlx(rename = "type")]
    resource_type: String,
    version: Json<Version>,
    metadata: Json<Vec<MetadataField>>,
    pipeline_id: i64,
}

impl From<VersionRow> for SavedVersionedResource {
    fn from(row: VersionRow) -> Self {
        SavedVersionedResource {
            id: row.id,
            check_order: row.check_order,
            versioned_resource: VersionedResource {
                resource: row.resource,
                resource_type: row.resource_type,
                version: row.version.0,
                metadata: row.metadata.0,
                pipeline_id: PipelineId::new(row.pipeline_id),
            },
        }
    }
}

#[derive(sqlx::FromRow)]
struct InputRow {
    name: String,
    #[sqlx(flatten)]
    saved: VersionRow,
}

#[derive(sqlx::FromRow)]
struct OutputRow {
    explicit: bool,
    #[sqlx(flatten)]
    saved: VersionRow,
}

/// PostgreSQL implementation of ResourceLedger.
pub struct PgResourceLedger {
    pool: PgPool,
}

impl PgResourceLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Insert or refresh the resource and its version.
///
/// A first sighting gets the next check order for the resource. Re-saving a
/// known version keeps its id and check order, and only replaces metadata
/// when new metadata is supplied.
async fn upsert_versioned_resource(
    conn: &mut PgConnection,
    vr: &VersionedResource,
) -> DbResult<SavedVersionedResource> {
    let resource_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO resources (pipeline_id, name, type)
        VALUES ($1, $2, $3)
        ON CONFLICT (pipeline_id, name) DO UPDATE SET type = EXCLUDED.type
        RETURNING id
        "#,
    )
    .bind(vr.pipeline_id.get())
    .bind(&vr.resource)
    .bind(&vr.resource_type)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| DbError::missing_reference(e, format!("pipeline {}", vr.pipeline_id)))?;

    let (id, check_order, metadata): (i64, i64, Json<Vec<MetadataField>>) = sqlx::query_as(
        r#"
        INSERT INTO versioned_resources (resource_id, type, version, metadata, check_order)
        VALUES (
            $1, $2, $3, $4,
            (SELECT COALESCE(MAX(check_order), 0) + 1 FROM versioned_resources WHERE resource_id = $1)
        )
        ON CONFLICT (resource_id, version) DO UPDATE SET
            type = EXCLUDED.type,
            metadata = CASE
                WHEN EXCLUDED.metadata = '[]'::jsonb THEN versioned_resources.metadata
                ELSE EXCLUDED.metadata
            END
        RETURNING id, check_order, metadata
        "#,
    )
    .bind(resource_id)
    .bind(&vr.resource_type)
    .bind(Json(vr.version.clone()))
    .bind(Json(vr.metadata.clone()))
    .fetch_one(&mut *conn)
    .await?;

    Ok(SavedVersionedResource {
        id,
        check_order,
        versioned_resource: VersionedResource {
            metadata: metadata.0,
            ..vr.clone()
        },
    })
}

#[async_trait]
impl ResourceLedger for PgResourceLedger {
    async fn save_input(
        &self,
        build: BuildId,
        input: &BuildInput,
    ) -> DbResult<SavedVersionedResource> {
        let mut tx = self.pool.begin().await?;
        let saved = upsert_versioned_resource(&mut tx, &input.versioned_resource).await?;

        sqlx::query(
            r#"
            INSERT INTO build_inputs (build_id, versioned_resource_id, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (build_id, name) DO UPDATE SET versioned_resource_id = EXCLUDED.versioned_resource_id
            "#,
        )
        .bind(build.get())
        .bind(saved.id)
        .bind(&input.name)
        .execute(&mut *tx)
        .await
        .map_err(|e| DbError::missing_reference(e, format!("build {}", build)))?;

        tx.commit().await?;
        Ok(saved)
    }

    async fn save_output(
        &self,
        build: BuildId,
        resource: &VersionedResource,
        explicit: bool,
    ) -> DbResult<SavedVersionedResource> {
        let mut tx = self.pool.begin().await?;
        let saved = upsert_versioned_resource(&mut tx, resource).await?;

        sqlx::query(
            r#"
            INSERT INTO build_outputs (build_id, versioned_resource_id, explicit)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(build.get())
        .bind(saved.id)
        .bind(explicit)
        .execute(&mut *tx)
        .await
        .map_err(|e| DbError::missing_reference(e, format!("build {}", build)))?;

        tx.commit().await?;
        Ok(saved)
    }

    async fn inputs_for_build(&self, build: BuildId) -> DbResult<Vec<LedgerInput>> {
        let rows = sqlx::query_as::<_, InputRow>(
            r#"
            SELECT i.name, v.id, v.check_order, r.name AS resource, v.type,
                   v.version, v.metadata, r.pipeline_id
            FROM build_inputs i
            JOIN versioned_resources v ON v.id = i.versioned_resource_id
            JOIN resources r ON r.id = v.resource_id
            WHERE i.build_id = $1
            ORDER BY i.name ASC
            "#,
        )
        .bind(build.get())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| LedgerInput {
                name: row.name,
                resource: row.saved.into(),
            })
            .collect())
    }

    async fn outputs_for_build(&self, build: BuildId) -> DbResult<Vec<LedgerOutput>> {
        let rows = sqlx::query_as::<_, OutputRow>(
            r#"
            SELECT o.explicit, v.id, v.check_order, r.name AS resource, v.type,
                   v.version, v.metadata, r.pipeline_id
            FROM build_outputs o
            JOIN versioned_resources v ON v.id = o.versioned_resource_id
            JOIN resources r ON r.id = v.resource_id
            WHERE o.build_id = $1
            ORDER BY v.id ASC, o.explicit ASC
            "#,
        )
        .bind(build.get())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| LedgerOutput {
                explicit: row.explicit,
                resource: row.saved.into(),
            })
            .collect())
    }
}
