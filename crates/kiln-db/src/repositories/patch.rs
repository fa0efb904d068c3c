//! PostgreSQL implementations of PatchRepository and ProjectRefRepository.

use async_trait::async_trait;
use kiln_core::ids::{PatchId, VersionId};
use kiln_core::patch::{ModulePatch, Patch, PatchStatus, ProjectRef};
use kiln_core::pair::VariantTasks;
use kiln_core::ports::{PatchRepository, ProjectRefRepository};
use kiln_core::{Error, Result};
use sqlx::{PgPool, Row};

/// PostgreSQL implementation of PatchRepository.
#[derive(Clone)]
pub struct PgPatchRepository {
    pool: PgPool,
}

impl PgPatchRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PatchRepository for PgPatchRepository {
    async fn insert(&self, patch: &Patch) -> Result<()> {
        let variants_tasks = serde_json::to_value(&patch.variants_tasks)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let patches = serde_json::to_value(&patch.patches)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO patches (id, description, project, githash, author, variants_tasks,
                patches, patched_config, activated, version, status, create_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(patch.id.as_uuid())
        .bind(&patch.description)
        .bind(&patch.project)
        .bind(&patch.githash)
        .bind(&patch.author)
        .bind(&variants_tasks)
        .bind(&patches)
        .bind(&patch.patched_config)
        .bind(patch.activated)
        .bind(patch.version.as_ref().map(|v| v.as_str()))
        .bind(patch.status.as_str())
        .bind(patch.create_time)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, id: PatchId) -> Result<Option<Patch>> {
        let row = sqlx::query(
            r#"
            SELECT id, description, project, githash, author, variants_tasks, patches,
                patched_config, activated, version, status, create_time
            FROM patches WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => {
                let variants_tasks: Vec<VariantTasks> =
                    serde_json::from_value(r.get("variants_tasks"))
                        .map_err(|e| Error::Serialization(e.to_string()))?;
                let patches: Vec<ModulePatch> = serde_json::from_value(r.get("patches"))
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                let status: String = r.get("status");

                Ok(Some(Patch {
                    id: PatchId::from_uuid(r.get::<uuid::Uuid, _>("id")),
                    description: r.get("description"),
                    project: r.get("project"),
                    githash: r.get("githash"),
                    author: r.get("author"),
                    variants_tasks,
                    patches,
                    patched_config: r.get("patched_config"),
                    activated: r.get("activated"),
                    version: r.get::<Option<String>, _>("version").map(VersionId::new),
                    status: PatchStatus::parse(&status),
                    create_time: r.get("create_time"),
                }))
            }
            None => Ok(None),
        }
    }

    async fn set_activated(&self, id: PatchId, version: &VersionId) -> Result<()> {
        let result =
            sqlx::query("UPDATE patches SET activated = TRUE, version = $2 WHERE id = $1")
                .bind(id.as_uuid())
                .bind(version.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::PatchNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn remove(&self, id: PatchId) -> Result<()> {
        sqlx::query("DELETE FROM patches WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}

/// PostgreSQL implementation of ProjectRefRepository.
#[derive(Clone)]
pub struct PgProjectRefRepository {
    pool: PgPool,
}

impl PgProjectRefRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectRefRepository for PgProjectRefRepository {
    async fn get(&self, identifier: &str) -> Result<Option<ProjectRef>> {
        let row = sqlx::query(
            "SELECT identifier, owner, repo, branch, remote_path, enabled FROM project_refs WHERE identifier = $1",
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.map(|r| ProjectRef {
            identifier: r.get("identifier"),
            owner: r.get("owner"),
            repo: r.get("repo"),
            branch: r.get("branch"),
            remote_path: r.get("remote_path"),
            enabled: r.get("enabled"),
        }))
    }

    async fn upsert(&self, project_ref: &ProjectRef) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO project_refs (identifier, owner, repo, branch, remote_path, enabled)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (identifier) DO UPDATE SET
                owner = EXCLUDED.owner,
                repo = EXCLUDED.repo,
                branch = EXCLUDED.branch,
                remote_path = EXCLUDED.remote_path,
                enabled = EXCLUDED.enabled
            "#,
        )
        .bind(&project_ref.identifier)
        .bind(&project_ref.owner)
        .bind(&project_ref.repo)
        .bind(&project_ref.branch)
        .bind(&project_ref.remote_path)
        .bind(project_ref.enabled)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}
