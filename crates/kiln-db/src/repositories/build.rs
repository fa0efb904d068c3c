//! PostgreSQL implementation of BuildRepository.

use async_trait::async_trait;
use kiln_core::build::{Build, BuildState};
use kiln_core::ids::{BuildId, TaskId, VersionId};
use kiln_core::ports::BuildRepository;
use kiln_core::version::Requester;
use kiln_core::{Error, Result};
use sqlx::{PgPool, Row};

const COLUMNS: &str = "id, version_id, project, variant, display_name, revision, requester, activated, status, task_ids, create_time";

/// PostgreSQL implementation of BuildRepository.
#[derive(Clone)]
pub struct PgBuildRepository {
    pool: PgPool,
}

impl PgBuildRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_build(r: &sqlx::postgres::PgRow) -> Build {
        let status: String = r.get("status");
        let requester: String = r.get("requester");
        Build {
            id: BuildId::new(r.get::<String, _>("id")),
            version_id: VersionId::new(r.get::<String, _>("version_id")),
            project: r.get("project"),
            variant: r.get("variant"),
            display_name: r.get("display_name"),
            revision: r.get("revision"),
            requester: Requester::parse(&requester),
            activated: r.get("activated"),
            status: BuildState::parse(&status),
            task_ids: r
                .get::<Vec<String>, _>("task_ids")
                .into_iter()
                .map(TaskId::new)
                .collect(),
            create_time: r.get("create_time"),
        }
    }
}

#[async_trait]
impl BuildRepository for PgBuildRepository {
    async fn insert(&self, build: &Build) -> Result<()> {
        let task_ids: Vec<String> = build.task_ids.iter().map(|t| t.to_string()).collect();

        sqlx::query(&format!(
            "INSERT INTO builds ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(build.id.as_str())
        .bind(build.version_id.as_str())
        .bind(&build.project)
        .bind(&build.variant)
        .bind(&build.display_name)
        .bind(&build.revision)
        .bind(build.requester.as_str())
        .bind(build.activated)
        .bind(build.status.as_str())
        .bind(task_ids)
        .bind(build.create_time)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, id: &BuildId) -> Result<Option<Build>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM builds WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.as_ref().map(Self::row_to_build))
    }

    async fn find_by_ids(&self, ids: &[BuildId]) -> Result<Vec<Build>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| id.to_string()).collect();

        // ordinality keeps the caller's order
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM builds b JOIN unnest($1::text[]) WITH ORDINALITY AS k(id, ord) USING (id) ORDER BY k.ord"
        ))
        .bind(keys)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::row_to_build).collect())
    }

    async fn append_tasks(&self, id: &BuildId, task_ids: &[TaskId]) -> Result<()> {
        if task_ids.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = task_ids.iter().map(|t| t.to_string()).collect();

        let result = sqlx::query("UPDATE builds SET task_ids = task_ids || $2::text[] WHERE id = $1")
            .bind(id.as_str())
            .bind(keys)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::BuildNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn set_activation_for_version(
        &self,
        version: &VersionId,
        activated: bool,
    ) -> Result<u64> {
        let result = sqlx::query("UPDATE builds SET activated = $2 WHERE version_id = $1")
            .bind(version.as_str())
            .bind(activated)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
