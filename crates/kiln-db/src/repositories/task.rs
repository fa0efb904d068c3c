//! PostgreSQL implementation of TaskRepository.

use async_trait::async_trait;
use kiln_core::ids::{BuildId, TaskId, VersionId};
use kiln_core::ports::TaskRepository;
use kiln_core::task::{Task, TaskStatus};
use kiln_core::version::Requester;
use kiln_core::{Error, Result};
use sqlx::{PgPool, Row};
use tracing::debug;

const COLUMNS: &str = "id, build_id, version_id, project, variant, display_name, revision, requester, depends_on, distros, status, activated, aborted, create_time";

/// PostgreSQL implementation of TaskRepository.
#[derive(Clone)]
pub struct PgTaskRepository {
    pool: PgPool,
}

impl PgTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_task(r: &sqlx::postgres::PgRow) -> Task {
        let status: String = r.get("status");
        let requester: String = r.get("requester");
        Task {
            id: TaskId::new(r.get::<String, _>("id")),
            build_id: BuildId::new(r.get::<String, _>("build_id")),
            version_id: VersionId::new(r.get::<String, _>("version_id")),
            project: r.get("project"),
            variant: r.get("variant"),
            display_name: r.get("display_name"),
            revision: r.get("revision"),
            requester: Requester::parse(&requester),
            depends_on: r
                .get::<Vec<String>, _>("depends_on")
                .into_iter()
                .map(TaskId::new)
                .collect(),
            distros: r.get("distros"),
            status: TaskStatus::parse(&status),
            activated: r.get("activated"),
            aborted: r.get("aborted"),
            create_time: r.get("create_time"),
        }
    }
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn insert_many(&self, tasks: &[Task]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let insert = format!(
            "INSERT INTO tasks ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        for task in tasks {
            let depends_on: Vec<String> = task.depends_on.iter().map(|t| t.to_string()).collect();
            sqlx::query(&insert)
                .bind(task.id.as_str())
                .bind(task.build_id.as_str())
                .bind(task.version_id.as_str())
                .bind(&task.project)
                .bind(&task.variant)
                .bind(&task.display_name)
                .bind(&task.revision)
                .bind(task.requester.as_str())
                .bind(depends_on)
                .bind(&task.distros)
                .bind(task.status.as_str())
                .bind(task.activated)
                .bind(task.aborted)
                .bind(task.create_time)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        debug!(count = tasks.len(), "Inserted tasks");
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.as_ref().map(Self::row_to_task))
    }

    async fn find_by_build(&self, build: &BuildId) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM tasks WHERE build_id = $1 ORDER BY create_time, id"
        ))
        .bind(build.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::row_to_task).collect())
    }

    async fn deactivate_for_version(&self, version: &VersionId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET activated = FALSE WHERE version_id = $1 AND status = 'undispatched'",
        )
        .bind(version.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn abort_for_version(&self, version: &VersionId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET aborted = TRUE WHERE version_id = $1 AND status IN ('dispatched', 'started')",
        )
        .bind(version.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
