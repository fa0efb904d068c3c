//! PostgreSQL implementation of VersionRepository.

use async_trait::async_trait;
use kiln_core::ids::{BuildId, VersionId};
use kiln_core::ports::VersionRepository;
use kiln_core::version::{BuildStatus, Requester, Version, VersionStatus};
use kiln_core::{Error, Result};
use sqlx::{PgPool, Row};

/// PostgreSQL implementation of VersionRepository.
#[derive(Clone)]
pub struct PgVersionRepository {
    pool: PgPool,
}

impl PgVersionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_version(r: &sqlx::postgres::PgRow) -> Result<Version> {
        let build_variants: Vec<BuildStatus> = serde_json::from_value(r.get("build_variants"))
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let status: String = r.get("status");
        let requester: String = r.get("requester");
        Ok(Version {
            id: VersionId::new(r.get::<String, _>("id")),
            create_time: r.get("create_time"),
            identifier: r.get("identifier"),
            revision: r.get("revision"),
            author: r.get("author"),
            author_email: r.get("author_email"),
            message: r.get("message"),
            config: r.get("config"),
            status: VersionStatus::parse(&status),
            requester: Requester::parse(&requester),
            activated: r.get("activated"),
            build_ids: r
                .get::<Vec<String>, _>("build_ids")
                .into_iter()
                .map(BuildId::new)
                .collect(),
            build_variants,
        })
    }
}

fn build_ids(builds: &[BuildStatus]) -> Vec<String> {
    builds.iter().map(|b| b.build_id.as_str().to_string()).collect()
}

#[async_trait]
impl VersionRepository for PgVersionRepository {
    async fn insert(&self, version: &Version) -> Result<()> {
        let build_variants = serde_json::to_value(&version.build_variants)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO versions (id, create_time, identifier, revision, author, author_email,
                message, config, status, requester, activated, build_ids, build_variants)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(version.id.as_str())
        .bind(version.create_time)
        .bind(&version.identifier)
        .bind(&version.revision)
        .bind(&version.author)
        .bind(&version.author_email)
        .bind(&version.message)
        .bind(&version.config)
        .bind(version.status.as_str())
        .bind(version.requester.as_str())
        .bind(version.activated)
        .bind(build_ids(&version.build_variants))
        .bind(&build_variants)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, id: &VersionId) -> Result<Option<Version>> {
        let row = sqlx::query(
            r#"
            SELECT id, create_time, identifier, revision, author, author_email, message, config,
                status, requester, activated, build_ids, build_variants
            FROM versions WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        row.as_ref().map(Self::row_to_version).transpose()
    }

    async fn append_builds(&self, id: &VersionId, builds: &[BuildStatus]) -> Result<()> {
        if builds.is_empty() {
            return Ok(());
        }
        let entries =
            serde_json::to_value(builds).map_err(|e| Error::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE versions
            SET build_ids = build_ids || $2::text[], build_variants = build_variants || $3::jsonb
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(build_ids(builds))
        .bind(&entries)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::VersionNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn set_activation(&self, id: &VersionId, activated: bool) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE versions
            SET activated = $2,
                build_variants = COALESCE((
                    SELECT jsonb_agg(jsonb_set(e.value, '{activated}', to_jsonb($2::boolean)) ORDER BY e.ord)
                    FROM jsonb_array_elements(build_variants) WITH ORDINALITY AS e(value, ord)
                ), '[]'::jsonb)
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(activated)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::VersionNotFound(id.to_string()));
        }
        Ok(())
    }
}
