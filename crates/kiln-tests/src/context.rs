//! Test context providing access to all test infrastructure.

use crate::containers::PostgresContainer;
use crate::fixtures::{ProjectFixture, ReplacingPatcher, StaticCommits};
use kiln_core::ports::{ProjectRefRepository, TaskRepository};
use kiln_db::memory::{
    MemoryBuildRepository, MemoryHostRepository, MemoryPatchRepository,
    MemoryProjectRefRepository, MemoryTaskRepository, MemoryVersionRepository,
};
use kiln_db::{
    Database, PgBuildRepository, PgHostRepository, PgPatchRepository, PgProjectRefRepository,
    PgTaskRepository, PgVersionRepository,
};
use kiln_fleet::{HostManager, TaskAssigner};
use kiln_scheduler::{BuildAssembler, PatchFinalizer};
use std::sync::Arc;

/// Services wired over in-memory repositories, with the fixture project
/// registered.
///
/// The repositories are public so tests can inspect what the services
/// wrote.
pub struct TestContext {
    pub hosts: Arc<MemoryHostRepository>,
    pub versions: Arc<MemoryVersionRepository>,
    pub builds: Arc<MemoryBuildRepository>,
    pub tasks: Arc<MemoryTaskRepository>,
    pub patches: Arc<MemoryPatchRepository>,
    pub project_refs: Arc<MemoryProjectRefRepository>,
}

impl TestContext {
    pub async fn new() -> Self {
        crate::init_test_logging();

        let project_refs = Arc::new(MemoryProjectRefRepository::new());
        project_refs
            .upsert(&ProjectFixture::project_ref())
            .await
            .expect("memory upsert cannot fail");

        Self {
            hosts: Arc::new(MemoryHostRepository::new()),
            versions: Arc::new(MemoryVersionRepository::new()),
            builds: Arc::new(MemoryBuildRepository::new()),
            tasks: Arc::new(MemoryTaskRepository::new()),
            patches: Arc::new(MemoryPatchRepository::new()),
            project_refs,
        }
    }

    pub fn host_manager(&self) -> HostManager {
        HostManager::new(self.hosts.clone())
    }

    pub fn assigner(&self) -> TaskAssigner {
        TaskAssigner::new(self.hosts.clone())
    }

    pub fn assembler(&self) -> BuildAssembler {
        self.assembler_with_tasks(self.tasks.clone())
    }

    /// Assembler writing tasks through `tasks` instead of the context's
    /// store.
    pub fn assembler_with_tasks(&self, tasks: Arc<dyn TaskRepository>) -> BuildAssembler {
        BuildAssembler::new(self.versions.clone(), self.builds.clone(), tasks)
    }

    pub fn finalizer(&self) -> PatchFinalizer {
        self.finalizer_with(self.assembler())
    }

    pub fn finalizer_with(&self, assembler: BuildAssembler) -> PatchFinalizer {
        PatchFinalizer::new(
            assembler,
            self.patches.clone(),
            self.project_refs.clone(),
            Arc::new(StaticCommits),
            Arc::new(ReplacingPatcher),
        )
    }

    /// Create context with only PostgreSQL.
    pub async fn postgres_only() -> anyhow::Result<PostgresOnlyContext> {
        crate::init_test_logging();

        let postgres = PostgresContainer::start().await?;
        let db = Database::connect(postgres.connection_string()).await?;
        db.migrate().await?;

        Ok(PostgresOnlyContext { postgres, db })
    }
}

/// Minimal context with only PostgreSQL.
pub struct PostgresOnlyContext {
    pub postgres: PostgresContainer,
    pub db: Database,
}

impl PostgresOnlyContext {
    pub fn host_repository(&self) -> Arc<PgHostRepository> {
        Arc::new(PgHostRepository::new(self.db.pool().clone()))
    }

    pub fn assembler(&self) -> BuildAssembler {
        let pool = self.db.pool().clone();
        BuildAssembler::new(
            Arc::new(PgVersionRepository::new(pool.clone())),
            Arc::new(PgBuildRepository::new(pool.clone())),
            Arc::new(PgTaskRepository::new(pool)),
        )
    }

    /// Finalizer over PostgreSQL with the fixture project registered.
    pub async fn finalizer(&self) -> anyhow::Result<PatchFinalizer> {
        let pool = self.db.pool().clone();
        let project_refs = Arc::new(PgProjectRefRepository::new(pool.clone()));
        project_refs.upsert(&ProjectFixture::project_ref()).await?;

        Ok(PatchFinalizer::new(
            self.assembler(),
            Arc::new(PgPatchRepository::new(pool)),
            project_refs,
            Arc::new(StaticCommits),
            Arc::new(ReplacingPatcher),
        ))
    }

    /// Get database connection string.
    pub fn db_url(&self) -> &str {
        self.postgres.connection_string()
    }
}
