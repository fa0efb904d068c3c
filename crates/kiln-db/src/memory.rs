//! In-process repositories.
//!
//! Each store holds its documents behind one async mutex, so a guarded
//! update is checked and applied under the same lock, matching the single
//! `UPDATE ... WHERE` the PostgreSQL adapters issue.

use async_trait::async_trait;
use kiln_core::build::Build;
use kiln_core::host::Host;
use kiln_core::host_query::{HostFilter, HostGuard, HostQuery, HostUpdate};
use kiln_core::ids::{BuildId, HostId, PatchId, TaskId, VersionId};
use kiln_core::patch::{Patch, ProjectRef};
use kiln_core::ports::{
    BuildRepository, HostRepository, PatchRepository, ProjectRefRepository, TaskRepository,
    VersionRepository,
};
use kiln_core::task::{Task, TaskStatus};
use kiln_core::version::{BuildStatus, Version};
use kiln_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

fn duplicate(kind: &str, id: impl std::fmt::Display) -> Error {
    Error::Database(format!("duplicate {kind} id: {id}"))
}

/// In-memory host store.
#[derive(Default)]
pub struct MemoryHostRepository {
    hosts: Mutex<BTreeMap<HostId, Host>>,
}

impl MemoryHostRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HostRepository for MemoryHostRepository {
    async fn insert(&self, host: &Host) -> Result<()> {
        let mut hosts = self.hosts.lock().await;
        if hosts.contains_key(&host.id) {
            return Err(duplicate("host", &host.id));
        }
        hosts.insert(host.id.clone(), host.clone());
        Ok(())
    }

    async fn upsert(&self, host: &Host) -> Result<()> {
        let mut hosts = self.hosts.lock().await;
        let mut stored = host.clone();
        if let Some(existing) = hosts.get(&host.id) {
            stored.status = existing.status;
            stored.creation_time = existing.creation_time;
        }
        hosts.insert(host.id.clone(), stored);
        Ok(())
    }

    async fn get(&self, id: &HostId) -> Result<Option<Host>> {
        Ok(self.hosts.lock().await.get(id).cloned())
    }

    async fn find(&self, query: &HostQuery) -> Result<Vec<Host>> {
        let hosts = self.hosts.lock().await;
        Ok(query.run(hosts.values()))
    }

    async fn count(&self, filter: &HostFilter) -> Result<u64> {
        let hosts = self.hosts.lock().await;
        Ok(hosts.values().filter(|h| filter.matches(h)).count() as u64)
    }

    async fn update_one(
        &self,
        id: &HostId,
        guard: &HostGuard,
        update: &HostUpdate,
    ) -> Result<bool> {
        let mut hosts = self.hosts.lock().await;
        match hosts.get_mut(id) {
            Some(host) if guard.holds(host) => {
                update.apply(host);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_all(&self, filter: &HostFilter, update: &HostUpdate) -> Result<u64> {
        let mut hosts = self.hosts.lock().await;
        let mut n = 0;
        for host in hosts.values_mut().filter(|h| filter.matches(h)) {
            update.apply(host);
            n += 1;
        }
        Ok(n)
    }
}

/// In-memory version store.
#[derive(Default)]
pub struct MemoryVersionRepository {
    versions: Mutex<BTreeMap<VersionId, Version>>,
}

impl MemoryVersionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionRepository for MemoryVersionRepository {
    async fn insert(&self, version: &Version) -> Result<()> {
        let mut versions = self.versions.lock().await;
        if versions.contains_key(&version.id) {
            return Err(duplicate("version", &version.id));
        }
        versions.insert(version.id.clone(), version.clone());
        Ok(())
    }

    async fn get(&self, id: &VersionId) -> Result<Option<Version>> {
        Ok(self.versions.lock().await.get(id).cloned())
    }

    async fn append_builds(&self, id: &VersionId, builds: &[BuildStatus]) -> Result<()> {
        let mut versions = self.versions.lock().await;
        let version = versions
            .get_mut(id)
            .ok_or_else(|| Error::VersionNotFound(id.to_string()))?;
        for status in builds {
            version.push_build(status.clone());
        }
        Ok(())
    }

    async fn set_activation(&self, id: &VersionId, activated: bool) -> Result<()> {
        let mut versions = self.versions.lock().await;
        let version = versions
            .get_mut(id)
            .ok_or_else(|| Error::VersionNotFound(id.to_string()))?;
        version.activated = activated;
        for status in &mut version.build_variants {
            status.activated = activated;
        }
        Ok(())
    }
}

/// In-memory build store.
#[derive(Default)]
pub struct MemoryBuildRepository {
    builds: Mutex<BTreeMap<BuildId, Build>>,
}

impl MemoryBuildRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildRepository for MemoryBuildRepository {
    async fn insert(&self, build: &Build) -> Result<()> {
        let mut builds = self.builds.lock().await;
        if builds.contains_key(&build.id) {
            return Err(duplicate("build", &build.id));
        }
        builds.insert(build.id.clone(), build.clone());
        Ok(())
    }

    async fn get(&self, id: &BuildId) -> Result<Option<Build>> {
        Ok(self.builds.lock().await.get(id).cloned())
    }

    async fn find_by_ids(&self, ids: &[BuildId]) -> Result<Vec<Build>> {
        let builds = self.builds.lock().await;
        Ok(ids.iter().filter_map(|id| builds.get(id).cloned()).collect())
    }

    async fn append_tasks(&self, id: &BuildId, task_ids: &[TaskId]) -> Result<()> {
        let mut builds = self.builds.lock().await;
        let build = builds
            .get_mut(id)
            .ok_or_else(|| Error::BuildNotFound(id.to_string()))?;
        build.task_ids.extend_from_slice(task_ids);
        Ok(())
    }

    async fn set_activation_for_version(
        &self,
        version: &VersionId,
        activated: bool,
    ) -> Result<u64> {
        let mut builds = self.builds.lock().await;
        let mut n = 0;
        for build in builds.values_mut().filter(|b| b.version_id == *version) {
            build.activated = activated;
            n += 1;
        }
        Ok(n)
    }
}

/// In-memory task store.
#[derive(Default)]
pub struct MemoryTaskRepository {
    tasks: Mutex<BTreeMap<TaskId, Task>>,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored task, ordered by id.
    pub async fn all(&self) -> Vec<Task> {
        self.tasks.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn insert_many(&self, tasks: &[Task]) -> Result<()> {
        let mut stored = self.tasks.lock().await;
        // all or nothing, like the transaction in the SQL adapter
        if let Some(dup) = tasks.iter().find(|t| stored.contains_key(&t.id)) {
            return Err(duplicate("task", &dup.id));
        }
        for task in tasks {
            stored.insert(task.id.clone(), task.clone());
        }
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.lock().await.get(id).cloned())
    }

    async fn find_by_build(&self, build: &BuildId) -> Result<Vec<Task>> {
        let tasks = self.tasks.lock().await;
        Ok(tasks
            .values()
            .filter(|t| t.build_id == *build)
            .cloned()
            .collect())
    }

    async fn deactivate_for_version(&self, version: &VersionId) -> Result<u64> {
        let mut tasks = self.tasks.lock().await;
        let mut n = 0;
        for task in tasks
            .values_mut()
            .filter(|t| t.version_id == *version && t.status == TaskStatus::Undispatched)
        {
            task.activated = false;
            n += 1;
        }
        Ok(n)
    }

    async fn abort_for_version(&self, version: &VersionId) -> Result<u64> {
        let mut tasks = self.tasks.lock().await;
        let mut n = 0;
        for task in tasks
            .values_mut()
            .filter(|t| t.version_id == *version && t.status.is_in_progress())
        {
            task.aborted = true;
            n += 1;
        }
        Ok(n)
    }
}

/// In-memory patch store.
#[derive(Default)]
pub struct MemoryPatchRepository {
    patches: Mutex<HashMap<PatchId, Patch>>,
}

impl MemoryPatchRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PatchRepository for MemoryPatchRepository {
    async fn insert(&self, patch: &Patch) -> Result<()> {
        let mut patches = self.patches.lock().await;
        if patches.contains_key(&patch.id) {
            return Err(duplicate("patch", patch.id));
        }
        patches.insert(patch.id, patch.clone());
        Ok(())
    }

    async fn get(&self, id: PatchId) -> Result<Option<Patch>> {
        Ok(self.patches.lock().await.get(&id).cloned())
    }

    async fn set_activated(&self, id: PatchId, version: &VersionId) -> Result<()> {
        let mut patches = self.patches.lock().await;
        let patch = patches
            .get_mut(&id)
            .ok_or_else(|| Error::PatchNotFound(id.to_string()))?;
        patch.activated = true;
        patch.version = Some(version.clone());
        Ok(())
    }

    async fn remove(&self, id: PatchId) -> Result<()> {
        self.patches.lock().await.remove(&id);
        Ok(())
    }
}

/// In-memory project ref store.
#[derive(Default)]
pub struct MemoryProjectRefRepository {
    refs: Mutex<BTreeMap<String, ProjectRef>>,
}

impl MemoryProjectRefRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectRefRepository for MemoryProjectRefRepository {
    async fn get(&self, identifier: &str) -> Result<Option<ProjectRef>> {
        Ok(self.refs.lock().await.get(identifier).cloned())
    }

    async fn upsert(&self, project_ref: &ProjectRef) -> Result<()> {
        self.refs
            .lock()
            .await
            .insert(project_ref.identifier.clone(), project_ref.clone());
        Ok(())
    }
}
