//! Test fixtures for creating sample data.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::host::{Distro, Host, HostStatus};
use kiln_core::ids::{BuildId, DistroId, PatchId, TaskId, VersionId};
use kiln_core::pair::VariantTasks;
use kiln_core::patch::{CommitInfo, ModulePatch, Patch, PatchStatus, ProjectRef};
use kiln_core::ports::{CloudProvider, CommitProvider, ConfigPatcher, TaskRepository};
use kiln_core::project::Project;
use kiln_core::task::Task;
use kiln_core::{Error, Result};
use kiln_db::memory::MemoryTaskRepository;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Identifier of the fixture project.
pub const PROJECT_ID: &str = "kiln";

/// A project with a same-variant chain, a cross-variant dependency, a
/// requirement and a wildcard dependency.
pub const PROJECT_YAML: &str = r#"
identifier: kiln
tasks:
  - name: compile
  - name: unit
    depends_on: [{ name: compile }]
  - name: lint
  - name: integration
    depends_on:
      - { name: unit }
      - { name: compile, variant: windows }
    requires: [{ name: lint }]
  - name: package
    depends_on: [{ name: "*", variant: "*" }]
buildvariants:
  - name: linux
    display_name: Linux x86_64
    run_on: [ubuntu2204]
    tasks:
      - { name: compile }
      - { name: unit }
      - { name: lint }
      - { name: integration, distros: [ubuntu2204-large] }
  - name: windows
    run_on: [windows2022]
    tasks:
      - { name: compile }
      - { name: unit }
  - name: release
    run_on: [ubuntu2204]
    tasks:
      - { name: package }
"#;

/// Factory for the fixture project.
pub struct ProjectFixture;

impl ProjectFixture {
    pub fn project() -> Project {
        Project::from_yaml(PROJECT_YAML).expect("fixture project parses")
    }

    pub fn project_ref() -> ProjectRef {
        ProjectRef {
            identifier: PROJECT_ID.to_string(),
            owner: "kiln-ci".to_string(),
            repo: "kiln".to_string(),
            branch: "main".to_string(),
            remote_path: "kiln.yml".to_string(),
            enabled: true,
        }
    }
}

/// Factory for creating test patches.
pub struct PatchFixture;

impl PatchFixture {
    /// An unfinalized patch of the fixture project selecting `selection`.
    pub fn with_tasks(selection: &[(&str, &[&str])]) -> Patch {
        Patch {
            id: PatchId::new(),
            description: "test patch".to_string(),
            project: PROJECT_ID.to_string(),
            githash: "c0ffee".to_string(),
            author: "dev".to_string(),
            variants_tasks: selection
                .iter()
                .map(|(variant, tasks)| VariantTasks {
                    variant: variant.to_string(),
                    tasks: tasks.iter().map(|t| t.to_string()).collect(),
                })
                .collect(),
            patches: vec![ModulePatch {
                module_name: String::new(),
                githash: "c0ffee".to_string(),
                diff: PROJECT_YAML.to_string(),
            }],
            patched_config: PROJECT_YAML.to_string(),
            activated: true,
            version: None,
            status: PatchStatus::Created,
            create_time: Utc::now(),
        }
    }

    /// `linux/unit` only.
    pub fn simple() -> Patch {
        Self::with_tasks(&[("linux", &["unit"])])
    }
}

/// Factory for creating test hosts.
pub struct HostFixture;

impl HostFixture {
    pub fn distro(id: &str) -> Distro {
        Distro {
            id: DistroId::new(id),
            provider: FakeCloud::NAME.to_string(),
        }
    }

    /// A system-started host in `status`.
    pub fn with_status(id: &str, distro: &str, status: HostStatus) -> Host {
        let mut host = Host::new(id, Self::distro(distro));
        host.status = status;
        host
    }

    /// A running, provisioned system host that just sent a heartbeat.
    pub fn running(id: &str, distro: &str) -> Host {
        let mut host = Self::with_status(id, distro, HostStatus::Running);
        host.provisioned = true;
        host.last_communication_time = Some(Utc::now());
        host
    }

    /// A running host spawned by `user`, expiring at `expires`.
    pub fn spawned(id: &str, user: &str, expires: DateTime<Utc>) -> Host {
        let mut host = Self::running(id, "d1");
        host.started_by = user.to_string();
        host.expiration_time = Some(expires);
        host
    }
}

/// Commit provider that knows every revision except `missing`, and fails
/// outright for `unreachable`.
pub struct StaticCommits;

#[async_trait]
impl CommitProvider for StaticCommits {
    async fn get_commit(
        &self,
        _owner: &str,
        _repo: &str,
        revision: &str,
    ) -> Result<Option<CommitInfo>> {
        match revision {
            "missing" => Ok(None),
            "unreachable" => Err(Error::CommitFetch("connection refused".to_string())),
            _ => Ok(Some(CommitInfo {
                revision: revision.to_string(),
                author: "dev".to_string(),
                author_email: "dev@kiln-ci.dev".to_string(),
                message: "Fix the build".to_string(),
            })),
        }
    }
}

/// Patcher whose diff is the complete new config.
pub struct ReplacingPatcher;

#[async_trait]
impl ConfigPatcher for ReplacingPatcher {
    async fn apply(&self, _base: &str, diff: &str, _remote_path: &str) -> Result<String> {
        if diff.is_empty() {
            return Err(Error::ConfigPatch("empty diff".to_string()));
        }
        Ok(diff.to_string())
    }
}

/// In-process cloud. Machines answer unless marked down.
#[derive(Default)]
pub struct FakeCloud {
    down: Mutex<HashSet<String>>,
    terminated: Mutex<Vec<String>>,
}

impl FakeCloud {
    pub const NAME: &'static str = "fake";

    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_down(&self, host_id: &str, down: bool) {
        let mut set = self.down.lock().await;
        if down {
            set.insert(host_id.to_string());
        } else {
            set.remove(host_id);
        }
    }

    /// Ids of the machines destroyed so far.
    pub async fn terminated(&self) -> Vec<String> {
        self.terminated.lock().await.clone()
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn is_up(&self, host: &Host) -> Result<bool> {
        Ok(!self.down.lock().await.contains(host.id.as_str()))
    }

    async fn dns_name(&self, host: &Host) -> Result<Option<String>> {
        Ok(Some(format!("{}.fake.internal", host.id)))
    }

    async fn terminate(&self, host: &Host) -> Result<()> {
        self.terminated.lock().await.push(host.id.to_string());
        Ok(())
    }
}

/// Task store that fails its `fail_on`th `insert_many` call (counting from
/// one) and otherwise writes through to the wrapped store.
pub struct FlakyTaskRepository {
    inner: Arc<MemoryTaskRepository>,
    fail_on: usize,
    calls: AtomicUsize,
}

impl FlakyTaskRepository {
    pub fn new(inner: Arc<MemoryTaskRepository>, fail_on: usize) -> Self {
        Self {
            inner,
            fail_on,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TaskRepository for FlakyTaskRepository {
    async fn insert_many(&self, tasks: &[Task]) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(Error::Database("connection reset".to_string()));
        }
        self.inner.insert_many(tasks).await
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        self.inner.get(id).await
    }

    async fn find_by_build(&self, build: &BuildId) -> Result<Vec<Task>> {
        self.inner.find_by_build(build).await
    }

    async fn deactivate_for_version(&self, version: &VersionId) -> Result<u64> {
        self.inner.deactivate_for_version(version).await
    }

    async fn abort_for_version(&self, version: &VersionId) -> Result<u64> {
        self.inner.abort_for_version(version).await
    }
}
