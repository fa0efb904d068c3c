//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the core domain and external adapters.

use crate::build::Build;
use crate::host::Host;
use crate::host_query::{HostFilter, HostGuard, HostQuery, HostUpdate};
use crate::ids::*;
use crate::patch::{CommitInfo, Patch, ProjectRef};
use crate::task::Task;
use crate::version::{BuildStatus, Version};
use crate::Result;
use async_trait::async_trait;

/// Store for fleet hosts.
///
/// Every mutation is a single conditional update keyed by host id; there is
/// no read-modify-write across calls.
#[async_trait]
pub trait HostRepository: Send + Sync {
    /// Insert a new host.
    async fn insert(&self, host: &Host) -> Result<()>;

    /// Insert the host, or overwrite an existing one except for its status,
    /// which is only written on insert.
    async fn upsert(&self, host: &Host) -> Result<()>;

    /// Get a host by ID.
    async fn get(&self, id: &HostId) -> Result<Option<Host>>;

    /// Find hosts matching a query.
    async fn find(&self, query: &HostQuery) -> Result<Vec<Host>>;

    /// Count hosts matching a filter.
    async fn count(&self, filter: &HostFilter) -> Result<u64>;

    /// Apply `update` to one host if `guard` holds.
    ///
    /// Returns false when the host does not exist or the guard failed.
    async fn update_one(&self, id: &HostId, guard: &HostGuard, update: &HostUpdate)
    -> Result<bool>;

    /// Apply `update` to every matching host. Returns the number updated.
    async fn update_all(&self, filter: &HostFilter, update: &HostUpdate) -> Result<u64>;
}

/// Store for versions.
#[async_trait]
pub trait VersionRepository: Send + Sync {
    /// Insert a new version.
    async fn insert(&self, version: &Version) -> Result<()>;

    /// Get a version by ID.
    async fn get(&self, id: &VersionId) -> Result<Option<Version>>;

    /// Append builds to a version, keeping `build_ids` and
    /// `build_variants` aligned.
    async fn append_builds(&self, id: &VersionId, builds: &[BuildStatus]) -> Result<()>;

    /// Set the activation of a version and all its build-status entries.
    async fn set_activation(&self, id: &VersionId, activated: bool) -> Result<()>;
}

/// Store for builds.
#[async_trait]
pub trait BuildRepository: Send + Sync {
    /// Insert a new build.
    async fn insert(&self, build: &Build) -> Result<()>;

    /// Get a build by ID.
    async fn get(&self, id: &BuildId) -> Result<Option<Build>>;

    /// Get builds by ID, in the order given. Missing ids are skipped.
    async fn find_by_ids(&self, ids: &[BuildId]) -> Result<Vec<Build>>;

    /// Append task ids to a build.
    async fn append_tasks(&self, id: &BuildId, task_ids: &[TaskId]) -> Result<()>;

    /// Set the activation of every build of a version.
    async fn set_activation_for_version(&self, version: &VersionId, activated: bool)
    -> Result<u64>;
}

/// Store for tasks.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert new tasks.
    async fn insert_many(&self, tasks: &[Task]) -> Result<()>;

    /// Get a task by ID.
    async fn get(&self, id: &TaskId) -> Result<Option<Task>>;

    /// Get the tasks of a build.
    async fn find_by_build(&self, build: &BuildId) -> Result<Vec<Task>>;

    /// Deactivate the undispatched tasks of a version.
    async fn deactivate_for_version(&self, version: &VersionId) -> Result<u64>;

    /// Mark the dispatched and started tasks of a version as aborted.
    async fn abort_for_version(&self, version: &VersionId) -> Result<u64>;
}

/// Store for patches.
#[async_trait]
pub trait PatchRepository: Send + Sync {
    /// Insert a new patch.
    async fn insert(&self, patch: &Patch) -> Result<()>;

    /// Get a patch by ID.
    async fn get(&self, id: PatchId) -> Result<Option<Patch>>;

    /// Mark a patch activated and link it to its version.
    async fn set_activated(&self, id: PatchId, version: &VersionId) -> Result<()>;

    /// Delete a patch.
    async fn remove(&self, id: PatchId) -> Result<()>;
}

/// Store for project references.
#[async_trait]
pub trait ProjectRefRepository: Send + Sync {
    /// Get a project ref by identifier.
    async fn get(&self, identifier: &str) -> Result<Option<ProjectRef>>;

    /// Insert or replace a project ref.
    async fn upsert(&self, project_ref: &ProjectRef) -> Result<()>;
}

/// Source-control metadata provider.
#[async_trait]
pub trait CommitProvider: Send + Sync {
    /// Fetch commit metadata. `Ok(None)` means the commit does not exist.
    async fn get_commit(&self, owner: &str, repo: &str, revision: &str)
    -> Result<Option<CommitInfo>>;
}

/// Applies a diff to a project config file.
#[async_trait]
pub trait ConfigPatcher: Send + Sync {
    /// Apply the parts of `diff` touching `remote_path` to `base_config`
    /// and return the patched file contents.
    async fn apply(&self, base_config: &str, diff: &str, remote_path: &str) -> Result<String>;
}

/// Provisioning backend for one kind of distro.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Provider name, matched against `Distro::provider`.
    fn name(&self) -> &str;

    /// Whether the machine behind a host answers.
    async fn is_up(&self, host: &Host) -> Result<bool>;

    /// DNS name of the machine, once it has one.
    async fn dns_name(&self, host: &Host) -> Result<Option<String>>;

    /// Destroy the machine behind a host.
    async fn terminate(&self, host: &Host) -> Result<()>;
}
