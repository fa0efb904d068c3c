//! Turning a patch into a runnable version, and cancelling it again.

use crate::assembler::BuildAssembler;
use crate::task_table::TaskIdTable;
use chrono::Utc;
use kiln_core::ids::VersionId;
use kiln_core::patch::Patch;
use kiln_core::ports::{CommitProvider, ConfigPatcher, PatchRepository, ProjectRefRepository};
use kiln_core::project::Project;
use kiln_core::version::{BuildStatus, Requester, Version, VersionStatus};
use kiln_core::{Error, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// A project config with a patch applied.
#[derive(Debug, Clone)]
pub struct PatchedConfig {
    pub project: Project,
    /// The patched file contents, as stored on the patch.
    pub yaml: String,
}

/// Drives a patch from `created` to an activated version.
pub struct PatchFinalizer {
    assembler: BuildAssembler,
    patches: Arc<dyn PatchRepository>,
    project_refs: Arc<dyn ProjectRefRepository>,
    commits: Arc<dyn CommitProvider>,
    patcher: Arc<dyn ConfigPatcher>,
}

impl PatchFinalizer {
    pub fn new(
        assembler: BuildAssembler,
        patches: Arc<dyn PatchRepository>,
        project_refs: Arc<dyn ProjectRefRepository>,
        commits: Arc<dyn CommitProvider>,
        patcher: Arc<dyn ConfigPatcher>,
    ) -> Self {
        Self {
            assembler,
            patches,
            project_refs,
            commits,
            patcher,
        }
    }

    pub fn assembler(&self) -> &BuildAssembler {
        &self.assembler
    }

    /// Create and persist the version for a patch.
    ///
    /// One activated build is created per distinct requested variant,
    /// holding exactly the requested tasks. The version is inserted last,
    /// so any failure before that leaves no version behind. Builds and tasks
    /// written by a failed attempt stay, and calling again completes them.
    pub async fn finalize_patch(&self, patch: &Patch) -> Result<Version> {
        let project = Project::from_yaml(&patch.patched_config)?;

        let project_ref = self
            .project_refs
            .get(&patch.project)
            .await?
            .ok_or_else(|| Error::ProjectRefNotFound(patch.project.clone()))?;

        let commit = self
            .commits
            .get_commit(&project_ref.owner, &project_ref.repo, &patch.githash)
            .await
            .map_err(|e| match e {
                Error::CommitNotFound { .. } | Error::CommitFetch(_) => e,
                other => Error::CommitFetch(other.to_string()),
            })?
            .ok_or_else(|| Error::CommitNotFound {
                revision: patch.githash.clone(),
            })?;

        let mut version = Version {
            id: VersionId::for_patch(patch.id),
            create_time: Utc::now(),
            identifier: patch.project.clone(),
            revision: patch.githash.clone(),
            author: commit.author,
            author_email: commit.author_email,
            message: commit.message,
            config: patch.patched_config.clone(),
            status: VersionStatus::Created,
            requester: Requester::Patch,
            activated: true,
            build_ids: Vec::new(),
            build_variants: Vec::new(),
        };

        let pairs = patch.pairs();
        let table = TaskIdTable::build(&project, &version.id, &pairs);

        for variant in pairs.variants() {
            let build = self
                .assembler
                .ensure_build(
                    &project,
                    &version,
                    &table,
                    &variant,
                    true,
                    &pairs.task_names(&variant),
                )
                .await
                .map_err(|e| Error::BuildCreation {
                    variant: variant.clone(),
                    source: Box::new(e),
                })?;
            version.push_build(BuildStatus {
                variant,
                build_id: build.id,
                activated: true,
            });
        }

        // a retry after the patch update failed finds the version in place
        if self.assembler.versions.get(&version.id).await?.is_none() {
            self.assembler.versions.insert(&version).await?;
        }
        self.patches.set_activated(patch.id, &version.id).await?;

        info!(
            patch_id = %patch.id,
            version_id = %version.id,
            builds = version.build_ids.len(),
            "Finalized patch"
        );
        Ok(version)
    }

    /// Apply the patch's project diff to `project_config` and parse the
    /// result. Module patches are ignored.
    pub async fn make_patched_config(
        &self,
        patch: &Patch,
        remote_path: &str,
        project_config: &str,
    ) -> Result<PatchedConfig> {
        let project_patch = patch
            .patches
            .iter()
            .find(|p| p.module_name.is_empty())
            .ok_or(Error::NoPatchForProject)?;

        let yaml = self
            .patcher
            .apply(project_config, &project_patch.diff, remote_path)
            .await
            .map_err(|e| match e {
                Error::ConfigPatch(_) => e,
                other => Error::ConfigPatch(other.to_string()),
            })?;
        let project = Project::from_yaml(&yaml)?;

        Ok(PatchedConfig { project, yaml })
    }

    /// Stop a patch. A finalized patch has its version deactivated and its
    /// in-progress tasks aborted; an unfinalized one is deleted.
    pub async fn cancel_patch(&self, patch: &Patch, caller: &str) -> Result<()> {
        let Some(version) = &patch.version else {
            self.patches.remove(patch.id).await?;
            info!(patch_id = %patch.id, caller, "Deleted unfinalized patch");
            return Ok(());
        };

        self.assembler.versions.set_activation(version, false).await?;
        let builds = self
            .assembler
            .builds
            .set_activation_for_version(version, false)
            .await?;
        let deactivated = self.assembler.tasks.deactivate_for_version(version).await?;
        let aborted = self.assembler.tasks.abort_for_version(version).await?;

        if aborted > 0 {
            warn!(version_id = %version, aborted, caller, "Aborted running tasks");
        }
        info!(
            patch_id = %patch.id,
            version_id = %version,
            builds,
            deactivated,
            caller,
            "Cancelled patch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kiln_core::pair::VariantTasks;
    use kiln_core::patch::{CommitInfo, ModulePatch, PatchStatus, ProjectRef};
    use kiln_core::ids::PatchId;
    use kiln_core::ports::VersionRepository;
    use kiln_db::memory::*;

    const YAML: &str = r#"
identifier: kiln
tasks:
  - name: compile
  - name: test
    depends_on: [{ name: compile }]
buildvariants:
  - name: linux
    tasks: [{ name: compile }, { name: test }]
  - name: osx
    tasks: [{ name: compile }]
"#;

    struct Commits;

    #[async_trait]
    impl CommitProvider for Commits {
        async fn get_commit(
            &self,
            _owner: &str,
            _repo: &str,
            revision: &str,
        ) -> Result<Option<CommitInfo>> {
            if revision == "missing" {
                return Ok(None);
            }
            Ok(Some(CommitInfo {
                revision: revision.to_string(),
                author: "dev".to_string(),
                author_email: "dev@example.com".to_string(),
                message: "fix things".to_string(),
            }))
        }
    }

    struct Patcher;

    #[async_trait]
    impl ConfigPatcher for Patcher {
        async fn apply(&self, _base: &str, diff: &str, _remote_path: &str) -> Result<String> {
            Ok(diff.to_string())
        }
    }

    struct Harness {
        finalizer: PatchFinalizer,
        versions: Arc<MemoryVersionRepository>,
        patches: Arc<MemoryPatchRepository>,
    }

    async fn harness() -> Harness {
        let versions = Arc::new(MemoryVersionRepository::new());
        let patches = Arc::new(MemoryPatchRepository::new());
        let refs = Arc::new(MemoryProjectRefRepository::new());
        refs.upsert(&ProjectRef {
            identifier: "kiln".to_string(),
            owner: "kiln-ci".to_string(),
            repo: "kiln".to_string(),
            branch: "main".to_string(),
            remote_path: "kiln.yml".to_string(),
            enabled: true,
        })
        .await
        .unwrap();

        let assembler = BuildAssembler::new(
            versions.clone(),
            Arc::new(MemoryBuildRepository::new()),
            Arc::new(MemoryTaskRepository::new()),
        );
        let finalizer = PatchFinalizer::new(
            assembler,
            patches.clone(),
            refs,
            Arc::new(Commits),
            Arc::new(Patcher),
        );
        Harness {
            finalizer,
            versions,
            patches,
        }
    }

    fn patch(githash: &str) -> Patch {
        Patch {
            id: PatchId::new(),
            description: String::new(),
            project: "kiln".to_string(),
            githash: githash.to_string(),
            author: "dev".to_string(),
            variants_tasks: vec![
                VariantTasks {
                    variant: "linux".to_string(),
                    tasks: vec!["test".to_string()],
                },
                VariantTasks {
                    variant: "osx".to_string(),
                    tasks: vec!["compile".to_string()],
                },
            ],
            patches: Vec::new(),
            patched_config: YAML.to_string(),
            activated: false,
            version: None,
            status: PatchStatus::Created,
            create_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_finalize_creates_one_build_per_variant() {
        let h = harness().await;
        let p = patch("abc123");
        h.patches.insert(&p).await.unwrap();

        let version = h.finalizer.finalize_patch(&p).await.unwrap();
        assert_eq!(version.id, VersionId::for_patch(p.id));
        assert_eq!(version.requester, Requester::Patch);
        assert_eq!(version.build_ids.len(), 2);
        assert!(version.build_variants.iter().all(|b| b.activated));

        let stored = h.versions.get(&version.id).await.unwrap().unwrap();
        assert_eq!(stored.build_ids, version.build_ids);

        let p = h.patches.get(p.id).await.unwrap().unwrap();
        assert!(p.activated);
        assert_eq!(p.version, Some(version.id));
    }

    #[tokio::test]
    async fn test_missing_commit_leaves_no_version() {
        let h = harness().await;
        let p = patch("missing");
        h.patches.insert(&p).await.unwrap();

        let err = h.finalizer.finalize_patch(&p).await.unwrap_err();
        assert!(matches!(err, Error::CommitNotFound { .. }));
        assert!(
            h.versions
                .get(&VersionId::for_patch(p.id))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_unknown_project_ref_is_configuration_error() {
        let h = harness().await;
        let mut p = patch("abc123");
        p.project = "elsewhere".to_string();
        let err = h.finalizer.finalize_patch(&p).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_patched_config_needs_project_patch() {
        let h = harness().await;
        let mut p = patch("abc123");
        p.patches = vec![ModulePatch {
            module_name: "docs".to_string(),
            githash: "abc123".to_string(),
            diff: String::new(),
        }];
        let err = h
            .finalizer
            .make_patched_config(&p, "kiln.yml", YAML)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoPatchForProject));

        p.patches.push(ModulePatch {
            module_name: String::new(),
            githash: "abc123".to_string(),
            diff: YAML.to_string(),
        });
        let patched = h
            .finalizer
            .make_patched_config(&p, "kiln.yml", "")
            .await
            .unwrap();
        assert_eq!(patched.project.identifier, "kiln");
    }

    #[tokio::test]
    async fn test_cancel_unfinalized_patch_deletes_it() {
        let h = harness().await;
        let p = patch("abc123");
        h.patches.insert(&p).await.unwrap();

        h.finalizer.cancel_patch(&p, "dev").await.unwrap();
        assert!(h.patches.get(p.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_finalized_patch_deactivates_version() {
        let h = harness().await;
        let p = patch("abc123");
        h.patches.insert(&p).await.unwrap();
        h.finalizer.finalize_patch(&p).await.unwrap();
        let p = h.patches.get(p.id).await.unwrap().unwrap();

        h.finalizer.cancel_patch(&p, "dev").await.unwrap();
        let version = h
            .versions
            .get(p.version.as_ref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(!version.activated);
        assert!(version.build_variants.iter().all(|b| !b.activated));
        assert!(h.patches.get(p.id).await.unwrap().is_some());
    }
}
