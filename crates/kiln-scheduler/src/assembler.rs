//! Materializes a pair set as build and task records under a version.

use crate::task_table::TaskIdTable;
use chrono::Utc;
use kiln_core::build::{Build, BuildState};
use kiln_core::ids::{BuildId, TaskId, VersionId};
use kiln_core::pair::{Pair, PairSet};
use kiln_core::patch::Patch;
use kiln_core::ports::{BuildRepository, TaskRepository, VersionRepository};
use kiln_core::project::{BuildVariant, Project};
use kiln_core::task::{Task, TaskStatus};
use kiln_core::version::{BuildStatus, Version};
use kiln_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Creates builds and tasks for a version.
///
/// Neither entry point is transactional. Both are safe to retry after a
/// partial failure: variants that already have a build are skipped, and
/// task names already present in a build are not created again.
#[derive(Clone)]
pub struct BuildAssembler {
    pub(crate) versions: Arc<dyn VersionRepository>,
    pub(crate) builds: Arc<dyn BuildRepository>,
    pub(crate) tasks: Arc<dyn TaskRepository>,
}

impl BuildAssembler {
    pub fn new(
        versions: Arc<dyn VersionRepository>,
        builds: Arc<dyn BuildRepository>,
        tasks: Arc<dyn TaskRepository>,
    ) -> Self {
        Self {
            versions,
            builds,
            tasks,
        }
    }

    /// Create a build for every variant of `pairs` that the version does
    /// not have yet, and append it to the version. Returns the new build
    /// ids in the order created.
    pub async fn create_missing_builds(
        &self,
        patch: &Patch,
        version_id: &VersionId,
        project: &Project,
        pairs: &PairSet,
    ) -> Result<Vec<BuildId>> {
        let mut version = self.load_version(version_id).await?;
        let table = self.table_for(&version, project, pairs).await?;
        let mut created = Vec::new();

        for variant in pairs.variants() {
            if version.build_for_variant(&variant).is_some() {
                debug!(version_id = %version.id, variant = %variant, "Build already exists");
                continue;
            }
            let names = pairs.task_names(&variant);
            let status = self
                .build_for_missing_variant(&version, project, &table, &variant, patch.activated, &names)
                .await
                .map_err(|e| Error::BuildCreation {
                    variant: variant.clone(),
                    source: Box::new(e),
                })?;

            created.push(status.build_id.clone());
            version.push_build(status);
        }

        if !created.is_empty() {
            info!(
                version_id = %version.id,
                count = created.len(),
                "Created builds for new variants"
            );
        }
        Ok(created)
    }

    /// For every build of the version, create the requested task names it
    /// does not contain yet. Returns the ids of the tasks created.
    pub async fn create_missing_tasks(
        &self,
        _patch: &Patch,
        version_id: &VersionId,
        project: &Project,
        pairs: &PairSet,
    ) -> Result<Vec<TaskId>> {
        let version = self.load_version(version_id).await?;
        let table = self.table_for(&version, project, pairs).await?;
        let builds = self.builds.find_by_ids(&version.build_ids).await?;
        let mut created = Vec::new();

        for build in &builds {
            let names = pairs.task_names(&build.variant);
            if names.is_empty() {
                continue;
            }
            created.extend(
                self.add_tasks_to_build(build, project, &version, &table, &names)
                    .await?,
            );
        }
        Ok(created)
    }

    /// Create one build for `variant` holding the requested task names the
    /// variant declares, in declaration order, together with its tasks.
    pub async fn create_build_from_version(
        &self,
        project: &Project,
        version: &Version,
        table: &TaskIdTable,
        variant: &str,
        activated: bool,
        task_names: &[String],
    ) -> Result<Build> {
        let bv = project
            .find_variant(variant)
            .ok_or_else(|| Error::UnknownVariant(variant.to_string()))?;
        let id = BuildId::derive(&version.id, variant);
        let tasks = self.make_tasks(project, version, table, &id, bv, task_names, activated)?;

        let build = Build {
            id,
            version_id: version.id.clone(),
            project: version.identifier.clone(),
            variant: bv.name.clone(),
            display_name: bv.display_name().to_string(),
            revision: version.revision.clone(),
            requester: version.requester,
            activated,
            status: BuildState::Created,
            task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
            create_time: Utc::now(),
        };

        self.builds.insert(&build).await?;
        self.tasks.insert_many(&tasks).await?;

        info!(
            build_id = %build.id,
            variant = %variant,
            tasks = tasks.len(),
            "Created build"
        );
        Ok(build)
    }

    /// Create the tasks in `task_names` that `build` does not have yet.
    ///
    /// Requested tasks whose rows exist but which the build does not list
    /// yet, as left by an interrupted attempt, are listed too.
    pub async fn add_tasks_to_build(
        &self,
        build: &Build,
        project: &Project,
        version: &Version,
        table: &TaskIdTable,
        task_names: &[String],
    ) -> Result<Vec<TaskId>> {
        let bv = project
            .find_variant(&build.variant)
            .ok_or_else(|| Error::UnknownVariant(build.variant.clone()))?;

        let existing: HashMap<String, TaskId> = self
            .tasks
            .find_by_build(&build.id)
            .await?
            .into_iter()
            .map(|t| (t.display_name, t.id))
            .collect();
        let missing: Vec<String> = task_names
            .iter()
            .filter(|name| !existing.contains_key(*name))
            .cloned()
            .collect();

        let tasks = self.make_tasks(project, version, table, &build.id, bv, &missing, build.activated)?;
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
        let unlisted: Vec<TaskId> = task_names
            .iter()
            .filter_map(|name| existing.get(name))
            .chain(ids.iter())
            .filter(|id| !build.task_ids.contains(id))
            .cloned()
            .collect();
        if tasks.is_empty() && unlisted.is_empty() {
            return Ok(Vec::new());
        }

        let wrap = |e: Error| Error::TaskCreation {
            build_id: build.id.to_string(),
            tasks: tasks.iter().map(|t| t.display_name.clone()).collect(),
            source: Box::new(e),
        };

        if !tasks.is_empty() {
            self.tasks.insert_many(&tasks).await.map_err(wrap)?;
        }
        if !unlisted.is_empty() {
            self.builds
                .append_tasks(&build.id, &unlisted)
                .await
                .map_err(wrap)?;
        }

        if !ids.is_empty() {
            info!(build_id = %build.id, count = ids.len(), "Added tasks to build");
        }
        Ok(ids)
    }

    /// The build for `variant` under `version`, created when missing. A
    /// build left by an interrupted attempt gets whichever requested tasks
    /// it lacks.
    pub async fn ensure_build(
        &self,
        project: &Project,
        version: &Version,
        table: &TaskIdTable,
        variant: &str,
        activated: bool,
        task_names: &[String],
    ) -> Result<Build> {
        let id = BuildId::derive(&version.id, variant);
        match self.builds.get(&id).await? {
            Some(build) => {
                debug!(build_id = %id, "Completing build from an interrupted attempt");
                self.add_tasks_to_build(&build, project, version, table, task_names)
                    .await?;
                Ok(build)
            }
            None => {
                self.create_build_from_version(project, version, table, variant, activated, task_names)
                    .await
            }
        }
    }

    /// Build records for a variant, one task per requested name that the
    /// variant declares. Dependencies resolve through `table` only.
    #[allow(clippy::too_many_arguments)]
    fn make_tasks(
        &self,
        project: &Project,
        version: &Version,
        table: &TaskIdTable,
        build_id: &BuildId,
        bv: &BuildVariant,
        task_names: &[String],
        activated: bool,
    ) -> Result<Vec<Task>> {
        let wanted: HashSet<&str> = task_names.iter().map(String::as_str).collect();
        let now = Utc::now();
        let mut tasks = Vec::new();

        for unit in bv.tasks.iter().filter(|t| wanted.contains(t.name.as_str())) {
            let pair = Pair::new(&bv.name, &unit.name);
            let id = table
                .get_pair(&pair)
                .cloned()
                .unwrap_or_else(|| TaskId::derive(&version.id, &bv.name, &unit.name));

            let mut depends_on = Vec::new();
            for dep in project.dependencies_of(&pair)? {
                match table.get_pair(&dep) {
                    Some(dep_id) if *dep_id != id && !depends_on.contains(dep_id) => {
                        depends_on.push(dep_id.clone())
                    }
                    _ => {}
                }
            }

            let distros = if unit.distros.is_empty() {
                bv.run_on.clone()
            } else {
                unit.distros.clone()
            };

            tasks.push(Task {
                id,
                build_id: build_id.clone(),
                version_id: version.id.clone(),
                project: version.identifier.clone(),
                variant: bv.name.clone(),
                display_name: unit.name.clone(),
                revision: version.revision.clone(),
                requester: version.requester,
                depends_on,
                distros,
                status: TaskStatus::Undispatched,
                activated,
                aborted: false,
                create_time: now,
            });
        }
        Ok(tasks)
    }

    async fn build_for_missing_variant(
        &self,
        version: &Version,
        project: &Project,
        table: &TaskIdTable,
        variant: &str,
        activated: bool,
        task_names: &[String],
    ) -> Result<BuildStatus> {
        let build = self
            .ensure_build(project, version, table, variant, activated, task_names)
            .await?;

        let status = BuildStatus {
            variant: variant.to_string(),
            build_id: build.id,
            activated: build.activated,
        };
        self.versions
            .append_builds(&version.id, std::slice::from_ref(&status))
            .await?;
        Ok(status)
    }

    async fn load_version(&self, id: &VersionId) -> Result<Version> {
        self.versions
            .get(id)
            .await?
            .ok_or_else(|| Error::VersionNotFound(id.to_string()))
    }

    /// Table over `pairs` plus every task the version already has, so edges
    /// into earlier batches resolve to the ids those tasks were created with.
    async fn table_for(
        &self,
        version: &Version,
        project: &Project,
        pairs: &PairSet,
    ) -> Result<TaskIdTable> {
        let mut all = pairs.clone();
        for build in self.builds.find_by_ids(&version.build_ids).await? {
            for task in self.tasks.find_by_build(&build.id).await? {
                all.insert(Pair::new(task.variant, task.display_name));
            }
        }
        Ok(TaskIdTable::build(project, &version.id, &all))
    }
}
