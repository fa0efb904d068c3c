//! Patches and the project references they target.

use crate::ids::{PatchId, VersionId};
use crate::pair::{PairSet, VariantTasks};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub id: PatchId,
    pub description: String,
    /// Identifier of the target project.
    pub project: String,
    pub githash: String,
    pub author: String,
    pub variants_tasks: Vec<VariantTasks>,
    pub patches: Vec<ModulePatch>,
    /// Project YAML with the patch applied.
    pub patched_config: String,
    pub activated: bool,
    pub version: Option<VersionId>,
    pub status: PatchStatus,
    pub create_time: DateTime<Utc>,
}

impl Patch {
    /// Requested pairs, flattened.
    pub fn pairs(&self) -> PairSet {
        PairSet::from_variant_tasks(&self.variants_tasks)
    }
}

/// A diff against the project repository (empty `module_name`) or one of
/// its modules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulePatch {
    #[serde(default)]
    pub module_name: String,
    pub githash: String,
    pub diff: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStatus {
    Created,
    Started,
    Success,
    Failed,
}

impl PatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchStatus::Created => "created",
            PatchStatus::Started => "started",
            PatchStatus::Success => "success",
            PatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "started" => PatchStatus::Started,
            "success" => PatchStatus::Success,
            "failed" => PatchStatus::Failed,
            _ => PatchStatus::Created,
        }
    }
}

/// Repository coordinates of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub identifier: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// Path of the project config inside the repository.
    pub remote_path: String,
    pub enabled: bool,
}

/// Commit metadata returned by the source-control provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub revision: String,
    pub author: String,
    pub author_email: String,
    pub message: String,
}
