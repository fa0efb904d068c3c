//! Versions: one materialized snapshot of a project at a revision.

use crate::ids::{BuildId, VersionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub create_time: DateTime<Utc>,
    /// Project identifier.
    pub identifier: String,
    pub revision: String,
    pub author: String,
    pub author_email: String,
    pub message: String,
    /// Serialized project config the builds were created from.
    pub config: String,
    pub status: VersionStatus,
    pub requester: Requester,
    pub activated: bool,
    /// Append-only; parallel to `build_variants`.
    pub build_ids: Vec<BuildId>,
    pub build_variants: Vec<BuildStatus>,
}

impl Version {
    pub fn build_for_variant(&self, variant: &str) -> Option<&BuildId> {
        self.build_variants
            .iter()
            .find(|bs| bs.variant == variant)
            .map(|bs| &bs.build_id)
    }

    /// Record a newly created build in memory, keeping both lists aligned.
    pub fn push_build(&mut self, status: BuildStatus) {
        self.build_ids.push(status.build_id.clone());
        self.build_variants.push(status);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub variant: String,
    pub build_id: BuildId,
    pub activated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Created,
    Started,
    Success,
    Failed,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Created => "created",
            VersionStatus::Started => "started",
            VersionStatus::Success => "success",
            VersionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "started" => VersionStatus::Started,
            "success" => VersionStatus::Success,
            "failed" => VersionStatus::Failed,
            _ => VersionStatus::Created,
        }
    }
}

/// What caused a version (and everything under it) to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requester {
    Patch,
    Mainline,
    Trigger,
}

impl Requester {
    pub fn as_str(&self) -> &'static str {
        match self {
            Requester::Patch => "patch",
            Requester::Mainline => "mainline",
            Requester::Trigger => "trigger",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "patch" => Requester::Patch,
            "trigger" => Requester::Trigger,
            _ => Requester::Mainline,
        }
    }
}
