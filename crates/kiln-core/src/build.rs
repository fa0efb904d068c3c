//! Builds: the tasks of one build variant within a version.

use crate::ids::{BuildId, TaskId, VersionId};
use crate::version::Requester;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub version_id: VersionId,
    pub project: String,
    pub variant: String,
    pub display_name: String,
    pub revision: String,
    pub requester: Requester,
    pub activated: bool,
    pub status: BuildState,
    pub task_ids: Vec<TaskId>,
    pub create_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Created,
    Started,
    Success,
    Failed,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Created => "created",
            BuildState::Started => "started",
            BuildState::Success => "success",
            BuildState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "started" => BuildState::Started,
            "success" => BuildState::Success,
            "failed" => BuildState::Failed,
            _ => BuildState::Created,
        }
    }
}
