//! Tasks as created by the build assembler.

use crate::ids::{BuildId, TaskId, VersionId};
use crate::version::Requester;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub build_id: BuildId,
    pub version_id: VersionId,
    pub project: String,
    pub variant: String,
    pub display_name: String,
    pub revision: String,
    pub requester: Requester,
    /// Ids of tasks that must finish first. Every entry is either a
    /// persisted task or an id from the same task-id table.
    pub depends_on: Vec<TaskId>,
    pub distros: Vec<String>,
    pub status: TaskStatus,
    pub activated: bool,
    pub aborted: bool,
    pub create_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Undispatched,
    Dispatched,
    Started,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, TaskStatus::Dispatched | TaskStatus::Started)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Undispatched => "undispatched",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Started => "started",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "dispatched" => TaskStatus::Dispatched,
            "started" => TaskStatus::Started,
            "success" => TaskStatus::Success,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Undispatched,
        }
    }
}
