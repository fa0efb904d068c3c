//! Error types for Kiln.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("Invalid project definition: {0}")]
    InvalidProject(String),

    #[error("Unknown build variant: {0}")]
    UnknownVariant(String),

    #[error("Task '{task}' is not defined for build variant '{variant}'")]
    UnknownTask { variant: String, task: String },

    #[error("Dependency cycle detected at {variant}/{task}")]
    DependencyCycle { variant: String, task: String },

    #[error("Project ref not found: {0}")]
    ProjectRefNotFound(String),

    #[error("No patch on project")]
    NoPatchForProject,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Lookup errors
    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Version not found: {0}")]
    VersionNotFound(String),

    #[error("Build not found: {0}")]
    BuildNotFound(String),

    #[error("Patch not found: {0}")]
    PatchNotFound(String),

    // Conflict errors
    #[error("Host {host_id} is terminated; cannot set status to '{requested}'")]
    HostTerminated { host_id: String, requested: String },

    #[error("Host {host_id} is running '{actual}', expected '{expected}'")]
    RunningTaskMismatch {
        host_id: String,
        expected: String,
        actual: String,
    },

    #[error("Host {host_id} is already running task '{running}'")]
    RunningTaskOccupied { host_id: String, running: String },

    #[error("Task id must not be empty (host {0})")]
    EmptyTaskId(String),

    // Partial batch errors
    #[error("Failed to create build for variant '{variant}': {source}")]
    BuildCreation {
        variant: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to add tasks {tasks:?} to build '{build_id}': {source}")]
    TaskCreation {
        build_id: String,
        tasks: Vec<String>,
        #[source]
        source: Box<Error>,
    },

    // Collaborator errors
    #[error("Couldn't fetch commit information: commit {revision} doesn't exist")]
    CommitNotFound { revision: String },

    #[error("Couldn't fetch commit information: {0}")]
    CommitFetch(String),

    #[error("Could not patch project config: {0}")]
    ConfigPatch(String),

    #[error("Cloud provider error: {0}")]
    Provider(String),

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when a guarded write lost to a concurrent writer or hit an
    /// absorbing state. Callers may reread and decide whether to retry.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::HostTerminated { .. }
                | Error::RunningTaskMismatch { .. }
                | Error::RunningTaskOccupied { .. }
        )
    }

    /// True for malformed project graphs and unresolvable patch targets.
    /// These are never worth retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidProject(_)
                | Error::UnknownVariant(_)
                | Error::UnknownTask { .. }
                | Error::DependencyCycle { .. }
                | Error::ProjectRefNotFound(_)
                | Error::NoPatchForProject
                | Error::InvalidConfig(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::InvalidProject(err.to_string())
    }
}
