//! Fleet hosts.

use crate::ids::{DistroId, HostId, TaskId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Owner recorded on hosts the fleet scheduler starts itself. Any other
/// `started_by` value is a user who spawned the host.
pub const SYSTEM_USER: &str = "kiln";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    /// DNS name, set once the machine is reachable.
    pub host: String,
    pub user: String,
    pub tag: String,
    pub distro: Distro,
    pub status: HostStatus,
    pub provisioned: bool,
    pub started_by: String,
    pub running_task: Option<TaskId>,
    pub last_task_completed: Option<TaskId>,
    pub last_task_completed_time: Option<DateTime<Utc>>,
    pub task_dispatch_time: Option<DateTime<Utc>>,
    pub last_communication_time: Option<DateTime<Utc>>,
    pub last_reachability_check: Option<DateTime<Utc>>,
    pub expiration_time: Option<DateTime<Utc>>,
    /// Expiration notices already sent, keyed by lead-time tag ("2h", ...).
    pub notifications: BTreeMap<String, bool>,
    pub secret: String,
    pub pid: Option<String>,
    pub quarantined: bool,
    pub creation_time: DateTime<Utc>,
    pub termination_time: Option<DateTime<Utc>>,
}

/// The capability class a host was provisioned from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Distro {
    pub id: DistroId,
    /// Name of the cloud provider that creates and destroys hosts of this
    /// distro.
    pub provider: String,
}

impl Host {
    /// A new, unprovisioned host owned by the fleet scheduler.
    pub fn new(id: impl Into<HostId>, distro: Distro) -> Self {
        Self {
            id: id.into(),
            host: String::new(),
            user: String::new(),
            tag: String::new(),
            distro,
            status: HostStatus::Uninitialized,
            provisioned: false,
            started_by: SYSTEM_USER.to_string(),
            running_task: None,
            last_task_completed: None,
            last_task_completed_time: None,
            task_dispatch_time: None,
            last_communication_time: None,
            last_reachability_check: None,
            expiration_time: None,
            notifications: BTreeMap::new(),
            secret: String::new(),
            pid: None,
            quarantined: false,
            creation_time: Utc::now(),
            termination_time: None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.status == HostStatus::Terminated
    }

    /// Started by a user rather than the fleet scheduler.
    pub fn is_spawned(&self) -> bool {
        self.started_by != SYSTEM_USER
    }

    pub fn is_running_task(&self) -> bool {
        self.running_task.is_some()
    }
}

/// Treats a missing timestamp and anything at or before the Unix epoch as
/// "never".
pub fn is_unset(t: Option<DateTime<Utc>>) -> bool {
    t.is_none_or(|t| t.timestamp() <= 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Uninitialized,
    Building,
    Starting,
    Provisioning,
    ProvisionFailed,
    Running,
    Decommissioned,
    Terminated,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Uninitialized => "uninitialized",
            HostStatus::Building => "building",
            HostStatus::Starting => "starting",
            HostStatus::Provisioning => "provisioning",
            HostStatus::ProvisionFailed => "provision_failed",
            HostStatus::Running => "running",
            HostStatus::Decommissioned => "decommissioned",
            HostStatus::Terminated => "terminated",
        }
    }

    /// Decode a stored status. Unknown values are an error rather than a
    /// fallback, so a damaged row cannot leave the terminated state.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "uninitialized" => Ok(HostStatus::Uninitialized),
            "building" => Ok(HostStatus::Building),
            "starting" => Ok(HostStatus::Starting),
            "provisioning" => Ok(HostStatus::Provisioning),
            "provision_failed" => Ok(HostStatus::ProvisionFailed),
            "running" => Ok(HostStatus::Running),
            "decommissioned" => Ok(HostStatus::Decommissioned),
            "terminated" => Ok(HostStatus::Terminated),
            other => Err(Error::Serialization(format!("unknown host status '{other}'"))),
        }
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
