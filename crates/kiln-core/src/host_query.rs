//! Host selection and mutation vocabulary shared by every host store.
//!
//! [`HostFilter`] is the library of fleet predicates. Each predicate is
//! defined once here as [`HostFilter::matches`]; the SQL adapter compiles the
//! same predicates to `WHERE` clauses and must agree with `matches`.
//!
//! [`HostUpdate`] is a partial document: only the fields that are set get
//! written. Paired with a [`HostGuard`] it forms one conditional update, the
//! only way host state is ever changed.

use crate::host::{Host, HostStatus, SYSTEM_USER, is_unset};
use crate::ids::{DistroId, HostId, TaskId};
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;

/// Heartbeats older than this are considered timed out.
pub const MAX_LCT_INTERVAL_MINUTES: i64 = 10;

pub fn max_lct_interval() -> Duration {
    Duration::minutes(MAX_LCT_INTERVAL_MINUTES)
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostFilter {
    Any,
    ById(HostId),
    ByDistro(DistroId),
    ByStatus(HostStatus),
    StatusNot(HostStatus),
    /// Running and started by the system.
    Active,
    /// Active with no task assigned.
    Idle,
    /// Running with a task assigned.
    RunningTask,
    /// Running, system-started, not running a task, and not checked for
    /// reachability since the given time.
    NotMonitoredSince(DateTime<Utc>),
    /// Running with a heartbeat that is unset or older than
    /// [`MAX_LCT_INTERVAL_MINUTES`] before the given time.
    TimedOutHeartbeat(DateTime<Utc>),
    /// Running and started by a user.
    RunningAndSpawned,
    /// Running, started by a user, and past its expiration time.
    ExpiredSpawned(DateTime<Utc>),
    /// Decommissioned with no task assigned.
    DecommissionedIdle,
    And(Vec<HostFilter>),
}

impl HostFilter {
    pub fn and(self, other: HostFilter) -> HostFilter {
        match self {
            HostFilter::And(mut all) => {
                all.push(other);
                HostFilter::And(all)
            }
            first => HostFilter::And(vec![first, other]),
        }
    }

    pub fn matches(&self, host: &Host) -> bool {
        let running = host.status == HostStatus::Running;
        match self {
            HostFilter::Any => true,
            HostFilter::ById(id) => host.id == *id,
            HostFilter::ByDistro(distro) => host.distro.id == *distro,
            HostFilter::ByStatus(status) => host.status == *status,
            HostFilter::StatusNot(status) => host.status != *status,
            HostFilter::Active => running && host.started_by == SYSTEM_USER,
            HostFilter::Idle => {
                running && host.started_by == SYSTEM_USER && host.running_task.is_none()
            }
            HostFilter::RunningTask => running && host.running_task.is_some(),
            HostFilter::NotMonitoredSince(since) => {
                running
                    && host.started_by == SYSTEM_USER
                    && host.running_task.is_none()
                    && (is_unset(host.last_reachability_check)
                        || host.last_reachability_check.is_some_and(|t| t <= *since))
            }
            HostFilter::TimedOutHeartbeat(now) => {
                let cutoff = *now - max_lct_interval();
                running
                    && (is_unset(host.last_communication_time)
                        || host.last_communication_time.is_some_and(|t| t <= cutoff))
            }
            HostFilter::RunningAndSpawned => running && host.started_by != SYSTEM_USER,
            HostFilter::ExpiredSpawned(now) => {
                running
                    && host.started_by != SYSTEM_USER
                    && host.expiration_time.is_some_and(|t| t <= *now)
            }
            HostFilter::DecommissionedIdle => {
                host.status == HostStatus::Decommissioned && host.running_task.is_none()
            }
            HostFilter::And(all) => all.iter().all(|f| f.matches(host)),
        }
    }
}

/// Precondition of a single-host conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum HostGuard {
    None,
    /// Status is not terminated.
    NotTerminated,
    /// DNS name is still empty.
    DnsUnset,
    /// Secret is still empty.
    NoSecret,
    /// The task slot holds exactly this value.
    RunningTask(Option<TaskId>),
}

impl HostGuard {
    pub fn holds(&self, host: &Host) -> bool {
        match self {
            HostGuard::None => true,
            HostGuard::NotTerminated => !host.is_terminated(),
            HostGuard::DnsUnset => host.host.is_empty(),
            HostGuard::NoSecret => host.secret.is_empty(),
            HostGuard::RunningTask(expected) => host.running_task == *expected,
        }
    }
}

/// Fields to write. `None` leaves a field untouched; for optional fields
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostUpdate {
    pub status: Option<HostStatus>,
    pub provisioned: Option<bool>,
    pub host: Option<String>,
    pub secret: Option<String>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub clear_notifications: bool,
    pub add_notification: Option<String>,
    pub running_task: Option<Option<TaskId>>,
    pub last_task_completed: Option<Option<TaskId>>,
    pub last_task_completed_time: Option<Option<DateTime<Utc>>>,
    pub task_dispatch_time: Option<Option<DateTime<Utc>>>,
    pub pid: Option<Option<String>>,
    pub last_communication_time: Option<Option<DateTime<Utc>>>,
    pub last_reachability_check: Option<DateTime<Utc>>,
    pub termination_time: Option<DateTime<Utc>>,
    pub quarantined: Option<bool>,
}

impl HostUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: HostStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn provisioned(mut self, provisioned: bool) -> Self {
        self.provisioned = Some(provisioned);
        self
    }

    pub fn host(mut self, name: impl Into<String>) -> Self {
        self.host = Some(name.into());
        self
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Sets the expiration time and drops every notice sent for the old one.
    pub fn expiration_time(mut self, t: DateTime<Utc>) -> Self {
        self.expiration_time = Some(t);
        self.clear_notifications = true;
        self
    }

    pub fn add_notification(mut self, tag: impl Into<String>) -> Self {
        self.add_notification = Some(tag.into());
        self
    }

    pub fn running_task(mut self, task: Option<TaskId>) -> Self {
        self.running_task = Some(task);
        self
    }

    pub fn last_task_completed(mut self, task: Option<TaskId>, at: Option<DateTime<Utc>>) -> Self {
        self.last_task_completed = Some(task);
        self.last_task_completed_time = Some(at);
        self
    }

    pub fn task_dispatch_time(mut self, t: Option<DateTime<Utc>>) -> Self {
        self.task_dispatch_time = Some(t);
        self
    }

    pub fn pid(mut self, pid: Option<String>) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn last_communication_time(mut self, t: Option<DateTime<Utc>>) -> Self {
        self.last_communication_time = Some(t);
        self
    }

    pub fn last_reachability_check(mut self, t: DateTime<Utc>) -> Self {
        self.last_reachability_check = Some(t);
        self
    }

    pub fn termination_time(mut self, t: DateTime<Utc>) -> Self {
        self.termination_time = Some(t);
        self
    }

    pub fn quarantined(mut self, quarantined: bool) -> Self {
        self.quarantined = Some(quarantined);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == HostUpdate::default()
    }

    /// Apply to an in-memory copy, exactly as a store applies it to the
    /// stored document.
    pub fn apply(&self, h: &mut Host) {
        if let Some(status) = self.status {
            h.status = status;
        }
        if let Some(provisioned) = self.provisioned {
            h.provisioned = provisioned;
        }
        if let Some(name) = &self.host {
            h.host = name.clone();
        }
        if let Some(secret) = &self.secret {
            h.secret = secret.clone();
        }
        if let Some(t) = self.expiration_time {
            h.expiration_time = Some(t);
        }
        if self.clear_notifications {
            h.notifications.clear();
        }
        if let Some(tag) = &self.add_notification {
            h.notifications.insert(tag.clone(), true);
        }
        if let Some(task) = &self.running_task {
            h.running_task = task.clone();
        }
        if let Some(task) = &self.last_task_completed {
            h.last_task_completed = task.clone();
        }
        if let Some(t) = self.last_task_completed_time {
            h.last_task_completed_time = t;
        }
        if let Some(t) = self.task_dispatch_time {
            h.task_dispatch_time = t;
        }
        if let Some(pid) = &self.pid {
            h.pid = pid.clone();
        }
        if let Some(t) = self.last_communication_time {
            h.last_communication_time = t;
        }
        if let Some(t) = self.last_reachability_check {
            h.last_reachability_check = Some(t);
        }
        if let Some(t) = self.termination_time {
            h.termination_time = Some(t);
        }
        if let Some(q) = self.quarantined {
            h.quarantined = q;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSortKey {
    Id,
    Tag,
    Status,
    CreationTime,
    ExpirationTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Fields that can be left out of query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostField {
    Host,
    Secret,
    Notifications,
    Pid,
    User,
}

impl HostField {
    pub fn clear(&self, h: &mut Host) {
        match self {
            HostField::Host => h.host.clear(),
            HostField::Secret => h.secret.clear(),
            HostField::Notifications => h.notifications.clear(),
            HostField::Pid => h.pid = None,
            HostField::User => h.user.clear(),
        }
    }
}

/// A filter plus projection, sort, skip and limit.
#[derive(Debug, Clone, PartialEq)]
pub struct HostQuery {
    pub filter: HostFilter,
    pub sort: Vec<(HostSortKey, SortOrder)>,
    pub skip: u64,
    pub limit: Option<u64>,
    pub without: Vec<HostField>,
}

impl HostQuery {
    pub fn new(filter: HostFilter) -> Self {
        Self {
            filter,
            sort: Vec::new(),
            skip: 0,
            limit: None,
            without: Vec::new(),
        }
    }

    pub fn sort(mut self, key: HostSortKey) -> Self {
        self.sort.push((key, SortOrder::Ascending));
        self
    }

    pub fn sort_desc(mut self, key: HostSortKey) -> Self {
        self.sort.push((key, SortOrder::Descending));
        self
    }

    pub fn skip(mut self, n: u64) -> Self {
        self.skip = n;
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn without_fields(mut self, fields: &[HostField]) -> Self {
        self.without.extend_from_slice(fields);
        self
    }

    fn compare(&self, a: &Host, b: &Host) -> Ordering {
        for (key, order) in &self.sort {
            let ord = match key {
                HostSortKey::Id => a.id.cmp(&b.id),
                HostSortKey::Tag => a.tag.cmp(&b.tag),
                HostSortKey::Status => a.status.as_str().cmp(b.status.as_str()),
                HostSortKey::CreationTime => a.creation_time.cmp(&b.creation_time),
                HostSortKey::ExpirationTime => a.expiration_time.cmp(&b.expiration_time),
            };
            let ord = match order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Evaluate against an in-memory collection.
    pub fn run<'a>(&self, hosts: impl IntoIterator<Item = &'a Host>) -> Vec<Host> {
        let mut found: Vec<Host> = hosts
            .into_iter()
            .filter(|h| self.filter.matches(h))
            .cloned()
            .collect();
        found.sort_by(|a, b| self.compare(a, b));
        let limit = self.limit.map_or(usize::MAX, |n| n as usize);
        found
            .into_iter()
            .skip(self.skip as usize)
            .take(limit)
            .map(|mut h| {
                self.project(&mut h);
                h
            })
            .collect()
    }

    /// Blank the excluded fields.
    pub fn project(&self, h: &mut Host) {
        for field in &self.without {
            field.clear(h);
        }
    }
}

impl From<HostFilter> for HostQuery {
    fn from(filter: HostFilter) -> Self {
        HostQuery::new(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Distro;

    fn running(id: &str) -> Host {
        let mut h = Host::new(id, Distro::default());
        h.status = HostStatus::Running;
        h
    }

    #[test]
    fn test_idle_implies_active() {
        let mut h = running("h1");
        assert!(HostFilter::Active.matches(&h));
        assert!(HostFilter::Idle.matches(&h));

        h.running_task = Some(TaskId::new("t1"));
        assert!(HostFilter::Active.matches(&h));
        assert!(!HostFilter::Idle.matches(&h));
        assert!(HostFilter::RunningTask.matches(&h));
    }

    #[test]
    fn test_spawned_hosts_are_not_active() {
        let mut h = running("h1");
        h.started_by = "alice".to_string();
        assert!(!HostFilter::Active.matches(&h));
        assert!(HostFilter::RunningAndSpawned.matches(&h));
    }

    #[test]
    fn test_timed_out_heartbeat() {
        let now = Utc::now();
        let mut h = running("h1");
        assert!(HostFilter::TimedOutHeartbeat(now).matches(&h));

        h.last_communication_time = Some(now - Duration::minutes(20));
        assert!(HostFilter::TimedOutHeartbeat(now).matches(&h));

        h.last_communication_time = Some(now + Duration::minutes(5));
        assert!(!HostFilter::TimedOutHeartbeat(now).matches(&h));

        h.last_communication_time = None;
        h.status = HostStatus::Terminated;
        assert!(!HostFilter::TimedOutHeartbeat(now).matches(&h));
    }

    #[test]
    fn test_update_sets_expiration_and_clears_notices() {
        let mut h = running("h1");
        h.notifications.insert("2h".to_string(), true);
        let t = Utc::now();
        HostUpdate::new().expiration_time(t).apply(&mut h);
        assert_eq!(h.expiration_time, Some(t));
        assert!(h.notifications.is_empty());
    }

    #[test]
    fn test_guard_on_running_task() {
        let mut h = running("h1");
        assert!(HostGuard::RunningTask(None).holds(&h));
        h.running_task = Some(TaskId::new("t1"));
        assert!(HostGuard::RunningTask(Some(TaskId::new("t1"))).holds(&h));
        assert!(!HostGuard::RunningTask(Some(TaskId::new("t2"))).holds(&h));
    }

    #[test]
    fn test_query_sort_skip_limit_projection() {
        let mut hosts = Vec::new();
        for (id, tag) in [("a", "2"), ("b", "1"), ("c", "3")] {
            let mut h = running(id);
            h.tag = tag.to_string();
            h.host = format!("{id}.example.com");
            hosts.push(h);
        }

        let found = HostQuery::new(HostFilter::Any)
            .sort(HostSortKey::Tag)
            .skip(1)
            .limit(1)
            .without_fields(&[HostField::Host])
            .run(&hosts);

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, HostId::new("a"));
        assert!(found[0].host.is_empty());
    }
}
