//! Claiming and releasing a host's task slot.

use chrono::{DateTime, Utc};
use kiln_core::host::Host;
use kiln_core::host_query::{HostGuard, HostUpdate};
use kiln_core::ids::TaskId;
use kiln_core::ports::HostRepository;
use kiln_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Binds tasks to hosts. A host runs at most one task; every change to the
/// slot is guarded on the value the caller expects it to hold.
#[derive(Clone)]
pub struct TaskAssigner {
    hosts: Arc<dyn HostRepository>,
}

impl TaskAssigner {
    pub fn new(hosts: Arc<dyn HostRepository>) -> Self {
        Self { hosts }
    }

    /// Put `task` on an idle host.
    pub async fn claim_running_task(
        &self,
        host: &mut Host,
        task: &TaskId,
        dispatched_at: DateTime<Utc>,
    ) -> Result<()> {
        if task.is_empty() {
            return Err(Error::EmptyTaskId(host.id.to_string()));
        }
        let update = HostUpdate::new()
            .running_task(Some(task.clone()))
            .task_dispatch_time(Some(dispatched_at));
        self.swap(host, None, update).await?;
        debug!(host_id = %host.id, task_id = %task, "Claimed host");
        Ok(())
    }

    /// Replace the finished task `old` with `new` in one step.
    pub async fn update_running_task(
        &self,
        host: &mut Host,
        old: &TaskId,
        new: &TaskId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if new.is_empty() {
            return Err(Error::EmptyTaskId(host.id.to_string()));
        }
        let update = HostUpdate::new()
            .running_task(Some(new.clone()))
            .task_dispatch_time(Some(at))
            .last_task_completed(Some(old.clone()), Some(at));
        self.swap(host, Some(old), update).await?;
        debug!(host_id = %host.id, old = %old, new = %new, "Swapped running task");
        Ok(())
    }

    /// Release the slot held by `prev` and record it as the last completed
    /// task.
    pub async fn clear_running_task(
        &self,
        host: &mut Host,
        prev: &TaskId,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        if prev.is_empty() {
            return Err(Error::EmptyTaskId(host.id.to_string()));
        }
        let update = HostUpdate::new()
            .running_task(None)
            .pid(None)
            .task_dispatch_time(None)
            .last_task_completed(Some(prev.clone()), Some(finished_at));
        self.swap(host, Some(prev), update).await?;
        debug!(host_id = %host.id, task_id = %prev, "Cleared running task");
        Ok(())
    }

    async fn swap(&self, host: &mut Host, expected: Option<&TaskId>, update: HostUpdate) -> Result<()> {
        let guard = HostGuard::RunningTask(expected.cloned());
        if self.hosts.update_one(&host.id, &guard, &update).await? {
            update.apply(host);
            return Ok(());
        }

        let stored = self
            .hosts
            .get(&host.id)
            .await?
            .ok_or_else(|| Error::HostNotFound(host.id.to_string()))?;
        host.running_task = stored.running_task.clone();
        warn!(
            host_id = %host.id,
            expected = ?expected,
            actual = ?stored.running_task,
            "Task slot changed underneath"
        );

        let actual = stored
            .running_task
            .map(|t| t.to_string())
            .unwrap_or_default();
        Err(match expected {
            None => Error::RunningTaskOccupied {
                host_id: host.id.to_string(),
                running: actual,
            },
            Some(expected) => Error::RunningTaskMismatch {
                host_id: host.id.to_string(),
                expected: expected.to_string(),
                actual,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::host::{Distro, HostStatus};
    use kiln_core::host_query::HostFilter;
    use kiln_db::memory::MemoryHostRepository;

    async fn setup() -> (Arc<MemoryHostRepository>, TaskAssigner, Host) {
        let repo = Arc::new(MemoryHostRepository::new());
        let mut host = Host::new("h1", Distro::default());
        host.status = HostStatus::Running;
        repo.insert(&host).await.unwrap();
        (repo.clone(), TaskAssigner::new(repo), host)
    }

    #[tokio::test]
    async fn test_claim_then_clear() {
        let (repo, assigner, mut host) = setup().await;
        let task = TaskId::new("t1");
        let now = Utc::now();

        assigner.claim_running_task(&mut host, &task, now).await.unwrap();
        assert_eq!(repo.count(&HostFilter::Idle).await.unwrap(), 0);
        let active = repo.count(&HostFilter::Active).await.unwrap();

        assigner.clear_running_task(&mut host, &task, now).await.unwrap();
        let stored = repo.get(&host.id).await.unwrap().unwrap();
        assert!(stored.running_task.is_none());
        assert!(stored.pid.is_none());
        assert!(stored.task_dispatch_time.is_none());
        assert_eq!(stored.last_task_completed, Some(task));
        assert_eq!(stored.last_task_completed_time, Some(now));
        assert_eq!(repo.count(&HostFilter::Idle).await.unwrap(), 1);
        assert_eq!(repo.count(&HostFilter::Active).await.unwrap(), active);
    }

    #[tokio::test]
    async fn test_second_claim_loses() {
        let (_repo, assigner, host) = setup().await;
        let mut a = host.clone();
        let mut b = host;

        assigner
            .claim_running_task(&mut a, &TaskId::new("t1"), Utc::now())
            .await
            .unwrap();
        let err = assigner
            .claim_running_task(&mut b, &TaskId::new("t2"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RunningTaskOccupied { .. }));
        assert_eq!(b.running_task, Some(TaskId::new("t1")));
    }

    #[tokio::test]
    async fn test_clear_with_wrong_task_is_rejected() {
        let (repo, assigner, mut host) = setup().await;
        assigner
            .claim_running_task(&mut host, &TaskId::new("t1"), Utc::now())
            .await
            .unwrap();

        let err = assigner
            .clear_running_task(&mut host, &TaskId::new("t2"), Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        let stored = repo.get(&host.id).await.unwrap().unwrap();
        assert_eq!(stored.running_task, Some(TaskId::new("t1")));
    }

    #[tokio::test]
    async fn test_update_running_task() {
        let (repo, assigner, mut host) = setup().await;
        let old = TaskId::new("t1");
        assigner
            .claim_running_task(&mut host, &old, Utc::now())
            .await
            .unwrap();

        let err = assigner
            .update_running_task(&mut host, &old, &TaskId::new(""), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyTaskId(_)));

        assigner
            .update_running_task(&mut host, &old, &TaskId::new("t2"), Utc::now())
            .await
            .unwrap();
        let stored = repo.get(&host.id).await.unwrap().unwrap();
        assert_eq!(stored.running_task, Some(TaskId::new("t2")));
        assert_eq!(stored.last_task_completed, Some(old));
    }
}
