//! PostgreSQL implementation of HostRepository.
//!
//! Host predicates and partial updates are compiled into a single
//! statement each, so every guarded transition is one atomic `UPDATE`.

use async_trait::async_trait;
use kiln_core::host::{Distro, Host, HostStatus, SYSTEM_USER};
use kiln_core::host_query::{
    HostFilter, HostGuard, HostQuery, HostSortKey, HostUpdate, SortOrder, max_lct_interval,
};
use kiln_core::ids::{DistroId, HostId, TaskId};
use kiln_core::ports::HostRepository;
use kiln_core::{Error, Result};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::BTreeMap;

const COLUMNS: &str = "id, host, username, tag, distro_id, provider, status, provisioned, started_by, running_task, last_task_completed, last_task_completed_time, task_dispatch_time, last_communication_time, last_reachability_check, expiration_time, notifications, secret, pid, quarantined, creation_time, termination_time";

/// PostgreSQL implementation of HostRepository.
#[derive(Clone)]
pub struct PgHostRepository {
    pool: PgPool,
}

impl PgHostRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_host(r: &sqlx::postgres::PgRow) -> Result<Host> {
        let notifications: BTreeMap<String, bool> =
            serde_json::from_value(r.get("notifications"))
                .map_err(|e| Error::Serialization(e.to_string()))?;
        let status: String = r.get("status");
        Ok(Host {
            id: HostId::new(r.get::<String, _>("id")),
            host: r.get("host"),
            user: r.get("username"),
            tag: r.get("tag"),
            distro: Distro {
                id: DistroId::new(r.get::<String, _>("distro_id")),
                provider: r.get("provider"),
            },
            status: HostStatus::parse(&status)?,
            provisioned: r.get("provisioned"),
            started_by: r.get("started_by"),
            running_task: r.get::<Option<String>, _>("running_task").map(TaskId::new),
            last_task_completed: r
                .get::<Option<String>, _>("last_task_completed")
                .map(TaskId::new),
            last_task_completed_time: r.get("last_task_completed_time"),
            task_dispatch_time: r.get("task_dispatch_time"),
            last_communication_time: r.get("last_communication_time"),
            last_reachability_check: r.get("last_reachability_check"),
            expiration_time: r.get("expiration_time"),
            notifications,
            secret: r.get("secret"),
            pid: r.get("pid"),
            quarantined: r.get("quarantined"),
            creation_time: r.get("creation_time"),
            termination_time: r.get("termination_time"),
        })
    }

    fn notifications_json(host: &Host) -> Result<serde_json::Value> {
        serde_json::to_value(&host.notifications).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn push_values<'a>(qb: &mut QueryBuilder<'a, Postgres>, host: &'a Host) -> Result<()> {
        let notifications = Self::notifications_json(host)?;
        let mut values = qb.separated(", ");
        values
            .push_bind(host.id.as_str())
            .push_bind(&host.host)
            .push_bind(&host.user)
            .push_bind(&host.tag)
            .push_bind(host.distro.id.as_str())
            .push_bind(&host.distro.provider)
            .push_bind(host.status.as_str())
            .push_bind(host.provisioned)
            .push_bind(&host.started_by)
            .push_bind(host.running_task.as_ref().map(|t| t.as_str()))
            .push_bind(host.last_task_completed.as_ref().map(|t| t.as_str()))
            .push_bind(host.last_task_completed_time)
            .push_bind(host.task_dispatch_time)
            .push_bind(host.last_communication_time)
            .push_bind(host.last_reachability_check)
            .push_bind(host.expiration_time)
            .push_bind(notifications)
            .push_bind(&host.secret)
            .push_bind(host.pid.as_deref())
            .push_bind(host.quarantined)
            .push_bind(host.creation_time)
            .push_bind(host.termination_time);
        Ok(())
    }
}

/// Compile a host predicate to SQL. Must agree with `HostFilter::matches`.
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &HostFilter) {
    match filter {
        HostFilter::Any => {
            qb.push("TRUE");
        }
        HostFilter::ById(id) => {
            qb.push("id = ").push_bind(id.as_str().to_string());
        }
        HostFilter::ByDistro(distro) => {
            qb.push("distro_id = ").push_bind(distro.as_str().to_string());
        }
        HostFilter::ByStatus(status) => {
            qb.push("status = ").push_bind(status.as_str());
        }
        HostFilter::StatusNot(status) => {
            qb.push("status <> ").push_bind(status.as_str());
        }
        HostFilter::Active => {
            qb.push("status = 'running' AND started_by = ")
                .push_bind(SYSTEM_USER);
        }
        HostFilter::Idle => {
            qb.push("status = 'running' AND running_task IS NULL AND started_by = ")
                .push_bind(SYSTEM_USER);
        }
        HostFilter::RunningTask => {
            qb.push("status = 'running' AND running_task IS NOT NULL");
        }
        HostFilter::NotMonitoredSince(since) => {
            qb.push("status = 'running' AND running_task IS NULL AND started_by = ")
                .push_bind(SYSTEM_USER)
                .push(" AND (last_reachability_check IS NULL OR last_reachability_check <= to_timestamp(0) OR last_reachability_check <= ")
                .push_bind(*since)
                .push(")");
        }
        HostFilter::TimedOutHeartbeat(now) => {
            qb.push("status = 'running' AND (last_communication_time IS NULL OR last_communication_time <= to_timestamp(0) OR last_communication_time <= ")
                .push_bind(*now - max_lct_interval())
                .push(")");
        }
        HostFilter::RunningAndSpawned => {
            qb.push("status = 'running' AND started_by <> ")
                .push_bind(SYSTEM_USER);
        }
        HostFilter::ExpiredSpawned(now) => {
            qb.push("status = 'running' AND started_by <> ")
                .push_bind(SYSTEM_USER)
                .push(" AND expiration_time <= ")
                .push_bind(*now);
        }
        HostFilter::DecommissionedIdle => {
            qb.push("status = 'decommissioned' AND running_task IS NULL");
        }
        HostFilter::And(all) => {
            if all.is_empty() {
                qb.push("TRUE");
            }
            for (i, f) in all.iter().enumerate() {
                if i > 0 {
                    qb.push(" AND ");
                }
                qb.push("(");
                push_filter(qb, f);
                qb.push(")");
            }
        }
    }
}

fn push_guard(qb: &mut QueryBuilder<'_, Postgres>, guard: &HostGuard) {
    match guard {
        HostGuard::None => {}
        HostGuard::NotTerminated => {
            qb.push(" AND status <> 'terminated'");
        }
        HostGuard::DnsUnset => {
            qb.push(" AND host = ''");
        }
        HostGuard::NoSecret => {
            qb.push(" AND secret = ''");
        }
        HostGuard::RunningTask(None) => {
            qb.push(" AND running_task IS NULL");
        }
        HostGuard::RunningTask(Some(task)) => {
            qb.push(" AND running_task = ")
                .push_bind(task.as_str().to_string());
        }
    }
}

/// Compile a partial update to a `SET` list.
fn push_update(qb: &mut QueryBuilder<'_, Postgres>, u: &HostUpdate) {
    let mut set = qb.separated(", ");
    // keeps the list non-empty
    set.push("id = id");
    if let Some(status) = u.status {
        set.push("status = ").push_bind_unseparated(status.as_str());
    }
    if let Some(provisioned) = u.provisioned {
        set.push("provisioned = ").push_bind_unseparated(provisioned);
    }
    if let Some(name) = &u.host {
        set.push("host = ").push_bind_unseparated(name.clone());
    }
    if let Some(secret) = &u.secret {
        set.push("secret = ").push_bind_unseparated(secret.clone());
    }
    if let Some(t) = u.expiration_time {
        set.push("expiration_time = ").push_bind_unseparated(t);
    }
    match (&u.add_notification, u.clear_notifications) {
        (Some(tag), clear) => {
            let base = if clear {
                "'{}'::jsonb"
            } else {
                "notifications"
            };
            set.push(format!("notifications = {base} || jsonb_build_object("))
                .push_bind_unseparated(tag.clone())
                .push_unseparated("::text, true)");
        }
        (None, true) => {
            set.push("notifications = '{}'::jsonb");
        }
        (None, false) => {}
    }
    if let Some(task) = &u.running_task {
        set.push("running_task = ")
            .push_bind_unseparated(task.as_ref().map(|t| t.as_str().to_string()));
    }
    if let Some(task) = &u.last_task_completed {
        set.push("last_task_completed = ")
            .push_bind_unseparated(task.as_ref().map(|t| t.as_str().to_string()));
    }
    if let Some(t) = u.last_task_completed_time {
        set.push("last_task_completed_time = ").push_bind_unseparated(t);
    }
    if let Some(t) = u.task_dispatch_time {
        set.push("task_dispatch_time = ").push_bind_unseparated(t);
    }
    if let Some(pid) = &u.pid {
        set.push("pid = ").push_bind_unseparated(pid.clone());
    }
    if let Some(t) = u.last_communication_time {
        set.push("last_communication_time = ").push_bind_unseparated(t);
    }
    if let Some(t) = u.last_reachability_check {
        set.push("last_reachability_check = ").push_bind_unseparated(t);
    }
    if let Some(t) = u.termination_time {
        set.push("termination_time = ").push_bind_unseparated(t);
    }
    if let Some(q) = u.quarantined {
        set.push("quarantined = ").push_bind_unseparated(q);
    }
}

fn sort_column(key: HostSortKey) -> &'static str {
    match key {
        HostSortKey::Id => "id",
        HostSortKey::Tag => "tag",
        HostSortKey::Status => "status",
        HostSortKey::CreationTime => "creation_time",
        HostSortKey::ExpirationTime => "expiration_time",
    }
}

#[async_trait]
impl HostRepository for PgHostRepository {
    async fn insert(&self, host: &Host) -> Result<()> {
        let mut qb = QueryBuilder::new(format!("INSERT INTO hosts ({COLUMNS}) VALUES ("));
        Self::push_values(&mut qb, host)?;
        qb.push(")");
        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn upsert(&self, host: &Host) -> Result<()> {
        let mut qb = QueryBuilder::new(format!("INSERT INTO hosts ({COLUMNS}) VALUES ("));
        Self::push_values(&mut qb, host)?;
        qb.push(
            ") ON CONFLICT (id) DO UPDATE SET host = EXCLUDED.host, username = EXCLUDED.username, tag = EXCLUDED.tag, distro_id = EXCLUDED.distro_id, provider = EXCLUDED.provider, provisioned = EXCLUDED.provisioned, started_by = EXCLUDED.started_by, running_task = EXCLUDED.running_task, last_task_completed = EXCLUDED.last_task_completed, last_task_completed_time = EXCLUDED.last_task_completed_time, task_dispatch_time = EXCLUDED.task_dispatch_time, last_communication_time = EXCLUDED.last_communication_time, last_reachability_check = EXCLUDED.last_reachability_check, expiration_time = EXCLUDED.expiration_time, notifications = EXCLUDED.notifications, secret = EXCLUDED.secret, pid = EXCLUDED.pid, quarantined = EXCLUDED.quarantined, termination_time = EXCLUDED.termination_time",
        );
        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: &HostId) -> Result<Option<Host>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM hosts WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        row.as_ref().map(Self::row_to_host).transpose()
    }

    async fn find(&self, query: &HostQuery) -> Result<Vec<Host>> {
        let mut qb = QueryBuilder::new(format!("SELECT {COLUMNS} FROM hosts WHERE "));
        push_filter(&mut qb, &query.filter);
        if !query.sort.is_empty() {
            qb.push(" ORDER BY ");
            for (i, (key, order)) in query.sort.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                qb.push(sort_column(*key));
                qb.push(match order {
                    SortOrder::Ascending => " ASC",
                    SortOrder::Descending => " DESC",
                });
            }
        }
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        if query.skip > 0 {
            qb.push(" OFFSET ").push_bind(query.skip as i64);
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        rows.iter()
            .map(|r| {
                let mut host = Self::row_to_host(r)?;
                query.project(&mut host);
                Ok(host)
            })
            .collect()
    }

    async fn count(&self, filter: &HostFilter) -> Result<u64> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) AS n FROM hosts WHERE ");
        push_filter(&mut qb, filter);
        let row = qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn update_one(
        &self,
        id: &HostId,
        guard: &HostGuard,
        update: &HostUpdate,
    ) -> Result<bool> {
        let mut qb = QueryBuilder::new("UPDATE hosts SET ");
        push_update(&mut qb, update);
        qb.push(" WHERE id = ").push_bind(id.as_str().to_string());
        push_guard(&mut qb, guard);
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_all(&self, filter: &HostFilter, update: &HostUpdate) -> Result<u64> {
        let mut qb = QueryBuilder::new("UPDATE hosts SET ");
        push_update(&mut qb, update);
        qb.push(" WHERE ");
        push_filter(&mut qb, filter);
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }
}
