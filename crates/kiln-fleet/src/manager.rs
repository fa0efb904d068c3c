//! Host lifecycle operations.
//!
//! Every operation here is one conditional update keyed by host id. When a
//! guarded write applies to nothing, the host is reread so the caller's copy
//! reflects what won, and the outcome is reported rather than retried.

use chrono::{DateTime, Utc};
use kiln_core::host::{Host, HostStatus};
use kiln_core::host_query::{HostFilter, HostGuard, HostQuery, HostUpdate};
use kiln_core::ids::{DistroId, HostId};
use kiln_core::ports::HostRepository;
use kiln_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Applies state transitions to fleet hosts.
#[derive(Clone)]
pub struct HostManager {
    hosts: Arc<dyn HostRepository>,
}

impl HostManager {
    pub fn new(hosts: Arc<dyn HostRepository>) -> Self {
        Self { hosts }
    }

    pub fn repository(&self) -> &Arc<dyn HostRepository> {
        &self.hosts
    }

    pub async fn insert(&self, host: &Host) -> Result<()> {
        self.hosts.insert(host).await?;
        info!(host_id = %host.id, distro = %host.distro.id, "Inserted host");
        Ok(())
    }

    /// Insert or overwrite a host. An existing host keeps its stored status.
    pub async fn upsert(&self, host: &Host) -> Result<()> {
        self.hosts.upsert(host).await
    }

    pub async fn get(&self, id: &HostId) -> Result<Host> {
        self.hosts
            .get(id)
            .await?
            .ok_or_else(|| Error::HostNotFound(id.to_string()))
    }

    pub async fn find(&self, query: impl Into<HostQuery>) -> Result<Vec<Host>> {
        self.hosts.find(&query.into()).await
    }

    pub async fn count(&self, filter: &HostFilter) -> Result<u64> {
        self.hosts.count(filter).await
    }

    /// Set the status of a host. Terminated is absorbing: moving a
    /// terminated host anywhere else fails and changes nothing.
    pub async fn set_status(&self, host: &mut Host, status: HostStatus) -> Result<()> {
        self.transition(host, HostUpdate::new().status(status)).await?;
        debug!(host_id = %host.id, status = %status, "Set host status");
        Ok(())
    }

    /// Mark a host terminated and stamp the termination time. Terminating
    /// a host that is already terminated keeps its first termination time.
    pub async fn terminate(&self, host: &mut Host) -> Result<()> {
        let update = HostUpdate::new()
            .status(HostStatus::Terminated)
            .termination_time(Utc::now());
        if self
            .hosts
            .update_one(&host.id, &HostGuard::NotTerminated, &update)
            .await?
        {
            update.apply(host);
            info!(host_id = %host.id, "Terminated host");
            return Ok(());
        }

        let stored = self.get(&host.id).await?;
        host.status = stored.status;
        host.termination_time = stored.termination_time;
        debug!(host_id = %host.id, "Host already terminated");
        Ok(())
    }

    /// The machine reported ready: running and provisioned.
    pub async fn mark_as_provisioned(&self, host: &mut Host) -> Result<()> {
        let update = HostUpdate::new()
            .status(HostStatus::Running)
            .provisioned(true);
        self.transition(host, update).await?;
        info!(host_id = %host.id, "Host provisioned");
        Ok(())
    }

    /// Record the DNS name if none is set yet. Returns false when another
    /// writer set it first; `host` then holds the stored name.
    pub async fn set_dns_name(&self, host: &mut Host, name: &str) -> Result<bool> {
        let update = HostUpdate::new().host(name);
        if self.hosts.update_one(&host.id, &HostGuard::DnsUnset, &update).await? {
            update.apply(host);
            debug!(host_id = %host.id, dns_name = name, "Set DNS name");
            return Ok(true);
        }
        let stored = self.get(&host.id).await?;
        host.host = stored.host;
        Ok(false)
    }

    /// Generate an agent secret unless the host already has one. Returns
    /// the secret in effect.
    pub async fn create_secret(&self, host: &mut Host) -> Result<String> {
        if !host.secret.is_empty() {
            return Ok(host.secret.clone());
        }
        let secret = uuid::Uuid::new_v4().simple().to_string();
        let update = HostUpdate::new().secret(secret);
        if self.hosts.update_one(&host.id, &HostGuard::NoSecret, &update).await? {
            update.apply(host);
        } else {
            host.secret = self.get(&host.id).await?.secret;
        }
        Ok(host.secret.clone())
    }

    /// Move the expiration time. Notices already sent refer to the old
    /// deadline and are cleared.
    pub async fn set_expiration_time(&self, host: &mut Host, t: DateTime<Utc>) -> Result<()> {
        self.write(host, HostUpdate::new().expiration_time(t)).await
    }

    /// Record that the notice for `tag` went out.
    pub async fn set_expiration_notification(&self, host: &mut Host, tag: &str) -> Result<()> {
        self.write(host, HostUpdate::new().add_notification(tag))
            .await
    }

    /// Zero the heartbeat so the host is due for a reachability check.
    pub async fn reset_last_communicated(&self, host: &mut Host) -> Result<()> {
        let update = HostUpdate::new().last_communication_time(Some(DateTime::UNIX_EPOCH));
        self.write(host, update).await
    }

    pub async fn update_last_communicated(&self, host: &mut Host, t: DateTime<Utc>) -> Result<()> {
        self.write(host, HostUpdate::new().last_communication_time(Some(t)))
            .await
    }

    pub async fn update_reachability_check(&self, host: &mut Host, t: DateTime<Utc>) -> Result<()> {
        self.write(host, HostUpdate::new().last_reachability_check(t))
            .await
    }

    pub async fn set_quarantined(&self, host: &mut Host, quarantined: bool) -> Result<()> {
        self.write(host, HostUpdate::new().quarantined(quarantined))
            .await?;
        info!(host_id = %host.id, quarantined, "Set quarantine");
        Ok(())
    }

    /// Decommission every non-terminated host of a distro. Returns the
    /// number of hosts changed.
    pub async fn decommission_hosts_with_distro(&self, distro: &DistroId) -> Result<u64> {
        let filter = HostFilter::ByDistro(distro.clone())
            .and(HostFilter::StatusNot(HostStatus::Terminated));
        let n = self
            .hosts
            .update_all(&filter, &HostUpdate::new().status(HostStatus::Decommissioned))
            .await?;
        info!(distro = %distro, count = n, "Decommissioned hosts");
        Ok(n)
    }

    /// Unconditional single-host write.
    async fn write(&self, host: &mut Host, update: HostUpdate) -> Result<()> {
        if !self.hosts.update_one(&host.id, &HostGuard::None, &update).await? {
            return Err(Error::HostNotFound(host.id.to_string()));
        }
        update.apply(host);
        Ok(())
    }

    /// Status write guarded against leaving Terminated.
    async fn transition(&self, host: &mut Host, update: HostUpdate) -> Result<()> {
        let Some(status) = update.status else {
            return self.write(host, update).await;
        };
        if status == HostStatus::Terminated {
            return self.write(host, update).await;
        }
        if host.is_terminated() {
            return Err(terminated(host, status));
        }

        if self
            .hosts
            .update_one(&host.id, &HostGuard::NotTerminated, &update)
            .await?
        {
            update.apply(host);
            return Ok(());
        }

        // terminated underneath us, or gone
        let stored = self.get(&host.id).await?;
        host.status = stored.status;
        Err(terminated(host, status))
    }
}

fn terminated(host: &Host, requested: HostStatus) -> Error {
    Error::HostTerminated {
        host_id: host.id.to_string(),
        requested: requested.to_string(),
    }
}
