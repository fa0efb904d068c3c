//! Periodic fleet monitor.
//!
//! Each pass selects hosts through the shared predicates and drives them
//! with [`HostManager`] operations. A failure on one host is logged and the
//! pass moves on; a conflict means another writer got there first.

use crate::config::FleetConfig;
use crate::manager::HostManager;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use kiln_core::host::{Host, HostStatus};
use kiln_core::host_query::HostFilter;
use kiln_core::ports::CloudProvider;
use kiln_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// What one monitor pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub provisioned: usize,
    pub probed: usize,
    pub quarantined: usize,
    pub recovered: usize,
    pub notified: usize,
    pub terminated: usize,
}

enum Probe {
    Up { was_quarantined: bool },
    Down { was_quarantined: bool },
}

/// Control loop over the fleet.
pub struct FleetMonitor {
    manager: HostManager,
    providers: HashMap<String, Arc<dyn CloudProvider>>,
    config: FleetConfig,
}

impl FleetMonitor {
    pub fn new(manager: HostManager, config: FleetConfig) -> Self {
        Self {
            manager,
            providers: HashMap::new(),
            config,
        }
    }

    /// Register the backend for hosts whose distro names this provider.
    pub fn with_provider(mut self, provider: Arc<dyn CloudProvider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    /// Run passes until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(std::time::Duration::from_secs(
            self.config.monitor_interval_secs,
        ));

        info!(
            interval_secs = self.config.monitor_interval_secs,
            providers = self.providers.len(),
            "Starting fleet monitor"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_once(Utc::now()).await;
                    debug!(?report, "Fleet monitor pass complete");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Fleet monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over the fleet as of `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> MonitorReport {
        let mut report = MonitorReport::default();

        match self.provision_started_hosts().await {
            Ok(n) => report.provisioned = n,
            Err(e) => error!(error = %e, "Failed to provision started hosts"),
        }
        if let Err(e) = self.check_reachability(now, &mut report).await {
            error!(error = %e, "Failed to check host reachability");
        }
        match self.notify_expiring(now).await {
            Ok(n) => report.notified = n,
            Err(e) => error!(error = %e, "Failed to send expiration notices"),
        }
        if self.config.terminate_expired {
            match self.terminate_matching(HostFilter::ExpiredSpawned(now)).await {
                Ok(n) => report.terminated += n,
                Err(e) => error!(error = %e, "Failed to terminate expired hosts"),
            }
        }
        match self.terminate_matching(HostFilter::DecommissionedIdle).await {
            Ok(n) => report.terminated += n,
            Err(e) => error!(error = %e, "Failed to terminate decommissioned hosts"),
        }

        report
    }

    fn provider(&self, host: &Host) -> Result<&Arc<dyn CloudProvider>> {
        self.providers.get(&host.distro.provider).ok_or_else(|| {
            Error::Provider(format!(
                "no provider '{}' for host {}",
                host.distro.provider, host.id
            ))
        })
    }

    /// Starting hosts whose machine has a DNS name become running.
    async fn provision_started_hosts(&self) -> Result<usize> {
        let hosts = self
            .manager
            .find(HostFilter::ByStatus(HostStatus::Starting))
            .await?;
        let results = join_all(hosts.into_iter().map(|host| self.provision(host))).await;
        Ok(self.tally(results))
    }

    async fn provision(&self, mut host: Host) -> Result<bool> {
        let provider = self.provider(&host)?;
        let Some(name) = provider.dns_name(&host).await? else {
            return Ok(false);
        };
        self.manager.set_dns_name(&mut host, &name).await?;
        self.manager.create_secret(&mut host).await?;
        self.manager.mark_as_provisioned(&mut host).await?;
        Ok(true)
    }

    /// Probe hosts whose heartbeat timed out, and idle hosts nobody has
    /// checked recently. Unreachable hosts are quarantined; reachable ones
    /// are released from quarantine.
    async fn check_reachability(&self, now: DateTime<Utc>, report: &mut MonitorReport) -> Result<()> {
        let since = now
            .checked_sub_signed(self.config.reachability_interval()?)
            .ok_or_else(|| Error::InvalidConfig("reachability interval out of range".to_string()))?;
        let mut hosts = self.manager.find(HostFilter::TimedOutHeartbeat(now)).await?;
        hosts.retain(|h| h.last_reachability_check.is_none_or(|t| t <= since));
        for host in self.manager.find(HostFilter::NotMonitoredSince(since)).await? {
            if !hosts.iter().any(|h| h.id == host.id) {
                hosts.push(host);
            }
        }

        let results = join_all(hosts.into_iter().map(|host| self.probe(host, now))).await;
        for result in results {
            match result {
                Ok(Probe::Up { was_quarantined }) => {
                    report.probed += 1;
                    if was_quarantined {
                        report.recovered += 1;
                    }
                }
                Ok(Probe::Down { was_quarantined }) => {
                    report.probed += 1;
                    if !was_quarantined {
                        report.quarantined += 1;
                    }
                }
                Err(e) => warn!(error = %e, "Reachability check failed"),
            }
        }
        Ok(())
    }

    async fn probe(&self, mut host: Host, now: DateTime<Utc>) -> Result<Probe> {
        let provider = self.provider(&host)?;
        let up = provider.is_up(&host).await?;
        let was_quarantined = host.quarantined;

        if up == was_quarantined {
            self.manager.set_quarantined(&mut host, !up).await?;
        }
        self.manager.update_reachability_check(&mut host, now).await?;

        if up {
            Ok(Probe::Up { was_quarantined })
        } else {
            warn!(host_id = %host.id, "Host unreachable");
            Ok(Probe::Down { was_quarantined })
        }
    }

    /// Record the notice for every bucket a spawned host's expiration has
    /// entered.
    async fn notify_expiring(&self, now: DateTime<Utc>) -> Result<usize> {
        let buckets = self.config.buckets()?;
        let hosts = self.manager.find(HostFilter::RunningAndSpawned).await?;
        let mut sent = 0;

        for mut host in hosts {
            let Some(expires) = host.expiration_time else {
                continue;
            };
            if expires <= now {
                continue;
            }
            for (tag, lead) in &buckets {
                if !due(expires, now, *lead) || host.notifications.contains_key(tag) {
                    continue;
                }
                match self.manager.set_expiration_notification(&mut host, tag).await {
                    Ok(()) => {
                        info!(
                            host_id = %host.id,
                            started_by = %host.started_by,
                            expires = %expires,
                            bucket = %tag,
                            "Host expiring soon"
                        );
                        sent += 1;
                    }
                    Err(e) => warn!(host_id = %host.id, error = %e, "Failed to record notice"),
                }
            }
        }
        Ok(sent)
    }

    async fn terminate_matching(&self, filter: HostFilter) -> Result<usize> {
        let hosts = self.manager.find(filter).await?;
        let results = join_all(hosts.into_iter().map(|host| self.terminate_host(host))).await;
        Ok(self.tally(results))
    }

    async fn terminate_host(&self, mut host: Host) -> Result<bool> {
        let provider = self.provider(&host)?;
        provider.terminate(&host).await?;
        self.manager.terminate(&mut host).await?;
        Ok(true)
    }

    fn tally(&self, results: Vec<Result<bool>>) -> usize {
        results
            .into_iter()
            .filter(|r| match r {
                Ok(done) => *done,
                Err(e) if e.is_conflict() => {
                    debug!(error = %e, "Host changed underneath, skipping");
                    false
                }
                Err(e) => {
                    warn!(error = %e, "Host operation failed");
                    false
                }
            })
            .count()
    }
}

fn due(expires: DateTime<Utc>, now: DateTime<Utc>, lead: Duration) -> bool {
    expires - now <= lead
}
