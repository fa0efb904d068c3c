//! Host state machine and fleet query tests over the in-memory store.

use chrono::{DateTime, Duration, Utc};
use kiln_core::host::HostStatus;
use kiln_core::host_query::{HostField, HostFilter, HostQuery, HostSortKey};
use kiln_core::ids::{DistroId, HostId, TaskId};
use kiln_core::ports::HostRepository;
use kiln_core::Error;
use kiln_tests::{HostFixture, TestContext};
use pretty_assertions::assert_eq;
use tokio_test::{assert_err, assert_ok};

fn ids(hosts: &[kiln_core::host::Host]) -> Vec<String> {
    hosts.iter().map(|h| h.id.to_string()).collect()
}

#[tokio::test]
async fn test_terminated_then_running_fails() {
    let ctx = TestContext::new().await;
    let manager = ctx.host_manager();
    let mut host = HostFixture::running("h1", "d1");
    manager.insert(&host).await.unwrap();

    assert_ok!(manager.set_status(&mut host, HostStatus::Terminated).await);
    let err = assert_err!(manager.set_status(&mut host, HostStatus::Running).await);
    assert!(err.is_conflict());

    let stored = manager.get(&host.id).await.unwrap();
    assert_eq!(stored.status, HostStatus::Terminated);
}

#[tokio::test]
async fn test_non_terminal_status_writes_succeed() {
    let ctx = TestContext::new().await;
    let manager = ctx.host_manager();
    let mut host = HostFixture::with_status("h1", "d1", HostStatus::Uninitialized);
    manager.insert(&host).await.unwrap();

    for status in [
        HostStatus::Building,
        HostStatus::Provisioning,
        HostStatus::Running,
        HostStatus::Decommissioned,
        HostStatus::Running,
    ] {
        assert_ok!(manager.set_status(&mut host, status).await);
        assert_eq!(manager.get(&host.id).await.unwrap().status, status);
    }
}

#[tokio::test]
async fn test_set_expiration_time_clears_notifications() {
    let ctx = TestContext::new().await;
    let manager = ctx.host_manager();
    let mut host = HostFixture::spawned("h1", "alice", Utc::now() + Duration::hours(1));
    manager.insert(&host).await.unwrap();

    manager.set_expiration_notification(&mut host, "12h").await.unwrap();
    manager.set_expiration_notification(&mut host, "2h").await.unwrap();
    // recording the same tag twice merges
    manager.set_expiration_notification(&mut host, "2h").await.unwrap();
    let stored = manager.get(&host.id).await.unwrap();
    assert_eq!(stored.notifications.keys().collect::<Vec<_>>(), vec!["12h", "2h"]);

    let later = Utc::now() + Duration::days(1);
    manager.set_expiration_time(&mut host, later).await.unwrap();
    let stored = manager.get(&host.id).await.unwrap();
    assert!(stored.notifications.is_empty());
    assert_eq!(stored.expiration_time, Some(later));
}

#[tokio::test]
async fn test_dns_name_keeps_first_value() {
    let ctx = TestContext::new().await;
    let manager = ctx.host_manager();
    let mut host = HostFixture::with_status("h1", "d1", HostStatus::Starting);
    manager.insert(&host).await.unwrap();

    assert!(manager.set_dns_name(&mut host, "a").await.unwrap());
    assert!(!manager.set_dns_name(&mut host, "b").await.unwrap());
    assert_eq!(host.host, "a");
    assert_eq!(manager.get(&host.id).await.unwrap().host, "a");
}

#[tokio::test]
async fn test_clear_running_task_moves_host_to_idle() {
    let ctx = TestContext::new().await;
    let assigner = ctx.assigner();
    let mut host = HostFixture::running("h1", "d1");
    ctx.hosts.insert(&host).await.unwrap();
    let prev = TaskId::new("kiln_linux_unit_abc");

    assigner
        .claim_running_task(&mut host, &prev, Utc::now())
        .await
        .unwrap();
    assert_eq!(ctx.hosts.count(&HostFilter::Idle).await.unwrap(), 0);
    let active_before = ctx.hosts.count(&HostFilter::Active).await.unwrap();

    let t = Utc::now();
    assigner.clear_running_task(&mut host, &prev, t).await.unwrap();

    let stored = ctx.hosts.get(&host.id).await.unwrap().unwrap();
    assert!(stored.running_task.is_none());
    assert_eq!(stored.last_task_completed, Some(prev));
    assert_eq!(stored.last_task_completed_time, Some(t));
    assert_eq!(ctx.hosts.count(&HostFilter::Idle).await.unwrap(), 1);
    assert_eq!(
        ctx.hosts.count(&HostFilter::Active).await.unwrap(),
        active_before
    );
}

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let ctx = TestContext::new().await;
    let assigner = ctx.assigner();
    let host = HostFixture::running("h1", "d1");
    ctx.hosts.insert(&host).await.unwrap();

    let attempts = (0..8).map(|i| {
        let assigner = assigner.clone();
        let mut copy = host.clone();
        async move {
            assigner
                .claim_running_task(&mut copy, &TaskId::new(format!("t{i}")), Utc::now())
                .await
        }
    });
    let results = futures::future::join_all(attempts).await;

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
        e,
        Error::RunningTaskOccupied { .. }
    )));
}

#[tokio::test]
async fn test_timed_out_heartbeat_scenario() {
    let ctx = TestContext::new().await;
    let manager = ctx.host_manager();

    let mut zero = HostFixture::with_status("zero", "d1", HostStatus::Running);
    zero.last_communication_time = Some(DateTime::UNIX_EPOCH);
    let mut future = HostFixture::with_status("future", "d1", HostStatus::Running);
    future.last_communication_time = Some(Utc::now() + Duration::minutes(5));
    let mut dead = HostFixture::with_status("dead", "d1", HostStatus::Terminated);
    dead.last_communication_time = Some(DateTime::UNIX_EPOCH);
    for h in [&zero, &future, &dead] {
        manager.insert(h).await.unwrap();
    }

    let found = manager
        .find(HostFilter::TimedOutHeartbeat(Utc::now()))
        .await
        .unwrap();
    assert_eq!(ids(&found), vec!["zero"]);

    manager.reset_last_communicated(&mut zero).await.unwrap();
    let found = manager
        .find(HostFilter::TimedOutHeartbeat(Utc::now()))
        .await
        .unwrap();
    assert_eq!(ids(&found), vec!["zero"]);

    // terminated stays out whatever the clock says
    let far = Utc::now() + Duration::days(365);
    let found = manager
        .find(HostFilter::TimedOutHeartbeat(far))
        .await
        .unwrap();
    assert!(!ids(&found).contains(&"dead".to_string()));
}

#[tokio::test]
async fn test_decommission_hosts_with_distro() {
    let ctx = TestContext::new().await;
    let manager = ctx.host_manager();
    for i in 0..10 {
        manager
            .insert(&HostFixture::running(&format!("d1-{i}"), "d1"))
            .await
            .unwrap();
        manager
            .insert(&HostFixture::running(&format!("d2-{i}"), "d2"))
            .await
            .unwrap();
    }

    let changed = manager
        .decommission_hosts_with_distro(&DistroId::new("d1"))
        .await
        .unwrap();
    assert_eq!(changed, 10);

    let d1 = manager
        .find(HostFilter::ByDistro(DistroId::new("d1")))
        .await
        .unwrap();
    assert_eq!(d1.len(), 10);
    assert!(d1.iter().all(|h| h.status == HostStatus::Decommissioned));

    let d2 = manager
        .find(HostFilter::ByDistro(DistroId::new("d2")))
        .await
        .unwrap();
    assert_eq!(d2.len(), 10);
    assert!(d2.iter().all(|h| h.status == HostStatus::Running));
}

#[tokio::test]
async fn test_decommission_skips_terminated_hosts() {
    let ctx = TestContext::new().await;
    let manager = ctx.host_manager();
    manager
        .insert(&HostFixture::running("live", "d1"))
        .await
        .unwrap();
    manager
        .insert(&HostFixture::with_status("gone", "d1", HostStatus::Terminated))
        .await
        .unwrap();
    manager
        .insert(&HostFixture::with_status("booting", "d1", HostStatus::Provisioning))
        .await
        .unwrap();

    let changed = manager
        .decommission_hosts_with_distro(&DistroId::new("d1"))
        .await
        .unwrap();
    assert_eq!(changed, 2);
    assert_eq!(
        manager.get(&HostId::new("gone")).await.unwrap().status,
        HostStatus::Terminated
    );
    assert_eq!(
        manager.get(&HostId::new("booting")).await.unwrap().status,
        HostStatus::Decommissioned
    );
}

#[tokio::test]
async fn test_upsert_keeps_stored_status() {
    let ctx = TestContext::new().await;
    let manager = ctx.host_manager();
    let mut host = HostFixture::running("h1", "d1");
    manager.insert(&host).await.unwrap();
    manager.terminate(&mut host).await.unwrap();

    let mut replacement = HostFixture::running("h1", "d1");
    replacement.tag = "rebuilt".to_string();
    manager.upsert(&replacement).await.unwrap();

    let stored = manager.get(&host.id).await.unwrap();
    assert_eq!(stored.tag, "rebuilt");
    assert_eq!(stored.status, HostStatus::Terminated);

    let fresh = HostFixture::running("h2", "d1");
    manager.upsert(&fresh).await.unwrap();
    assert_eq!(manager.count(&HostFilter::Any).await.unwrap(), 2);
}

#[tokio::test]
async fn test_duplicate_insert_fails() {
    let ctx = TestContext::new().await;
    let host = HostFixture::running("h1", "d1");
    ctx.hosts.insert(&host).await.unwrap();
    assert_err!(ctx.hosts.insert(&host).await);
}

#[tokio::test]
async fn test_find_sorts_skips_limits_and_projects() {
    let ctx = TestContext::new().await;
    let manager = ctx.host_manager();
    for (id, tag) in [("h1", "c"), ("h2", "a"), ("h3", "b"), ("h4", "d")] {
        let mut host = HostFixture::running(id, "d1");
        host.tag = tag.to_string();
        host.secret = format!("secret-{id}");
        host.host = format!("{id}.example.com");
        manager.insert(&host).await.unwrap();
    }

    let query = HostQuery::new(HostFilter::Active)
        .sort(HostSortKey::Tag)
        .skip(1)
        .limit(2)
        .without_fields(&[HostField::Secret]);
    let found = manager.find(query).await.unwrap();

    assert_eq!(ids(&found), vec!["h3", "h1"]);
    assert!(found.iter().all(|h| h.secret.is_empty()));
    assert!(found.iter().all(|h| !h.host.is_empty()));

    let desc = manager
        .find(HostQuery::new(HostFilter::Any).sort_desc(HostSortKey::Id))
        .await
        .unwrap();
    assert_eq!(ids(&desc), vec!["h4", "h3", "h2", "h1"]);
}

#[tokio::test]
async fn test_fleet_predicates() {
    let ctx = TestContext::new().await;
    let now = Utc::now();

    let idle = HostFixture::running("idle", "d1");
    let mut busy = HostFixture::running("busy", "d1");
    busy.running_task = Some(TaskId::new("t1"));
    let spawned = HostFixture::spawned("spawned", "alice", now + Duration::hours(4));
    let expired = HostFixture::spawned("expired", "alice", now - Duration::minutes(1));
    let decom = HostFixture::with_status("decom", "d1", HostStatus::Decommissioned);
    let mut decom_busy = HostFixture::with_status("decom-busy", "d1", HostStatus::Decommissioned);
    decom_busy.running_task = Some(TaskId::new("t2"));
    for h in [&idle, &busy, &spawned, &expired, &decom, &decom_busy] {
        ctx.hosts.insert(h).await.unwrap();
    }

    let find = |f: HostFilter| {
        let hosts = ctx.hosts.clone();
        async move {
            let mut found = ids(&hosts.find(&HostQuery::new(f)).await.unwrap());
            found.sort();
            found
        }
    };

    assert_eq!(find(HostFilter::Active).await, vec!["busy", "idle"]);
    assert_eq!(find(HostFilter::Idle).await, vec!["idle"]);
    assert_eq!(find(HostFilter::RunningTask).await, vec!["busy"]);
    assert_eq!(
        find(HostFilter::RunningAndSpawned).await,
        vec!["expired", "spawned"]
    );
    assert_eq!(find(HostFilter::ExpiredSpawned(now)).await, vec!["expired"]);
    assert_eq!(find(HostFilter::DecommissionedIdle).await, vec!["decom"]);
    assert_eq!(
        find(HostFilter::NotMonitoredSince(now - Duration::minutes(10))).await,
        vec!["idle"]
    );
}
