//! Database integration tests.
//!
//! Run with: `cargo test -p kiln-tests --test database_tests --features integration`

#![cfg(feature = "integration")]

use chrono::{DateTime, Duration, Utc};
use kiln_core::host::HostStatus;
use kiln_core::host_query::{HostField, HostFilter, HostQuery, HostSortKey};
use kiln_core::ids::{DistroId, TaskId};
use kiln_core::pair::{Pair, PairSet};
use kiln_core::ports::{BuildRepository, HostRepository, PatchRepository, TaskRepository, VersionRepository};
use kiln_db::{PgBuildRepository, PgPatchRepository, PgTaskRepository, PgVersionRepository};
use kiln_fleet::{HostManager, TaskAssigner};
use kiln_scheduler::include_patch_dependencies;
use kiln_tests::{HostFixture, PatchFixture, ProjectFixture, context::TestContext};
use std::sync::Arc;

#[tokio::test]
async fn test_host_crud_and_queries() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let repo = ctx.host_repository();

    for (id, tag) in [("h1", "c"), ("h2", "a"), ("h3", "b")] {
        let mut host = HostFixture::running(id, "d1");
        host.tag = tag.to_string();
        host.secret = format!("secret-{id}");
        repo.insert(&host).await.expect("Failed to insert host");
    }
    assert!(repo.insert(&HostFixture::running("h1", "d1")).await.is_err());

    let found = repo
        .find(
            &HostQuery::new(HostFilter::Active)
                .sort(HostSortKey::Tag)
                .skip(1)
                .limit(1)
                .without_fields(&[HostField::Secret]),
        )
        .await
        .expect("Failed to find hosts");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id.as_str(), "h3");
    assert!(found[0].secret.is_empty());

    assert_eq!(repo.count(&HostFilter::Any).await.unwrap(), 3);
}

#[tokio::test]
async fn test_host_state_machine() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let manager = HostManager::new(ctx.host_repository());

    let mut host = HostFixture::with_status("h1", "d1", HostStatus::Starting);
    manager.insert(&host).await.unwrap();

    assert!(manager.set_dns_name(&mut host, "a").await.unwrap());
    assert!(!manager.set_dns_name(&mut host, "b").await.unwrap());
    assert_eq!(manager.get(&host.id).await.unwrap().host, "a");

    manager.set_expiration_notification(&mut host, "12h").await.unwrap();
    manager.set_expiration_notification(&mut host, "2h").await.unwrap();
    assert_eq!(manager.get(&host.id).await.unwrap().notifications.len(), 2);
    manager
        .set_expiration_time(&mut host, Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    assert!(manager.get(&host.id).await.unwrap().notifications.is_empty());

    manager.terminate(&mut host).await.unwrap();
    let err = manager
        .set_status(&mut host, HostStatus::Running)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(
        manager.get(&host.id).await.unwrap().status,
        HostStatus::Terminated
    );
}

#[tokio::test]
async fn test_task_slot_and_predicates() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let repo = ctx.host_repository();
    let manager = HostManager::new(repo.clone());
    let assigner = TaskAssigner::new(repo.clone());

    let mut host = HostFixture::running("h1", "d1");
    manager.insert(&host).await.unwrap();
    let task = TaskId::new("t1");

    assigner.claim_running_task(&mut host, &task, Utc::now()).await.unwrap();
    let mut rival = host.clone();
    rival.running_task = None;
    assert!(assigner
        .claim_running_task(&mut rival, &TaskId::new("t2"), Utc::now())
        .await
        .is_err());

    let active = repo.count(&HostFilter::Active).await.unwrap();
    assigner.clear_running_task(&mut host, &task, Utc::now()).await.unwrap();
    assert_eq!(repo.count(&HostFilter::Idle).await.unwrap(), 1);
    assert_eq!(repo.count(&HostFilter::Active).await.unwrap(), active);

    manager.reset_last_communicated(&mut host).await.unwrap();
    let stored = manager.get(&host.id).await.unwrap();
    assert_eq!(stored.last_communication_time, Some(DateTime::UNIX_EPOCH));
    assert_eq!(
        repo.count(&HostFilter::TimedOutHeartbeat(Utc::now()))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_decommission_hosts_with_distro() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let manager = HostManager::new(ctx.host_repository());

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

    let d1 = HostFilter::ByDistro(DistroId::new("d1"));
    let d2 = HostFilter::ByDistro(DistroId::new("d2"));
    assert_eq!(
        manager
            .count(&d1.and(HostFilter::ByStatus(HostStatus::Decommissioned)))
            .await
            .unwrap(),
        10
    );
    assert_eq!(
        manager
            .count(&d2.and(HostFilter::ByStatus(HostStatus::Running)))
            .await
            .unwrap(),
        10
    );
}

#[tokio::test]
async fn test_finalize_and_grow_version() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let pool = ctx.db.pool().clone();
    let finalizer = ctx.finalizer().await.expect("Failed to build finalizer");
    let patches = PgPatchRepository::new(pool.clone());
    let versions = PgVersionRepository::new(pool.clone());
    let builds = PgBuildRepository::new(pool.clone());
    let tasks = PgTaskRepository::new(pool);

    let patch = PatchFixture::with_tasks(&[("linux", &["compile"])]);
    patches.insert(&patch).await.unwrap();
    let version = finalizer.finalize_patch(&patch).await.unwrap();

    let project = ProjectFixture::project();
    let mut seed = PairSet::new();
    seed.insert(Pair::new("linux", "integration"));
    let wanted = include_patch_dependencies(&project, &seed).unwrap();

    let assembler = finalizer.assembler();
    let created = assembler
        .create_missing_builds(&patch, &version.id, &project, &wanted)
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    let added = assembler
        .create_missing_tasks(&patch, &version.id, &project, &wanted)
        .await
        .unwrap();
    assert_eq!(added.len(), 3);
    let added = assembler
        .create_missing_tasks(&patch, &version.id, &project, &wanted)
        .await
        .unwrap();
    assert!(added.is_empty());

    let stored = versions.get(&version.id).await.unwrap().unwrap();
    assert_eq!(stored.build_ids.len(), 2);
    let found = builds.find_by_ids(&stored.build_ids).await.unwrap();
    assert_eq!(found[0].id, stored.build_ids[0]);
    let linux = builds
        .get(stored.build_for_variant("linux").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(linux.task_ids.len(), 4);
    assert_eq!(tasks.find_by_build(&linux.id).await.unwrap().len(), 4);

    let patch = patches.get(patch.id).await.unwrap().unwrap();
    finalizer.cancel_patch(&patch, "alice").await.unwrap();
    let stored = versions.get(&version.id).await.unwrap().unwrap();
    assert!(!stored.activated);
    assert!(stored.build_variants.iter().all(|b| !b.activated));
}

#[tokio::test]
async fn test_cancel_unfinalized_patch() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let finalizer = ctx.finalizer().await.expect("Failed to build finalizer");
    let patches: Arc<dyn PatchRepository> = Arc::new(PgPatchRepository::new(ctx.db.pool().clone()));

    let patch = PatchFixture::simple();
    patches.insert(&patch).await.unwrap();
    finalizer.cancel_patch(&patch, "alice").await.unwrap();
    assert!(patches.get(patch.id).await.unwrap().is_none());
}
