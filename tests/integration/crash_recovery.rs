//! Restarting after a scheduler process dies.
//!
//! A crash is simulated by dropping a scheduler with dispatches in flight,
//! or by claiming tasks directly through the store, then opening a fresh
//! connection to the same database file. The restarted scheduler runs with
//! a zero lease so the dead claims count as expired straight away.

use std::sync::Arc;
use std::time::Duration;

use testforge::core::{ProjectStatus, StageDef, StageId, StageRegistry, TaskStatus};
use testforge::orchestration::{AgentGateway, Capability, RetryPolicy, Scheduler};
use testforge::store::{ProjectTransition, StateStore, TaskTransition};

use crate::fixtures::{gateway, scheduler, Gated, Scripted, TestStore};

fn two_stages() -> StageRegistry {
    StageRegistry::new(vec![
        StageDef::new("parse", Capability::Parse),
        StageDef::new("scan", Capability::SecurityScan).after(&["parse"]),
    ])
    .unwrap()
}

fn restarted(store: Arc<dyn StateStore>, gateway: AgentGateway) -> Scheduler {
    scheduler(store, gateway).with_recovery_lease(Duration::ZERO)
}

fn claim_parse(store: &TestStore, project: &testforge::core::Project) {
    store
        .store
        .update_project(&project.id, ProjectStatus::Pending, ProjectTransition::Start)
        .unwrap();
    store
        .store
        .update_task(
            &project.id,
            &StageId::from("parse"),
            TaskStatus::Pending,
            TaskTransition::Claim,
        )
        .unwrap();
}

#[tokio::test]
async fn test_interrupted_task_is_retried_after_restart() {
    let store = TestStore::new();
    let project = store.create("interrupted", &two_stages());
    claim_parse(&store, &project);

    let parse = Scripted::ok(Capability::Parse);
    let mut second = restarted(
        store.reopen(),
        gateway()
            .with_provider(parse.clone())
            .with_provider(Scripted::ok(Capability::SecurityScan)),
    );
    let report = second.recover().await.unwrap();
    assert_eq!(report.reset, 1);
    assert_eq!(report.total(), 1);

    second.run_until_idle().await.unwrap();

    let task = store.store.get_task(&project.id, &StageId::from("parse")).unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.attempt, 2);
    assert_eq!(parse.calls(), 1);
    assert_eq!(
        store.store.get_project(&project.id).unwrap().status,
        ProjectStatus::Completed
    );
}

#[tokio::test]
async fn test_interrupted_task_at_ceiling_fails_project() {
    let store = TestStore::new();
    let project = store.create("out of attempts", &two_stages());
    claim_parse(&store, &project);

    let parse = Scripted::ok(Capability::Parse);
    let mut second = Scheduler::new(
        store.reopen(),
        Arc::new(
            gateway()
                .with_provider(parse.clone())
                .with_provider(Scripted::ok(Capability::SecurityScan)),
        ),
        RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
    )
    .with_poll_interval(Duration::from_millis(5))
    .with_recovery_lease(Duration::ZERO);
    let report = second.recover().await.unwrap();
    assert_eq!(report.failed, 1);

    second.run_until_idle().await.unwrap();

    let finished = store.store.get_project(&project.id).unwrap();
    assert_eq!(finished.status, ProjectStatus::Failed);
    assert!(finished.reason.unwrap().contains("interrupted"));
    assert_eq!(parse.calls(), 0);
}

#[tokio::test]
async fn test_crash_mid_dispatch_keeps_finished_stages() {
    let store = TestStore::new();
    let project = store.create("half done", &two_stages());

    let first_parse = Scripted::ok(Capability::Parse);
    let first_scan = Gated::new(Capability::SecurityScan);
    let mut first = scheduler(
        store.store.clone(),
        gateway()
            .with_provider(first_parse.clone())
            .with_provider(first_scan.clone()),
    );
    first.tick().await.unwrap();
    first.drain().await.unwrap();
    assert_eq!(first.tick().await.unwrap().dispatched, 1);
    first_scan.started.notified().await;
    // Dropping the scheduler aborts the in-flight scan without recording it.
    drop(first);

    let scan = store.store.get_task(&project.id, &StageId::from("scan")).unwrap();
    assert_eq!(scan.status, TaskStatus::Running);

    let second_parse = Scripted::ok(Capability::Parse);
    let second_scan = Scripted::ok(Capability::SecurityScan);
    let mut second = restarted(
        store.reopen(),
        gateway()
            .with_provider(second_parse.clone())
            .with_provider(second_scan.clone()),
    );
    assert_eq!(second.recover().await.unwrap().reset, 1);
    second.run_until_idle().await.unwrap();

    assert_eq!(first_parse.calls(), 1);
    assert_eq!(second_parse.calls(), 0);
    assert_eq!(second_scan.calls(), 1);
    let scan = store.store.get_task(&project.id, &StageId::from("scan")).unwrap();
    assert_eq!(scan.status, TaskStatus::Succeeded);
    assert_eq!(scan.attempt, 2);
}

#[tokio::test]
async fn test_recent_claim_waits_for_its_lease() {
    let store = TestStore::new();
    let project = store.create("just claimed", &two_stages());
    claim_parse(&store, &project);

    let parse = Scripted::ok(Capability::Parse);
    let mut second = scheduler(store.reopen(), gateway().with_provider(parse.clone()));
    assert_eq!(second.recover().await.unwrap().total(), 0);
    assert_eq!(second.tick().await.unwrap().dispatched, 0);

    let task = store.store.get_task(&project.id, &StageId::from("parse")).unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.attempt, 1);
    assert_eq!(parse.calls(), 0);
}

#[tokio::test]
async fn test_resuming_finished_work_is_a_no_op() {
    let store = TestStore::new();
    let project = store.create("finished", &two_stages());
    let mut first = scheduler(
        store.store.clone(),
        gateway()
            .with_provider(Scripted::ok(Capability::Parse))
            .with_provider(Scripted::ok(Capability::SecurityScan)),
    );
    first.run_until_idle().await.unwrap();
    let before = store.store.list_tasks(&project.id).unwrap();

    let parse = Scripted::ok(Capability::Parse);
    let scan = Scripted::ok(Capability::SecurityScan);
    let mut again = scheduler(
        store.reopen(),
        gateway().with_provider(parse.clone()).with_provider(scan.clone()),
    );
    assert_eq!(again.recover().await.unwrap().total(), 0);
    again.run_until_idle().await.unwrap();

    assert_eq!(parse.calls() + scan.calls(), 0);
    assert_eq!(store.store.list_tasks(&project.id).unwrap(), before);
}
