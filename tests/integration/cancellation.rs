//! Cancelling projects while work is queued, waiting, or in flight.

use std::sync::Arc;
use std::time::Duration;

use testforge::core::{ProjectStatus, StageDef, StageId, StageRegistry, TaskStatus};
use testforge::orchestration::{Capability, ProviderError, RetryPolicy, Scheduler, SchedulerEvent};
use testforge::store::{ProjectTransition, StateStore};
use testforge::Error;

use crate::fixtures::{drain_events, gateway, observed_scheduler, scheduler, Gated, Scripted, TestStore};

fn two_stages() -> StageRegistry {
    StageRegistry::new(vec![
        StageDef::new("parse", Capability::Parse),
        StageDef::new("scan", Capability::SecurityScan).after(&["parse"]),
    ])
    .unwrap()
}

fn cancel(store: &TestStore, id: &testforge::core::ProjectId, expected: ProjectStatus) {
    store
        .store
        .update_project(
            id,
            expected,
            ProjectTransition::Cancel {
                reason: "operator request".to_string(),
            },
        )
        .unwrap();
}

/// Given a stage whose provider is still running
/// When the project is cancelled and the provider then reports success
/// Then the result is discarded and the project ends cancelled
#[tokio::test]
async fn test_result_arriving_after_cancel_is_discarded() {
    let store = TestStore::new();
    let parse = Gated::new(Capability::Parse);
    let scan = Scripted::ok(Capability::SecurityScan);
    let (mut scheduler, mut events) = observed_scheduler(
        store.store.clone(),
        gateway().with_provider(parse.clone()).with_provider(scan.clone()),
    );
    let project = store.create("cancel me", &two_stages());

    assert_eq!(scheduler.tick().await.unwrap().dispatched, 1);
    parse.started.notified().await;
    cancel(&store, &project.id, ProjectStatus::Running);

    parse.gate.notify_one();
    scheduler.drain().await.unwrap();

    let task = store.store.get_task(&project.id, &StageId::from("parse")).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.output.is_none());
    assert!(store.store.list_artifacts(&project.id).unwrap().is_empty());
    assert!(drain_events(&mut events)
        .iter()
        .any(|e| matches!(e, SchedulerEvent::ResultDiscarded { .. })));

    scheduler.run_until_idle().await.unwrap();
    let finished = store.store.get_project(&project.id).unwrap();
    assert_eq!(finished.status, ProjectStatus::Cancelled);
    assert_eq!(finished.reason.as_deref(), Some("operator request"));
    assert_eq!(parse.calls(), 1);
    assert_eq!(scan.calls(), 0);
}

#[tokio::test]
async fn test_cancel_stops_pending_retry() {
    let store = TestStore::new();
    let parse = Scripted::failing(
        Capability::Parse,
        ProviderError::Network("unreachable".to_string()),
        5,
    );
    let policy = RetryPolicy::new(5, Duration::from_secs(30), Duration::from_secs(60));
    let mut scheduler = Scheduler::new(
        store.store.clone(),
        Arc::new(gateway().with_provider(parse.clone())),
        policy,
    );
    let project = store.create("waiting", &two_stages());

    scheduler.tick().await.unwrap();
    scheduler.drain().await.unwrap();
    assert_eq!(
        store.store.get_task(&project.id, &StageId::from("parse")).unwrap().status,
        TaskStatus::Retrying
    );

    cancel(&store, &project.id, ProjectStatus::Running);
    scheduler.run_until_idle().await.unwrap();

    let tasks = store.store.list_tasks(&project.id).unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Cancelled));
    assert_eq!(parse.calls(), 1);
}

#[tokio::test]
async fn test_cancel_before_start_dispatches_nothing() {
    let store = TestStore::new();
    let parse = Scripted::ok(Capability::Parse);
    let scan = Scripted::ok(Capability::SecurityScan);
    let mut scheduler = scheduler(
        store.store.clone(),
        gateway().with_provider(parse.clone()).with_provider(scan.clone()),
    );
    let project = store.create("never started", &two_stages());

    cancel(&store, &project.id, ProjectStatus::Pending);
    scheduler.run_until_idle().await.unwrap();

    assert_eq!(parse.calls(), 0);
    assert_eq!(
        store.store.get_project(&project.id).unwrap().status,
        ProjectStatus::Cancelled
    );
}

#[tokio::test]
async fn test_finished_project_cannot_be_cancelled() {
    let store = TestStore::new();
    let mut scheduler = scheduler(
        store.store.clone(),
        gateway()
            .with_provider(Scripted::ok(Capability::Parse))
            .with_provider(Scripted::ok(Capability::SecurityScan)),
    );
    let project = store.create("done", &two_stages());
    scheduler.run_until_idle().await.unwrap();

    let err = store
        .store
        .update_project(
            &project.id,
            ProjectStatus::Completed,
            ProjectTransition::Cancel {
                reason: "too late".to_string(),
            },
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
    assert_eq!(
        store.store.get_project(&project.id).unwrap().status,
        ProjectStatus::Completed
    );
}
