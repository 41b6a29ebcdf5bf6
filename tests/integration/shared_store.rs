//! Several schedulers claiming work from one database.

use futures::future::join_all;
use std::sync::Barrier;
use std::time::Duration;

use testforge::core::{ProjectStatus, StageDef, StageId, StageRegistry, TaskStatus};
use testforge::orchestration::{Capability, SchedulerEvent};
use testforge::store::{StateStore, TaskTransition};

use crate::fixtures::{
    drain_events, gateway, observed_scheduler, scheduler, Gated, Scripted, TestStore,
};

fn two_stages() -> StageRegistry {
    StageRegistry::new(vec![
        StageDef::new("parse", Capability::Parse),
        StageDef::new("scan", Capability::SecurityScan).after(&["parse"]),
    ])
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_schedulers_run_each_task_once() {
    let store = TestStore::new();
    let projects: Vec<_> = (0..6)
        .map(|i| store.create(&format!("project-{}", i), &two_stages()))
        .collect();

    let providers: Vec<_> = (0..3)
        .map(|_| (Scripted::ok(Capability::Parse), Scripted::ok(Capability::SecurityScan)))
        .collect();
    let mut schedulers: Vec<_> = providers
        .iter()
        .map(|(parse, scan)| {
            scheduler(
                store.reopen(),
                gateway().with_provider(parse.clone()).with_provider(scan.clone()),
            )
            .with_concurrency(2)
        })
        .collect();

    for result in join_all(schedulers.iter_mut().map(|s| s.run_until_idle())).await {
        result.unwrap();
    }

    let total_calls: u32 = providers
        .iter()
        .map(|(parse, scan)| parse.calls() + scan.calls())
        .sum();
    assert_eq!(total_calls, 12);
    for project in &projects {
        assert_eq!(
            store.store.get_project(&project.id).unwrap().status,
            ProjectStatus::Completed
        );
        for task in store.store.list_tasks(&project.id).unwrap() {
            assert_eq!(task.status, TaskStatus::Succeeded);
            assert_eq!(task.attempt, 1);
        }
    }
}

#[test]
fn test_concurrent_claims_have_one_winner() {
    let store = TestStore::new();
    let project = store.create("contested", &two_stages());
    let parse = StageId::from("parse");
    let barrier = Barrier::new(4);

    let winners = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let connection = store.reopen();
                let (barrier, parse, id) = (&barrier, &parse, project.id);
                scope.spawn(move || {
                    barrier.wait();
                    connection.update_task(&id, parse, TaskStatus::Pending, TaskTransition::Claim)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|result| match result {
                Ok(_) => true,
                Err(e) => {
                    assert!(e.is_stale(), "unexpected error: {}", e);
                    false
                }
            })
            .count()
    });

    assert_eq!(winners, 1);
    let task = store.store.get_task(&project.id, &parse).unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.attempt, 1);
}

#[tokio::test]
async fn test_recovery_leaves_live_dispatch_alone() {
    let store = TestStore::new();
    let project = store.create("busy", &two_stages());
    let parse = StageId::from("parse");

    let held = Gated::new(Capability::Parse);
    let mut owner = scheduler(store.store.clone(), gateway().with_provider(held.clone()));
    assert_eq!(owner.tick().await.unwrap().dispatched, 1);
    held.started.notified().await;

    let other_parse = Scripted::ok(Capability::Parse);
    let mut other = scheduler(store.reopen(), gateway().with_provider(other_parse.clone()));
    assert_eq!(other.recover().await.unwrap().total(), 0);
    assert_eq!(other.tick().await.unwrap().dispatched, 0);
    let task = store.store.get_task(&project.id, &parse).unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.attempt, 1);

    held.gate.notify_one();
    owner.drain().await.unwrap();

    let task = store.store.get_task(&project.id, &parse).unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.attempt, 1);
    assert_eq!(held.calls() + other_parse.calls(), 1);
}

#[tokio::test]
async fn test_late_result_after_takeover_is_discarded() {
    let store = TestStore::new();
    let project = store.create("slow owner", &two_stages());
    let parse = StageId::from("parse");

    let held = Gated::new(Capability::Parse);
    let (mut owner, mut events) =
        observed_scheduler(store.store.clone(), gateway().with_provider(held.clone()));
    owner.tick().await.unwrap();
    held.started.notified().await;

    // The other scheduler treats every claim as expired and takes parse over.
    let taken = Gated::new(Capability::Parse);
    let mut other = scheduler(store.reopen(), gateway().with_provider(taken.clone()))
        .with_recovery_lease(Duration::ZERO);
    assert_eq!(other.tick().await.unwrap().dispatched, 1);
    taken.started.notified().await;

    held.gate.notify_one();
    owner.drain().await.unwrap();
    assert!(drain_events(&mut events).contains(&SchedulerEvent::ResultDiscarded {
        project_id: project.id,
        stage_id: parse.clone(),
    }));
    let task = store.store.get_task(&project.id, &parse).unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.attempt, 2);
    assert!(task.output.is_none());

    taken.gate.notify_one();
    other.drain().await.unwrap();
    let task = store.store.get_task(&project.id, &parse).unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.attempt, 2);
    assert_eq!(held.calls() + taken.calls(), 2);
}
