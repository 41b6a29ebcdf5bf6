//! Scheduling behaviour across a full project pipeline.

use std::sync::Arc;
use std::time::Duration;

use testforge::core::{ProjectStatus, StageDef, StageId, StageRegistry, TaskStatus};
use testforge::orchestration::{
    Capability, FailureClass, ProviderError, RetryPolicy, Scheduler, SchedulerEvent,
};
use testforge::report::{self, codes};
use testforge::store::StateStore;

use crate::fixtures::{drain_events, gateway, observed_scheduler, scheduler, Scripted, TestStore};

struct Pipeline {
    parse: Arc<Scripted>,
    scan: Arc<Scripted>,
    framework: Arc<Scripted>,
    devops: Arc<Scripted>,
}

impl Pipeline {
    fn healthy() -> Self {
        Self {
            parse: Scripted::ok(Capability::Parse),
            scan: Scripted::ok(Capability::SecurityScan),
            framework: Scripted::ok(Capability::FrameworkGeneration),
            devops: Scripted::ok(Capability::DevopsGeneration),
        }
    }

    fn gateway(&self) -> testforge::orchestration::AgentGateway {
        gateway()
            .with_provider(self.parse.clone())
            .with_provider(self.scan.clone())
            .with_provider(self.framework.clone())
            .with_provider(self.devops.clone())
    }
}

fn default_registry() -> StageRegistry {
    StageRegistry::default_pipeline().unwrap()
}

fn task_status(store: &TestStore, project: &testforge::core::Project, stage: &str) -> TaskStatus {
    store
        .store
        .get_task(&project.id, &StageId::from(stage))
        .unwrap()
        .status
}

/// Given a clean API description
/// When every provider succeeds
/// Then all tasks succeed in dependency order and the project completes
#[tokio::test]
async fn test_happy_path_runs_every_stage_in_order() {
    let store = TestStore::new();
    let pipeline = Pipeline::healthy();
    let (mut scheduler, mut events) = observed_scheduler(store.store.clone(), pipeline.gateway());
    let project = store.create("Pet Store", &default_registry());

    scheduler.run_until_idle().await.unwrap();

    let summary = report::summarize(store.store.as_ref(), &project.id).unwrap();
    assert_eq!(summary.status(), ProjectStatus::Completed);
    assert_eq!(summary.progress(), (4, 4));
    assert!(!summary.degraded);
    assert_eq!(summary.exit_code(), codes::SUCCESS);
    assert!(summary.tasks.iter().all(|t| t.attempt == 1));

    let started: Vec<String> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SchedulerEvent::TaskStarted { stage_id, .. } => Some(stage_id.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(started.len(), 4);
    assert_eq!(started[0], "parse");
    assert_eq!(started[1], "security_scan");
}

#[tokio::test]
async fn test_dependency_outputs_reach_downstream_stages() {
    let store = TestStore::new();
    let pipeline = Pipeline::healthy();
    let mut scheduler = scheduler(store.store.clone(), pipeline.gateway());
    store.create("Pet Store", &default_registry());

    scheduler.run_until_idle().await.unwrap();

    let inputs = pipeline.framework.inputs();
    assert_eq!(inputs.len(), 1);
    let deps: Vec<&str> = inputs[0]
        .dependencies
        .iter()
        .map(|d| d.stage_id.as_str())
        .collect();
    assert_eq!(deps, vec!["parse", "security_scan"]);
    let parsed = inputs[0].output_of(Capability::Parse).unwrap();
    assert_eq!(parsed["stage"], "parse");
    assert!(pipeline.parse.inputs()[0].dependencies.is_empty());
}

/// Given a parse provider that times out twice
/// When the ceiling is three attempts
/// Then parse succeeds on the third attempt with no duplicate side effects
#[tokio::test]
async fn test_transient_failures_retry_then_succeed() {
    let store = TestStore::new();
    let mut pipeline = Pipeline::healthy();
    pipeline.parse = Scripted::failing(
        Capability::Parse,
        ProviderError::Timeout(Duration::from_secs(30)),
        2,
    );
    let (mut scheduler, mut events) = observed_scheduler(store.store.clone(), pipeline.gateway());
    let project = store.create("Pet Store", &default_registry());

    scheduler.run_until_idle().await.unwrap();

    let parse = store.store.get_task(&project.id, &StageId::from("parse")).unwrap();
    assert_eq!(parse.status, TaskStatus::Succeeded);
    assert_eq!(parse.attempt, 3);
    assert_eq!(pipeline.parse.calls(), 3);
    assert_eq!(
        store.store.get_project(&project.id).unwrap().status,
        ProjectStatus::Completed
    );

    let events = drain_events(&mut events);
    let retries = events
        .iter()
        .filter(|e| matches!(e, SchedulerEvent::TaskRetrying { .. }))
        .count();
    assert_eq!(retries, 2);
    let parse_successes = events
        .iter()
        .filter(|e| matches!(e, SchedulerEvent::TaskSucceeded { stage_id, .. } if stage_id.as_str() == "parse"))
        .count();
    assert_eq!(parse_successes, 1);
    assert_eq!(pipeline.scan.calls(), 1);
}

#[tokio::test]
async fn test_retry_ceiling_fails_project_with_reason() {
    let store = TestStore::new();
    let mut pipeline = Pipeline::healthy();
    pipeline.parse = Scripted::failing(
        Capability::Parse,
        ProviderError::RateLimited("429 too many requests".to_string()),
        10,
    );
    let mut scheduler = scheduler(store.store.clone(), pipeline.gateway());
    let project = store.create("Pet Store", &default_registry());

    scheduler.run_until_idle().await.unwrap();

    assert_eq!(pipeline.parse.calls(), 3);
    let summary = report::summarize(store.store.as_ref(), &project.id).unwrap();
    assert_eq!(summary.status(), ProjectStatus::Failed);
    assert_eq!(summary.exit_code(), codes::FAILED);
    let reason = summary.project.reason.clone().unwrap();
    assert!(reason.contains("parse"));
    assert!(reason.contains("3 attempt(s)"));
    assert!(reason.contains("transient_provider"));

    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].class, Some(FailureClass::TransientProvider));
    for stage in ["security_scan", "framework_generation", "devops_generation"] {
        assert_eq!(task_status(&store, &project, stage), TaskStatus::Cancelled);
    }
    assert_eq!(pipeline.scan.calls(), 0);
}

/// Given a scan that finds a blocking secret
/// When the scan stage fails
/// Then generation stages are cancelled and the project fails naming the pattern class
#[tokio::test]
async fn test_policy_violation_is_not_retried() {
    let store = TestStore::new();
    let mut pipeline = Pipeline::healthy();
    pipeline.scan = Scripted::failing(
        Capability::SecurityScan,
        ProviderError::PolicyViolation {
            pattern_class: "aws_access_key".to_string(),
            guidance: "replace the value at line 3, column 9 with ${AWS_ACCESS_KEY_ID}".to_string(),
        },
        1,
    );
    let mut scheduler = scheduler(store.store.clone(), pipeline.gateway());
    let project = store.create("Pet Store", &default_registry());

    scheduler.run_until_idle().await.unwrap();

    let scan = store
        .store
        .get_task(&project.id, &StageId::from("security_scan"))
        .unwrap();
    assert_eq!(scan.status, TaskStatus::Failed);
    assert_eq!(scan.attempt, 1);
    assert_eq!(scan.last_error_class, Some(FailureClass::PolicyViolation));

    let finished = store.store.get_project(&project.id).unwrap();
    assert_eq!(finished.status, ProjectStatus::Failed);
    assert!(finished.reason.unwrap().contains("aws_access_key"));
    assert_eq!(pipeline.framework.calls(), 0);
    assert_eq!(pipeline.devops.calls(), 0);
}

#[tokio::test]
async fn test_soft_fail_stage_leaves_project_completed_but_degraded() {
    let store = TestStore::new();
    let mut pipeline = Pipeline::healthy();
    pipeline.devops = Scripted::failing(
        Capability::DevopsGeneration,
        ProviderError::DoNotRetry("no container runtime templates".to_string()),
        1,
    );
    let mut scheduler = scheduler(store.store.clone(), pipeline.gateway());
    let project = store.create("Pet Store", &default_registry());

    scheduler.run_until_idle().await.unwrap();

    let summary = report::summarize(store.store.as_ref(), &project.id).unwrap();
    assert_eq!(summary.status(), ProjectStatus::Completed);
    assert!(summary.degraded);
    assert_eq!(summary.exit_code(), codes::SUCCESS);
    assert_eq!(summary.progress(), (3, 4));
    assert_eq!(
        task_status(&store, &project, "devops_generation"),
        TaskStatus::Failed
    );
    assert!(summary.to_string().contains("(degraded)"));
}

#[tokio::test]
async fn test_backoff_delays_next_attempt() {
    let store = TestStore::new();
    let parse = Scripted::failing(
        Capability::Parse,
        ProviderError::Timeout(Duration::from_secs(1)),
        1,
    );
    let registry = StageRegistry::new(vec![StageDef::new("parse", Capability::Parse)]).unwrap();
    let policy = RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(10));
    let mut scheduler = Scheduler::new(
        store.store.clone(),
        Arc::new(gateway().with_provider(parse.clone())),
        policy,
    );
    let project = store.create("slow", &registry);

    assert_eq!(scheduler.tick().await.unwrap().dispatched, 1);
    scheduler.drain().await.unwrap();

    let task = store.store.get_task(&project.id, &StageId::from("parse")).unwrap();
    assert_eq!(task.status, TaskStatus::Retrying);
    let retry_at = task.retry_at.unwrap();

    let tick = scheduler.tick().await.unwrap();
    assert_eq!(tick.dispatched, 0);
    assert_eq!(tick.active_projects, 1);
    assert_eq!(tick.next_retry, Some(retry_at));
    assert_eq!(parse.calls(), 1);
}

#[tokio::test]
async fn test_independent_projects_progress_together() {
    let store = TestStore::new();
    let pipeline = Pipeline::healthy();
    let mut scheduler = scheduler(store.store.clone(), pipeline.gateway()).with_concurrency(8);
    let first = store.create("first", &default_registry());
    let second = store.create("second", &default_registry());

    let tick = scheduler.tick().await.unwrap();
    assert_eq!(tick.active_projects, 2);
    assert_eq!(tick.dispatched, 2);

    scheduler.run_until_idle().await.unwrap();
    for id in [first.id, second.id] {
        assert_eq!(
            store.store.get_project(&id).unwrap().status,
            ProjectStatus::Completed
        );
    }
    assert_eq!(pipeline.parse.calls(), 2);
    assert_eq!(pipeline.framework.calls(), 2);
}
