//! Scheduler for dependency-aware task execution.
//!
//! Each iteration reloads every non-terminal project from the state store,
//! settles tasks that can never run, finishes projects whose tasks are all
//! terminal, and claims ready tasks with compare-and-swap before handing
//! them to the agent gateway. No orchestration state lives only in memory:
//! the set of in-flight dispatches is the one thing held here, and losing
//! it (a crash) is handled by [`recover`](Scheduler::recover) once the
//! claim's lease runs out.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{Id as JoinId, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::project::{Project, ProjectId, ProjectStatus};
use crate::core::registry::StageId;
use crate::core::task::{Task, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::gateway::{
    AgentGateway, AgentInput, AgentOutcome, DependencyOutput, Failure, FailureClass,
};
use crate::orchestration::recovery::{self, RecoveryReport};
use crate::orchestration::retry::{RetryDecision, RetryPolicy};
use crate::store::{ProjectTransition, StateStore, TaskTransition};
use crate::util::blocking;

/// Slack on top of the agent timeout before a claim counts as abandoned.
const RECOVERY_GRACE: Duration = Duration::from_secs(30);

/// Events emitted by the scheduler for task lifecycle changes.
///
/// Advisory only: events are dropped when the receiver falls behind.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    TaskStarted {
        project_id: ProjectId,
        stage_id: StageId,
        attempt: u32,
    },
    TaskSucceeded {
        project_id: ProjectId,
        stage_id: StageId,
        attempt: u32,
    },
    TaskRetrying {
        project_id: ProjectId,
        stage_id: StageId,
        attempt: u32,
        delay: Duration,
        failure: Failure,
    },
    TaskFailed {
        project_id: ProjectId,
        stage_id: StageId,
        attempt: u32,
        failure: Failure,
    },
    /// A result arrived for a task someone else already moved on.
    ResultDiscarded {
        project_id: ProjectId,
        stage_id: StageId,
    },
    ProjectFinished {
        project_id: ProjectId,
        status: ProjectStatus,
    },
}

/// What one pass over the active projects did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSummary {
    pub active_projects: usize,
    pub dispatched: usize,
    /// Earliest backoff deadline among retrying tasks.
    pub next_retry: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    store: Arc<dyn StateStore>,
    gateway: Arc<AgentGateway>,
    policy: RetryPolicy,
    max_concurrent: usize,
    poll_interval: Duration,
    recovery_lease: Duration,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
    in_flight: JoinSet<AgentOutcome>,
    /// Task snapshot (as claimed) for each running dispatch.
    dispatched: HashMap<JoinId, Task>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn StateStore>, gateway: Arc<AgentGateway>, policy: RetryPolicy) -> Self {
        let recovery_lease = gateway.timeout() + RECOVERY_GRACE;
        Self {
            store,
            gateway,
            policy,
            max_concurrent: 4,
            poll_interval: Duration::from_millis(500),
            recovery_lease,
            event_tx: None,
            in_flight: JoinSet::new(),
            dispatched: HashMap::new(),
        }
    }

    pub fn from_config(store: Arc<dyn StateStore>, gateway: Arc<AgentGateway>, config: &Config) -> Self {
        Self::new(store, gateway, RetryPolicy::from_config(&config.retry))
            .with_concurrency(config.scheduler.max_concurrent_dispatches)
            .with_poll_interval(config.scheduler.poll_interval())
    }

    pub fn with_concurrency(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// How long a claim may stay `Running` before [`recover`](Self::recover)
    /// treats its owner as dead.
    pub fn with_recovery_lease(mut self, lease: Duration) -> Self {
        self.recovery_lease = lease;
        self
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Number of dispatches currently awaiting a provider.
    pub fn active_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Reset or finalize tasks a dead process left in `Running`.
    ///
    /// Only claims older than the recovery lease are touched, never this
    /// scheduler's own dispatches. Every [`tick`](Self::tick) starts with it.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let policy = self.policy;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.recovery_lease).unwrap_or_else(|_| chrono::Duration::zero());
        let owned: HashSet<(ProjectId, StageId)> = self
            .dispatched
            .values()
            .map(|t| (t.project_id, t.stage_id.clone()))
            .collect();
        let report = self
            .with_store(move |s| recovery::recover(s, &policy, cutoff, &owned))
            .await?;
        if report.total() > 0 {
            info!(
                reset = report.reset,
                failed = report.failed,
                cancelled = report.cancelled,
                "recovered interrupted tasks"
            );
        }
        Ok(report)
    }

    /// Drive every active project until none is left.
    pub async fn run_until_idle(&mut self) -> Result<()> {
        self.run(CancellationToken::new(), true).await
    }

    /// Main loop.
    ///
    /// Stops when `shutdown` fires, or, with `stop_when_idle`, once no
    /// project is active and nothing is in flight. In-flight dispatches
    /// are always awaited and recorded before returning.
    pub async fn run(&mut self, shutdown: CancellationToken, stop_when_idle: bool) -> Result<()> {
        loop {
            let tick = self.tick().await?;
            if stop_when_idle && tick.active_projects == 0 && self.in_flight.is_empty() {
                debug!("no active projects, scheduler idle");
                break;
            }

            let wait = self.wait_duration(&tick);
            tokio::select! {
                Some(joined) = self.in_flight.join_next_with_id(), if !self.in_flight.is_empty() => {
                    self.handle_joined(joined).await?;
                }
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.cancelled() => {
                    info!(in_flight = self.in_flight.len(), "shutdown requested");
                    break;
                }
            }
        }
        self.drain().await
    }

    /// Wait for every in-flight dispatch and record its result.
    pub async fn drain(&mut self) -> Result<()> {
        while let Some(joined) = self.in_flight.join_next_with_id().await {
            self.handle_joined(joined).await?;
        }
        Ok(())
    }

    /// One pass over all active projects.
    pub async fn tick(&mut self) -> Result<TickSummary> {
        self.recover().await?;
        let projects = self.with_store(|s| s.list_active_projects()).await?;
        let mut summary = TickSummary::default();
        for project in projects {
            if self.advance_project(project, &mut summary).await? {
                summary.active_projects += 1;
            }
        }
        Ok(summary)
    }

    fn wait_duration(&self, tick: &TickSummary) -> Duration {
        match tick.next_retry {
            Some(at) => (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.poll_interval),
            None => self.poll_interval,
        }
    }

    /// Returns whether the project is still active afterwards.
    async fn advance_project(&mut self, mut project: Project, summary: &mut TickSummary) -> Result<bool> {
        let id = project.id;
        let tasks = self.with_store(move |s| s.list_tasks(&id)).await?;
        let mut statuses: HashMap<StageId, TaskStatus> = tasks
            .iter()
            .map(|t| (t.stage_id.clone(), t.status))
            .collect();

        if let Some(failed) = tasks
            .iter()
            .find(|t| t.fatal && t.status == TaskStatus::Failed)
        {
            let reason = failure_reason(failed);
            self.finish_project(&project, ProjectTransition::Fail { reason })
                .await?;
            return Ok(false);
        }

        // Tasks whose dependencies can no longer succeed are skipped, or
        // fail the project when the stage is fatal.
        for task in &tasks {
            let current = statuses[&task.stage_id];
            if !matches!(current, TaskStatus::Pending | TaskStatus::Retrying) {
                continue;
            }
            let Some(blocker) = task.depends_on.iter().find(|dep| {
                !matches!(
                    statuses.get(*dep),
                    Some(TaskStatus::Pending | TaskStatus::Running | TaskStatus::Retrying | TaskStatus::Succeeded)
                )
            }) else {
                continue;
            };

            if task.fatal {
                let reason = format!(
                    "stage '{}' cannot run: dependency '{}' did not succeed",
                    task.stage_id, blocker
                );
                self.finish_project(&project, ProjectTransition::Fail { reason })
                    .await?;
                return Ok(false);
            }

            let reason = format!("skipped: dependency '{}' did not succeed", blocker);
            let stage = task.stage_id.clone();
            match self
                .with_store(move |s| s.update_task(&id, &stage, current, TaskTransition::Cancel { reason }))
                .await
            {
                Ok(_) => {
                    info!(project = %id, stage = %task.stage_id, blocker = %blocker, "skipped task");
                    statuses.insert(task.stage_id.clone(), TaskStatus::Cancelled);
                }
                Err(e) if e.is_stale() => {}
                Err(e) => return Err(e),
            }
        }

        if statuses.values().all(|s| s.is_terminal()) {
            self.finish_project(&project, ProjectTransition::Complete)
                .await?;
            return Ok(false);
        }

        let now = Utc::now();
        let by_stage: HashMap<&StageId, &Task> = tasks.iter().map(|t| (&t.stage_id, t)).collect();
        for task in &tasks {
            if statuses[&task.stage_id] == TaskStatus::Retrying && !task.is_due(now) {
                if let Some(at) = task.retry_at {
                    summary.next_retry = Some(summary.next_retry.map_or(at, |n| n.min(at)));
                }
                continue;
            }
            if statuses[&task.stage_id] != task.status || !task.is_due(now) {
                continue;
            }
            let deps_done = task
                .depends_on
                .iter()
                .all(|dep| statuses.get(dep) == Some(&TaskStatus::Succeeded));
            if !deps_done || self.is_in_flight(&task.project_id, &task.stage_id) {
                continue;
            }
            if self.in_flight.len() >= self.max_concurrent {
                debug!(project = %id, "dispatch capacity reached");
                break;
            }

            let Some(claimed) = self.claim(task).await? else {
                continue;
            };
            statuses.insert(claimed.stage_id.clone(), TaskStatus::Running);

            if project.status == ProjectStatus::Pending {
                match self
                    .with_store(move |s| s.update_project(&id, ProjectStatus::Pending, ProjectTransition::Start))
                    .await
                {
                    Ok(updated) => project = updated,
                    Err(e) if e.is_stale() => {}
                    Err(e) => return Err(e),
                }
            }

            let input = AgentInput {
                project_id: id,
                project_name: project.name.clone(),
                stage_id: claimed.stage_id.clone(),
                attempt: claimed.attempt,
                config: project.config.clone(),
                dependencies: claimed
                    .depends_on
                    .iter()
                    .filter_map(|dep| by_stage.get(dep))
                    .map(|dep| DependencyOutput {
                        stage_id: dep.stage_id.clone(),
                        capability: dep.capability,
                        output: dep.output.clone().unwrap_or(serde_json::Value::Null),
                    })
                    .collect(),
            };
            self.dispatch(claimed, input);
            summary.dispatched += 1;
        }

        Ok(true)
    }

    /// CAS the task into `Running`. `None` means another worker won.
    async fn claim(&self, task: &Task) -> Result<Option<Task>> {
        let (id, stage, expected) = (task.project_id, task.stage_id.clone(), task.status);
        match self
            .with_store(move |s| s.update_task(&id, &stage, expected, TaskTransition::Claim))
            .await
        {
            Ok(claimed) => Ok(Some(claimed)),
            Err(e) if e.is_stale() => {
                debug!(project = %task.project_id, stage = %task.stage_id, "claim lost to another worker");
                Ok(None)
            }
            Err(Error::DependencyNotSatisfied { dependency, .. }) => {
                debug!(project = %task.project_id, stage = %task.stage_id, %dependency, "dependency not ready");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn dispatch(&mut self, task: Task, input: AgentInput) {
        info!(
            project = %task.project_id,
            stage = %task.stage_id,
            attempt = task.attempt,
            capability = %task.capability,
            "dispatching task"
        );
        self.emit(SchedulerEvent::TaskStarted {
            project_id: task.project_id,
            stage_id: task.stage_id.clone(),
            attempt: task.attempt,
        });
        let gateway = Arc::clone(&self.gateway);
        let capability = task.capability;
        let handle = self
            .in_flight
            .spawn(async move { gateway.invoke(capability, &input).await });
        self.dispatched.insert(handle.id(), task);
    }

    fn is_in_flight(&self, project_id: &ProjectId, stage_id: &StageId) -> bool {
        self.dispatched
            .values()
            .any(|t| &t.project_id == project_id && &t.stage_id == stage_id)
    }

    async fn handle_joined(&mut self, joined: std::result::Result<(JoinId, AgentOutcome), JoinError>) -> Result<()> {
        let (join_id, outcome) = match joined {
            Ok(done) => done,
            Err(e) => {
                let failure = Failure::new(
                    FailureClass::TransientProvider,
                    format!("provider task aborted: {}", e),
                );
                (e.id(), AgentOutcome::Retryable(failure))
            }
        };
        let Some(task) = self.dispatched.remove(&join_id) else {
            warn!(?join_id, "result for unknown dispatch");
            return Ok(());
        };
        self.handle_outcome(task, outcome).await
    }

    /// Record a gateway outcome for a task this scheduler dispatched.
    pub async fn handle_outcome(&mut self, task: Task, outcome: AgentOutcome) -> Result<()> {
        match outcome {
            AgentOutcome::Success(output) => {
                let transition = TaskTransition::Succeed {
                    output: output.payload,
                    artifacts: output.artifacts,
                };
                if self.apply(&task, transition).await?.is_some() {
                    info!(project = %task.project_id, stage = %task.stage_id, attempt = task.attempt, "task succeeded");
                    self.emit(SchedulerEvent::TaskSucceeded {
                        project_id: task.project_id,
                        stage_id: task.stage_id.clone(),
                        attempt: task.attempt,
                    });
                }
                Ok(())
            }
            AgentOutcome::Retryable(failure) => match self.policy.decide(failure.class, task.attempt) {
                RetryDecision::Wait(delay) => self.schedule_retry(task, failure, delay).await,
                RetryDecision::GiveUp => self.fail_task(task, failure).await,
            },
            AgentOutcome::Fatal(failure) => self.fail_task(task, failure).await,
        }
    }

    async fn schedule_retry(&mut self, task: Task, failure: Failure, delay: Duration) -> Result<()> {
        let id = task.project_id;
        let project = self.with_store(move |s| s.get_project(&id)).await?;
        if project.status.is_terminal() {
            let reason = format!("project already {}", project.status);
            self.apply(&task, TaskTransition::Cancel { reason }).await?;
            return Ok(());
        }

        let retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let transition = TaskTransition::Retry {
            class: failure.class,
            message: failure.message.clone(),
            retry_at,
        };
        if self.apply(&task, transition).await?.is_some() {
            warn!(
                project = %task.project_id,
                stage = %task.stage_id,
                attempt = task.attempt,
                class = %failure.class,
                delay_ms = delay.as_millis() as u64,
                "task will be retried"
            );
            self.emit(SchedulerEvent::TaskRetrying {
                project_id: task.project_id,
                stage_id: task.stage_id.clone(),
                attempt: task.attempt,
                delay,
                failure,
            });
        }
        Ok(())
    }

    async fn fail_task(&mut self, task: Task, failure: Failure) -> Result<()> {
        let transition = TaskTransition::Fail {
            class: failure.class,
            message: failure.message.clone(),
        };
        let Some(failed) = self.apply(&task, transition).await? else {
            return Ok(());
        };
        warn!(
            project = %task.project_id,
            stage = %task.stage_id,
            attempt = task.attempt,
            class = %failure.class,
            fatal = task.fatal,
            "task failed"
        );
        self.emit(SchedulerEvent::TaskFailed {
            project_id: task.project_id,
            stage_id: task.stage_id.clone(),
            attempt: task.attempt,
            failure,
        });

        if failed.fatal {
            let id = failed.project_id;
            let project = self.with_store(move |s| s.get_project(&id)).await?;
            let reason = failure_reason(&failed);
            self.finish_project(&project, ProjectTransition::Fail { reason })
                .await?;
        }
        Ok(())
    }

    /// Apply a transition to the claim `task` was dispatched under; `None`
    /// when the task has since moved on.
    async fn apply(&self, task: &Task, transition: TaskTransition) -> Result<Option<Task>> {
        let (id, stage, attempt) = (task.project_id, task.stage_id.clone(), task.attempt);
        match self
            .with_store(move |s| s.update_claimed_task(&id, &stage, attempt, transition))
            .await
        {
            Ok(updated) => Ok(Some(updated)),
            Err(e) if e.is_stale() => {
                info!(project = %task.project_id, stage = %task.stage_id, "discarding stale result");
                self.emit(SchedulerEvent::ResultDiscarded {
                    project_id: task.project_id,
                    stage_id: task.stage_id.clone(),
                });
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn finish_project(&self, project: &Project, transition: ProjectTransition) -> Result<()> {
        if project.status.is_terminal() {
            return Ok(());
        }
        let (id, expected) = (project.id, project.status);
        match self
            .with_store(move |s| s.update_project(&id, expected, transition))
            .await
        {
            Ok(finished) => {
                info!(
                    project = %finished.id,
                    status = %finished.status,
                    reason = finished.reason.as_deref().unwrap_or(""),
                    "project finished"
                );
                self.emit(SchedulerEvent::ProjectFinished {
                    project_id: finished.id,
                    status: finished.status,
                });
                Ok(())
            }
            Err(e) if e.is_stale() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            if tx.try_send(event).is_err() {
                debug!("scheduler event dropped");
            }
        }
    }

    /// Run a store call off the async workers.
    async fn with_store<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn StateStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        blocking(move || f(store.as_ref())).await
    }
}

/// User-facing reason for a failed task: stage, attempts, class, message.
pub fn failure_reason(task: &Task) -> String {
    format!(
        "stage '{}' failed after {} attempt(s) [{}]: {}",
        task.stage_id,
        task.attempt,
        task.last_error_class
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        task.last_error.as_deref().unwrap_or("no error recorded")
    )
}
