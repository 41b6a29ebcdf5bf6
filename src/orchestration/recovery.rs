//! Recovery for tasks orphaned in `Running`.
//!
//! A claim is a lease: a live dispatch records its result within the agent
//! timeout, so a task still `Running` after the lease expired belongs to a
//! process that died. Each one is reset to `Pending` while attempts remain,
//! failed once the ceiling is reached, or cancelled if its project already
//! finished. Younger claims and the caller's own dispatches are left alone.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::core::project::ProjectId;
use crate::core::registry::StageId;
use crate::core::task::TaskStatus;
use crate::orchestration::retry::RetryPolicy;
use crate::orchestration::FailureClass;
use crate::store::{StateStore, TaskTransition};
use crate::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reset: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.reset + self.failed + self.cancelled
    }
}

/// Recover every `Running` task claimed at or before `cutoff` that is not
/// in `owned`.
pub fn recover(
    store: &dyn StateStore,
    policy: &RetryPolicy,
    cutoff: DateTime<Utc>,
    owned: &HashSet<(ProjectId, StageId)>,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    for task in store.list_running_tasks()? {
        if owned.contains(&(task.project_id, task.stage_id.clone())) {
            continue;
        }
        if !task.claimed_before(cutoff) {
            debug!(
                project = %task.project_id,
                stage = %task.stage_id,
                attempt = task.attempt,
                "claim still within its lease"
            );
            continue;
        }
        let project = store.get_project(&task.project_id)?;
        let transition = if project.status.is_terminal() {
            TaskTransition::Cancel {
                reason: format!("project already {}", project.status),
            }
        } else if policy.has_attempts_left(task.attempt) {
            TaskTransition::Reset
        } else {
            TaskTransition::Fail {
                class: FailureClass::TransientProvider,
                message: format!(
                    "interrupted during attempt {} of {}",
                    task.attempt,
                    policy.max_attempts()
                ),
            }
        };

        let target = transition.target();
        match store.update_claimed_task(&task.project_id, &task.stage_id, task.attempt, transition) {
            Ok(_) => {}
            Err(e) if e.is_stale() => continue,
            Err(e) => return Err(e),
        }
        match target {
            TaskStatus::Pending => {
                report.reset += 1;
                info!(
                    project = %task.project_id,
                    stage = %task.stage_id,
                    attempt = task.attempt,
                    "reset interrupted task"
                );
            }
            TaskStatus::Failed => {
                report.failed += 1;
                warn!(
                    project = %task.project_id,
                    stage = %task.stage_id,
                    attempt = task.attempt,
                    "interrupted task exhausted its attempts"
                );
            }
            _ => report.cancelled += 1,
        }
    }
    Ok(report)
}
