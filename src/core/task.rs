//! Task data model.
//!
//! A task is one pipeline stage instance inside a project. Its identity is
//! the pair (project id, stage id); the stage's capability, fatality and
//! dependency list are copied from the registry when the project is created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::core::project::ProjectId;
use crate::core::registry::StageId;
use crate::error::{Error, Result};
use crate::orchestration::{Capability, FailureClass};

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies or a dispatch slot.
    #[default]
    Pending,
    /// Claimed and handed to a capability provider.
    Running,
    /// Failed transiently; eligible again once `retry_at` passes.
    Retrying,
    Succeeded,
    Failed,
    /// Never ran to completion: cancelled or skipped.
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Retrying,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `target` is a legal lifecycle step.
    ///
    /// `Running -> Pending` exists only for crash recovery.
    pub fn can_transition(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Retrying)
                | (Running, Failed)
                | (Running, Pending)
                | (Running, Cancelled)
                | (Retrying, Running)
                | (Retrying, Cancelled)
        )
    }

    /// Validate a transition, returning `InvalidTransition` when illegal.
    pub fn check_transition(&self, target: TaskStatus) -> Result<()> {
        if self.can_transition(target) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown task status '{}'", s)))
    }
}

/// A single pipeline stage instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub project_id: ProjectId,
    pub stage_id: StageId,
    /// Topological position within the project's pipeline.
    pub position: u32,
    pub capability: Capability,
    /// Failure of a fatal stage fails the whole project.
    pub fatal: bool,
    pub depends_on: Vec<StageId>,
    pub status: TaskStatus,
    /// Number of times the task has been claimed into `Running`.
    pub attempt: u32,
    pub last_error_class: Option<FailureClass>,
    pub last_error: Option<String>,
    /// Why the scheduler cancelled, skipped, or reset the task.
    pub note: Option<String>,
    /// Provider result, opaque to the scheduler.
    pub output: Option<serde_json::Value>,
    pub retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Claimed at or before `cutoff`. A claim without a start time counts.
    pub fn claimed_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.started_at.map_or(true, |at| at <= cutoff)
    }

    /// Claimable now: pending, or retrying with its backoff elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending => true,
            TaskStatus::Retrying => self.retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }
}
