//! Durable state store contract.
//!
//! The store is the only place orchestration state lives. Task updates are
//! compare-and-swap on (project id, stage id, expected status); losing the
//! race yields [`Error::StaleTransition`](crate::Error::StaleTransition).

mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::project::{Project, ProjectConfig, ProjectId, ProjectStatus};
use crate::core::registry::{StageId, StageRegistry};
use crate::core::task::{Task, TaskStatus};
use crate::orchestration::{Artifact, FailureClass};
use crate::Result;

/// A task state change applied with compare-and-swap.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskTransition {
    /// Pending or Retrying to Running. Increments the attempt counter and
    /// requires every dependency to have succeeded.
    Claim,
    Succeed {
        output: serde_json::Value,
        artifacts: Vec<Artifact>,
    },
    Retry {
        class: FailureClass,
        message: String,
        retry_at: DateTime<Utc>,
    },
    Fail {
        class: FailureClass,
        message: String,
    },
    /// Running back to Pending after the worker died. Keeps the attempt count.
    Reset,
    Cancel {
        reason: String,
    },
}

impl TaskTransition {
    pub fn target(&self) -> TaskStatus {
        match self {
            TaskTransition::Claim => TaskStatus::Running,
            TaskTransition::Succeed { .. } => TaskStatus::Succeeded,
            TaskTransition::Retry { .. } => TaskStatus::Retrying,
            TaskTransition::Fail { .. } => TaskStatus::Failed,
            TaskTransition::Reset => TaskStatus::Pending,
            TaskTransition::Cancel { .. } => TaskStatus::Cancelled,
        }
    }
}

/// A project state change applied with compare-and-swap.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectTransition {
    Start,
    Complete,
    /// Also cancels every Pending and Retrying task in the same transaction.
    Fail { reason: String },
    /// Also cancels every non-terminal task, Running ones included.
    Cancel { reason: String },
}

impl ProjectTransition {
    pub fn target(&self) -> ProjectStatus {
        match self {
            ProjectTransition::Start => ProjectStatus::Running,
            ProjectTransition::Complete => ProjectStatus::Completed,
            ProjectTransition::Fail { .. } => ProjectStatus::Failed,
            ProjectTransition::Cancel { .. } => ProjectStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub stage_id: StageId,
    pub path: String,
    pub description: String,
    pub recorded_at: DateTime<Utc>,
}

/// Row counts by status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub projects: BTreeMap<String, usize>,
    pub tasks: BTreeMap<String, usize>,
    pub artifacts: usize,
}

impl StoreStats {
    pub fn total_projects(&self) -> usize {
        self.projects.values().sum()
    }

    pub fn total_tasks(&self) -> usize {
        self.tasks.values().sum()
    }
}

pub trait StateStore: Send + Sync {
    /// Create a project and one Pending task per registry stage, atomically.
    fn create_project(
        &self,
        name: &str,
        config: &ProjectConfig,
        registry: &StageRegistry,
    ) -> Result<Project>;

    fn get_project(&self, id: &ProjectId) -> Result<Project>;

    /// Resolve a full id or a unique id prefix.
    fn find_project(&self, id_or_prefix: &str) -> Result<Project>;

    /// All projects, newest first.
    fn list_projects(&self) -> Result<Vec<Project>>;

    /// Projects not yet Completed, Failed or Cancelled, oldest first.
    fn list_active_projects(&self) -> Result<Vec<Project>>;

    /// Tasks of a project in pipeline order.
    fn list_tasks(&self, id: &ProjectId) -> Result<Vec<Task>>;

    fn get_task(&self, id: &ProjectId, stage: &StageId) -> Result<Task>;

    /// Every task currently marked Running, across all projects.
    fn list_running_tasks(&self) -> Result<Vec<Task>>;

    fn list_artifacts(&self, id: &ProjectId) -> Result<Vec<ArtifactRecord>>;

    fn update_task(
        &self,
        id: &ProjectId,
        stage: &StageId,
        expected: TaskStatus,
        transition: TaskTransition,
    ) -> Result<Task>;

    /// Record the outcome of one claim. The task must still be Running on
    /// `attempt`; a result from an older claim is a stale transition.
    fn update_claimed_task(
        &self,
        id: &ProjectId,
        stage: &StageId,
        attempt: u32,
        transition: TaskTransition,
    ) -> Result<Task>;

    fn update_project(
        &self,
        id: &ProjectId,
        expected: ProjectStatus,
        transition: ProjectTransition,
    ) -> Result<Project>;

    fn delete_project(&self, id: &ProjectId) -> Result<()>;

    /// Remove terminal projects that finished before `cutoff`.
    fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn statistics(&self) -> Result<StoreStats>;
}
