//! Lifecycle reporting.
//!
//! Every function here only reads from the store, so it can run alongside a
//! scheduler in another process at any time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::core::project::{Project, ProjectId, ProjectStatus};
use crate::core::registry::StageId;
use crate::core::task::{Task, TaskStatus};
use crate::orchestration::{Capability, FailureClass};
use crate::store::{ArtifactRecord, StateStore, StoreStats};
use crate::{Error, Result};

/// Process exit codes for the command line.
pub mod codes {
    /// Completed project, or any command that succeeded.
    pub const SUCCESS: i32 = 0;
    pub const FAILED: i32 = 1;
    pub const CANCELLED: i32 = 2;
    /// The project has not reached a terminal status yet.
    pub const IN_PROGRESS: i32 = 3;
    /// Bad arguments, configuration, or an unknown project.
    pub const USAGE: i32 = 10;
}

pub fn exit_code(status: ProjectStatus) -> i32 {
    match status {
        ProjectStatus::Completed => codes::SUCCESS,
        ProjectStatus::Failed => codes::FAILED,
        ProjectStatus::Cancelled => codes::CANCELLED,
        ProjectStatus::Pending | ProjectStatus::Running => codes::IN_PROGRESS,
    }
}

pub fn error_exit_code(error: &Error) -> i32 {
    match error {
        Error::Validation(_)
        | Error::CycleDetected { .. }
        | Error::ProjectNotFound(_)
        | Error::AmbiguousProject(_)
        | Error::TomlParse(_)
        | Error::NoHomeDir => codes::USAGE,
        _ => codes::FAILED,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub stage_id: StageId,
    pub capability: Capability,
    pub fatal: bool,
    pub status: TaskStatus,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

/// Why a task failed, with enough context to act on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReason {
    pub stage_id: StageId,
    pub attempt: u32,
    pub class: Option<FailureClass>,
    pub message: String,
    pub fatal: bool,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = self.class.map(|c| c.as_str()).unwrap_or("unknown");
        write!(
            f,
            "{} (attempt {}, {}{}): {}",
            self.stage_id,
            self.attempt,
            class,
            if self.fatal { "" } else { ", soft" },
            self.message
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectSummary {
    pub project: Project,
    pub tasks: Vec<TaskSummary>,
    pub failures: Vec<FailureReason>,
    /// Completed, but at least one soft-fail stage failed or was skipped.
    pub degraded: bool,
    pub artifacts: Vec<ArtifactRecord>,
}

impl ProjectSummary {
    pub fn status(&self) -> ProjectStatus {
        self.project.status
    }

    pub fn exit_code(&self) -> i32 {
        exit_code(self.project.status)
    }

    /// (succeeded, total)
    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Succeeded)
            .count();
        (done, self.tasks.len())
    }
}

impl fmt::Display for ProjectSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (done, total) = self.progress();
        writeln!(f, "Project:  {} ({})", self.project.name, self.project.id)?;
        write!(f, "Status:   {}", self.project.status)?;
        if self.degraded {
            write!(f, " (degraded)")?;
        }
        writeln!(f)?;
        writeln!(f, "Progress: {}/{} stages succeeded", done, total)?;
        if let Some(reason) = &self.project.reason {
            writeln!(f, "Reason:   {}", reason)?;
        }

        writeln!(f, "\nStages:")?;
        for task in &self.tasks {
            write!(
                f,
                "  {:<24} {:<10} attempt {}",
                task.stage_id.as_str(),
                task.status.as_str(),
                task.attempt
            )?;
            if let Some(at) = task.retry_at.filter(|_| task.status == TaskStatus::Retrying) {
                write!(f, "  next try {}", at.format("%H:%M:%S"))?;
            }
            if let Some(note) = &task.note {
                write!(f, "  ({})", note)?;
            }
            writeln!(f)?;
        }

        if !self.failures.is_empty() {
            writeln!(f, "\nFailures:")?;
            for failure in &self.failures {
                writeln!(f, "  {}", failure)?;
            }
        }
        if !self.artifacts.is_empty() {
            writeln!(f, "\nArtifacts: {}", self.artifacts.len())?;
            for artifact in &self.artifacts {
                writeln!(f, "  [{}] {}", artifact.stage_id, artifact.path)?;
            }
        }
        Ok(())
    }
}

fn task_summary(task: &Task) -> TaskSummary {
    TaskSummary {
        stage_id: task.stage_id.clone(),
        capability: task.capability,
        fatal: task.fatal,
        status: task.status,
        attempt: task.attempt,
        note: task.note.clone(),
        retry_at: task.retry_at,
    }
}

/// Failures worth reporting: failed tasks, plus retrying ones so an
/// operator can see why progress is slow.
fn failure_reasons(tasks: &[Task]) -> Vec<FailureReason> {
    tasks
        .iter()
        .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Retrying))
        .filter_map(|t| {
            Some(FailureReason {
                stage_id: t.stage_id.clone(),
                attempt: t.attempt,
                class: t.last_error_class,
                message: t.last_error.clone()?,
                fatal: t.fatal,
            })
        })
        .collect()
}

pub fn summarize(store: &dyn StateStore, id: &ProjectId) -> Result<ProjectSummary> {
    let project = store.get_project(id)?;
    build_summary(store, project)
}

/// Like [`summarize`], accepting a unique id prefix.
pub fn summarize_prefix(store: &dyn StateStore, id_or_prefix: &str) -> Result<ProjectSummary> {
    let project = store.find_project(id_or_prefix)?;
    build_summary(store, project)
}

fn build_summary(store: &dyn StateStore, project: Project) -> Result<ProjectSummary> {
    let tasks = store.list_tasks(&project.id)?;
    let artifacts = store.list_artifacts(&project.id)?;
    let degraded = project.status == ProjectStatus::Completed
        && tasks.iter().any(|t| t.status != TaskStatus::Succeeded);
    Ok(ProjectSummary {
        failures: failure_reasons(&tasks),
        tasks: tasks.iter().map(task_summary).collect(),
        degraded,
        artifacts,
        project,
    })
}

/// One line per project for `list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectOverview {
    pub id: ProjectId,
    pub name: String,
    pub status: ProjectStatus,
    pub succeeded: usize,
    pub total: usize,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for ProjectOverview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  {:<10} {}/{}  {}  {}",
            self.id.short(),
            self.status.as_str(),
            self.succeeded,
            self.total,
            self.created_at.format("%Y-%m-%d %H:%M"),
            self.name
        )
    }
}

pub fn overview(store: &dyn StateStore) -> Result<Vec<ProjectOverview>> {
    store
        .list_projects()?
        .into_iter()
        .map(|project| {
            let tasks = store.list_tasks(&project.id)?;
            Ok(ProjectOverview {
                succeeded: tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Succeeded)
                    .count(),
                total: tasks.len(),
                id: project.id,
                name: project.name,
                status: project.status,
                created_at: project.created_at,
            })
        })
        .collect()
}

pub fn statistics(store: &dyn StateStore) -> Result<StoreStats> {
    store.statistics()
}
