//! SQLite-backed [`StateStore`].
//!
//! One connection behind a mutex. Every write runs in an IMMEDIATE
//! transaction so the status check and the update happen under the same
//! write lock, which is what makes the compare-and-swap hold across
//! processes sharing the database file.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::{ArtifactRecord, ProjectTransition, StateStore, StoreStats, TaskTransition};
use crate::core::project::{Project, ProjectConfig, ProjectId, ProjectStatus};
use crate::core::registry::{StageId, StageRegistry};
use crate::core::task::{Task, TaskStatus};
use crate::error::{Error, Result};

const SCHEMA_VERSION: i32 = 1;

const PROJECT_COLUMNS: &str =
    "id, name, config, status, reason, created_at, updated_at, finished_at";

const TASK_COLUMNS: &str = "project_id, stage_id, position, capability, fatal, depends_on, \
     status, attempt, last_error_class, last_error, note, output, retry_at, \
     created_at, started_at, finished_at, updated_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file, creating parent directories.
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        debug!(path = %path.as_ref().display(), "opening state store");
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::Validation(format!("state store lock poisoned: {}", e)))
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        if current < 1 {
            migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
        }
        Ok(())
    }
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            config TEXT NOT NULL,
            status TEXT NOT NULL,
            reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            finished_at TEXT
        );

        CREATE TABLE IF NOT EXISTS tasks (
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            stage_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            capability TEXT NOT NULL,
            fatal INTEGER NOT NULL,
            depends_on TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 0,
            last_error_class TEXT,
            last_error TEXT,
            note TEXT,
            output TEXT,
            retry_at TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (project_id, stage_id)
        );

        CREATE TABLE IF NOT EXISTS artifacts (
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            stage_id TEXT NOT NULL,
            path TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            recorded_at TEXT NOT NULL,
            PRIMARY KEY (project_id, stage_id, path)
        );

        CREATE INDEX IF NOT EXISTS idx_projects_status ON projects(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        "#,
    )?;
    Ok(())
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_project_id(s: &str) -> Result<ProjectId> {
    s.parse()
        .map_err(|e| Error::Validation(format!("bad project id '{}': {}", s, e)))
}

/// Column values as stored; converted to domain types outside the row closure.
struct RawProject {
    id: String,
    name: String,
    config: String,
    status: String,
    reason: Option<String>,
    created_at: String,
    updated_at: String,
    finished_at: Option<String>,
}

impl RawProject {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            config: row.get(2)?,
            status: row.get(3)?,
            reason: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            finished_at: row.get(7)?,
        })
    }

    fn into_project(self) -> Result<Project> {
        Ok(Project {
            id: parse_project_id(&self.id)?,
            name: self.name,
            config: serde_json::from_str::<ProjectConfig>(&self.config)?,
            status: self.status.parse()?,
            reason: self.reason,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            finished_at: parse_opt_ts(self.finished_at)?,
        })
    }
}

struct RawTask {
    project_id: String,
    stage_id: String,
    position: i64,
    capability: String,
    fatal: bool,
    depends_on: String,
    status: String,
    attempt: i64,
    last_error_class: Option<String>,
    last_error: Option<String>,
    note: Option<String>,
    output: Option<String>,
    retry_at: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    updated_at: String,
}

impl RawTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project_id: row.get(0)?,
            stage_id: row.get(1)?,
            position: row.get(2)?,
            capability: row.get(3)?,
            fatal: row.get(4)?,
            depends_on: row.get(5)?,
            status: row.get(6)?,
            attempt: row.get(7)?,
            last_error_class: row.get(8)?,
            last_error: row.get(9)?,
            note: row.get(10)?,
            output: row.get(11)?,
            retry_at: row.get(12)?,
            created_at: row.get(13)?,
            started_at: row.get(14)?,
            finished_at: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        Ok(Task {
            project_id: parse_project_id(&self.project_id)?,
            stage_id: StageId::from(self.stage_id),
            position: self.position.max(0) as u32,
            capability: self.capability.parse()?,
            fatal: self.fatal,
            depends_on: serde_json::from_str(&self.depends_on)?,
            status: self.status.parse()?,
            attempt: self.attempt.max(0) as u32,
            last_error_class: self
                .last_error_class
                .as_deref()
                .map(str::parse)
                .transpose()?,
            last_error: self.last_error,
            note: self.note,
            output: self
                .output
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            retry_at: parse_opt_ts(self.retry_at)?,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            finished_at: parse_opt_ts(self.finished_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn load_project(conn: &Connection, id: &str) -> Result<Project> {
    conn.query_row(
        &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
        [id],
        RawProject::from_row,
    )
    .optional()?
    .ok_or_else(|| Error::ProjectNotFound(id.to_string()))?
    .into_project()
}

fn load_task(conn: &Connection, id: &ProjectId, stage: &StageId) -> Result<Task> {
    conn.query_row(
        &format!(
            "SELECT {} FROM tasks WHERE project_id = ?1 AND stage_id = ?2",
            TASK_COLUMNS
        ),
        params![id.to_string(), stage.as_str()],
        RawTask::from_row,
    )
    .optional()?
    .ok_or_else(|| Error::TaskNotFound {
        project: id.to_string(),
        stage: stage.to_string(),
    })?
    .into_task()
}

fn query_projects(conn: &Connection, filter: &str) -> Result<Vec<Project>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM projects {}",
        PROJECT_COLUMNS, filter
    ))?;
    let raw = stmt
        .query_map([], RawProject::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.into_iter().map(RawProject::into_project).collect()
}

fn query_tasks<P: rusqlite::Params>(conn: &Connection, filter: &str, params: P) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM tasks {}", TASK_COLUMNS, filter))?;
    let raw = stmt
        .query_map(params, RawTask::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.into_iter().map(RawTask::into_task).collect()
}

fn task_state(tx: &Transaction<'_>, id: &ProjectId, stage: &str) -> Result<Option<(TaskStatus, u32)>> {
    tx.query_row(
        "SELECT status, attempt FROM tasks WHERE project_id = ?1 AND stage_id = ?2",
        params![id.to_string(), stage],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)),
    )
    .optional()?
    .map(|(status, attempt)| Ok((status.parse()?, attempt)))
    .transpose()
}

fn task_status(tx: &Transaction<'_>, id: &ProjectId, stage: &str) -> Result<Option<TaskStatus>> {
    Ok(task_state(tx, id, stage)?.map(|(status, _)| status))
}

impl SqliteStore {
    /// Shared CAS path for task updates. With `attempt` set, the row must
    /// also still belong to that claim.
    fn transition_task(
        &self,
        id: &ProjectId,
        stage: &StageId,
        expected: TaskStatus,
        attempt: Option<u32>,
        transition: TaskTransition,
    ) -> Result<Task> {
        expected.check_transition(transition.target())?;

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let pid = id.to_string();

        match task_state(&tx, id, stage.as_str())? {
            None => {
                return Err(Error::TaskNotFound {
                    project: pid,
                    stage: stage.to_string(),
                })
            }
            Some((actual, _)) if actual != expected => {
                return Err(Error::StaleTransition {
                    project: pid,
                    stage: stage.to_string(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                })
            }
            Some((actual, current)) => {
                if let Some(claimed) = attempt.filter(|&claimed| claimed != current) {
                    return Err(Error::StaleTransition {
                        project: pid,
                        stage: stage.to_string(),
                        expected: format!("{} (attempt {})", expected, claimed),
                        actual: format!("{} (attempt {})", actual, current),
                    });
                }
            }
        }

        let now = ts(Utc::now());
        let target = transition.target().as_str();
        match transition {
            TaskTransition::Claim => {
                let deps_json: String = tx.query_row(
                    "SELECT depends_on FROM tasks WHERE project_id = ?1 AND stage_id = ?2",
                    params![pid, stage.as_str()],
                    |row| row.get(0),
                )?;
                let deps: Vec<StageId> = serde_json::from_str(&deps_json)?;
                for dep in &deps {
                    if task_status(&tx, id, dep.as_str())? != Some(TaskStatus::Succeeded) {
                        return Err(Error::DependencyNotSatisfied {
                            stage: stage.to_string(),
                            dependency: dep.to_string(),
                        });
                    }
                }
                tx.execute(
                    "UPDATE tasks SET status = ?1, attempt = attempt + 1, retry_at = NULL,
                            started_at = ?2, updated_at = ?2
                     WHERE project_id = ?3 AND stage_id = ?4 AND status = ?5",
                    params![target, now, pid, stage.as_str(), expected.as_str()],
                )?;
            }
            TaskTransition::Succeed { output, artifacts } => {
                tx.execute(
                    "UPDATE tasks SET status = ?1, output = ?2, retry_at = NULL,
                            finished_at = ?3, updated_at = ?3
                     WHERE project_id = ?4 AND stage_id = ?5 AND status = ?6",
                    params![
                        target,
                        serde_json::to_string(&output)?,
                        now,
                        pid,
                        stage.as_str(),
                        expected.as_str()
                    ],
                )?;
                for artifact in &artifacts {
                    tx.execute(
                        "INSERT OR REPLACE INTO artifacts
                            (project_id, stage_id, path, description, recorded_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![pid, stage.as_str(), artifact.path, artifact.description, now],
                    )?;
                }
            }
            TaskTransition::Retry {
                class,
                message,
                retry_at,
            } => {
                tx.execute(
                    "UPDATE tasks SET status = ?1, last_error_class = ?2, last_error = ?3,
                            retry_at = ?4, updated_at = ?5
                     WHERE project_id = ?6 AND stage_id = ?7 AND status = ?8",
                    params![
                        target,
                        class.as_str(),
                        message,
                        ts(retry_at),
                        now,
                        pid,
                        stage.as_str(),
                        expected.as_str()
                    ],
                )?;
            }
            TaskTransition::Fail { class, message } => {
                tx.execute(
                    "UPDATE tasks SET status = ?1, last_error_class = ?2, last_error = ?3,
                            retry_at = NULL, finished_at = ?4, updated_at = ?4
                     WHERE project_id = ?5 AND stage_id = ?6 AND status = ?7",
                    params![
                        target,
                        class.as_str(),
                        message,
                        now,
                        pid,
                        stage.as_str(),
                        expected.as_str()
                    ],
                )?;
            }
            TaskTransition::Reset => {
                tx.execute(
                    "UPDATE tasks SET status = ?1, note = ?2, updated_at = ?3
                     WHERE project_id = ?4 AND stage_id = ?5 AND status = ?6",
                    params![
                        target,
                        "reset after interrupted attempt",
                        now,
                        pid,
                        stage.as_str(),
                        expected.as_str()
                    ],
                )?;
            }
            TaskTransition::Cancel { reason } => {
                tx.execute(
                    "UPDATE tasks SET status = ?1, note = ?2, retry_at = NULL,
                            finished_at = ?3, updated_at = ?3
                     WHERE project_id = ?4 AND stage_id = ?5 AND status = ?6",
                    params![target, reason, now, pid, stage.as_str(), expected.as_str()],
                )?;
            }
        }

        let task = load_task(&tx, id, stage)?;
        tx.commit()?;
        debug!(
            project = %id,
            stage = %stage,
            from = %expected,
            to = %task.status,
            attempt = task.attempt,
            "task transition"
        );
        Ok(task)
    }
}

impl StateStore for SqliteStore {
    fn create_project(
        &self,
        name: &str,
        config: &ProjectConfig,
        registry: &StageRegistry,
    ) -> Result<Project> {
        if name.trim().is_empty() {
            return Err(Error::Validation("project name must not be empty".to_string()));
        }
        let now = Utc::now();
        let project = Project {
            id: ProjectId::new(),
            name: name.trim().to_string(),
            config: config.clone(),
            status: ProjectStatus::Pending,
            reason: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO projects (id, name, config, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                project.id.to_string(),
                project.name,
                serde_json::to_string(&project.config)?,
                project.status.as_str(),
                ts(now),
            ],
        )?;
        for (position, stage) in registry.stages().iter().enumerate() {
            tx.execute(
                "INSERT INTO tasks (project_id, stage_id, position, capability, fatal,
                                    depends_on, status, attempt, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)",
                params![
                    project.id.to_string(),
                    stage.id.as_str(),
                    position as i64,
                    stage.capability.as_str(),
                    stage.fatal,
                    serde_json::to_string(&stage.depends_on)?,
                    TaskStatus::Pending.as_str(),
                    ts(now),
                ],
            )?;
        }
        tx.commit()?;
        debug!(project = %project.id, tasks = registry.len(), "project created");
        Ok(project)
    }

    fn get_project(&self, id: &ProjectId) -> Result<Project> {
        let conn = self.conn()?;
        load_project(&conn, &id.to_string())
    }

    fn find_project(&self, id_or_prefix: &str) -> Result<Project> {
        let needle = id_or_prefix.trim().to_ascii_lowercase();
        if let Ok(id) = needle.parse::<ProjectId>() {
            return self.get_project(&id);
        }
        if needle.is_empty() || !needle.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Err(Error::ProjectNotFound(id_or_prefix.to_string()));
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM projects WHERE id LIKE ?1 || '%' LIMIT 2")?;
        let matches = stmt
            .query_map([&needle], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        match matches.as_slice() {
            [] => Err(Error::ProjectNotFound(id_or_prefix.to_string())),
            [only] => load_project(&conn, only),
            _ => Err(Error::AmbiguousProject(id_or_prefix.to_string())),
        }
    }

    fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn()?;
        query_projects(&conn, "ORDER BY created_at DESC, rowid DESC")
    }

    fn list_active_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn()?;
        query_projects(
            &conn,
            "WHERE status IN ('pending', 'running') ORDER BY created_at ASC, rowid ASC",
        )
    }

    fn list_tasks(&self, id: &ProjectId) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        query_tasks(
            &conn,
            "WHERE project_id = ?1 ORDER BY position ASC",
            [id.to_string()],
        )
    }

    fn get_task(&self, id: &ProjectId, stage: &StageId) -> Result<Task> {
        let conn = self.conn()?;
        load_task(&conn, id, stage)
    }

    fn list_running_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        query_tasks(
            &conn,
            "WHERE status = 'running' ORDER BY project_id, position",
            [],
        )
    }

    fn list_artifacts(&self, id: &ProjectId) -> Result<Vec<ArtifactRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT stage_id, path, description, recorded_at FROM artifacts
             WHERE project_id = ?1 ORDER BY stage_id, path",
        )?;
        let rows = stmt
            .query_map([id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(stage, path, description, recorded_at)| {
                Ok(ArtifactRecord {
                    stage_id: StageId::from(stage),
                    path,
                    description,
                    recorded_at: parse_ts(&recorded_at)?,
                })
            })
            .collect()
    }

    fn update_task(
        &self,
        id: &ProjectId,
        stage: &StageId,
        expected: TaskStatus,
        transition: TaskTransition,
    ) -> Result<Task> {
        self.transition_task(id, stage, expected, None, transition)
    }

    fn update_claimed_task(
        &self,
        id: &ProjectId,
        stage: &StageId,
        attempt: u32,
        transition: TaskTransition,
    ) -> Result<Task> {
        self.transition_task(id, stage, TaskStatus::Running, Some(attempt), transition)
    }

    fn update_project(
        &self,
        id: &ProjectId,
        expected: ProjectStatus,
        transition: ProjectTransition,
    ) -> Result<Project> {
        let target = transition.target();
        if !expected.can_transition(target) {
            return Err(Error::InvalidTransition {
                from: expected.to_string(),
                to: target.to_string(),
            });
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let pid = id.to_string();

        let actual: ProjectStatus = tx
            .query_row("SELECT status FROM projects WHERE id = ?1", [&pid], |row| {
                row.get::<_, String>(0)
            })
            .optional()?
            .ok_or_else(|| Error::ProjectNotFound(pid.clone()))?
            .parse()?;
        if actual != expected {
            return Err(Error::StaleProject {
                project: pid,
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        let now = ts(Utc::now());
        let (reason, cancel_statuses): (Option<&str>, &[TaskStatus]) = match &transition {
            ProjectTransition::Start => (None, &[]),
            ProjectTransition::Complete => {
                let open: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM tasks WHERE project_id = ?1
                     AND status NOT IN ('succeeded', 'failed', 'cancelled')",
                    [&pid],
                    |row| row.get(0),
                )?;
                if open > 0 {
                    return Err(Error::Validation(format!(
                        "project {} still has {} unfinished task(s)",
                        pid, open
                    )));
                }
                (None, &[])
            }
            ProjectTransition::Fail { reason } => (
                Some(reason.as_str()),
                &[TaskStatus::Pending, TaskStatus::Retrying],
            ),
            ProjectTransition::Cancel { reason } => (
                Some(reason.as_str()),
                &[TaskStatus::Pending, TaskStatus::Retrying, TaskStatus::Running],
            ),
        };

        let finished_at = target.is_terminal().then(|| now.clone());
        tx.execute(
            "UPDATE projects SET status = ?1, reason = COALESCE(?2, reason),
                    updated_at = ?3, finished_at = COALESCE(?4, finished_at)
             WHERE id = ?5 AND status = ?6",
            params![
                target.as_str(),
                reason,
                now,
                finished_at,
                pid,
                expected.as_str()
            ],
        )?;

        let note = match &transition {
            ProjectTransition::Fail { reason } => format!("project failed: {}", reason),
            ProjectTransition::Cancel { reason } => format!("project cancelled: {}", reason),
            _ => String::new(),
        };
        let mut cancelled = 0;
        for status in cancel_statuses {
            cancelled += tx.execute(
                "UPDATE tasks SET status = 'cancelled', note = ?1, retry_at = NULL,
                        finished_at = ?2, updated_at = ?2
                 WHERE project_id = ?3 AND status = ?4",
                params![note, now, pid, status.as_str()],
            )?;
        }

        let project = load_project(&tx, &pid)?;
        tx.commit()?;
        debug!(
            project = %id,
            from = %expected,
            to = %project.status,
            cancelled_tasks = cancelled,
            "project transition"
        );
        Ok(project)
    }

    fn delete_project(&self, id: &ProjectId) -> Result<()> {
        let removed = self
            .conn()?
            .execute("DELETE FROM projects WHERE id = ?1", [id.to_string()])?;
        if removed == 0 {
            return Err(Error::ProjectNotFound(id.to_string()));
        }
        Ok(())
    }

    fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self.conn()?.execute(
            "DELETE FROM projects
             WHERE status IN ('completed', 'failed', 'cancelled')
               AND finished_at IS NOT NULL AND finished_at < ?1",
            [ts(cutoff)],
        )?;
        debug!(removed, cutoff = %cutoff, "purged finished projects");
        Ok(removed)
    }

    fn statistics(&self) -> Result<StoreStats> {
        let conn = self.conn()?;
        let count_by = |table: &str| -> Result<BTreeMap<String, usize>> {
            let mut stmt = conn.prepare(&format!(
                "SELECT status, COUNT(*) FROM {} GROUP BY status",
                table
            ))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows
                .into_iter()
                .map(|(status, n)| (status, n.max(0) as usize))
                .collect())
        };
        let projects = count_by("projects")?;
        let tasks = count_by("tasks")?;
        let artifacts: i64 = conn.query_row("SELECT COUNT(*) FROM artifacts", [], |row| row.get(0))?;
        Ok(StoreStats {
            projects,
            tasks,
            artifacts: artifacts.max(0) as usize,
        })
    }
}
