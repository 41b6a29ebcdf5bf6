use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Project prefix '{0}' matches more than one project")]
    AmbiguousProject(String),

    #[error("Task not found: {project}/{stage}")]
    TaskNotFound { project: String, stage: String },

    /// The row was already advanced by someone else; callers skip silently.
    #[error("Stale transition on {project}/{stage}: expected {expected}, found {actual}")]
    StaleTransition {
        project: String,
        stage: String,
        expected: String,
        actual: String,
    },

    #[error("Stale transition on project {project}: expected {expected}, found {actual}")]
    StaleProject {
        project: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Stage {stage} cannot start: dependency {dependency} has not succeeded")]
    DependencyNotSatisfied { stage: String, dependency: String },

    #[error("Stage registry contains a cycle through '{stage}'")]
    CycleDetected { stage: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl Error {
    /// True when a compare-and-swap lost its race.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            Error::StaleTransition { .. } | Error::StaleProject { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
