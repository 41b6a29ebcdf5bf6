//! Project data model.
//!
//! A project is one end-to-end generation request. Its task set is fixed
//! when it is created; the configuration payload is passed through to the
//! capability providers untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Created; nothing dispatched yet.
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ProjectStatus {
    pub const ALL: [ProjectStatus; 5] = [
        ProjectStatus::Pending,
        ProjectStatus::Running,
        ProjectStatus::Completed,
        ProjectStatus::Failed,
        ProjectStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Pending => "pending",
            ProjectStatus::Running => "running",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
            ProjectStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProjectStatus::Completed | ProjectStatus::Failed | ProjectStatus::Cancelled
        )
    }

    pub fn can_transition(&self, target: ProjectStatus) -> bool {
        use ProjectStatus::*;
        matches!(
            (self, target),
            (Pending, Running)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ProjectStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown project status '{}'", s)))
    }
}

/// Language the generated test framework targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    #[default]
    Java,
    Python,
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Java => write!(f, "java"),
            Language::Python => write!(f, "python"),
        }
    }
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "java" => Ok(Language::Java),
            "python" => Ok(Language::Python),
            other => Err(Error::Validation(format!(
                "unsupported language '{}' (expected java or python)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    #[default]
    RestApi,
    Graphql,
    Microservice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    #[default]
    None,
    Basic,
    Bearer,
    ApiKey,
    Oauth2,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::RestApi => "rest_api",
            ProjectType::Graphql => "graphql",
            ProjectType::Microservice => "microservice",
        }
    }
}

impl AuthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::None => "none",
            AuthKind::Basic => "basic",
            AuthKind::Bearer => "bearer",
            AuthKind::ApiKey => "api_key",
            AuthKind::Oauth2 => "oauth2",
        }
    }
}

impl std::fmt::Display for AuthKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "none" => Ok(AuthKind::None),
            "basic" => Ok(AuthKind::Basic),
            "bearer" => Ok(AuthKind::Bearer),
            "api_key" => Ok(AuthKind::ApiKey),
            "oauth2" => Ok(AuthKind::Oauth2),
            other => Err(Error::Validation(format!("unsupported auth kind '{}'", other))),
        }
    }
}

fn default_environments() -> Vec<String> {
    vec!["dev".to_string(), "staging".to_string(), "prod".to_string()]
}

/// Declared project configuration, handed verbatim to every provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub spec_path: PathBuf,
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub project_type: ProjectType,
    #[serde(default = "default_environments")]
    pub environments: Vec<String>,
    #[serde(default)]
    pub auth: AuthKind,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl ProjectConfig {
    pub fn new(spec_path: impl Into<PathBuf>) -> Self {
        Self {
            spec_path: spec_path.into(),
            language: Language::default(),
            project_type: ProjectType::default(),
            environments: default_environments(),
            auth: AuthKind::default(),
            output_dir: None,
        }
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub config: ProjectConfig,
    pub status: ProjectStatus,
    /// Why the project failed or was cancelled.
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Lower-case, dash-separated form of a project name for paths and packages.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "project".to_string()
    } else {
        trimmed.to_string()
    }
}
