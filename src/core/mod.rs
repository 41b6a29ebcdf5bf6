//! Core domain models: projects, tasks, and the stage registry.

pub mod project;
pub mod registry;
pub mod task;

pub use project::{AuthKind, Language, Project, ProjectConfig, ProjectId, ProjectStatus, ProjectType};
pub use registry::{StageDef, StageId, StageRegistry};
pub use task::{Task, TaskStatus};
