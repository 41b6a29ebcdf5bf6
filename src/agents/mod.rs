//! Built-in capability providers.
//!
//! Each provider owns one [`Capability`] and reports failures as
//! [`ProviderError`]; classification stays in the gateway.

pub mod devops;
pub mod framework;
pub mod parser;
pub mod scanner;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::core::project::slugify;
use crate::orchestration::{AgentGateway, AgentInput, Artifact, Capability, ProviderError, ReasoningClient};
use crate::Result;

pub use devops::DevopsProvider;
pub use framework::FrameworkProvider;
pub use parser::{ApiDescription, ParserProvider};
pub use scanner::{ScannerProvider, SecretScanner};

/// Gateway with every built-in provider registered.
pub fn standard_gateway(config: &Config) -> Result<AgentGateway> {
    let mut parser = ParserProvider::new();
    if config.ai.enabled {
        match ReasoningClient::from_config(&config.ai) {
            Some(client) => {
                info!(binary = %client.binary().display(), "reasoning enhancement enabled");
                parser = parser.with_reasoning(client);
            }
            None => info!(command = %config.ai.command, "reasoning command not found, parsing without it"),
        }
    }
    let output_dir = config.output_dir();
    Ok(AgentGateway::new(config.scheduler.agent_timeout())
        .with_provider(Arc::new(parser))
        .with_provider(Arc::new(ScannerProvider::new(SecretScanner::new(&config.scan.allow)?)))
        .with_provider(Arc::new(FrameworkProvider::new(output_dir.clone())))
        .with_provider(Arc::new(DevopsProvider::new(output_dir))))
}

/// A file a generator wants written, relative to the project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
    pub description: String,
}

impl GeneratedFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            description: description.into(),
        }
    }
}

/// `<output_dir>/<project-slug>`, where the project's own output directory
/// wins over the configured default.
pub fn project_dir(input: &AgentInput, default_output: &Path) -> PathBuf {
    input
        .config
        .output_dir
        .as_deref()
        .unwrap_or(default_output)
        .join(slugify(&input.project_name))
}

/// Parse output handed forward by the `parse` dependency.
pub fn parsed_api(input: &AgentInput) -> std::result::Result<ApiDescription, ProviderError> {
    let value = input.output_of(Capability::Parse).ok_or_else(|| {
        ProviderError::InvalidInput(format!(
            "stage '{}' needs the output of a parse stage",
            input.stage_id
        ))
    })?;
    serde_json::from_value(value.clone())
        .map_err(|e| ProviderError::InvalidInput(format!("parse output is not an API description: {}", e)))
}

/// Write `files` under `dir`, overwriting earlier attempts.
pub async fn write_files(dir: &Path, files: &[GeneratedFile]) -> std::result::Result<Vec<Artifact>, ProviderError> {
    let mut artifacts = Vec::with_capacity(files.len());
    for file in files {
        let path = dir.join(&file.path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| io_error(parent, e))?;
        }
        tokio::fs::write(&path, &file.content)
            .await
            .map_err(|e| io_error(&path, e))?;
        debug!(path = %path.display(), bytes = file.content.len(), "wrote generated file");
        artifacts.push(Artifact {
            path: path.display().to_string(),
            description: file.description.clone(),
        });
    }
    Ok(artifacts)
}

fn io_error(path: &Path, err: std::io::Error) -> ProviderError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => {
            ProviderError::DoNotRetry(format!("cannot write {}: {}", path.display(), err))
        }
        _ => ProviderError::Other(format!("cannot write {}: {}", path.display(), err)),
    }
}

/// `Pets` from `pets`, `OrderItems` from `order_items`.
pub(crate) fn pascal_case(text: &str) -> String {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}
