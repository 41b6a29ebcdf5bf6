//! Headless reasoning client.
//!
//! Runs an external reasoning command (Claude Code by default) in
//! non-interactive mode (`-p`) with JSON output and maps whatever goes
//! wrong onto [`ProviderError`] so the gateway can classify it.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::AiConfig;
use crate::orchestration::gateway::ProviderError;

/// Stderr fragments that mean the backend is throttling us.
const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "429", "overloaded"];

/// Response from a headless execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningResponse {
    pub output: String,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    subtype: Option<String>,
    result: Option<String>,
    session_id: Option<String>,
    total_cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReasoningClient {
    binary: PathBuf,
    timeout: Duration,
}

impl ReasoningClient {
    /// Resolve the configured command on `PATH`.
    ///
    /// Returns `None` when the command is not installed, in which case
    /// callers fall back to their deterministic path.
    pub fn from_config(config: &AiConfig) -> Option<Self> {
        let binary = which::which(&config.command).ok()?;
        Some(Self::with_binary(binary).with_timeout(Duration::from_secs(config.timeout_secs)))
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn execute(&self, prompt: &str, cwd: &Path) -> Result<ReasoningResponse, ProviderError> {
        debug!(binary = %self.binary.display(), prompt_len = prompt.len(), "running reasoning command");
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .arg("-p")
                .arg(prompt)
                .arg("--output-format")
                .arg("json")
                .current_dir(cwd)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ProviderError::Timeout(self.timeout))?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                ProviderError::DoNotRetry(format!("cannot run {}: {}", self.binary.display(), e))
            }
            _ => ProviderError::Other(e.to_string()),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Some(parsed) = Self::parse_json_response(&stdout) {
            return parsed;
        }

        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                format!(
                    "reasoning command exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(error_from_message(message));
        }

        Ok(ReasoningResponse {
            output: stdout.trim().to_string(),
            session_id: None,
            cost_usd: None,
            duration_ms: None,
        })
    }

    /// `None` when `json` is not a response document at all.
    pub fn parse_json_response(json: &str) -> Option<Result<ReasoningResponse, ProviderError>> {
        let raw: RawResponse = serde_json::from_str(json.trim()).ok()?;
        let failed = raw.is_error || raw.subtype.as_deref() == Some("error") || raw.error.is_some();
        if failed {
            let message = raw
                .error
                .or(raw.result)
                .unwrap_or_else(|| "reasoning command reported an error".to_string());
            return Some(Err(error_from_message(message)));
        }
        match raw.result {
            Some(output) => Some(Ok(ReasoningResponse {
                output,
                session_id: raw.session_id,
                cost_usd: raw.total_cost_usd,
                duration_ms: raw.duration_ms,
            })),
            None => Some(Err(ProviderError::Other("response carried no result".to_string()))),
        }
    }
}

fn error_from_message(message: String) -> ProviderError {
    let lower = message.to_lowercase();
    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        ProviderError::RateLimited(message)
    } else {
        ProviderError::Other(message)
    }
}
