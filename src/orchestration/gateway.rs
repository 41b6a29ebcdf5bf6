//! Agent gateway: the single place provider errors are classified.
//!
//! Providers report what went wrong with a [`ProviderError`]; the gateway
//! turns that into an [`AgentOutcome`] the scheduler can act on. Providers
//! never decide whether something is retried. Invocation timeouts are
//! enforced here too.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::project::{ProjectConfig, ProjectId};
use crate::core::registry::{StageId, StageRegistry};

/// Substrings that mark an otherwise unclassified provider error as transient.
pub const TRANSIENT_PATTERNS: &[&str] = &[
    "rate limit",
    "too many requests",
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "temporarily unavailable",
    "service unavailable",
];

/// Closed set of capabilities a stage can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Parse,
    SecurityScan,
    FrameworkGeneration,
    DevopsGeneration,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Parse => "parse",
            Capability::SecurityScan => "security_scan",
            Capability::FrameworkGeneration => "framework_generation",
            Capability::DevopsGeneration => "devops_generation",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        [
            Capability::Parse,
            Capability::SecurityScan,
            Capability::FrameworkGeneration,
            Capability::DevopsGeneration,
        ]
        .into_iter()
        .find(|c| c.as_str() == s)
        .ok_or_else(|| crate::Error::Validation(format!("unknown capability '{}'", s)))
    }
}

/// Classification the retry policy consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network, timeout, or rate limiting. Retried.
    TransientProvider,
    /// Malformed or unsupported input. Surfaced verbatim.
    InvalidInput,
    /// Blocked by policy, e.g. a secret in the API description.
    PolicyViolation,
    /// Provider refused or failed in a way retrying will not fix.
    ProviderRejected,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::TransientProvider => "transient_provider",
            FailureClass::InvalidInput => "invalid_input",
            FailureClass::PolicyViolation => "policy_violation",
            FailureClass::ProviderRejected => "provider_rejected",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::TransientProvider)
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureClass {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        [
            FailureClass::TransientProvider,
            FailureClass::InvalidInput,
            FailureClass::PolicyViolation,
            FailureClass::ProviderRejected,
        ]
        .into_iter()
        .find(|c| c.as_str() == s)
        .ok_or_else(|| crate::Error::Validation(format!("unknown failure class '{}'", s)))
    }
}

/// Native error reported by a capability provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Carries the pattern class only, never the matched value.
    #[error("blocking pattern class '{pattern_class}' found; {guidance}")]
    PolicyViolation {
        pattern_class: String,
        guidance: String,
    },

    #[error("provider declined: {0}")]
    DoNotRetry(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub class: FailureClass,
    pub message: String,
}

impl Failure {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

/// A file (or other durable thing) a provider produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentOutput {
    pub payload: serde_json::Value,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl AgentOutput {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Success(AgentOutput),
    Retryable(Failure),
    Fatal(Failure),
}

/// Output of a succeeded dependency, passed forward explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyOutput {
    pub stage_id: StageId,
    pub capability: Capability,
    pub output: serde_json::Value,
}

/// Everything a provider may look at. Built by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInput {
    pub project_id: ProjectId,
    pub project_name: String,
    pub stage_id: StageId,
    pub attempt: u32,
    pub config: ProjectConfig,
    pub dependencies: Vec<DependencyOutput>,
}

impl AgentInput {
    /// Output of the first dependency that ran `capability`.
    pub fn output_of(&self, capability: Capability) -> Option<&serde_json::Value> {
        self.dependencies
            .iter()
            .find(|d| d.capability == capability)
            .map(|d| &d.output)
    }
}

#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    fn capability(&self) -> Capability;

    async fn invoke(&self, input: &AgentInput) -> Result<AgentOutput, ProviderError>;
}

/// Routes capability invocations to providers and classifies their errors.
#[derive(Clone)]
pub struct AgentGateway {
    providers: HashMap<Capability, Arc<dyn CapabilityProvider>>,
    timeout: Duration,
}

impl AgentGateway {
    pub fn new(timeout: Duration) -> Self {
        Self {
            providers: HashMap::new(),
            timeout,
        }
    }

    /// Register a provider, replacing any existing one for its capability.
    pub fn register(&mut self, provider: Arc<dyn CapabilityProvider>) {
        self.providers.insert(provider.capability(), provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Capabilities the registry needs that nobody provides.
    pub fn missing_capabilities(&self, registry: &StageRegistry) -> Vec<Capability> {
        let mut missing: Vec<Capability> = registry
            .capabilities()
            .into_iter()
            .filter(|c| !self.providers.contains_key(c))
            .collect();
        missing.sort();
        missing
    }

    pub async fn invoke(&self, capability: Capability, input: &AgentInput) -> AgentOutcome {
        let Some(provider) = self.providers.get(&capability) else {
            warn!(%capability, stage = %input.stage_id, "no provider registered");
            return AgentOutcome::Fatal(Failure::new(
                FailureClass::ProviderRejected,
                format!("no provider registered for capability '{}'", capability),
            ));
        };

        debug!(
            %capability,
            stage = %input.stage_id,
            attempt = input.attempt,
            "invoking provider"
        );
        match tokio::time::timeout(self.timeout, provider.invoke(input)).await {
            Ok(Ok(output)) => AgentOutcome::Success(output),
            Ok(Err(err)) => classify(err),
            Err(_) => classify(ProviderError::Timeout(self.timeout)),
        }
    }
}

/// Map a provider's native error to a retry-relevant outcome.
pub fn classify(err: ProviderError) -> AgentOutcome {
    let message = err.to_string();
    match err {
        ProviderError::Timeout(_) | ProviderError::Network(_) | ProviderError::RateLimited(_) => {
            AgentOutcome::Retryable(Failure::new(FailureClass::TransientProvider, message))
        }
        ProviderError::InvalidInput(_) => {
            AgentOutcome::Fatal(Failure::new(FailureClass::InvalidInput, message))
        }
        ProviderError::PolicyViolation { .. } => {
            AgentOutcome::Fatal(Failure::new(FailureClass::PolicyViolation, message))
        }
        ProviderError::DoNotRetry(_) => {
            AgentOutcome::Fatal(Failure::new(FailureClass::ProviderRejected, message))
        }
        ProviderError::Other(ref text) if looks_transient(text) => {
            AgentOutcome::Retryable(Failure::new(FailureClass::TransientProvider, message))
        }
        ProviderError::Other(_) => {
            AgentOutcome::Fatal(Failure::new(FailureClass::ProviderRejected, message))
        }
    }
}

fn looks_transient(text: &str) -> bool {
    let lower = text.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}
