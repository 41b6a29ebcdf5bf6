//! Orchestration layer: provider gateway, retry policy, scheduler loop and
//! crash recovery.

mod claude;
pub mod gateway;
pub mod recovery;
pub mod retry;
pub mod scheduler;

pub use claude::{ReasoningClient, ReasoningResponse};
pub use gateway::{
    classify, AgentGateway, AgentInput, AgentOutcome, AgentOutput, Artifact, Capability,
    CapabilityProvider, DependencyOutput, Failure, FailureClass, ProviderError,
};
pub use recovery::RecoveryReport;
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{failure_reason, Scheduler, SchedulerEvent, TickSummary};
