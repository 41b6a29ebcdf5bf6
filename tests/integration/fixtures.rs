//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A file-backed state store in a temporary directory
//! - Scripted and gated fake providers
//! - Schedulers tuned for millisecond backoff

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};

use testforge::core::{Project, ProjectConfig, StageRegistry};
use testforge::orchestration::{
    AgentGateway, AgentInput, AgentOutput, Capability, CapabilityProvider, ProviderError,
    RetryPolicy, Scheduler, SchedulerEvent,
};
use testforge::store::{SqliteStore, StateStore};

/// A state store backed by a database file that outlives any one handle.
pub struct TestStore {
    pub temp_dir: TempDir,
    pub store: Arc<SqliteStore>,
}

impl TestStore {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = Arc::new(SqliteStore::open_at(temp_dir.path().join("state.db")).expect("Failed to open store"));
        Self { temp_dir, store }
    }

    pub fn db_path(&self) -> PathBuf {
        self.temp_dir.path().join("state.db")
    }

    /// A second, independent connection to the same database.
    pub fn reopen(&self) -> Arc<SqliteStore> {
        Arc::new(SqliteStore::open_at(self.db_path()).expect("Failed to reopen store"))
    }

    pub fn create(&self, name: &str, registry: &StageRegistry) -> Project {
        self.store
            .create_project(name, &ProjectConfig::new("api.yaml"), registry)
            .expect("Failed to create project")
    }
}

/// Returns scripted results in order, then succeeds forever.
pub struct Scripted {
    capability: Capability,
    script: Mutex<VecDeque<Result<Value, ProviderError>>>,
    calls: AtomicU32,
    seen: Mutex<Vec<AgentInput>>,
}

impl Scripted {
    pub fn ok(capability: Capability) -> Arc<Self> {
        Self::new(capability, vec![])
    }

    pub fn new(capability: Capability, script: Vec<Result<Value, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            capability,
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(capability: Capability, err: ProviderError, times: usize) -> Arc<Self> {
        Self::new(capability, (0..times).map(|_| Err(err.clone())).collect())
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Inputs of every invocation so far.
    pub fn inputs(&self) -> Vec<AgentInput> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CapabilityProvider for Scripted {
    fn capability(&self) -> Capability {
        self.capability
    }

    async fn invoke(&self, input: &AgentInput) -> Result<AgentOutput, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(input.clone());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result.map(AgentOutput::new),
            None => Ok(AgentOutput::new(json!({
                "stage": input.stage_id.as_str(),
                "attempt": input.attempt,
            }))),
        }
    }
}

/// Blocks every invocation until the test opens the gate.
pub struct Gated {
    capability: Capability,
    pub started: Notify,
    pub gate: Notify,
    calls: AtomicU32,
}

impl Gated {
    pub fn new(capability: Capability) -> Arc<Self> {
        Arc::new(Self {
            capability,
            started: Notify::new(),
            gate: Notify::new(),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityProvider for Gated {
    fn capability(&self) -> Capability {
        self.capability
    }

    async fn invoke(&self, _input: &AgentInput) -> Result<AgentOutput, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        self.gate.notified().await;
        Ok(AgentOutput::new(json!({ "gated": true })))
    }
}

/// Three attempts with millisecond backoff.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
}

pub fn gateway() -> AgentGateway {
    AgentGateway::new(Duration::from_secs(5))
}

pub fn scheduler(store: Arc<dyn StateStore>, gateway: AgentGateway) -> Scheduler {
    Scheduler::new(store, Arc::new(gateway), fast_policy()).with_poll_interval(Duration::from_millis(5))
}

/// Scheduler plus a receiver for its events.
pub fn observed_scheduler(
    store: Arc<dyn StateStore>,
    gateway: AgentGateway,
) -> (Scheduler, mpsc::Receiver<SchedulerEvent>) {
    let (tx, rx) = mpsc::channel(256);
    (scheduler(store, gateway).with_events(tx), rx)
}

pub fn drain_events(rx: &mut mpsc::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
