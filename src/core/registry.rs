//! Stage registry: the static pipeline definition.
//!
//! The registry is validated once when it is built. Unknown dependencies,
//! duplicate ids, and cycles are rejected here so the scheduler never has
//! to consider them. After construction it is immutable and can be shared
//! freely between workers.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction::{Incoming, Outgoing};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::{Error, Result};
use crate::orchestration::Capability;

pub const PARSE: &str = "parse";
pub const SECURITY_SCAN: &str = "security_scan";
pub const FRAMEWORK_GENERATION: &str = "framework_generation";
pub const DEVOPS_GENERATION: &str = "devops_generation";

/// Identifier of a stage, unique within a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for StageId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_fatal() -> bool {
    true
}

/// One pipeline stage: what it needs, what it waits for, how bad failure is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDef {
    pub id: StageId,
    pub capability: Capability,
    #[serde(default)]
    pub depends_on: Vec<StageId>,
    /// `false` marks a soft-fail stage.
    #[serde(default = "default_fatal")]
    pub fatal: bool,
}

impl StageDef {
    pub fn new(id: &str, capability: Capability) -> Self {
        Self {
            id: StageId::from(id),
            capability,
            depends_on: Vec::new(),
            fatal: true,
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| StageId::from(*d)).collect();
        self
    }

    pub fn soft_fail(mut self) -> Self {
        self.fatal = false;
        self
    }
}

/// Validated, topologically ordered set of stages.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: Vec<StageDef>,
    index: HashMap<StageId, usize>,
}

impl StageRegistry {
    /// Validate and order `stages`.
    ///
    /// # Errors
    /// - `Validation` for an empty registry, blank or duplicate ids, self
    ///   dependencies, or dependencies on unknown stages
    /// - `CycleDetected` when the dependency graph is not a DAG
    pub fn new(stages: Vec<StageDef>) -> Result<Self> {
        if stages.is_empty() {
            return Err(Error::Validation("stage registry is empty".to_string()));
        }

        let mut graph: DiGraph<StageId, ()> = DiGraph::new();
        let mut nodes: HashMap<StageId, NodeIndex> = HashMap::new();
        for stage in &stages {
            if stage.id.as_str().trim().is_empty() {
                return Err(Error::Validation("stage id must not be blank".to_string()));
            }
            if nodes.contains_key(&stage.id) {
                return Err(Error::Validation(format!(
                    "duplicate stage id '{}'",
                    stage.id
                )));
            }
            nodes.insert(stage.id.clone(), graph.add_node(stage.id.clone()));
        }

        for stage in &stages {
            let to = nodes[&stage.id];
            for dep in &stage.depends_on {
                if dep == &stage.id {
                    return Err(Error::Validation(format!(
                        "stage '{}' depends on itself",
                        stage.id
                    )));
                }
                let from = nodes.get(dep).ok_or_else(|| {
                    Error::Validation(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.id, dep
                    ))
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        let order = stable_order(&graph)?;
        let mut slots: Vec<Option<StageDef>> = stages.into_iter().map(Some).collect();
        let stages: Vec<StageDef> = order
            .into_iter()
            .filter_map(|node| slots[node.index()].take())
            .collect();
        let index = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        Ok(Self { stages, index })
    }

    /// parse -> security_scan -> {framework_generation, devops_generation}.
    ///
    /// Devops generation is soft-fail; the rest are fatal.
    pub fn default_pipeline() -> Result<Self> {
        Self::new(vec![
            StageDef::new(PARSE, Capability::Parse),
            StageDef::new(SECURITY_SCAN, Capability::SecurityScan).after(&[PARSE]),
            StageDef::new(FRAMEWORK_GENERATION, Capability::FrameworkGeneration)
                .after(&[PARSE, SECURITY_SCAN]),
            StageDef::new(DEVOPS_GENERATION, Capability::DevopsGeneration)
                .after(&[PARSE, SECURITY_SCAN])
                .soft_fail(),
        ])
    }

    /// Stages in dependency order.
    pub fn stages(&self) -> &[StageDef] {
        &self.stages
    }

    pub fn get(&self, id: &str) -> Option<&StageDef> {
        self.index.get(id).map(|&i| &self.stages[i])
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn capabilities(&self) -> HashSet<Capability> {
        self.stages.iter().map(|s| s.capability).collect()
    }
}

/// Kahn's algorithm over the dependency graph. Among ready stages the one
/// declared first goes next; node indices follow declaration order.
fn stable_order(graph: &DiGraph<StageId, ()>) -> Result<Vec<NodeIndex>> {
    let mut pending: Vec<usize> = graph
        .node_indices()
        .map(|node| graph.neighbors_directed(node, Incoming).count())
        .collect();
    let mut ready: BTreeSet<NodeIndex> = graph
        .node_indices()
        .filter(|node| pending[node.index()] == 0)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for dependent in graph.neighbors_directed(next, Outgoing) {
            pending[dependent.index()] -= 1;
            if pending[dependent.index()] == 0 {
                ready.insert(dependent);
            }
        }
    }

    match graph.node_indices().find(|node| pending[node.index()] > 0) {
        Some(stuck) => Err(Error::CycleDetected {
            stage: graph[stuck].to_string(),
        }),
        None => Ok(order),
    }
}
