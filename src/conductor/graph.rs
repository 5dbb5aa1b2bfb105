//! Workflow definitions: nodes, edges, and load-time validation.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::condition;
use crate::error::{ApiaryError, Result};
use crate::ident::{self, IdentKind};

pub const START_NODE: &str = "__start__";
pub const END_NODE: &str = "__end__";

const DEFAULT_EDGE_PRIORITY: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Single,
    Parallel,
    Swarm,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Parallel => "parallel",
            Self::Swarm => "swarm",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "single" => Some(Self::Single),
            "parallel" => Some(Self::Parallel),
            "swarm" => Some(Self::Swarm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleDef {
    pub name: String,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub interests: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Re-fires allowed after a failure. Absent means zero; workflow authors
    /// must opt in explicitly.
    pub retry_budget: Option<u32>,
    /// Fan-out width for parallel nodes.
    pub concurrency: Option<usize>,
    /// Roles for swarm nodes; at least one is required.
    pub roles: Vec<RoleDef>,
    /// Parallel only: collect member failures instead of failing the node.
    pub best_effort: bool,
    pub agent_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: NodeKind,
    pub prompt_template: String,
    #[serde(default)]
    pub config: NodeConfig,
}

impl NodeDef {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

fn default_priority() -> i64 {
    DEFAULT_EDGE_PRIORITY
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDef {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// When true this edge also fires off a failed upstream node.
    #[serde(default)]
    pub on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<NodeDef>,
    pub edges: Vec<EdgeDef>,
}

impl WorkflowDef {
    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of a node, priority order (lower first), stable by
    /// declaration order for ties.
    pub fn outgoing(&self, from: &str) -> Vec<&EdgeDef> {
        let mut edges: Vec<&EdgeDef> = self.edges.iter().filter(|e| e.from == from).collect();
        edges.sort_by_key(|e| e.priority);
        edges
    }

    pub fn incoming(&self, to: &str) -> Vec<&EdgeDef> {
        let mut edges: Vec<&EdgeDef> = self.edges.iter().filter(|e| e.to == to).collect();
        edges.sort_by_key(|e| e.priority);
        edges
    }

    /// Full load-time validation. Everything here is a `validation` error;
    /// nothing downstream re-checks these invariants.
    pub fn validate(&self) -> Result<()> {
        ident::validate(&self.name, IdentKind::Workflow)?;

        if self.nodes.is_empty() {
            return Err(ApiaryError::WorkflowValidation(
                "workflow has no nodes".into(),
            ));
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            ident::validate(&node.id, IdentKind::Node)?;
            if !ids.insert(node.id.as_str()) {
                return Err(ApiaryError::WorkflowValidation(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
            match node.kind {
                NodeKind::Swarm => {
                    if node.config.roles.is_empty() {
                        return Err(ApiaryError::WorkflowValidation(format!(
                            "swarm node '{}' declares no roles",
                            node.id
                        )));
                    }
                    for role in &node.config.roles {
                        ident::validate(&role.name, IdentKind::Node)?;
                    }
                }
                NodeKind::Parallel => {
                    if node.config.concurrency == Some(0) {
                        return Err(ApiaryError::WorkflowValidation(format!(
                            "parallel node '{}' has zero concurrency",
                            node.id
                        )));
                    }
                }
                NodeKind::Single => {}
            }
            if let Some(agent_type) = &node.config.agent_type {
                ident::validate(agent_type, IdentKind::AgentType)?;
            }
        }

        let mut start_edges = 0usize;
        for edge in &self.edges {
            if edge.from != START_NODE && !ids.contains(edge.from.as_str()) {
                return Err(ApiaryError::WorkflowValidation(format!(
                    "edge references unknown node '{}'",
                    edge.from
                )));
            }
            if edge.to != END_NODE && !ids.contains(edge.to.as_str()) {
                return Err(ApiaryError::WorkflowValidation(format!(
                    "edge references unknown node '{}'",
                    edge.to
                )));
            }
            if edge.from == END_NODE {
                return Err(ApiaryError::WorkflowValidation(
                    "__end__ may only have incoming edges".into(),
                ));
            }
            if edge.to == START_NODE {
                return Err(ApiaryError::WorkflowValidation(
                    "__start__ may only have outgoing edges".into(),
                ));
            }
            if edge.from == START_NODE {
                start_edges += 1;
            }
            // Conditions must parse at load; a bad expression is fatal here,
            // never at run time.
            condition::parse(&edge.condition)?;
        }

        if start_edges != 1 {
            return Err(ApiaryError::WorkflowValidation(format!(
                "expected exactly one __start__ edge, found {}",
                start_edges
            )));
        }

        for node in &self.nodes {
            if self.outgoing(&node.id).is_empty() {
                return Err(ApiaryError::WorkflowValidation(format!(
                    "node '{}' has no outgoing edge",
                    node.id
                )));
            }
        }

        self.check_acyclic()?;
        Ok(())
    }

    /// Kahn's algorithm over the node-only subgraph (sentinels excluded).
    fn check_acyclic(&self) -> Result<()> {
        let mut indegree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

        for edge in &self.edges {
            if edge.from == START_NODE || edge.to == END_NODE {
                continue;
            }
            adjacency
                .entry(edge.from.as_str())
                .or_default()
                .push(edge.to.as_str());
            *indegree.entry(edge.to.as_str()).or_insert(0) += 1;
        }

        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            if let Some(next) = adjacency.get(id) {
                for to in next {
                    let d = indegree.get_mut(to).expect("known node");
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(to);
                    }
                }
            }
        }

        if visited != self.nodes.len() {
            return Err(ApiaryError::WorkflowValidation(
                "workflow graph contains a cycle".into(),
            ));
        }
        Ok(())
    }
}
