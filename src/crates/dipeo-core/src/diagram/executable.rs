//! The compiled diagram representation the engine executes.
//!
//! Compilation is deterministic: nodes are sorted by id, edges keep their
//! authoring order index, adjacency maps are `BTreeMap`s, and incoming edge
//! lists are pre-sorted by `(execution_priority desc, order asc)`. The same
//! input therefore yields byte-identical [`ExecutableDiagram::canonical_json`]
//! output.

use crate::diagram::domain::{NodeConfig, NodeType, Packing, RetryPolicy};
use crate::error::{Diagnostic, Result};
use dipeo_state::{ContentType, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A compiled node: resolved label, effective iteration budget, terminal
/// flag, and the bound typed configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutableNode {
    pub id: NodeId,
    pub label: String,
    pub node_type: NodeType,
    pub config: NodeConfig,
    /// Effective iteration budget (default 1).
    pub max_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Set by the compiler for endpoint nodes and nodes with no outgoing
    /// edges. Terminal detection never inspects labels.
    pub is_terminal: bool,
    /// Max `execution_priority` over incoming edges; ready-batch tie-break.
    pub priority: i32,
}

/// A compiled edge with resolved handles and an authoring-order index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutableEdge {
    pub source: NodeId,
    pub source_handle: String,
    pub target: NodeId,
    pub target_handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub execution_priority: i32,
    pub packing: Packing,
    /// Position in the authored edge list; the deterministic tie-break.
    pub order: usize,
    /// True for cycle-closing edges discovered during indexing. Feedback
    /// edges join on output presence rather than completion status.
    pub is_feedback: bool,
}

/// Output of compilation: type-tagged nodes plus pre-sorted adjacency.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutableDiagram {
    pub diagram_id: String,
    /// Sorted by node id.
    pub nodes: Vec<ExecutableNode>,
    /// Authored order preserved; referenced by index from the adjacency maps.
    pub edges: Vec<ExecutableEdge>,
    pub edges_by_source: BTreeMap<NodeId, Vec<usize>>,
    /// Values sorted by `(execution_priority desc, order asc)`.
    pub edges_by_target: BTreeMap<NodeId, Vec<usize>>,
    pub metadata: BTreeMap<String, Value>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ExecutableDiagram {
    pub fn node(&self, id: &str) -> Option<&ExecutableNode> {
        self.nodes
            .binary_search_by(|n| n.id.as_str().cmp(id))
            .ok()
            .map(|i| &self.nodes[i])
    }

    /// Incoming edges, highest priority first.
    pub fn incoming(&self, id: &str) -> Vec<&ExecutableEdge> {
        self.edges_by_target
            .get(id)
            .map(|idxs| idxs.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }

    /// Outgoing edges in authored order.
    pub fn outgoing(&self, id: &str) -> Vec<&ExecutableEdge> {
        self.edges_by_source
            .get(id)
            .map(|idxs| idxs.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }

    /// Nodes with no incoming non-feedback edges (the sources).
    pub fn start_nodes(&self) -> Vec<&ExecutableNode> {
        self.nodes
            .iter()
            .filter(|n| {
                self.incoming(&n.id)
                    .iter()
                    .all(|e| e.is_feedback)
            })
            .collect()
    }

    /// Terminal nodes (endpoints and sinks).
    pub fn terminal_nodes(&self) -> Vec<&ExecutableNode> {
        self.nodes.iter().filter(|n| n.is_terminal).collect()
    }

    /// Deterministic serialization used for compile-equality checks.
    pub fn canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
