//! Execution and node state records.

use crate::envelope::{Envelope, ExecutionId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Terminal and in-flight statuses for a whole execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
    MaxiterReached,
}

impl Status {
    /// Whether this status ends the execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed | Status::Aborted | Status::MaxiterReached
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Aborted => "aborted",
            Status::MaxiterReached => "maxiter_reached",
        };
        write!(f, "{s}")
    }
}

/// Per-node lifecycle status.
///
/// Transitions are monotonic except `completed/failed -> pending`, which the
/// scheduler applies when it re-enables a loop node for a further iteration
/// (the execution count is preserved separately).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    MaxiterReached,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed
                | NodeStatus::Failed
                | NodeStatus::Skipped
                | NodeStatus::MaxiterReached
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::MaxiterReached => "maxiter_reached",
        };
        write!(f, "{s}")
    }
}

/// Aggregated LLM token usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
}

impl LlmUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Accumulate another usage record into this one.
    pub fn add(&mut self, other: &LlmUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        if let Some(c) = other.cached_tokens {
            *self.cached_tokens.get_or_insert(0) += c;
        }
    }
}

/// State of one node within an execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_usage: Option<LlmUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_envelope: Option<Envelope>,
}

impl Default for NodeStatus {
    fn default() -> Self {
        NodeStatus::Pending
    }
}

/// The root record for one diagram run.
///
/// Created by the execute-diagram use case, mutated only by subscribers
/// reacting to bus events, terminal once a final status event is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub id: ExecutionId,
    pub diagram_id: String,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Number of `node_started` events per node.
    #[serde(default)]
    pub exec_counts: HashMap<NodeId, u32>,
    /// Nodes that started, in insertion order (repeats excluded).
    #[serde(default)]
    pub executed_nodes: Vec<NodeId>,
    #[serde(default)]
    pub node_states: HashMap<NodeId, NodeState>,
    /// Latest output envelope per node, retained for the life of the run.
    #[serde(default)]
    pub node_outputs: HashMap<NodeId, Envelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub llm_usage: LlmUsage,
}

impl ExecutionState {
    /// Create a fresh `pending` record.
    pub fn new(
        id: impl Into<ExecutionId>,
        diagram_id: impl Into<String>,
        variables: HashMap<String, Value>,
        metadata: HashMap<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            diagram_id: diagram_id.into(),
            status: Status::Pending,
            started_at: Utc::now(),
            ended_at: None,
            variables,
            metadata,
            exec_counts: HashMap::new(),
            executed_nodes: Vec::new(),
            node_states: HashMap::new(),
            node_outputs: HashMap::new(),
            error: None,
            llm_usage: LlmUsage::default(),
        }
    }

    /// Validated status transition. Terminal states accept no successor;
    /// `pending` may only move to `running` or a terminal state.
    pub fn transition(&mut self, to: Status) -> crate::error::Result<()> {
        let from = self.status;
        let ok = match (from, to) {
            (a, b) if a == b => true,
            (Status::Pending, Status::Running) => true,
            (Status::Pending, s) | (Status::Running, s) if s.is_terminal() => true,
            _ => false,
        };
        if !ok {
            return Err(crate::error::StateStoreError::invalid_transition(
                &self.id, from, to,
            ));
        }
        self.status = to;
        if to.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record a node start: bumps the exec count, appends to the executed
    /// list on first start, and resets the node slice to `running`.
    pub fn record_node_started(&mut self, node_id: &str, at: DateTime<Utc>) {
        let count = self.exec_counts.entry(node_id.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.executed_nodes.push(node_id.to_string());
        }
        let node = self.node_states.entry(node_id.to_string()).or_default();
        node.status = NodeStatus::Running;
        node.started_at = Some(at);
        node.ended_at = None;
        node.error = None;
    }

    /// Record a node completion with its output envelope.
    pub fn record_node_completed(
        &mut self,
        node_id: &str,
        output: Envelope,
        llm_usage: Option<LlmUsage>,
    ) {
        let node = self.node_states.entry(node_id.to_string()).or_default();
        node.status = NodeStatus::Completed;
        node.ended_at = Some(Utc::now());
        node.llm_usage = llm_usage;
        node.output_envelope = Some(output.clone());
        if let Some(usage) = llm_usage {
            self.llm_usage.add(&usage);
        }
        self.node_outputs.insert(node_id.to_string(), output);
    }

    /// Record a node failure.
    pub fn record_node_error(&mut self, node_id: &str, error: impl Into<String>) {
        let node = self.node_states.entry(node_id.to_string()).or_default();
        node.status = NodeStatus::Failed;
        node.ended_at = Some(Utc::now());
        node.error = Some(error.into());
    }
}
