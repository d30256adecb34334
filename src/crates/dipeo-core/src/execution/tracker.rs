//! Engine-private per-execution state tracking.
//!
//! The tracker is mutated only by the engine (through the event pipeline and
//! the scheduler); canonical long-lived state lives in the state store and is
//! populated by a bus subscriber. The tracker's one hard guarantee: no two
//! `mark_started` calls succeed for the same `(node, exec_count)` pair.

use crate::diagram::ExecutableDiagram;
use crate::error::{DipeoError, Result};
use chrono::{DateTime, Utc};
use dipeo_state::{Envelope, LlmUsage, NodeId, NodeState, NodeStatus};
use std::collections::{HashMap, HashSet};

/// Per-execution map of node id to node state plus execution counts.
#[derive(Debug, Default)]
pub struct StateTracker {
    node_states: HashMap<NodeId, NodeState>,
    exec_counts: HashMap<NodeId, u32>,
    /// First-start order, repeats excluded.
    executed_nodes: Vec<NodeId>,
    node_outputs: HashMap<NodeId, Envelope>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a node has a `pending` slice.
    pub fn initialize_node(&mut self, node_id: &str) {
        self.node_states
            .entry(node_id.to_string())
            .or_insert_with(NodeState::default);
    }

    /// Transition `pending -> running`, bumping the execution count.
    ///
    /// Fails unless the node is currently `pending`, which is what makes a
    /// second start for the same `(node, exec_count)` impossible.
    pub fn mark_started(&mut self, node_id: &str) -> Result<(DateTime<Utc>, u32)> {
        let state = self
            .node_states
            .get_mut(node_id)
            .ok_or_else(|| DipeoError::Execution(format!("Unknown node '{node_id}'")))?;
        if state.status != NodeStatus::Pending {
            return Err(DipeoError::Execution(format!(
                "Node '{node_id}' cannot start from state '{}'",
                state.status
            )));
        }
        let now = Utc::now();
        state.status = NodeStatus::Running;
        state.started_at = Some(now);
        state.ended_at = None;
        state.error = None;
        let count = self.exec_counts.entry(node_id.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.executed_nodes.push(node_id.to_string());
        }
        Ok((now, *count))
    }

    pub fn mark_completed(
        &mut self,
        node_id: &str,
        output: Envelope,
        llm_usage: Option<LlmUsage>,
    ) {
        if let Some(state) = self.node_states.get_mut(node_id) {
            state.status = NodeStatus::Completed;
            state.ended_at = Some(Utc::now());
            state.llm_usage = llm_usage;
            state.output_envelope = Some(output.clone());
        }
        self.node_outputs.insert(node_id.to_string(), output);
    }

    pub fn mark_failed(&mut self, node_id: &str, error: impl Into<String>) {
        if let Some(state) = self.node_states.get_mut(node_id) {
            state.status = NodeStatus::Failed;
            state.ended_at = Some(Utc::now());
            state.error = Some(error.into());
        }
    }

    pub fn mark_skipped(&mut self, node_id: &str) {
        if let Some(state) = self.node_states.get_mut(node_id) {
            if state.status == NodeStatus::Pending {
                state.status = NodeStatus::Skipped;
            }
        }
    }

    pub fn mark_maxiter_reached(&mut self, node_id: &str) {
        if let Some(state) = self.node_states.get_mut(node_id) {
            state.status = NodeStatus::MaxiterReached;
            state.ended_at = Some(Utc::now());
        }
    }

    /// Scheduler-driven loop re-enable: `completed -> pending`, counts kept.
    pub fn reset_for_iteration(&mut self, node_id: &str) {
        if let Some(state) = self.node_states.get_mut(node_id) {
            if state.status == NodeStatus::Completed {
                state.status = NodeStatus::Pending;
            }
        }
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_states.get(node_id).map(|s| s.status)
    }

    pub fn node_state(&self, node_id: &str) -> Option<&NodeState> {
        self.node_states.get(node_id)
    }

    pub fn execution_count(&self, node_id: &str) -> u32 {
        self.exec_counts.get(node_id).copied().unwrap_or(0)
    }

    pub fn output(&self, node_id: &str) -> Option<&Envelope> {
        self.node_outputs.get(node_id)
    }

    pub fn executed_nodes(&self) -> &[NodeId] {
        &self.executed_nodes
    }

    pub fn completed_nodes(&self) -> HashSet<NodeId> {
        self.node_states
            .iter()
            .filter(|(_, s)| s.status == NodeStatus::Completed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn first_error(&self) -> Option<(NodeId, String)> {
        // Deterministic: report the earliest-started failed node.
        self.executed_nodes
            .iter()
            .find_map(|id| {
                let state = self.node_states.get(id)?;
                if state.status == NodeStatus::Failed {
                    Some((id.clone(), state.error.clone().unwrap_or_default()))
                } else {
                    None
                }
            })
    }

    pub fn any_failed(&self) -> bool {
        self.node_states
            .values()
            .any(|s| s.status == NodeStatus::Failed)
    }

    pub fn any_maxiter_reached(&self) -> bool {
        self.node_states
            .values()
            .any(|s| s.status == NodeStatus::MaxiterReached)
    }

    /// Earliest-started node whose budget ran out, if any.
    pub fn first_maxiter_reached(&self) -> Option<NodeId> {
        self.executed_nodes
            .iter()
            .find(|id| self.node_status(id) == Some(NodeStatus::MaxiterReached))
            .cloned()
    }

    /// Counts of nodes by terminal-ness, for progress reporting.
    pub fn terminal_count(&self) -> usize {
        self.node_states
            .values()
            .filter(|s| s.status.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.node_states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_states.is_empty()
    }

    /// Whether the run is over: no node is running, and either some terminal
    /// node completed or every terminal node reached a terminal state.
    pub fn is_execution_complete(&self, diagram: &ExecutableDiagram) -> bool {
        if self
            .node_states
            .values()
            .any(|s| s.status == NodeStatus::Running)
        {
            return false;
        }
        let terminals = diagram.terminal_nodes();
        if terminals
            .iter()
            .any(|n| self.node_status(&n.id) == Some(NodeStatus::Completed))
        {
            return true;
        }
        !terminals.is_empty()
            && terminals
                .iter()
                .all(|n| self.node_status(&n.id).is_some_and(|s| s.is_terminal()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::{DiagramCompiler, DomainDiagram, DomainEdge, DomainNode, NodeConfig};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn tracker_for(diagram: &ExecutableDiagram) -> StateTracker {
        let mut tracker = StateTracker::new();
        for node in &diagram.nodes {
            tracker.initialize_node(&node.id);
        }
        tracker
    }

    fn linear_diagram() -> ExecutableDiagram {
        let diagram = DomainDiagram {
            nodes: vec![
                DomainNode::new(
                    "start",
                    NodeConfig::Start {
                        custom_data: BTreeMap::new(),
                    },
                ),
                DomainNode::new(
                    "end",
                    NodeConfig::Endpoint { save_to_file: None },
                ),
            ],
            edges: vec![DomainEdge::new("start", "end")],
            ..Default::default()
        };
        DiagramCompiler::new().compile(&diagram).unwrap()
    }

    #[test]
    fn test_double_start_rejected() {
        let diagram = linear_diagram();
        let mut tracker = tracker_for(&diagram);
        let (_, count) = tracker.mark_started("start").unwrap();
        assert_eq!(count, 1);
        assert!(tracker.mark_started("start").is_err());
    }

    #[test]
    fn test_reset_preserves_count() {
        let diagram = linear_diagram();
        let mut tracker = tracker_for(&diagram);
        tracker.mark_started("start").unwrap();
        tracker.mark_completed("start", Envelope::new(json!(1), "start", "exec_1"), None);
        tracker.reset_for_iteration("start");
        assert_eq!(tracker.node_status("start"), Some(NodeStatus::Pending));
        let (_, count) = tracker.mark_started("start").unwrap();
        assert_eq!(count, 2);
        // The first iteration's output stays visible.
        assert!(tracker.output("start").is_some());
    }

    #[test]
    fn test_completion_via_terminal_node() {
        let diagram = linear_diagram();
        let mut tracker = tracker_for(&diagram);
        assert!(!tracker.is_execution_complete(&diagram));

        tracker.mark_started("start").unwrap();
        assert!(!tracker.is_execution_complete(&diagram));
        tracker.mark_completed("start", Envelope::new(json!(null), "start", "exec_1"), None);

        tracker.mark_started("end").unwrap();
        tracker.mark_completed("end", Envelope::new(json!(null), "end", "exec_1"), None);
        assert!(tracker.is_execution_complete(&diagram));
    }

    #[test]
    fn test_completion_when_all_terminals_dead() {
        let diagram = linear_diagram();
        let mut tracker = tracker_for(&diagram);
        tracker.mark_started("start").unwrap();
        tracker.mark_failed("start", "boom");
        tracker.mark_skipped("end");
        assert!(tracker.is_execution_complete(&diagram));
        assert!(tracker.any_failed());
        assert_eq!(tracker.first_error().unwrap().0, "start");
    }

    #[test]
    fn test_skip_only_from_pending() {
        let diagram = linear_diagram();
        let mut tracker = tracker_for(&diagram);
        tracker.mark_started("start").unwrap();
        tracker.mark_completed("start", Envelope::new(json!(1), "start", "exec_1"), None);
        tracker.mark_skipped("start");
        assert_eq!(tracker.node_status("start"), Some(NodeStatus::Completed));
    }
}
