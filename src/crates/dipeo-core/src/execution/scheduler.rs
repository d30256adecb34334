//! Ready-node computation.
//!
//! A node is ready when it is `pending`, its iteration budget is not
//! exhausted, and its join over incoming edges is satisfied:
//!
//! - **Default join**: every non-feedback source completed for this
//!   iteration.
//! - **Conditional source**: only the edge whose handle matches the branch
//!   the condition produced counts; the untaken edge is soft-dead and never
//!   blocks.
//! - **Feedback edges**: satisfied once the source has produced any output
//!   this or a prior iteration (tracked by output presence, not status); a
//!   node that has never run ignores its feedback edges entirely, otherwise
//!   nothing could ever enter a loop.
//!
//! A `failed` or `maxiter_reached` source poisons its targets (they are
//! skipped); a node whose every incoming edge is soft-dead is skipped too,
//! and skips cascade within one scan. Skipped sources never block a join,
//! which is how the untaken branch of a conditional re-joins at a shared
//! downstream node.
//!
//! Ready nodes come back in `(priority desc, node id asc)` order; the engine
//! may dispatch them in parallel.

use crate::diagram::{ExecutableDiagram, ExecutableNode, NodeType};
use crate::execution::tracker::StateTracker;
use dipeo_state::NodeStatus;
use serde::Serialize;
use std::sync::Arc;

/// Join evaluation outcome for one node.
#[derive(Debug, PartialEq)]
enum Join {
    Ready,
    Wait,
    /// Every live path to this node is gone.
    Dead,
}

/// Scheduler-side accounting surfaced in progress frames.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub maxiter_reached: usize,
    /// Loop re-enables performed so far.
    pub reenabled: u64,
}

/// Computes ready nodes from the completion set, edge dependencies, join
/// policies, and iteration budgets.
pub struct NodeScheduler {
    diagram: Arc<ExecutableDiagram>,
    reenabled: u64,
}

impl NodeScheduler {
    pub fn new(diagram: Arc<ExecutableDiagram>) -> Self {
        Self {
            diagram,
            reenabled: 0,
        }
    }

    /// Compute the ready set, cascading skips for dead paths first.
    pub fn ready_nodes(&mut self, tracker: &mut StateTracker) -> Vec<ExecutableNode> {
        // Skip propagation to a fixed point: skipping one node can kill the
        // last live path into another.
        loop {
            let mut changed = false;
            for node in &self.diagram.nodes {
                if tracker.node_status(&node.id) != Some(NodeStatus::Pending) {
                    continue;
                }
                if self.evaluate_join(node, tracker) == Join::Dead {
                    tracing::debug!(node_id = %node.id, "Skipping node with no live inputs");
                    tracker.mark_skipped(&node.id);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut ready: Vec<ExecutableNode> = self
            .diagram
            .nodes
            .iter()
            .filter(|node| {
                tracker.node_status(&node.id) == Some(NodeStatus::Pending)
                    && tracker.execution_count(&node.id) < node.max_iterations
                    && self.evaluate_join(node, tracker) == Join::Ready
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        ready
    }

    fn evaluate_join(&self, node: &ExecutableNode, tracker: &StateTracker) -> Join {
        let incoming = self.diagram.incoming(&node.id);
        if incoming.is_empty() {
            return Join::Ready;
        }

        let has_run = tracker.execution_count(&node.id) > 0;
        let mut any_live = false;

        for edge in incoming {
            if edge.is_feedback {
                // First iteration ignores feedback; later iterations need
                // the producer to have emitted something at least once.
                if has_run && tracker.output(&edge.source).is_none() {
                    return Join::Wait;
                }
                if tracker.output(&edge.source).is_some() {
                    any_live = true;
                }
                continue;
            }

            let source_status = tracker.node_status(&edge.source);
            match source_status {
                Some(NodeStatus::Completed) => {
                    if self.is_condition(&edge.source) {
                        match self.taken_branch(&edge.source, tracker) {
                            Some(branch) if branch == edge.source_handle => any_live = true,
                            // Untaken branch: soft-dead, does not block.
                            _ => {}
                        }
                    } else {
                        any_live = true;
                    }
                }
                Some(NodeStatus::Skipped) => {}
                Some(NodeStatus::Failed) | Some(NodeStatus::MaxiterReached) => {
                    return Join::Dead;
                }
                Some(NodeStatus::Pending) | Some(NodeStatus::Running) | None => {
                    return Join::Wait;
                }
            }
        }

        if any_live {
            Join::Ready
        } else {
            Join::Dead
        }
    }

    /// Scheduler accounting after a node completes: re-enable loop targets
    /// whose feedback producer just fired.
    ///
    /// A feedback edge from a condition demands a re-fire only when its
    /// branch was taken; an exhausted budget there is a real
    /// `maxiter_reached`. An unconditional feedback edge exhausting its
    /// budget is a normal loop exit and leaves the target completed.
    pub fn mark_node_completed(&mut self, node_id: &str, tracker: &mut StateTracker) {
        let outgoing: Vec<usize> = self
            .diagram
            .edges_by_source
            .get(node_id)
            .cloned()
            .unwrap_or_default();
        for idx in outgoing {
            let edge = &self.diagram.edges[idx];
            if !edge.is_feedback {
                continue;
            }
            let demanded = if self.is_condition(&edge.source) {
                self.taken_branch(&edge.source, tracker).as_deref()
                    == Some(edge.source_handle.as_str())
            } else {
                true
            };
            if !demanded {
                continue;
            }
            let Some(target) = self.diagram.node(&edge.target) else {
                continue;
            };
            if tracker.node_status(&target.id) != Some(NodeStatus::Completed) {
                continue;
            }
            if tracker.execution_count(&target.id) < target.max_iterations {
                tracing::debug!(
                    node_id = %target.id,
                    exec_count = tracker.execution_count(&target.id),
                    budget = target.max_iterations,
                    "Re-enabling loop node"
                );
                tracker.reset_for_iteration(&target.id);
                self.reenabled += 1;
            } else if self.is_condition(&edge.source) {
                tracing::warn!(
                    node_id = %target.id,
                    budget = target.max_iterations,
                    "Loop demands another iteration but budget is exhausted"
                );
                tracker.mark_maxiter_reached(&target.id);
            }
        }
    }

    pub fn stats(&self, tracker: &StateTracker) -> SchedulerStats {
        let mut stats = SchedulerStats {
            reenabled: self.reenabled,
            ..Default::default()
        };
        for node in &self.diagram.nodes {
            match tracker.node_status(&node.id) {
                Some(NodeStatus::Pending) => stats.pending += 1,
                Some(NodeStatus::Running) => stats.running += 1,
                Some(NodeStatus::Completed) => stats.completed += 1,
                Some(NodeStatus::Failed) => stats.failed += 1,
                Some(NodeStatus::Skipped) => stats.skipped += 1,
                Some(NodeStatus::MaxiterReached) => stats.maxiter_reached += 1,
                None => {}
            }
        }
        stats
    }

    fn is_condition(&self, node_id: &str) -> bool {
        self.diagram
            .node(node_id)
            .map(|n| n.node_type == NodeType::Condition)
            .unwrap_or(false)
    }

    /// The branch a completed condition produced (`"true"`/`"false"`),
    /// recorded in its output envelope metadata.
    fn taken_branch(&self, node_id: &str, tracker: &StateTracker) -> Option<String> {
        tracker
            .output(node_id)
            .and_then(|env| env.meta.get("branch"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}
