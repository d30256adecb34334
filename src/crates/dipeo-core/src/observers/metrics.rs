//! Metrics aggregation over the event stream.
//!
//! Tracks per-node durations, token usage, and errors per execution, derives
//! the critical path (longest-duration chain of completed nodes from any
//! source to any terminal over non-feedback edges), and publishes a
//! `metrics_collected` event when the execution ends so the summary lands in
//! the persisted record.

use crate::diagram::ExecutableDiagram;
use crate::error::Result;
use crate::events::{
    DomainEvent, EventHandler, EventPayload, EventType, HandlerPriority, InProcessEventBus,
};
use crate::registry::ServiceKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dipeo_state::LlmUsage;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Registry key for the shared metrics observer.
pub const METRICS_OBSERVER: ServiceKey<Arc<MetricsObserver>> = ServiceKey::new("metrics_observer");

/// Metrics for one node (latest run).
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeMetrics {
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<LlmUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub exec_count: u32,
}

/// Aggregate metrics for one execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionMetrics {
    pub execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub total_duration_ms: u64,
    pub node_metrics: HashMap<String, NodeMetrics>,
    /// Longest-duration completed chain, source to terminal.
    pub critical_path: Vec<String>,
    pub critical_path_duration_ms: u64,
    pub total_llm_usage: LlmUsage,
    pub error_count: u32,
}

struct WatchedExecution {
    metrics: ExecutionMetrics,
    diagram: Option<Arc<ExecutableDiagram>>,
}

/// Pure-subscriber metrics aggregator.
pub struct MetricsObserver {
    executions: Mutex<HashMap<String, WatchedExecution>>,
    bus: Mutex<Option<Weak<InProcessEventBus>>>,
}

impl MetricsObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            executions: Mutex::new(HashMap::new()),
            bus: Mutex::new(None),
        })
    }

    /// Subscribe to the lifecycle events. Idempotent per bus.
    pub fn attach(self: &Arc<Self>, bus: &Arc<InProcessEventBus>) {
        *self.bus.lock() = Some(Arc::downgrade(bus));
        bus.subscribe(
            &[
                EventType::ExecutionStarted,
                EventType::NodeStarted,
                EventType::NodeCompleted,
                EventType::NodeError,
                EventType::ExecutionCompleted,
                EventType::ExecutionError,
            ],
            self.clone(),
            HandlerPriority::Normal,
            None,
        );
    }

    /// Start tracking an execution; the diagram enables critical-path
    /// derivation. Idempotent.
    pub fn watch_execution(&self, execution_id: &str, diagram: Arc<ExecutableDiagram>) {
        let mut executions = self.executions.lock();
        let entry = executions
            .entry(execution_id.to_string())
            .or_insert_with(|| WatchedExecution {
                metrics: ExecutionMetrics {
                    execution_id: execution_id.to_string(),
                    ..Default::default()
                },
                diagram: None,
            });
        entry.diagram = Some(diagram);
    }

    pub fn get_execution_metrics(&self, execution_id: &str) -> Option<ExecutionMetrics> {
        self.executions
            .lock()
            .get(execution_id)
            .map(|w| w.metrics.clone())
    }

    /// Compact summary for CLI/transport use.
    pub fn get_metrics_summary(&self, execution_id: &str) -> Option<serde_json::Value> {
        self.executions.lock().get(execution_id).map(|w| {
            let m = &w.metrics;
            serde_json::json!({
                "execution_id": m.execution_id,
                "total_duration_ms": m.total_duration_ms,
                "nodes": m.node_metrics.len(),
                "errors": m.error_count,
                "critical_path": m.critical_path,
                "critical_path_duration_ms": m.critical_path_duration_ms,
                "llm_input_tokens": m.total_llm_usage.input_tokens,
                "llm_output_tokens": m.total_llm_usage.output_tokens,
            })
        })
    }

    /// Executions currently tracked, newest unspecified order.
    pub fn tracked_executions(&self) -> Vec<String> {
        self.executions.lock().keys().cloned().collect()
    }

    fn finalize(&self, execution_id: &str, ended_at: DateTime<Utc>) -> Option<serde_json::Value> {
        let mut executions = self.executions.lock();
        let watched = executions.get_mut(execution_id)?;
        watched.metrics.ended_at = Some(ended_at);
        if let Some(started) = watched.metrics.started_at {
            watched.metrics.total_duration_ms =
                (ended_at - started).num_milliseconds().max(0) as u64;
        }
        if let Some(diagram) = &watched.diagram {
            let (path, duration) = critical_path(diagram, &watched.metrics.node_metrics);
            watched.metrics.critical_path = path;
            watched.metrics.critical_path_duration_ms = duration;
        }
        serde_json::to_value(&watched.metrics).ok()
    }
}

/// Longest-duration chain over non-feedback edges, restricted to nodes that
/// completed without error.
fn critical_path(
    diagram: &ExecutableDiagram,
    node_metrics: &HashMap<String, NodeMetrics>,
) -> (Vec<String>, u64) {
    let completed = |id: &str| -> Option<u64> {
        node_metrics
            .get(id)
            .filter(|m| m.error.is_none() && m.exec_count > 0)
            .map(|m| m.duration_ms)
    };

    // Nodes are id-sorted and the graph (minus feedback edges) is acyclic,
    // so a memoized DFS terminates.
    fn best(
        diagram: &ExecutableDiagram,
        id: &str,
        completed: &dyn Fn(&str) -> Option<u64>,
        memo: &mut HashMap<String, (u64, Vec<String>)>,
    ) -> (u64, Vec<String>) {
        if let Some(found) = memo.get(id) {
            return found.clone();
        }
        let Some(own) = completed(id) else {
            return (0, Vec::new());
        };
        // Best continuation: longest child chain, authored edge order on
        // ties so zero-duration runs still yield a full source-to-terminal
        // path.
        let mut continuation: Option<(u64, Vec<String>)> = None;
        for edge in diagram.outgoing(id) {
            if edge.is_feedback {
                continue;
            }
            let (sub_duration, sub_path) = best(diagram, &edge.target, completed, memo);
            if sub_path.is_empty() {
                continue;
            }
            let better = match &continuation {
                None => true,
                Some((current, _)) => sub_duration > *current,
            };
            if better {
                continuation = Some((sub_duration, sub_path));
            }
        }
        let chain = match continuation {
            Some((sub_duration, sub_path)) => {
                let mut path = vec![id.to_string()];
                path.extend(sub_path);
                (own + sub_duration, path)
            }
            None => (own, vec![id.to_string()]),
        };
        memo.insert(id.to_string(), chain.clone());
        chain
    }

    let mut memo = HashMap::new();
    let mut result = (0u64, Vec::new());
    for node in diagram.start_nodes() {
        let (duration, path) = best(diagram, &node.id, &completed, &mut memo);
        if duration > result.0 || (duration == result.0 && result.1.is_empty()) {
            result = (duration, path);
        }
    }
    (result.1, result.0)
}

impl Default for MetricsObserver {
    fn default() -> Self {
        Self {
            executions: Mutex::new(HashMap::new()),
            bus: Mutex::new(None),
        }
    }
}

#[async_trait]
impl EventHandler for MetricsObserver {
    fn name(&self) -> &str {
        "metrics_observer"
    }

    async fn on_event(&self, event: &DomainEvent) -> Result<()> {
        let execution_id = event.scope.execution_id.clone();
        match &event.payload {
            EventPayload::ExecutionStarted { .. } => {
                let mut executions = self.executions.lock();
                let entry = executions
                    .entry(execution_id.clone())
                    .or_insert_with(|| WatchedExecution {
                        metrics: ExecutionMetrics {
                            execution_id: execution_id.clone(),
                            ..Default::default()
                        },
                        diagram: None,
                    });
                entry.metrics.started_at = Some(event.timestamp);
            }
            EventPayload::NodeStarted { exec_count, .. } => {
                if let Some(node_id) = &event.scope.node_id {
                    let mut executions = self.executions.lock();
                    if let Some(watched) = executions.get_mut(&execution_id) {
                        let node = watched
                            .metrics
                            .node_metrics
                            .entry(node_id.clone())
                            .or_default();
                        node.exec_count = *exec_count;
                    }
                }
            }
            EventPayload::NodeCompleted {
                duration_ms,
                llm_usage,
                exec_count,
                ..
            } => {
                if let Some(node_id) = &event.scope.node_id {
                    let mut executions = self.executions.lock();
                    if let Some(watched) = executions.get_mut(&execution_id) {
                        let node = watched
                            .metrics
                            .node_metrics
                            .entry(node_id.clone())
                            .or_default();
                        node.duration_ms = *duration_ms;
                        node.exec_count = *exec_count;
                        node.token_usage = *llm_usage;
                        node.error = None;
                        if let Some(usage) = llm_usage {
                            watched.metrics.total_llm_usage.add(usage);
                        }
                    }
                }
            }
            EventPayload::NodeError {
                message,
                exec_count,
            } => {
                if let Some(node_id) = &event.scope.node_id {
                    let mut executions = self.executions.lock();
                    if let Some(watched) = executions.get_mut(&execution_id) {
                        let node = watched
                            .metrics
                            .node_metrics
                            .entry(node_id.clone())
                            .or_default();
                        node.error = Some(message.clone());
                        node.exec_count = *exec_count;
                        watched.metrics.error_count += 1;
                    }
                }
            }
            EventPayload::ExecutionCompleted { .. } | EventPayload::ExecutionError { .. } => {
                if let Some(metrics) = self.finalize(&execution_id, event.timestamp) {
                    let bus = self.bus.lock().clone();
                    if let Some(bus) = bus.and_then(|weak| weak.upgrade()) {
                        bus.publish(DomainEvent::metrics_collected(execution_id, metrics));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::{DiagramCompiler, DomainDiagram, DomainEdge, DomainNode, NodeConfig};
    use std::collections::BTreeMap;

    fn diamond() -> Arc<ExecutableDiagram> {
        let diagram = DomainDiagram {
            nodes: vec![
                DomainNode::new(
                    "start",
                    NodeConfig::Start {
                        custom_data: BTreeMap::new(),
                    },
                ),
                DomainNode::new("slow", NodeConfig::CodeJob { code: "1".into() }),
                DomainNode::new("fast", NodeConfig::CodeJob { code: "2".into() }),
                DomainNode::new("end", NodeConfig::Endpoint { save_to_file: None }),
            ],
            edges: vec![
                DomainEdge::new("start", "slow"),
                DomainEdge::new("start", "fast"),
                DomainEdge::new("slow", "end"),
                DomainEdge::new("fast", "end"),
            ],
            ..Default::default()
        };
        Arc::new(DiagramCompiler::new().compile(&diagram).unwrap())
    }

    fn metric(duration_ms: u64) -> NodeMetrics {
        NodeMetrics {
            duration_ms,
            token_usage: None,
            error: None,
            exec_count: 1,
        }
    }

    #[test]
    fn test_critical_path_picks_slowest_chain() {
        let diagram = diamond();
        let mut nodes = HashMap::new();
        nodes.insert("start".to_string(), metric(5));
        nodes.insert("slow".to_string(), metric(100));
        nodes.insert("fast".to_string(), metric(10));
        nodes.insert("end".to_string(), metric(1));

        let (path, duration) = critical_path(&diagram, &nodes);
        assert_eq!(path, vec!["start", "slow", "end"]);
        assert_eq!(duration, 106);
    }

    #[test]
    fn test_critical_path_skips_failed_nodes() {
        let diagram = diamond();
        let mut nodes = HashMap::new();
        nodes.insert("start".to_string(), metric(5));
        let mut failed = metric(100);
        failed.error = Some("boom".into());
        nodes.insert("slow".to_string(), failed);
        nodes.insert("fast".to_string(), metric(10));
        nodes.insert("end".to_string(), metric(1));

        let (path, duration) = critical_path(&diagram, &nodes);
        assert_eq!(path, vec!["start", "fast", "end"]);
        assert_eq!(duration, 16);
    }

    #[tokio::test]
    async fn test_observer_aggregates_usage_and_errors() {
        use dipeo_state::Envelope;
        let observer = MetricsObserver::new();
        observer.watch_execution("exec_m", diamond());

        let started = DomainEvent::execution_started("exec_m", Default::default());
        observer.on_event(&started).await.unwrap();
        observer
            .on_event(&DomainEvent::node_completed(
                "exec_m",
                "slow",
                Envelope::new(serde_json::json!(1), "slow", "exec_m"),
                40,
                1,
                Some(LlmUsage {
                    input_tokens: 7,
                    output_tokens: 3,
                    cached_tokens: None,
                }),
            ))
            .await
            .unwrap();
        observer
            .on_event(&DomainEvent::node_error("exec_m", "fast", "boom", 1))
            .await
            .unwrap();

        let metrics = observer.get_execution_metrics("exec_m").unwrap();
        assert_eq!(metrics.total_llm_usage.total(), 10);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.node_metrics["slow"].duration_ms, 40);
    }
}
