//! `sub_diagram` node: nested diagram execution.
//!
//! Two modes share the loading and output-mapping machinery:
//!
//! - **single** - one child run with the parent's registry and an event
//!   filter that hides child node chatter from the parent's observers.
//! - **batch** - bounded-parallel fan-out over an array input, one isolated
//!   child registry per item so in-flight state cannot cross-contaminate.

pub mod batch;
pub mod single;

use super::{HandlerRequest, NodeHandler};
use crate::config::new_execution_id;
use crate::diagram::{DomainDiagram, NodeConfig, NodeType};
use crate::error::{DipeoError, Result};
use crate::services::DIAGRAM_PORT;
use async_trait::async_trait;
use dipeo_state::{Envelope, ExecutionState, NodeStatus};

pub struct SubDiagramHandler;

#[async_trait]
impl NodeHandler for SubDiagramHandler {
    fn node_type(&self) -> NodeType {
        NodeType::SubDiagram
    }

    async fn handle(&self, request: HandlerRequest<'_>) -> Result<Envelope> {
        let NodeConfig::SubDiagram { batch, .. } = &request.node.config else {
            return Err(DipeoError::node_execution(
                &request.node.id,
                "sub_diagram node without sub-diagram config",
            ));
        };
        if *batch {
            batch::execute_batch(&request).await
        } else {
            single::execute_single(&request).await
        }
    }
}

/// Load the child diagram: inline data wins, otherwise the diagram port.
pub(crate) async fn load_diagram(request: &HandlerRequest<'_>) -> Result<DomainDiagram> {
    let NodeConfig::SubDiagram {
        diagram_name,
        diagram_data,
        ..
    } = &request.node.config
    else {
        return Err(DipeoError::node_execution(
            &request.node.id,
            "sub_diagram node without sub-diagram config",
        ));
    };
    if let Some(inline) = diagram_data {
        return Ok((**inline).clone());
    }
    let name = diagram_name.as_deref().ok_or_else(|| {
        DipeoError::node_execution(
            &request.node.id,
            "sub_diagram needs diagram_name or inline diagram_data",
        )
    })?;
    let port = request.services.resolve(DIAGRAM_PORT)?;
    port.load(name).await
}

/// The display name of the child diagram for metadata.
pub(crate) fn diagram_label(request: &HandlerRequest<'_>) -> String {
    match &request.node.config {
        NodeConfig::SubDiagram {
            diagram_name: Some(name),
            ..
        } => name.clone(),
        _ => "inline".to_string(),
    }
}

/// Mint a child execution id.
pub(crate) fn child_execution_id() -> String {
    new_execution_id()
}

/// Map a finished child run to this node's output value.
///
/// Preference order: any completed endpoint node's output, then the last
/// completed node's output in start order.
pub(crate) fn map_child_output(
    child_diagram: &DomainDiagram,
    state: &ExecutionState,
) -> serde_json::Value {
    let endpoint_ids: Vec<&str> = child_diagram
        .nodes
        .iter()
        .filter(|n| n.node_type() == NodeType::Endpoint)
        .map(|n| n.id.as_str())
        .collect();
    for id in &endpoint_ids {
        if let Some(envelope) = state.node_outputs.get(*id) {
            return envelope.body.clone();
        }
    }
    state
        .executed_nodes
        .iter()
        .rev()
        .find_map(|id| {
            let completed = state
                .node_states
                .get(id)
                .map(|s| s.status == NodeStatus::Completed)
                .unwrap_or(false);
            if completed {
                state.node_outputs.get(id).map(|env| env.body.clone())
            } else {
                None
            }
        })
        .unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::{DomainEdge, DomainNode};
    use dipeo_state::Envelope;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};

    fn child_diagram() -> DomainDiagram {
        DomainDiagram {
            nodes: vec![
                DomainNode::new(
                    "start",
                    NodeConfig::Start {
                        custom_data: BTreeMap::new(),
                    },
                ),
                DomainNode::new("work", NodeConfig::CodeJob { code: "1".into() }),
                DomainNode::new("end", NodeConfig::Endpoint { save_to_file: None }),
            ],
            edges: vec![
                DomainEdge::new("start", "work"),
                DomainEdge::new("work", "end"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_output_mapping_prefers_endpoint() {
        let diagram = child_diagram();
        let mut state = ExecutionState::new("exec_c", "child", HashMap::new(), HashMap::new());
        for id in ["start", "work", "end"] {
            state.record_node_started(id, chrono::Utc::now());
            state.record_node_completed(id, Envelope::new(json!(id), id, "exec_c"), None);
        }
        assert_eq!(map_child_output(&diagram, &state), json!("end"));
    }

    #[test]
    fn test_output_mapping_falls_back_to_last_completed() {
        let diagram = child_diagram();
        let mut state = ExecutionState::new("exec_c", "child", HashMap::new(), HashMap::new());
        for id in ["start", "work"] {
            state.record_node_started(id, chrono::Utc::now());
            state.record_node_completed(id, Envelope::new(json!(id), id, "exec_c"), None);
        }
        assert_eq!(map_child_output(&diagram, &state), json!("work"));
    }

    #[test]
    fn test_output_mapping_empty_run() {
        let diagram = child_diagram();
        let state = ExecutionState::new("exec_c", "child", HashMap::new(), HashMap::new());
        assert_eq!(map_child_output(&diagram, &state), serde_json::Value::Null);
    }
}
