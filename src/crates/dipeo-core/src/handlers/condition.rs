//! `condition` node: evaluates its expression and routes a branch.
//!
//! The produced envelope records the taken branch in metadata; the scheduler
//! reads it to decide which outgoing edge counts.

use super::{HandlerRequest, NodeHandler};
use crate::diagram::{NodeConfig, NodeType};
use crate::error::{DipeoError, Result};
use crate::expr;
use async_trait::async_trait;
use dipeo_state::Envelope;
use serde_json::json;

pub struct ConditionHandler;

#[async_trait]
impl NodeHandler for ConditionHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Condition
    }

    async fn handle(&self, request: HandlerRequest<'_>) -> Result<Envelope> {
        let NodeConfig::Condition { expression } = &request.node.config else {
            return Err(DipeoError::node_execution(
                &request.node.id,
                "condition node without condition config",
            ));
        };
        let scope = request.scope();
        let taken = expr::evaluate_bool(expression, &scope)
            .map_err(|e| DipeoError::node_execution(&request.node.id, e.to_string()))?;
        let branch = if taken { "true" } else { "false" };
        tracing::debug!(
            node_id = %request.node.id,
            expression = %expression,
            branch,
            "Condition evaluated"
        );
        Ok(request
            .envelope(json!(taken))
            .with_meta("branch", json!(branch)))
    }
}
