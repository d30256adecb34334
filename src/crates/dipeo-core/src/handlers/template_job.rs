//! `template_job` node: renders its template against the handler scope.

use super::{HandlerRequest, NodeHandler};
use crate::diagram::{NodeConfig, NodeType};
use crate::error::{DipeoError, Result};
use crate::services::TEMPLATE_PROCESSOR;
use async_trait::async_trait;
use dipeo_state::Envelope;
use serde_json::json;

pub struct TemplateJobHandler;

#[async_trait]
impl NodeHandler for TemplateJobHandler {
    fn node_type(&self) -> NodeType {
        NodeType::TemplateJob
    }

    async fn handle(&self, request: HandlerRequest<'_>) -> Result<Envelope> {
        let NodeConfig::TemplateJob { template } = &request.node.config else {
            return Err(DipeoError::node_execution(
                &request.node.id,
                "template_job node without template config",
            ));
        };
        let templates = request.services.resolve(TEMPLATE_PROCESSOR)?;
        let rendered = templates
            .render(template, &request.scope())
            .map_err(|e| DipeoError::node_execution(&request.node.id, e.to_string()))?;
        Ok(request.envelope(json!(rendered)))
    }
}
