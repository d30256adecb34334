//! `code_job` node: runs its source through the wired code runner.

use super::{HandlerRequest, NodeHandler};
use crate::diagram::{NodeConfig, NodeType};
use crate::error::{DipeoError, Result};
use crate::services::CODE_RUNNER;
use async_trait::async_trait;
use dipeo_state::Envelope;

pub struct CodeJobHandler;

#[async_trait]
impl NodeHandler for CodeJobHandler {
    fn node_type(&self) -> NodeType {
        NodeType::CodeJob
    }

    async fn handle(&self, request: HandlerRequest<'_>) -> Result<Envelope> {
        let NodeConfig::CodeJob { code } = &request.node.config else {
            return Err(DipeoError::node_execution(
                &request.node.id,
                "code_job node without code config",
            ));
        };
        let runner = request.services.resolve(CODE_RUNNER)?;
        let scope = request.scope();
        let result = runner
            .run(code, &scope)
            .await
            .map_err(|e| DipeoError::node_execution(&request.node.id, e.to_string()))?;
        Ok(request.envelope(result))
    }
}
