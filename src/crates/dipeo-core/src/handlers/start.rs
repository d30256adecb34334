//! `start` node: seeds the run with the execution variables.

use super::{HandlerRequest, NodeHandler};
use crate::diagram::{NodeConfig, NodeType};
use crate::error::Result;
use async_trait::async_trait;
use dipeo_state::Envelope;
use serde_json::{Map, Value};

pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Start
    }

    async fn handle(&self, request: HandlerRequest<'_>) -> Result<Envelope> {
        let mut body = Map::new();
        for (key, value) in request.ctx.variables() {
            body.insert(key, value);
        }
        if let NodeConfig::Start { custom_data } = &request.node.config {
            for (key, value) in custom_data {
                body.insert(key.clone(), value.clone());
            }
        }
        Ok(request.envelope(Value::Object(body)))
    }
}
