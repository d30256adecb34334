//! `endpoint` node: terminal pass-through, optionally persisting its input.

use super::{HandlerRequest, NodeHandler};
use crate::diagram::{NodeConfig, NodeType};
use crate::error::{DipeoError, Result};
use crate::services::FILE_SYSTEM;
use async_trait::async_trait;
use dipeo_state::{ContentType, Envelope};
use serde_json::Value;

pub struct EndpointHandler;

#[async_trait]
impl NodeHandler for EndpointHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Endpoint
    }

    async fn handle(&self, request: HandlerRequest<'_>) -> Result<Envelope> {
        // Pass the default input through; with several inputs, pass the map.
        let body = match request.default_input() {
            Some(envelope) => envelope.body.clone(),
            None if request.inputs.is_empty() => Value::Null,
            None => {
                let map: serde_json::Map<String, Value> = request
                    .inputs
                    .iter()
                    .map(|(handle, env)| (handle.clone(), env.body.clone()))
                    .collect();
                Value::Object(map)
            }
        };

        if let NodeConfig::Endpoint {
            save_to_file: Some(path),
        } = &request.node.config
        {
            let fs = request.services.resolve(FILE_SYSTEM)?;
            let contents = match &body {
                Value::String(s) => s.clone(),
                other => serde_json::to_string_pretty(other)
                    .map_err(|e| DipeoError::node_execution(&request.node.id, e.to_string()))?,
            };
            fs.write(path, &contents).await?;
            tracing::debug!(node_id = %request.node.id, path = %path, "Endpoint saved result");
        }

        let mut envelope = request.envelope(body);
        if let Some(input) = request.default_input() {
            if input.content_type == ContentType::RawText {
                envelope.content_type = ContentType::RawText;
            }
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::run_handler;
    use serde_json::json;

    #[tokio::test]
    async fn test_endpoint_passes_default_through() {
        let config = NodeConfig::Endpoint { save_to_file: None };
        let output = run_handler(EndpointHandler, config, [], [("default", json!(2))])
            .await
            .unwrap();
        assert_eq!(output.body, json!(2));
    }

    #[tokio::test]
    async fn test_endpoint_collects_named_handles() {
        let config = NodeConfig::Endpoint { save_to_file: None };
        let output = run_handler(
            EndpointHandler,
            config,
            [],
            [("a", json!(1)), ("b", json!("x"))],
        )
        .await
        .unwrap();
        assert_eq!(output.body, json!({"a": 1, "b": "x"}));
    }
}
