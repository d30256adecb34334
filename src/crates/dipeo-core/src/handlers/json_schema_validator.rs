//! `json_schema_validator` node: validates its input against a JSON schema.

use super::{HandlerRequest, NodeHandler};
use crate::diagram::{NodeConfig, NodeType};
use crate::error::{DipeoError, Result};
use async_trait::async_trait;
use dipeo_state::Envelope;
use serde_json::Value;

pub struct JsonSchemaValidatorHandler;

#[async_trait]
impl NodeHandler for JsonSchemaValidatorHandler {
    fn node_type(&self) -> NodeType {
        NodeType::JsonSchemaValidator
    }

    async fn handle(&self, request: HandlerRequest<'_>) -> Result<Envelope> {
        let NodeConfig::JsonSchemaValidator { schema } = &request.node.config else {
            return Err(DipeoError::node_execution(
                &request.node.id,
                "json_schema_validator node without schema config",
            ));
        };
        let payload = request
            .default_input()
            .map(|env| env.body.clone())
            .unwrap_or(Value::Null);

        validate(schema, &payload)
            .map_err(|violations| {
                DipeoError::node_execution(
                    &request.node.id,
                    format!("schema validation failed: {}", violations.join("; ")),
                )
            })?;

        // Valid input passes through unchanged.
        Ok(request.envelope(payload))
    }
}

#[cfg(feature = "json-validation")]
fn validate(schema: &Value, payload: &Value) -> std::result::Result<(), Vec<String>> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| vec![format!("invalid schema: {e}")])?;
    let outcome = compiled.validate(payload);
    match outcome {
        Ok(()) => Ok(()),
        Err(errors) => Err(errors.map(|e| e.to_string()).collect()),
    }
}

#[cfg(not(feature = "json-validation"))]
fn validate(_schema: &Value, _payload: &Value) -> std::result::Result<(), Vec<String>> {
    Err(vec![
        "json_schema_validator requires the 'json-validation' feature".to_string(),
    ])
}
