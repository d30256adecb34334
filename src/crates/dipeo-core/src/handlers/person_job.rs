//! `person_job` node: one LLM turn for a diagram person.
//!
//! The prompt template renders against the handler scope; on the first
//! iteration of a loop the `first_only_prompt` wins when present. Token
//! usage is attached to the output envelope metadata so the dispatcher can
//! roll it into the execution totals.

use super::{HandlerRequest, NodeHandler};
use crate::diagram::{NodeConfig, NodeType};
use crate::error::{DipeoError, Result};
use crate::services::{LlmMessage, LlmRequest, API_KEY_SERVICE, LLM_SERVICE, PROMPT_BUILDER};
use async_trait::async_trait;
use dipeo_state::Envelope;
use serde_json::json;

pub struct PersonJobHandler;

#[async_trait]
impl NodeHandler for PersonJobHandler {
    fn node_type(&self) -> NodeType {
        NodeType::PersonJob
    }

    async fn handle(&self, request: HandlerRequest<'_>) -> Result<Envelope> {
        let NodeConfig::PersonJob {
            prompt,
            first_only_prompt,
            resolved_person,
            ..
        } = &request.node.config
        else {
            return Err(DipeoError::node_execution(
                &request.node.id,
                "person_job node without person config",
            ));
        };

        let exec_count = request
            .ctx
            .with_tracker(|t| t.execution_count(&request.node.id));
        let template = match (exec_count, first_only_prompt) {
            (1, Some(first)) => first,
            _ => prompt,
        };

        let scope = request.scope();
        let builder = request.services.resolve(PROMPT_BUILDER)?;
        let rendered = builder.build(template, &scope)?;

        let person = resolved_person.as_ref().ok_or_else(|| {
            DipeoError::node_execution(&request.node.id, "person_job has no bound person")
        })?;

        let api_key = match &person.api_key_id {
            Some(key_id) => {
                let keys = request.services.resolve(API_KEY_SERVICE)?;
                keys.get_key(key_id).await?
            }
            None => None,
        };

        let llm = request.services.resolve(LLM_SERVICE)?;
        let response = llm
            .complete(LlmRequest {
                service: person.service.clone(),
                model: person.model.clone(),
                messages: vec![LlmMessage::user(rendered)],
                api_key,
            })
            .await
            .map_err(|e| DipeoError::node_execution(&request.node.id, e.to_string()))?;

        tracing::debug!(
            node_id = %request.node.id,
            model = %person.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "LLM turn completed"
        );

        Ok(request
            .envelope(json!(response.text))
            .with_meta("llm_usage", serde_json::to_value(response.usage)?)
            .with_meta("model", json!(person.model)))
    }
}
