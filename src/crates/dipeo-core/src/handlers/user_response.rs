//! `user_response` node: interactive prompt with timeout fallback.
//!
//! Emits an `interactive_prompt` event for observers, then asks the wired
//! interactive handler. Without a handler, or when the prompt times out, the
//! configured default resolves the node. Cancellation is cooperative: an
//! aborted execution abandons the pending prompt.

use super::{HandlerRequest, NodeHandler};
use crate::diagram::{NodeConfig, NodeType};
use crate::error::{DipeoError, Result};
use crate::events::DomainEvent;
use crate::services::{PromptRequest, EVENT_BUS};
use async_trait::async_trait;
use dipeo_state::Envelope;
use serde_json::Value;
use std::time::Duration;

pub struct UserResponseHandler;

#[async_trait]
impl NodeHandler for UserResponseHandler {
    fn node_type(&self) -> NodeType {
        NodeType::UserResponse
    }

    async fn handle(&self, request: HandlerRequest<'_>) -> Result<Envelope> {
        let NodeConfig::UserResponse {
            prompt,
            timeout_s,
            default,
        } = &request.node.config
        else {
            return Err(DipeoError::node_execution(
                &request.node.id,
                "user_response node without prompt config",
            ));
        };

        if let Ok(bus) = request.services.resolve(EVENT_BUS) {
            bus.publish(DomainEvent::interactive_prompt(
                request.ctx.execution_id.clone(),
                request.node.id.clone(),
                prompt.clone(),
                *timeout_s,
            ));
        }

        let fallback = || {
            default.clone().ok_or_else(|| {
                DipeoError::node_execution(
                    &request.node.id,
                    "no interactive handler wired and no default configured",
                )
            })
        };

        let Some(handler) = &request.ctx.interactive_handler else {
            return Ok(request.envelope(fallback()?));
        };

        let prompt_request = PromptRequest {
            execution_id: request.ctx.execution_id.clone(),
            node_id: request.node.id.clone(),
            prompt: prompt.clone(),
            timeout_s: *timeout_s,
        };

        let answer: Option<Value> = tokio::select! {
            answered = tokio::time::timeout(
                Duration::from_secs(*timeout_s),
                handler.prompt(prompt_request),
            ) => match answered {
                Ok(Ok(value)) => Some(value),
                Ok(Err(e)) => {
                    tracing::warn!(
                        node_id = %request.node.id,
                        error = %e,
                        "Interactive handler failed; using default"
                    );
                    None
                }
                Err(_) => {
                    tracing::info!(
                        node_id = %request.node.id,
                        timeout_s,
                        "Prompt timed out; using default"
                    );
                    None
                }
            },
            _ = request.ctx.abort.aborted() => {
                return Err(DipeoError::Cancelled(format!(
                    "prompt at node '{}' abandoned",
                    request.node.id
                )));
            }
        };

        match answer {
            Some(value) => Ok(request.envelope(value)),
            None => Ok(request.envelope(fallback()?)),
        }
    }
}
