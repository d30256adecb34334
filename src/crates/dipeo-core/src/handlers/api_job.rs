//! `api_job` node: one HTTP call through the wired invoker.

use super::{HandlerRequest, NodeHandler};
use crate::diagram::{NodeConfig, NodeType};
use crate::error::{DipeoError, Result};
use crate::services::{ApiRequest, API_INVOKER, TEMPLATE_PROCESSOR};
use async_trait::async_trait;
use dipeo_state::Envelope;
use serde_json::json;

pub struct ApiJobHandler;

#[async_trait]
impl NodeHandler for ApiJobHandler {
    fn node_type(&self) -> NodeType {
        NodeType::ApiJob
    }

    async fn handle(&self, request: HandlerRequest<'_>) -> Result<Envelope> {
        let NodeConfig::ApiJob {
            url,
            method,
            headers,
            body,
            timeout_s,
        } = &request.node.config
        else {
            return Err(DipeoError::node_execution(
                &request.node.id,
                "api_job node without api config",
            ));
        };

        let scope = request.scope();
        // URLs commonly interpolate upstream values.
        let url = match request.services.resolve(TEMPLATE_PROCESSOR) {
            Ok(templates) => templates.render(url, &scope)?,
            Err(_) => url.clone(),
        };

        let invoker = request.services.resolve(API_INVOKER)?;
        let response = invoker
            .invoke(ApiRequest {
                method: method.clone(),
                url: url.clone(),
                headers: headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                body: body.clone(),
                timeout_s: *timeout_s,
            })
            .await
            .map_err(|e| DipeoError::node_execution(&request.node.id, e.to_string()))?;

        if response.status >= 400 {
            return Err(DipeoError::node_execution(
                &request.node.id,
                format!("{method} {url} returned status {}", response.status),
            ));
        }
        Ok(request
            .envelope(response.body)
            .with_meta("status", json!(response.status)))
    }
}
