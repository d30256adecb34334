//! reqwest-backed API invoker wired into the CLI container.

use async_trait::async_trait;
use dipeo_core::error::{DipeoError, Result};
use dipeo_core::services::{ApiInvoker, ApiRequest, ApiResponse};
use serde_json::Value;
use std::time::Duration;

/// Outbound HTTP through a shared reqwest client.
pub struct HttpApiInvoker {
    client: reqwest::Client,
}

impl HttpApiInvoker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpApiInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApiInvoker for HttpApiInvoker {
    async fn invoke(&self, request: ApiRequest) -> Result<ApiResponse> {
        let method: reqwest::Method = request
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| DipeoError::Validation(format!("invalid HTTP method '{}'", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(secs) = request.timeout_s {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| DipeoError::Execution(format!("{} {}: {e}", request.method, request.url)))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| DipeoError::Execution(format!("reading response body: {e}")))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok(ApiResponse { status, body })
    }
}
