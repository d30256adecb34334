//! `hook` node: fires a side effect (file drop or webhook) with its input.

use super::{HandlerRequest, NodeHandler};
use crate::diagram::{HookType, NodeConfig, NodeType};
use crate::error::{DipeoError, Result};
use crate::services::{ApiRequest, API_INVOKER, FILE_SYSTEM};
use async_trait::async_trait;
use dipeo_state::Envelope;
use serde_json::{json, Value};
use std::collections::HashMap;

pub struct HookHandler;

#[async_trait]
impl NodeHandler for HookHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Hook
    }

    async fn handle(&self, request: HandlerRequest<'_>) -> Result<Envelope> {
        let NodeConfig::Hook {
            hook_type,
            path,
            url,
        } = &request.node.config
        else {
            return Err(DipeoError::node_execution(
                &request.node.id,
                "hook node without hook config",
            ));
        };

        let payload = request
            .default_input()
            .map(|env| env.body.clone())
            .unwrap_or(Value::Null);

        match hook_type {
            HookType::File => {
                let path = path.as_deref().ok_or_else(|| {
                    DipeoError::node_execution(&request.node.id, "file hook requires 'path'")
                })?;
                let fs = request.services.resolve(FILE_SYSTEM)?;
                let contents = serde_json::to_string_pretty(&payload)?;
                fs.write(path, &contents).await?;
                Ok(request.envelope(json!({"hook": "file", "path": path})))
            }
            HookType::Webhook => {
                let url = url.as_deref().ok_or_else(|| {
                    DipeoError::node_execution(&request.node.id, "webhook hook requires 'url'")
                })?;
                let invoker = request.services.resolve(API_INVOKER)?;
                let response = invoker
                    .invoke(ApiRequest {
                        method: "POST".into(),
                        url: url.into(),
                        headers: HashMap::new(),
                        body: Some(payload),
                        timeout_s: None,
                    })
                    .await
                    .map_err(|e| DipeoError::node_execution(&request.node.id, e.to_string()))?;
                Ok(request
                    .envelope(json!({"hook": "webhook", "status": response.status})))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{ApiResponse, FileSystemPort, FILE_SYSTEM};
    use crate::testing::{run_handler_with, test_registry};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct OneFileFs {
        written: Mutex<Option<(String, String)>>,
    }

    #[async_trait]
    impl FileSystemPort for OneFileFs {
        async fn read_to_string(&self, _path: &str) -> Result<String> {
            Err(DipeoError::Execution("read-only stub".into()))
        }
        async fn write(&self, path: &str, contents: &str) -> Result<()> {
            *self.written.lock() = Some((path.into(), contents.into()));
            Ok(())
        }
        async fn append(&self, _path: &str, _contents: &str) -> Result<()> {
            Ok(())
        }
        async fn exists(&self, _path: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_file_hook_writes_payload() {
        let fs = Arc::new(OneFileFs::default());
        let registry = test_registry();
        registry.register(FILE_SYSTEM, fs.clone() as Arc<dyn FileSystemPort>);

        let config = NodeConfig::Hook {
            hook_type: HookType::File,
            path: Some("hook.json".into()),
            url: None,
        };
        run_handler_with(HookHandler, config, [], [("default", json!({"ok": true}))], registry)
            .await
            .unwrap();

        let (path, contents) = fs.written.lock().clone().unwrap();
        assert_eq!(path, "hook.json");
        assert!(contents.contains("\"ok\""));
    }

    #[tokio::test]
    async fn test_webhook_hook_posts() {
        struct PostCheck;
        #[async_trait]
        impl crate::services::ApiInvoker for PostCheck {
            async fn invoke(&self, request: ApiRequest) -> Result<ApiResponse> {
                assert_eq!(request.method, "POST");
                Ok(ApiResponse {
                    status: 204,
                    body: Value::Null,
                })
            }
        }
        let registry = test_registry();
        registry.register(
            crate::services::API_INVOKER,
            Arc::new(PostCheck) as Arc<dyn crate::services::ApiInvoker>,
        );
        let config = NodeConfig::Hook {
            hook_type: HookType::Webhook,
            path: None,
            url: Some("https://hooks.example.com/x".into()),
        };
        let output = run_handler_with(HookHandler, config, [], [], registry)
            .await
            .unwrap();
        assert_eq!(output.body["status"], json!(204));
    }
}
