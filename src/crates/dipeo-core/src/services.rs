//! Required service keys and the narrow ports behind them.
//!
//! Handlers are pure with respect to their arguments and side-effectful only
//! through these services, resolved once at invocation by typed key. The
//! concrete adapters (HTTP client, real LLM providers, storage backends) are
//! external collaborators; this crate ships only in-process defaults (see
//! [`crate::wiring`]).

use crate::error::Result;
use crate::events::ExecutionUpdate;
use crate::registry::ServiceKey;
use async_trait::async_trait;
use dipeo_state::{CacheFirstStateStore, LlmUsage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Service keys (the required table)
// ---------------------------------------------------------------------------

pub const LLM_SERVICE: ServiceKey<Arc<dyn LlmService>> = ServiceKey::new("llm_service");
pub const FILE_SYSTEM: ServiceKey<Arc<dyn FileSystemPort>> = ServiceKey::new("filesystem_adapter");
pub const API_KEY_SERVICE: ServiceKey<Arc<dyn ApiKeyService>> = ServiceKey::new("api_key_service");
pub const STATE_STORE: ServiceKey<Arc<CacheFirstStateStore>> = ServiceKey::new("state_store");
pub const EVENT_BUS: ServiceKey<Arc<crate::events::InProcessEventBus>> =
    ServiceKey::new("event_bus");
pub const DIAGRAM_PORT: ServiceKey<Arc<dyn DiagramPort>> = ServiceKey::new("diagram_port");
pub const API_INVOKER: ServiceKey<Arc<dyn ApiInvoker>> = ServiceKey::new("api_invoker");
pub const CODE_RUNNER: ServiceKey<Arc<dyn CodeRunner>> = ServiceKey::new("code_runner");
pub const TEMPLATE_PROCESSOR: ServiceKey<Arc<dyn TemplateProcessor>> =
    ServiceKey::new("template_processor");
pub const PROMPT_BUILDER: ServiceKey<Arc<dyn PromptBuilder>> = ServiceKey::new("prompt_builder");
pub const PROVIDER_REGISTRY: ServiceKey<Arc<dyn ProviderRegistry>> =
    ServiceKey::new("provider_registry");
pub const INTEGRATED_API_SERVICE: ServiceKey<Arc<dyn IntegratedApiService>> =
    ServiceKey::new("integrated_api_service");
pub const MESSAGE_ROUTER: ServiceKey<Arc<dyn MessageRouter>> = ServiceKey::new("message_router");

/// Handler lookup table for node dispatch.
pub const NODE_REGISTRY: ServiceKey<Arc<crate::handlers::HandlerRegistry>> =
    ServiceKey::new("node_registry");

/// The compiled diagram of the running execution (engine-registered).
pub const DIAGRAM: ServiceKey<Arc<crate::diagram::ExecutableDiagram>> = ServiceKey::new("diagram");

/// The live execution context (engine-registered).
pub const EXECUTION_CONTEXT: ServiceKey<Arc<crate::execution::ExecutionContext>> =
    ServiceKey::new("execution_context");

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// One chat message for an LLM request.
#[derive(Debug, Clone)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// Request to the LLM port.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub service: String,
    pub model: String,
    pub messages: Vec<LlmMessage>,
    pub api_key: Option<String>,
}

/// Response from the LLM port.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub usage: LlmUsage,
}

/// Language-model completion port.
#[async_trait]
pub trait LlmService: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse>;
}

/// Filesystem access port used by `db`, `endpoint`, and `diff_patch` nodes.
#[async_trait]
pub trait FileSystemPort: Send + Sync {
    async fn read_to_string(&self, path: &str) -> Result<String>;
    async fn write(&self, path: &str, contents: &str) -> Result<()>;
    async fn append(&self, path: &str, contents: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> bool;
}

/// Resolves API key ids referenced by diagram persons to secret values.
#[async_trait]
pub trait ApiKeyService: Send + Sync {
    async fn get_key(&self, key_id: &str) -> Result<Option<String>>;
}

/// Loads named diagrams for `sub_diagram` nodes.
#[async_trait]
pub trait DiagramPort: Send + Sync {
    async fn load(&self, name: &str) -> Result<crate::diagram::DomainDiagram>;
}

/// HTTP request descriptor for [`ApiInvoker`].
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub timeout_s: Option<u64>,
}

/// HTTP response from [`ApiInvoker`].
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

/// Outbound HTTP port used by `api_job` and webhook hooks.
#[async_trait]
pub trait ApiInvoker: Send + Sync {
    async fn invoke(&self, request: ApiRequest) -> Result<ApiResponse>;
}

/// Executes `code_job` node sources against a variable scope.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(&self, code: &str, scope: &HashMap<String, Value>) -> Result<Value>;
}

/// Renders `{{placeholder}}` templates against a variable scope.
pub trait TemplateProcessor: Send + Sync {
    fn render(&self, template: &str, scope: &HashMap<String, Value>) -> Result<String>;
}

/// Builds the prompt for a `person_job` invocation.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, template: &str, scope: &HashMap<String, Value>) -> Result<String>;
}

/// Registry of integration providers (names only; the drivers live outside
/// the engine).
pub trait ProviderRegistry: Send + Sync {
    fn providers(&self) -> Vec<String>;
    fn has(&self, name: &str) -> bool;
}

/// Invokes a registered integration provider operation.
#[async_trait]
pub trait IntegratedApiService: Send + Sync {
    async fn call(&self, provider: &str, operation: &str, payload: Value) -> Result<Value>;
}

/// Transport-side sink for UI update frames.
#[async_trait]
pub trait MessageRouter: Send + Sync {
    async fn route(&self, frame: ExecutionUpdate) -> Result<()>;
}

/// Interactive prompt request delivered to a wired front-end.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub execution_id: String,
    pub node_id: String,
    pub prompt: String,
    pub timeout_s: u64,
}

/// Front-end callback for `user_response` nodes. Must propagate
/// cancellation: a pending prompt is abandoned when the execution aborts.
#[async_trait]
pub trait InteractivePromptHandler: Send + Sync {
    async fn prompt(&self, request: PromptRequest) -> Result<Value>;
}
