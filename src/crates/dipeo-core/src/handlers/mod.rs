//! Node handlers.
//!
//! A handler implements one node type's behavior. It is pure with respect to
//! its arguments and side-effectful only through the services resolved from
//! the registry by typed key. Handlers never publish events themselves; the
//! dispatcher wraps every invocation in `node_started`/`node_completed`/
//! `node_error`.

pub mod api_job;
pub mod code_job;
pub mod condition;
pub mod db;
pub mod diff_patch;
pub mod endpoint;
pub mod hook;
pub mod json_schema_validator;
pub mod person_job;
pub mod start;
pub mod sub_diagram;
pub mod template_job;
pub mod user_response;

use crate::diagram::{ExecutableNode, NodeType};
use crate::error::{DipeoError, Result};
use crate::execution::ExecutionContext;
use crate::registry::ServiceRegistry;
use async_trait::async_trait;
use dipeo_state::Envelope;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a handler invocation receives.
pub struct HandlerRequest<'a> {
    pub node: &'a ExecutableNode,
    /// Input envelopes keyed by target handle name.
    pub inputs: &'a HashMap<String, Envelope>,
    pub services: &'a Arc<ServiceRegistry>,
    pub ctx: &'a Arc<ExecutionContext>,
}

impl<'a> HandlerRequest<'a> {
    /// The envelope on the `default` handle, if any.
    pub fn default_input(&self) -> Option<&Envelope> {
        self.inputs.get("default")
    }

    /// Variables plus input bodies, the scope expressions evaluate against.
    pub fn scope(&self) -> HashMap<String, serde_json::Value> {
        self.ctx.handler_scope(self.inputs)
    }

    /// A fresh output envelope produced by this node.
    pub fn envelope(&self, body: serde_json::Value) -> Envelope {
        Envelope::new(body, self.node.id.clone(), self.ctx.execution_id.clone())
    }
}

/// One node type's implementation.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    fn node_type(&self) -> NodeType;

    async fn handle(&self, request: HandlerRequest<'_>) -> Result<Envelope>;
}

/// Handler lookup by node-type tag.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<NodeType, Arc<dyn NodeHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with every built-in handler.
    pub fn with_builtins() -> Arc<Self> {
        let registry = Self::new();
        registry.register(Arc::new(start::StartHandler));
        registry.register(Arc::new(endpoint::EndpointHandler));
        registry.register(Arc::new(condition::ConditionHandler));
        registry.register(Arc::new(code_job::CodeJobHandler));
        registry.register(Arc::new(api_job::ApiJobHandler));
        registry.register(Arc::new(person_job::PersonJobHandler));
        registry.register(Arc::new(db::DbHandler));
        registry.register(Arc::new(template_job::TemplateJobHandler));
        registry.register(Arc::new(hook::HookHandler));
        registry.register(Arc::new(user_response::UserResponseHandler));
        registry.register(Arc::new(json_schema_validator::JsonSchemaValidatorHandler));
        registry.register(Arc::new(diff_patch::DiffPatchHandler));
        registry.register(Arc::new(sub_diagram::SubDiagramHandler));
        Arc::new(registry)
    }

    pub fn register(&self, handler: Arc<dyn NodeHandler>) {
        self.handlers.write().insert(handler.node_type(), handler);
    }

    pub fn get(&self, node_type: NodeType) -> Result<Arc<dyn NodeHandler>> {
        self.handlers.read().get(&node_type).cloned().ok_or_else(|| {
            DipeoError::Execution(format!("No handler registered for node type '{node_type}'"))
        })
    }

    pub fn registered_types(&self) -> Vec<NodeType> {
        self.handlers.read().keys().copied().collect()
    }
}
