//! # dipeo-core - Diagram Execution Engine
//!
//! DiPeO executes user-authored computation graphs ("diagrams") in which
//! nodes are typed operations (LLM calls, HTTP jobs, code evaluation,
//! file I/O, conditionals, sub-diagrams) and edges carry typed envelopes
//! between node handles. This crate is the engine core:
//!
//! - **Compilation** - [`diagram::DiagramCompiler`] turns a declarative
//!   [`diagram::DomainDiagram`] into an [`diagram::ExecutableDiagram`] with
//!   resolved handles, bound persons, pre-sorted adjacency, and static
//!   checks. Compilation is deterministic: identical input, byte-identical
//!   output.
//! - **Execution** - [`execution::ExecutionEngine`] runs the schedule ->
//!   dispatch -> mark-complete loop with bounded parallelism, per-node
//!   iteration budgets and retry policies, cooperative cancellation, and a
//!   hard execution deadline.
//! - **Events** - [`events::InProcessEventBus`] is the single source of
//!   truth for state updates and observer fan-out: typed pub/sub with a
//!   high/normal priority barrier, per-handler bounded queues, filters, and
//!   per-execution replay by sequence number.
//! - **Observers** - state persistence (high priority), metrics with
//!   critical-path derivation, UI streaming, and a logging tap; all pure
//!   bus consumers.
//! - **Services** - a typed-key [`registry::ServiceRegistry`] with child
//!   scopes; handlers reach the outside world only through the ports in
//!   [`services`].
//!
//! ## Dataflow
//!
//! ```text
//! ExecuteDiagramUseCase
//!     │ compile + initialize state
//!     ▼
//! ExecutionEngine ⇄ NodeScheduler ⇄ NodeDispatcher ⇄ handlers
//!     │ publish
//!     ▼
//! InProcessEventBus ──► StatePersistenceSubscriber (HIGH)
//!                   ──► MetricsObserver, StreamingMonitor, LoggingObserver
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use dipeo_core::{wire_container, ExecuteDiagramUseCase, ExecutionOptions};
//! use dipeo_core::config::{new_execution_id, EnvSettings};
//! use dipeo_state::InMemoryStateRepository;
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! let repo = Arc::new(InMemoryStateRepository::new());
//! let container = wire_container(repo, &EnvSettings::from_env(), "diagrams");
//! let use_case = ExecuteDiagramUseCase::new(container.registry.clone())?;
//!
//! let diagram = dipeo_core::diagram::format::load_diagram("flow.light.yaml".as_ref(), None)?;
//! let mut run = use_case.execute_diagram(
//!     diagram,
//!     ExecutionOptions::new(),
//!     new_execution_id(),
//! );
//! while let Some(update) = run.next().await {
//!     println!("{update:?}");
//! }
//! ```

pub mod config;
pub mod diagram;
pub mod error;
pub mod events;
pub mod execution;
pub mod expr;
pub mod handlers;
pub mod observers;
pub mod registry;
pub mod services;
pub mod usecase;
pub mod wiring;

pub use diagram::{DiagramCompiler, DiagramFormat, DomainDiagram, ExecutableDiagram, NodeType};
pub use dipeo_state::{ContentType, Envelope, ExecutionState, NodeState, NodeStatus, Status};
pub use error::{Diagnostic, DipeoError, Result, Severity};
pub use events::{
    DomainEvent, EventFilter, EventHandler, EventType, ExecutionUpdate, HandlerPriority,
    InProcessEventBus, SubDiagramFilter,
};
pub use execution::{
    abort_pair, AbortHandle, AbortSignal, ExecutionEngine, ExecutionOptions, NodeScheduler,
};
pub use handlers::{HandlerRegistry, HandlerRequest, NodeHandler};
pub use observers::{MetricsObserver, StatePersistenceSubscriber, StreamingMonitor};
pub use registry::{ServiceKey, ServiceRegistry};
pub use usecase::{ExecuteDiagramUseCase, RunUpdate};
pub use wiring::{wire_container, Container};

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for handler unit tests.

    use crate::diagram::{ExecutableDiagram, ExecutableNode, NodeConfig};
    use crate::error::Result;
    use crate::execution::{ExecutionContext, ExecutionOptions};
    use crate::handlers::{HandlerRequest, NodeHandler};
    use crate::registry::ServiceRegistry;
    use crate::services::{
        CodeRunner, InteractivePromptHandler, PromptBuilder, TemplateProcessor, CODE_RUNNER,
        PROMPT_BUILDER, TEMPLATE_PROCESSOR,
    };
    use crate::wiring::{InlineCodeRunner, SimpleTemplateProcessor, TemplatePromptBuilder};
    use dipeo_state::Envelope;
    use serde_json::Value;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;

    /// Registry with the pure in-process defaults every test can rely on.
    pub fn test_registry() -> Arc<ServiceRegistry> {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(CODE_RUNNER, Arc::new(InlineCodeRunner) as Arc<dyn CodeRunner>);
        registry.register(
            TEMPLATE_PROCESSOR,
            Arc::new(SimpleTemplateProcessor) as Arc<dyn TemplateProcessor>,
        );
        registry.register(
            PROMPT_BUILDER,
            Arc::new(TemplatePromptBuilder) as Arc<dyn PromptBuilder>,
        );
        registry
    }

    /// Owns everything a [`HandlerRequest`] borrows.
    pub struct RequestParts {
        pub node: ExecutableNode,
        pub inputs: HashMap<String, Envelope>,
        pub services: Arc<ServiceRegistry>,
        pub ctx: Arc<ExecutionContext>,
    }

    impl RequestParts {
        pub fn request(&self) -> HandlerRequest<'_> {
            HandlerRequest {
                node: &self.node,
                inputs: &self.inputs,
                services: &self.services,
                ctx: &self.ctx,
            }
        }
    }

    pub fn make_request_parts(
        config: NodeConfig,
        variables: Vec<(&str, Value)>,
        inputs: Vec<(&str, Value)>,
    ) -> RequestParts {
        make_request_parts_with(config, variables, inputs, test_registry(), None)
    }

    pub fn make_request_parts_with(
        config: NodeConfig,
        variables: Vec<(&str, Value)>,
        inputs: Vec<(&str, Value)>,
        services: Arc<ServiceRegistry>,
        interactive: Option<Arc<dyn InteractivePromptHandler>>,
    ) -> RequestParts {
        let node = ExecutableNode {
            id: "node".to_string(),
            label: "node".to_string(),
            node_type: config.node_type(),
            config,
            max_iterations: 1,
            retry: None,
            is_terminal: false,
            priority: 0,
        };
        let diagram = Arc::new(ExecutableDiagram {
            diagram_id: "test".to_string(),
            nodes: vec![node.clone()],
            edges: Vec::new(),
            edges_by_source: BTreeMap::new(),
            edges_by_target: BTreeMap::new(),
            metadata: BTreeMap::new(),
            diagnostics: Vec::new(),
        });
        let mut options = ExecutionOptions::new();
        for (key, value) in variables {
            options = options.with_variable(key, value);
        }
        options.interactive_handler = interactive;
        let ctx = ExecutionContext::new("exec_test", diagram, &options);
        let inputs = inputs
            .into_iter()
            .map(|(handle, body)| {
                (
                    handle.to_string(),
                    Envelope::new(body, "upstream", "exec_test"),
                )
            })
            .collect();
        RequestParts {
            node,
            inputs,
            services,
            ctx,
        }
    }

    pub async fn run_handler<H, V, I>(
        handler: H,
        config: NodeConfig,
        variables: V,
        inputs: I,
    ) -> Result<Envelope>
    where
        H: NodeHandler,
        V: IntoIterator<Item = (&'static str, Value)>,
        I: IntoIterator<Item = (&'static str, Value)>,
    {
        run_handler_with(handler, config, variables, inputs, test_registry()).await
    }

    pub async fn run_handler_with<H, V, I>(
        handler: H,
        config: NodeConfig,
        variables: V,
        inputs: I,
        services: Arc<ServiceRegistry>,
    ) -> Result<Envelope>
    where
        H: NodeHandler,
        V: IntoIterator<Item = (&'static str, Value)>,
        I: IntoIterator<Item = (&'static str, Value)>,
    {
        let parts = make_request_parts_with(
            config,
            variables.into_iter().collect(),
            inputs.into_iter().collect(),
            services,
            None,
        );
        handler.handle(parts.request()).await
    }

    pub async fn run_handler_interactive<H>(
        handler: H,
        config: NodeConfig,
        interactive: Arc<dyn InteractivePromptHandler>,
    ) -> Result<Envelope>
    where
        H: NodeHandler,
    {
        let parts =
            make_request_parts_with(config, Vec::new(), Vec::new(), test_registry(), Some(interactive));
        handler.handle(parts.request()).await
    }
}
