//! Per-run execution context.

use crate::diagram::ExecutableDiagram;
use crate::execution::options::{AbortSignal, ExecutionOptions};
use crate::execution::tracker::StateTracker;
use crate::services::InteractivePromptHandler;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything one execution shares between the engine, the scheduler, the
/// dispatcher, and handlers. The tracker is behind a mutex: the engine loop
/// is the single logical writer, but dispatched node tasks record their own
/// start/completion.
pub struct ExecutionContext {
    pub execution_id: String,
    pub diagram_id: String,
    pub diagram: Arc<ExecutableDiagram>,
    pub parent_execution_id: Option<String>,
    pub is_sub_diagram: bool,
    pub debug: bool,
    pub abort: AbortSignal,
    pub interactive_handler: Option<Arc<dyn InteractivePromptHandler>>,
    tracker: Mutex<StateTracker>,
    variables: RwLock<HashMap<String, Value>>,
    metadata: RwLock<HashMap<String, Value>>,
    started: Instant,
    timeout: Duration,
}

impl ExecutionContext {
    pub fn new(
        execution_id: impl Into<String>,
        diagram: Arc<ExecutableDiagram>,
        options: &ExecutionOptions,
    ) -> Arc<Self> {
        let mut tracker = StateTracker::new();
        for node in &diagram.nodes {
            tracker.initialize_node(&node.id);
        }
        Arc::new(Self {
            execution_id: execution_id.into(),
            diagram_id: diagram.diagram_id.clone(),
            diagram,
            parent_execution_id: options.parent_execution_id.clone(),
            is_sub_diagram: options.is_sub_diagram,
            debug: options.debug,
            abort: options.abort.clone().unwrap_or_else(AbortSignal::never),
            interactive_handler: options.interactive_handler.clone(),
            tracker: Mutex::new(tracker),
            variables: RwLock::new(options.variables.clone()),
            metadata: RwLock::new(options.metadata.clone()),
            started: Instant::now(),
            timeout: options.effective_timeout(),
        })
    }

    /// Run `f` with exclusive tracker access.
    pub fn with_tracker<R>(&self, f: impl FnOnce(&mut StateTracker) -> R) -> R {
        f(&mut self.tracker.lock())
    }

    pub fn variables(&self) -> HashMap<String, Value> {
        self.variables.read().clone()
    }

    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.variables.write().insert(key.into(), value);
    }

    pub fn metadata(&self) -> HashMap<String, Value> {
        self.metadata.read().clone()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.metadata.write().insert(key.into(), value);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn deadline_expired(&self) -> bool {
        self.elapsed() >= self.timeout
    }

    pub fn remaining_time(&self) -> Duration {
        self.timeout.saturating_sub(self.elapsed())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The variable scope a handler evaluates against: execution variables
    /// plus the bodies of its input envelopes keyed by handle.
    pub fn handler_scope(
        &self,
        inputs: &HashMap<String, dipeo_state::Envelope>,
    ) -> HashMap<String, Value> {
        let mut scope = self.variables();
        for (handle, envelope) in inputs {
            scope.insert(handle.clone(), envelope.body.clone());
            // The default handle's fields merge into the scope directly so
            // upstream object outputs read like variables. Fields win over
            // the whole-envelope binding on a name collision.
            if handle == "default" {
                if let Value::Object(map) = &envelope.body {
                    for (k, v) in map {
                        scope.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        scope
    }
}
