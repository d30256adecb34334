//! Execution options and cooperative cancellation.
//!
//! Options are a closed set (no open-ended kwargs bag); everything the engine
//! honors is an explicit field here.

use crate::events::EventFilter;
use crate::services::InteractivePromptHandler;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cancels an execution from outside.
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cooperative abort signal observed by the engine and handlers.
#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so `changed()` never errors into
        // a spurious abort.
        std::mem::forget(tx);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when aborted; pends forever if the handle is dropped unfired.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a connected abort handle/signal pair.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}

/// Enumerated execution options.
#[derive(Clone, Default)]
pub struct ExecutionOptions {
    /// Execution deadline; defaults to
    /// [`DEFAULT_EXECUTION_TIMEOUT`](crate::config::DEFAULT_EXECUTION_TIMEOUT).
    pub timeout: Option<Duration>,
    pub variables: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
    pub debug: bool,
    /// Overrides every node's iteration budget when set.
    pub max_iterations_override: Option<u32>,
    pub is_sub_diagram: bool,
    pub parent_execution_id: Option<String>,
    pub diagram_source_path: Option<PathBuf>,
    /// Scope filter for transport subscriptions following this run (set for
    /// sub-diagram runs; consumed by the transport layer, not the engine).
    pub event_filter: Option<Arc<dyn EventFilter>>,
    pub abort: Option<AbortSignal>,
    pub interactive_handler: Option<Arc<dyn InteractivePromptHandler>>,
    /// Batch bookkeeping, set by the batch executor.
    pub is_batch_item: bool,
    pub batch_index: Option<usize>,
    pub batch_total: Option<usize>,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn as_sub_diagram(mut self, parent_execution_id: impl Into<String>) -> Self {
        self.is_sub_diagram = true;
        self.parent_execution_id = Some(parent_execution_id.into());
        self
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeout
            .unwrap_or(crate::config::DEFAULT_EXECUTION_TIMEOUT)
    }
}
