//! Error types and error handling for diagram execution.
//!
//! All errors implement `std::error::Error` via `thiserror`. The variants
//! follow the engine's error taxonomy:
//!
//! ```text
//! DipeoError
//! ├── Compilation        - diagram rejected by the compiler (fatal to the run)
//! ├── NodeExecution      - a handler failed; fatal to the node, not always to
//! │                        the execution
//! ├── Timeout            - node or execution deadline expired
//! ├── Cancelled          - external abort
//! ├── MaxIterations      - iteration budget exhausted where a re-fire was needed
//! ├── ServiceResolution  - a required service key missing at invocation
//! ├── Transport          - observer/subscriber failure; never reaches the engine
//! ├── StateStore         - persistence errors
//! ├── Serialization/Yaml/Io - wrapped foreign errors
//! └── Validation/Execution  - everything else with context
//! ```
//!
//! Propagation policy: a node failure is recovered locally when the node is
//! on an optional path (behind a conditional branch, or a batch item whose
//! siblings continue); otherwise it marks the execution terminal. No error
//! ever crosses the event-bus boundary - handlers run in isolation and
//! failures there are logged and re-emitted as `execution_log` events.

use thiserror::Error;

/// Convenience result type using [`DipeoError`].
pub type Result<T> = std::result::Result<T, DipeoError>;

/// Severity of a compiler diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

/// One finding from a compilation phase.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Diagnostic {
    /// Compilation phase that produced the finding (`resolve`, `bind`,
    /// `validate`, `index`).
    pub phase: &'static str,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl Diagnostic {
    pub fn error(phase: &'static str, message: impl Into<String>) -> Self {
        Self {
            phase,
            severity: Severity::Error,
            message: message.into(),
            node_id: None,
        }
    }

    pub fn warning(phase: &'static str, message: impl Into<String>) -> Self {
        Self {
            phase,
            severity: Severity::Warning,
            message: message.into(),
            node_id: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.node_id {
            Some(n) => write!(
                f,
                "[{}] {:?} at node '{}': {}",
                self.phase, self.severity, n, self.message
            ),
            None => write!(f, "[{}] {:?}: {}", self.phase, self.severity, self.message),
        }
    }
}

/// Comprehensive error type for diagram compilation and execution.
#[derive(Error, Debug)]
pub enum DipeoError {
    /// The compiler rejected the diagram. Carries every diagnostic so
    /// tooling can render all findings at once.
    #[error("Diagram compilation failed: {}", format_diagnostics(.0))]
    Compilation(Vec<Diagnostic>),

    /// A node handler failed.
    #[error("Node '{node}' execution failed: {error}")]
    NodeExecution {
        /// Id of the node that failed.
        node: String,
        /// Error message from the handler.
        error: String,
    },

    /// Node or execution deadline expiry.
    #[error("Operation timed out after {duration_ms}ms: {operation}")]
    Timeout {
        operation: String,
        duration_ms: u64,
    },

    /// External abort (user cancel, parent cancellation).
    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    /// A node should re-fire but its iteration budget is exhausted.
    #[error("Node '{node}' reached its iteration budget of {budget}")]
    MaxIterations { node: String, budget: u32 },

    /// A required service key was missing at handler invocation.
    ///
    /// Treated as a node-execution failure at dispatch, surfacing the key
    /// name.
    #[error("Service '{key}' is not registered")]
    ServiceResolution { key: String },

    /// Observer/subscriber failure. Logged and re-emitted as an
    /// `execution_log` event, never propagated to the engine.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Graph structure or input validation failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// General execution failure without node context.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// State persistence failed.
    #[error("State store error: {0}")]
    StateStore(#[from] dipeo_state::StateStoreError),

    /// JSON (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing failed (light/readable diagram formats).
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_diagnostics(diags: &[Diagnostic]) -> String {
    let errors: Vec<String> = diags
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.to_string())
        .collect();
    if errors.is_empty() {
        format!("{} diagnostic(s)", diags.len())
    } else {
        errors.join("; ")
    }
}

impl DipeoError {
    /// Create a node execution error with context.
    pub fn node_execution(node: impl Into<String>, error: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            error: error.into(),
        }
    }

    /// Create a timeout error for a named operation.
    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Create a missing-service error from a key name.
    pub fn service_resolution(key: impl Into<String>) -> Self {
        Self::ServiceResolution { key: key.into() }
    }

    /// The short error kind used in `execution_error` payloads and terminal
    /// frames (`timeout`, `aborted`, `node_execution`, ...).
    pub fn kind(&self) -> &'static str {
        match self {
            DipeoError::Compilation(_) => "compilation",
            DipeoError::NodeExecution { .. } => "node_execution",
            DipeoError::Timeout { .. } => "timeout",
            DipeoError::Cancelled(_) => "aborted",
            DipeoError::MaxIterations { .. } => "maxiter_reached",
            DipeoError::ServiceResolution { .. } => "service_resolution",
            DipeoError::Transport(_) => "transport",
            DipeoError::Validation(_) => "validation",
            DipeoError::Execution(_) => "execution",
            DipeoError::StateStore(_) => "state_store",
            DipeoError::Serialization(_) | DipeoError::Yaml(_) => "serialization",
            DipeoError::Io(_) => "io",
        }
    }
}
