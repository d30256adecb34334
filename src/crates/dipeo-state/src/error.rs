//! Error types for state persistence.

use thiserror::Error;

/// Convenience result type using [`StateStoreError`].
pub type Result<T> = std::result::Result<T, StateStoreError>;

/// Errors raised by state repositories and the cache-first store.
#[derive(Error, Debug)]
pub enum StateStoreError {
    /// The referenced execution does not exist in cache or repository.
    #[error("Execution '{0}' not found")]
    NotFound(String),

    /// An illegal state transition was requested.
    ///
    /// Transitions are monotonic except for the scheduler-driven
    /// `completed/failed -> pending` loop re-enable, which is applied through
    /// the engine-private tracker and never reaches the store.
    #[error("Invalid transition for execution '{execution_id}': {from} -> {to}")]
    InvalidTransition {
        execution_id: String,
        from: String,
        to: String,
    },

    /// Serialization of a state record failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying storage I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Repository-specific failure (backend message preserved).
    #[error("Repository error: {0}")]
    Repository(String),
}

impl StateStoreError {
    /// Create an invalid-transition error with context.
    pub fn invalid_transition(
        execution_id: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            execution_id: execution_id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
