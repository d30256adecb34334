//! The execution engine and its collaborators.
//!
//! - [`tracker`] - engine-private per-node state and execution counts
//! - [`context`] - the per-run context shared with handlers
//! - [`options`] - the closed execution-options set and abort plumbing
//! - [`pipeline`] - fused tracker-mutation + event-emission helpers
//! - [`scheduler`] - ready-node computation and join policies
//! - [`dispatcher`] - semaphore-bounded handler invocation with retry
//! - [`engine`] - the run loop

pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod options;
pub mod pipeline;
pub mod scheduler;
pub mod tracker;

pub use context::ExecutionContext;
pub use dispatcher::NodeDispatcher;
pub use engine::{EngineUpdate, ExecutionEngine, Progress};
pub use options::{abort_pair, AbortHandle, AbortSignal, ExecutionOptions};
pub use pipeline::EventPipeline;
pub use scheduler::{NodeScheduler, SchedulerStats};
pub use tracker::StateTracker;
