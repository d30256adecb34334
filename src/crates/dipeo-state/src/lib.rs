//! # dipeo-state - Execution State for the DiPeO Engine
//!
//! Durable, cache-fronted execution state for diagram runs. This crate owns
//! the record types that outlive a single engine loop iteration:
//!
//! - [`Envelope`] - the immutable typed value that flows along diagram edges
//!   and is retained per node in [`ExecutionState::node_outputs`]
//! - [`ExecutionState`] / [`NodeState`] - the root record for one run and the
//!   per-node slice of it
//! - [`ExecutionStateRepository`] - the durable-backend port (implemented
//!   in-memory and on the filesystem here; SQLite/Redis backends plug in the
//!   same way)
//! - [`CacheFirstStateStore`] - a write-through cache over a repository with
//!   write-behind, coalescing persistence
//!
//! # Architecture
//!
//! ```text
//!   engine / event subscribers
//!            │  record_* mutators
//!            ▼
//!   ┌─────────────────────────┐
//!   │  CacheFirstStateStore   │   hot map keyed by execution_id
//!   │  • cache (authoritative │   dirty set + periodic flusher
//!   │    while running)       │   immediate flush on terminal status
//!   └───────────┬─────────────┘
//!               │ ExecutionStateRepository
//!               ▼
//!   ┌─────────────────────────┐
//!   │  InMemoryStateRepository│   tests, short-lived runs
//!   │  FsStateRepository      │   one JSON document per execution
//!   └─────────────────────────┘
//! ```
//!
//! On startup the repository is authoritative: a cache miss falls through to
//! the repository and re-warms the cache. While an execution is in flight the
//! cache is authoritative and the repository lags by at most one flush
//! interval (except for terminal transitions, which flush immediately).
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use dipeo_state::{CacheFirstStateStore, InMemoryStateRepository, StateStoreConfig};
//! use std::sync::Arc;
//!
//! let repo = Arc::new(InMemoryStateRepository::new());
//! let store = CacheFirstStateStore::new(repo, StateStoreConfig::default());
//! let _flusher = store.clone().spawn_flusher();
//!
//! store.initialize_state("exec_...", "my-diagram", Default::default(), Default::default()).await?;
//! ```

pub mod envelope;
pub mod error;
pub mod filesystem;
pub mod memory;
pub mod repository;
pub mod state;
pub mod store;

pub use envelope::{ContentType, Envelope, ExecutionId, NodeId};
pub use error::{Result, StateStoreError};
pub use filesystem::FsStateRepository;
pub use memory::InMemoryStateRepository;
pub use repository::{ExecutionFilter, ExecutionStateRepository, ExecutionSummary};
pub use state::{ExecutionState, LlmUsage, NodeState, NodeStatus, Status};
pub use store::{CacheFirstStateStore, StateStoreConfig};
