//! Durable-backend port for execution state.
//!
//! Implement [`ExecutionStateRepository`] to persist executions in any
//! storage system. The contract the store relies on:
//!
//! - `upsert` is atomic per execution id (readers never observe a torn record)
//! - `list` supports filtering by diagram id and status with limit/offset
//! - `get` returns `None` for unknown ids rather than erroring

use crate::envelope::ExecutionId;
use crate::error::Result;
use crate::state::{ExecutionState, Status};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Filter for [`ExecutionStateRepository::list`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub diagram_id: Option<String>,
    pub status: Option<Status>,
    pub limit: usize,
    pub offset: usize,
}

impl ExecutionFilter {
    pub fn new() -> Self {
        Self {
            limit: 50,
            ..Default::default()
        }
    }

    pub fn with_diagram_id(mut self, diagram_id: impl Into<String>) -> Self {
        self.diagram_id = Some(diagram_id.into());
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Whether a record passes the diagram/status predicates.
    pub fn matches(&self, state: &ExecutionState) -> bool {
        if let Some(d) = &self.diagram_id {
            if &state.diagram_id != d {
                return false;
            }
        }
        if let Some(s) = self.status {
            if state.status != s {
                return false;
            }
        }
        true
    }
}

/// Listing row: the record header without the per-node maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: ExecutionId,
    pub diagram_id: String,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ExecutionState> for ExecutionSummary {
    fn from(state: &ExecutionState) -> Self {
        Self {
            id: state.id.clone(),
            diagram_id: state.diagram_id.clone(),
            status: state.status,
            started_at: state.started_at,
            ended_at: state.ended_at,
            error: state.error.clone(),
        }
    }
}

/// Port to the durable execution-state backend.
#[async_trait]
pub trait ExecutionStateRepository: Send + Sync {
    /// Fetch a full record; `None` when absent.
    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionState>>;

    /// Atomically insert or replace a record.
    async fn upsert(&self, state: &ExecutionState) -> Result<()>;

    /// List records matching `filter`, newest first.
    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionSummary>>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, execution_id: &str) -> Result<bool>;
}
