//! In-memory execution-state repository for development and testing.
//!
//! A reference implementation of [`ExecutionStateRepository`] over a
//! `RwLock<HashMap>`. Everything is lost on restart; use
//! [`FsStateRepository`](crate::filesystem::FsStateRepository) (or a real
//! database adapter) when recovery matters. Includes `clear()` for test
//! isolation.

use crate::error::Result;
use crate::repository::{ExecutionFilter, ExecutionStateRepository, ExecutionSummary};
use crate::state::ExecutionState;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Thread-safe in-memory repository.
#[derive(Default)]
pub struct InMemoryStateRepository {
    records: RwLock<HashMap<String, ExecutionState>>,
}

impl InMemoryStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored executions.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Drop every record. Intended for tests.
    pub fn clear(&self) {
        self.records.write().clear();
    }
}

#[async_trait]
impl ExecutionStateRepository for InMemoryStateRepository {
    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionState>> {
        Ok(self.records.read().get(execution_id).cloned())
    }

    async fn upsert(&self, state: &ExecutionState) -> Result<()> {
        self.records.write().insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionSummary>> {
        let records = self.records.read();
        let mut rows: Vec<ExecutionSummary> = records
            .values()
            .filter(|s| filter.matches(s))
            .map(ExecutionSummary::from)
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.id.cmp(&b.id)));
        Ok(rows
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.max(1))
            .collect())
    }

    async fn delete(&self, execution_id: &str) -> Result<bool> {
        Ok(self.records.write().remove(execution_id).is_some())
    }
}
