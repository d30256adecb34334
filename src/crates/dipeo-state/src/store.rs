//! Cache-first execution state store.
//!
//! [`CacheFirstStateStore`] fronts an [`ExecutionStateRepository`] with a hot
//! map keyed by execution id. Every mutation updates the cache immediately
//! and marks the entry dirty; a periodic flusher persists dirty entries with
//! coalescing (many mutations, one write). A terminal status transition
//! flushes that execution immediately so observers reading the repository
//! after the final event always see the final record.
//!
//! The store itself knows nothing about the event bus. The engine crate
//! installs a high-priority bus subscriber that maps domain events onto the
//! `record_*` mutators below, which is what guarantees state is persisted
//! before lower-priority observers see the same event.

use crate::envelope::{Envelope, ExecutionId};
use crate::error::{Result, StateStoreError};
use crate::repository::{ExecutionFilter, ExecutionStateRepository, ExecutionSummary};
use crate::state::{ExecutionState, LlmUsage, Status};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Tuning knobs for the store.
#[derive(Debug, Clone)]
pub struct StateStoreConfig {
    /// Maximum executions kept hot. Terminal entries are evicted first.
    pub cache_capacity: usize,
    /// Interval between write-behind flushes of dirty entries.
    pub flush_interval: Duration,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1000,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Write-through cache over a durable repository.
pub struct CacheFirstStateStore {
    repository: Arc<dyn ExecutionStateRepository>,
    cache: Mutex<HashMap<ExecutionId, ExecutionState>>,
    dirty: Mutex<HashSet<ExecutionId>>,
    config: StateStoreConfig,
}

impl CacheFirstStateStore {
    pub fn new(
        repository: Arc<dyn ExecutionStateRepository>,
        config: StateStoreConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            repository,
            cache: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            config,
        })
    }

    /// Spawn the write-behind flusher. The task runs until the store is
    /// dropped; keep the handle if you want to abort it earlier.
    pub fn spawn_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::downgrade(self);
        let interval = self.config.flush_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(store) = store.upgrade() else { break };
                if let Err(e) = store.flush_dirty().await {
                    tracing::warn!(error = %e, "State flush failed; will retry next interval");
                }
            }
        })
    }

    /// Insert a fresh `pending` record for a new execution.
    pub async fn initialize_state(
        &self,
        execution_id: &str,
        diagram_id: &str,
        variables: HashMap<String, Value>,
        metadata: HashMap<String, Value>,
    ) -> Result<()> {
        let state = ExecutionState::new(execution_id, diagram_id, variables, metadata);
        {
            let mut cache = self.cache.lock();
            cache.insert(execution_id.to_string(), state);
        }
        self.mark_dirty(execution_id);
        // Make the record durable up front so a crash before the first flush
        // still leaves a pending row behind.
        self.flush_one(execution_id).await
    }

    /// Cache first, repository fallback; `None` when absent everywhere.
    pub async fn get_state(&self, execution_id: &str) -> Result<Option<ExecutionState>> {
        if let Some(state) = self.cache.lock().get(execution_id) {
            return Ok(Some(state.clone()));
        }
        match self.repository.get(execution_id).await? {
            Some(state) => {
                self.cache
                    .lock()
                    .insert(execution_id.to_string(), state.clone());
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Cache only. Used by resolvers that need fresh in-flight state and must
    /// not pay repository latency.
    pub fn get_state_from_cache(&self, execution_id: &str) -> Option<ExecutionState> {
        self.cache.lock().get(execution_id).cloned()
    }

    /// List persisted executions. Dirty entries are flushed first so the
    /// repository view is current.
    pub async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionSummary>> {
        self.flush_dirty().await?;
        self.repository.list(filter).await
    }

    /// Transition the execution status, with an immediate flush on terminal.
    pub async fn transition_status(
        &self,
        execution_id: &str,
        to: Status,
        error: Option<String>,
    ) -> Result<()> {
        self.update(execution_id, |state| {
            state.transition(to)?;
            if error.is_some() {
                state.error = error.clone();
            }
            Ok(())
        })?;
        if to.is_terminal() {
            self.flush_one(execution_id).await?;
            self.evict_if_over_capacity();
        }
        Ok(())
    }

    pub fn record_node_started(
        &self,
        execution_id: &str,
        node_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update(execution_id, |state| {
            state.record_node_started(node_id, at);
            Ok(())
        })
    }

    pub fn record_node_completed(
        &self,
        execution_id: &str,
        node_id: &str,
        output: Envelope,
        llm_usage: Option<LlmUsage>,
    ) -> Result<()> {
        self.update(execution_id, |state| {
            state.record_node_completed(node_id, output, llm_usage);
            Ok(())
        })
    }

    pub fn record_node_error(&self, execution_id: &str, node_id: &str, error: &str) -> Result<()> {
        self.update(execution_id, |state| {
            state.record_node_error(node_id, error);
            Ok(())
        })
    }

    /// Merge a metadata entry into the record (used for collected metrics).
    pub fn set_metadata(&self, execution_id: &str, key: &str, value: Value) -> Result<()> {
        self.update(execution_id, |state| {
            state.metadata.insert(key.to_string(), value.clone());
            Ok(())
        })
    }

    /// Persist every dirty entry. Coalesces: each execution is written once
    /// no matter how many mutations accumulated.
    pub async fn flush_dirty(&self) -> Result<()> {
        let dirty: Vec<ExecutionId> = {
            let mut set = self.dirty.lock();
            set.drain().collect()
        };
        for id in dirty {
            if let Err(e) = self.flush_one(&id).await {
                // Re-mark so the next interval retries.
                self.mark_dirty(&id);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn flush_one(&self, execution_id: &str) -> Result<()> {
        let snapshot = self.cache.lock().get(execution_id).cloned();
        if let Some(state) = snapshot {
            self.repository.upsert(&state).await?;
            self.dirty.lock().remove(execution_id);
        }
        Ok(())
    }

    fn update(
        &self,
        execution_id: &str,
        f: impl FnOnce(&mut ExecutionState) -> Result<()>,
    ) -> Result<()> {
        {
            let mut cache = self.cache.lock();
            let state = cache
                .get_mut(execution_id)
                .ok_or_else(|| StateStoreError::NotFound(execution_id.to_string()))?;
            f(state)?;
        }
        self.mark_dirty(execution_id);
        Ok(())
    }

    fn mark_dirty(&self, execution_id: &str) {
        self.dirty.lock().insert(execution_id.to_string());
    }

    /// Evict terminal, non-dirty entries once the cache exceeds capacity.
    fn evict_if_over_capacity(&self) {
        let mut cache = self.cache.lock();
        if cache.len() <= self.config.cache_capacity {
            return;
        }
        let dirty = self.dirty.lock();
        let evictable: Vec<ExecutionId> = cache
            .iter()
            .filter(|(id, state)| state.status.is_terminal() && !dirty.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();
        let excess = cache.len().saturating_sub(self.config.cache_capacity);
        for id in evictable.into_iter().take(excess) {
            cache.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStateRepository;
    use serde_json::json;

    fn store_with_memory_repo() -> (Arc<CacheFirstStateStore>, Arc<InMemoryStateRepository>) {
        let repo = Arc::new(InMemoryStateRepository::new());
        let store = CacheFirstStateStore::new(repo.clone(), StateStoreConfig::default());
        (store, repo)
    }

    #[tokio::test]
    async fn test_initialize_is_durable() {
        let (store, repo) = store_with_memory_repo();
        store
            .initialize_state("exec_1", "d1", HashMap::new(), HashMap::new())
            .await
            .unwrap();
        let persisted = repo.get("exec_1").await.unwrap().unwrap();
        assert_eq!(persisted.status, Status::Pending);
    }

    #[tokio::test]
    async fn test_mutations_are_cached_before_flush() {
        let (store, repo) = store_with_memory_repo();
        store
            .initialize_state("exec_1", "d1", HashMap::new(), HashMap::new())
            .await
            .unwrap();
        store
            .transition_status("exec_1", Status::Running, None)
            .await
            .unwrap();
        store
            .record_node_started("exec_1", "a", Utc::now())
            .unwrap();

        // Cache is current...
        let cached = store.get_state_from_cache("exec_1").unwrap();
        assert_eq!(cached.status, Status::Running);
        assert_eq!(cached.exec_counts["a"], 1);

        // ...repository lags until a flush.
        let persisted = repo.get("exec_1").await.unwrap().unwrap();
        assert_eq!(persisted.status, Status::Pending);

        store.flush_dirty().await.unwrap();
        let persisted = repo.get("exec_1").await.unwrap().unwrap();
        assert_eq!(persisted.status, Status::Running);
    }

    #[tokio::test]
    async fn test_terminal_status_flushes_immediately() {
        let (store, repo) = store_with_memory_repo();
        store
            .initialize_state("exec_1", "d1", HashMap::new(), HashMap::new())
            .await
            .unwrap();
        store
            .transition_status("exec_1", Status::Running, None)
            .await
            .unwrap();
        store
            .record_node_completed(
                "exec_1",
                "a",
                Envelope::new(json!(1), "a", "exec_1"),
                None,
            )
            .unwrap();
        store
            .transition_status("exec_1", Status::Completed, None)
            .await
            .unwrap();

        let persisted = repo.get("exec_1").await.unwrap().unwrap();
        assert_eq!(persisted.status, Status::Completed);
        assert!(persisted.node_outputs.contains_key("a"));
    }

    #[tokio::test]
    async fn test_repository_is_authoritative_on_cache_miss() {
        let repo = Arc::new(InMemoryStateRepository::new());
        let state = ExecutionState::new("exec_old", "d1", HashMap::new(), HashMap::new());
        repo.upsert(&state).await.unwrap();

        let store = CacheFirstStateStore::new(repo, StateStoreConfig::default());
        assert!(store.get_state_from_cache("exec_old").is_none());
        let fetched = store.get_state("exec_old").await.unwrap().unwrap();
        assert_eq!(fetched.diagram_id, "d1");
        // Now warm.
        assert!(store.get_state_from_cache("exec_old").is_some());
    }

    #[tokio::test]
    async fn test_unknown_execution_errors_on_update() {
        let (store, _repo) = store_with_memory_repo();
        let err = store
            .record_node_started("exec_missing", "a", Utc::now())
            .unwrap_err();
        assert!(matches!(err, StateStoreError::NotFound(_)));
    }
}
