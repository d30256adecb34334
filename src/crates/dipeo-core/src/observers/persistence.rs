//! High-priority bus subscriber that keeps the state store current.
//!
//! This is the only writer to [`CacheFirstStateStore`] during a run. Because
//! it subscribes at [`HandlerPriority::High`], every state mutation is in
//! the store's cache before any normal-priority observer (metrics, UI
//! streaming) sees the same event.

use crate::error::{DipeoError, Result};
use crate::events::{
    DomainEvent, EventHandler, EventPayload, EventType, HandlerPriority, InProcessEventBus,
};
use async_trait::async_trait;
use dipeo_state::{CacheFirstStateStore, Status};
use std::sync::Arc;

/// Maps domain events onto state-store mutators.
pub struct StatePersistenceSubscriber {
    store: Arc<CacheFirstStateStore>,
}

impl StatePersistenceSubscriber {
    pub fn new(store: Arc<CacheFirstStateStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// Subscribe at high priority for every state-mutating event type.
    pub fn attach(self: &Arc<Self>, bus: &InProcessEventBus) {
        bus.subscribe(
            &[
                EventType::ExecutionStarted,
                EventType::NodeStarted,
                EventType::NodeCompleted,
                EventType::NodeError,
                EventType::ExecutionCompleted,
                EventType::ExecutionError,
                EventType::MetricsCollected,
            ],
            self.clone(),
            HandlerPriority::High,
            None,
        );
    }
}

#[async_trait]
impl EventHandler for StatePersistenceSubscriber {
    fn name(&self) -> &str {
        "state_persistence"
    }

    async fn on_event(&self, event: &DomainEvent) -> Result<()> {
        let execution_id = &event.scope.execution_id;
        let map_err = DipeoError::StateStore;

        match &event.payload {
            EventPayload::ExecutionStarted { .. } => self
                .store
                .transition_status(execution_id, Status::Running, None)
                .await
                .map_err(map_err),
            EventPayload::NodeStarted { .. } => {
                let node_id = event.scope.node_id.as_deref().unwrap_or_default();
                self.store
                    .record_node_started(execution_id, node_id, event.timestamp)
                    .map_err(map_err)
            }
            EventPayload::NodeCompleted {
                output, llm_usage, ..
            } => {
                let node_id = event.scope.node_id.as_deref().unwrap_or_default();
                self.store
                    .record_node_completed(execution_id, node_id, output.clone(), *llm_usage)
                    .map_err(map_err)
            }
            EventPayload::NodeError { message, .. } => {
                let node_id = event.scope.node_id.as_deref().unwrap_or_default();
                self.store
                    .record_node_error(execution_id, node_id, message)
                    .map_err(map_err)
            }
            EventPayload::ExecutionCompleted { status, .. } => self
                .store
                .transition_status(execution_id, *status, None)
                .await
                .map_err(map_err),
            EventPayload::ExecutionError {
                error_kind,
                message,
            } => {
                let status = match error_kind.as_str() {
                    "aborted" => Status::Aborted,
                    "maxiter_reached" => Status::MaxiterReached,
                    _ => Status::Failed,
                };
                self.store
                    .transition_status(execution_id, status, Some(message.clone()))
                    .await
                    .map_err(map_err)
            }
            EventPayload::MetricsCollected { metrics } => {
                self.store
                    .set_metadata(execution_id, "metrics", metrics.clone())
                    .map_err(map_err)?;
                // Metrics land after the terminal flush; push them through so
                // a process exiting right after the run still persists them.
                self.store.flush_dirty().await.map_err(map_err)
            }
            _ => Ok(()),
        }
    }
}
