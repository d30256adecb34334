//! Logging tap: forwards `execution_log` events to the tracing sink.

use crate::error::Result;
use crate::events::{
    DomainEvent, EventHandler, EventPayload, EventType, HandlerPriority, InProcessEventBus,
    LogLevel,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Captures `execution_log` events and forwards them at the requested level.
pub struct LoggingObserver;

impl LoggingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }

    pub fn attach(self: &Arc<Self>, bus: &Arc<InProcessEventBus>) {
        bus.subscribe(
            &[EventType::ExecutionLog],
            self.clone(),
            HandlerPriority::Normal,
            None,
        );
    }
}

#[async_trait]
impl EventHandler for LoggingObserver {
    fn name(&self) -> &str {
        "logging_observer"
    }

    async fn on_event(&self, event: &DomainEvent) -> Result<()> {
        if let EventPayload::Log { level, message } = &event.payload {
            let execution_id = &event.scope.execution_id;
            match level {
                LogLevel::Debug => {
                    tracing::debug!(execution_id = %execution_id, "{message}")
                }
                LogLevel::Info => tracing::info!(execution_id = %execution_id, "{message}"),
                LogLevel::Warning => {
                    tracing::warn!(execution_id = %execution_id, "{message}")
                }
                LogLevel::Error => {
                    tracing::error!(execution_id = %execution_id, "{message}")
                }
            }
        }
        Ok(())
    }
}
