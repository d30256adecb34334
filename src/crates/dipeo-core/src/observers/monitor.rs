//! Streaming monitor: events -> transport frames.
//!
//! Translates bus events into [`ExecutionUpdate`] frames and pushes them to
//! the wired message router (GraphQL subscription / SSE fan-out lives behind
//! that port). A keepalive ticker emits heartbeat frames for executions that
//! have been idle longer than the configured interval.

use crate::error::Result;
use crate::events::{
    DomainEvent, EventHandler, EventType, ExecutionUpdate, HandlerPriority, InProcessEventBus,
};
use crate::services::MessageRouter;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Fans execution updates out to a transport router.
pub struct StreamingMonitor {
    router: Arc<dyn MessageRouter>,
    /// Last frame time per live execution, for keepalives.
    last_activity: Mutex<HashMap<String, chrono::DateTime<Utc>>>,
    keepalive_interval: Duration,
}

impl StreamingMonitor {
    pub fn new(router: Arc<dyn MessageRouter>, keepalive_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            router,
            last_activity: Mutex::new(HashMap::new()),
            keepalive_interval,
        })
    }

    /// Subscribe to every event type at normal priority, after persistence.
    /// The optional filter scopes what reaches the transport; the standard
    /// wiring passes [`TransportScopeFilter`](crate::events::filter::TransportScopeFilter)
    /// so nested-run node chatter stays off the wire.
    pub fn attach(
        self: &Arc<Self>,
        bus: &Arc<InProcessEventBus>,
        filter: Option<Arc<dyn crate::events::EventFilter>>,
    ) {
        bus.subscribe(&[], self.clone(), HandlerPriority::Normal, filter);
    }

    /// Spawn the keepalive ticker. Frames are emitted straight to the
    /// router; they are heartbeat padding, not domain events.
    pub fn spawn_keepalive(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(monitor) = monitor.upgrade() else { break };
                let interval = monitor.keepalive_interval;
                tokio::time::sleep(interval).await;

                let now = Utc::now();
                let idle: Vec<String> = monitor
                    .last_activity
                    .lock()
                    .iter()
                    .filter(|(_, last)| {
                        (now - **last).num_milliseconds() as u128 >= interval.as_millis()
                    })
                    .map(|(id, _)| id.clone())
                    .collect();
                for execution_id in idle {
                    let frame = ExecutionUpdate {
                        execution_id: execution_id.clone(),
                        update_type: EventType::Keepalive.as_str().to_string(),
                        data: serde_json::Value::Null,
                        timestamp: now,
                        seq: 0,
                    };
                    if let Err(e) = monitor.router.route(frame).await {
                        tracing::debug!(error = %e, "Keepalive routing failed");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl EventHandler for StreamingMonitor {
    fn name(&self) -> &str {
        "streaming_monitor"
    }

    async fn on_event(&self, event: &DomainEvent) -> Result<()> {
        {
            let mut activity = self.last_activity.lock();
            match event.event_type {
                EventType::ExecutionCompleted | EventType::ExecutionError => {
                    activity.remove(&event.scope.execution_id);
                }
                _ => {
                    activity.insert(event.scope.execution_id.clone(), Utc::now());
                }
            }
        }
        self.router.route(ExecutionUpdate::from_event(event)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBusConfig;
    use serde_json::Value;

    #[derive(Default)]
    struct CollectingRouter {
        frames: Mutex<Vec<ExecutionUpdate>>,
    }

    #[async_trait]
    impl MessageRouter for CollectingRouter {
        async fn route(&self, frame: ExecutionUpdate) -> Result<()> {
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_monitor_translates_events_to_frames() {
        let router = Arc::new(CollectingRouter::default());
        let bus = InProcessEventBus::new(EventBusConfig::default());
        let monitor = StreamingMonitor::new(router.clone(), Duration::from_secs(30));
        monitor.attach(&bus, None);

        bus.publish(DomainEvent::node_started("exec_s", "n1", "code_job", 1));
        bus.publish(DomainEvent::execution_completed(
            "exec_s",
            dipeo_state::Status::Completed,
            1,
            vec!["n1".into()],
        ));
        bus.wait_for_pending_events().await;

        let frames = router.frames.lock();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].update_type, "node_started");
        assert_eq!(frames[0].seq, 1);
        assert_eq!(frames[1].update_type, "execution_completed");
        assert_ne!(frames[0].data, Value::Null);
    }
}
