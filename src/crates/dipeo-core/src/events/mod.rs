//! Domain events and the in-process event bus.
//!
//! Every state change in an execution is announced as a [`DomainEvent`] on
//! the [`InProcessEventBus`]. The bus is the single source of truth for
//! observers: state persistence, metrics, streaming monitors, and transports
//! are all pure subscribers and never hold engine references.

pub mod bus;
pub mod filter;

pub use bus::{EventBusConfig, EventHandler, HandlerPriority, InProcessEventBus, SubscriptionHandle};
pub use filter::{EventFilter, ExecutionScopeFilter, SubDiagramFilter, TransportScopeFilter};

use chrono::{DateTime, Utc};
use dipeo_state::{Envelope, ExecutionId, LlmUsage, NodeId, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Closed set of domain event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionError,
    NodeStarted,
    NodeCompleted,
    NodeError,
    ExecutionLog,
    MetricsCollected,
    WebhookReceived,
    InteractivePrompt,
    Keepalive,
}

impl EventType {
    /// The lowercase snake_case name used in transport frames.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ExecutionStarted => "execution_started",
            EventType::ExecutionCompleted => "execution_completed",
            EventType::ExecutionError => "execution_error",
            EventType::NodeStarted => "node_started",
            EventType::NodeCompleted => "node_completed",
            EventType::NodeError => "node_error",
            EventType::ExecutionLog => "execution_log",
            EventType::MetricsCollected => "metrics_collected",
            EventType::WebhookReceived => "webhook_received",
            EventType::InteractivePrompt => "interactive_prompt",
            EventType::Keepalive => "keepalive",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Log levels carried by `execution_log` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Where an event applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventScope {
    pub execution_id: ExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

/// Typed payload, one variant per event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    ExecutionStarted {
        variables: BTreeMap<String, Value>,
    },
    ExecutionCompleted {
        status: Status,
        total_steps: u64,
        execution_path: Vec<NodeId>,
    },
    ExecutionError {
        error_kind: String,
        message: String,
    },
    NodeStarted {
        node_type: String,
        exec_count: u32,
    },
    NodeCompleted {
        output: Envelope,
        duration_ms: u64,
        exec_count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        llm_usage: Option<LlmUsage>,
    },
    NodeError {
        message: String,
        exec_count: u32,
    },
    Log {
        level: LogLevel,
        message: String,
    },
    MetricsCollected {
        metrics: Value,
    },
    WebhookReceived {
        source: String,
        body: Value,
    },
    InteractivePrompt {
        prompt: String,
        timeout_s: u64,
    },
    Keepalive,
}

/// One event on the bus.
///
/// `seq` is assigned by the bus at publish time: monotonic and gap-free per
/// `execution_id`, starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub seq: u64,
    pub event_type: EventType,
    pub scope: EventScope,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
}

impl DomainEvent {
    fn new(
        event_type: EventType,
        execution_id: impl Into<ExecutionId>,
        node_id: Option<NodeId>,
        payload: EventPayload,
    ) -> Self {
        Self {
            seq: 0,
            event_type,
            scope: EventScope {
                execution_id: execution_id.into(),
                node_id,
            },
            payload,
            timestamp: Utc::now(),
            meta: BTreeMap::new(),
        }
    }

    pub fn execution_started(
        execution_id: impl Into<ExecutionId>,
        variables: BTreeMap<String, Value>,
    ) -> Self {
        Self::new(
            EventType::ExecutionStarted,
            execution_id,
            None,
            EventPayload::ExecutionStarted { variables },
        )
    }

    pub fn execution_completed(
        execution_id: impl Into<ExecutionId>,
        status: Status,
        total_steps: u64,
        execution_path: Vec<NodeId>,
    ) -> Self {
        Self::new(
            EventType::ExecutionCompleted,
            execution_id,
            None,
            EventPayload::ExecutionCompleted {
                status,
                total_steps,
                execution_path,
            },
        )
    }

    pub fn execution_error(
        execution_id: impl Into<ExecutionId>,
        error_kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            EventType::ExecutionError,
            execution_id,
            None,
            EventPayload::ExecutionError {
                error_kind: error_kind.into(),
                message: message.into(),
            },
        )
    }

    pub fn node_started(
        execution_id: impl Into<ExecutionId>,
        node_id: impl Into<NodeId>,
        node_type: impl Into<String>,
        exec_count: u32,
    ) -> Self {
        Self::new(
            EventType::NodeStarted,
            execution_id,
            Some(node_id.into()),
            EventPayload::NodeStarted {
                node_type: node_type.into(),
                exec_count,
            },
        )
    }

    pub fn node_completed(
        execution_id: impl Into<ExecutionId>,
        node_id: impl Into<NodeId>,
        output: Envelope,
        duration_ms: u64,
        exec_count: u32,
        llm_usage: Option<LlmUsage>,
    ) -> Self {
        Self::new(
            EventType::NodeCompleted,
            execution_id,
            Some(node_id.into()),
            EventPayload::NodeCompleted {
                output,
                duration_ms,
                exec_count,
                llm_usage,
            },
        )
    }

    pub fn node_error(
        execution_id: impl Into<ExecutionId>,
        node_id: impl Into<NodeId>,
        message: impl Into<String>,
        exec_count: u32,
    ) -> Self {
        Self::new(
            EventType::NodeError,
            execution_id,
            Some(node_id.into()),
            EventPayload::NodeError {
                message: message.into(),
                exec_count,
            },
        )
    }

    pub fn execution_log(
        execution_id: impl Into<ExecutionId>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            EventType::ExecutionLog,
            execution_id,
            None,
            EventPayload::Log {
                level,
                message: message.into(),
            },
        )
    }

    pub fn metrics_collected(execution_id: impl Into<ExecutionId>, metrics: Value) -> Self {
        Self::new(
            EventType::MetricsCollected,
            execution_id,
            None,
            EventPayload::MetricsCollected { metrics },
        )
    }

    pub fn webhook_received(
        execution_id: impl Into<ExecutionId>,
        source: impl Into<String>,
        body: Value,
    ) -> Self {
        Self::new(
            EventType::WebhookReceived,
            execution_id,
            None,
            EventPayload::WebhookReceived {
                source: source.into(),
                body,
            },
        )
    }

    pub fn interactive_prompt(
        execution_id: impl Into<ExecutionId>,
        node_id: impl Into<NodeId>,
        prompt: impl Into<String>,
        timeout_s: u64,
    ) -> Self {
        Self::new(
            EventType::InteractivePrompt,
            execution_id,
            Some(node_id.into()),
            EventPayload::InteractivePrompt {
                prompt: prompt.into(),
                timeout_s,
            },
        )
    }

    pub fn keepalive(execution_id: impl Into<ExecutionId>) -> Self {
        Self::new(EventType::Keepalive, execution_id, None, EventPayload::Keepalive)
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// The parent execution id for child-run events, when tagged.
    pub fn parent_execution_id(&self) -> Option<&str> {
        self.meta.get("parent_execution_id").and_then(|v| v.as_str())
    }
}

/// The wire frame pushed to transports (GraphQL subscriptions, SSE).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub execution_id: ExecutionId,
    /// Lowercase snake_case event type.
    #[serde(rename = "type")]
    pub update_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub seq: u64,
}

impl ExecutionUpdate {
    /// Build the transport frame for an event.
    pub fn from_event(event: &DomainEvent) -> Self {
        let mut data = serde_json::to_value(&event.payload).unwrap_or(Value::Null);
        if let (Value::Object(map), Some(node_id)) = (&mut data, &event.scope.node_id) {
            map.insert("node_id".to_string(), Value::String(node_id.clone()));
        }
        Self {
            execution_id: event.scope.execution_id.clone(),
            update_type: event.event_type.as_str().to_string(),
            data,
            timestamp: event.timestamp,
            seq: event.seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_names_are_snake_case() {
        assert_eq!(EventType::ExecutionStarted.as_str(), "execution_started");
        assert_eq!(EventType::NodeError.as_str(), "node_error");
        assert_eq!(
            serde_json::to_value(EventType::MetricsCollected).unwrap(),
            json!("metrics_collected")
        );
    }

    #[test]
    fn test_update_frame_carries_node_id() {
        let event = DomainEvent::node_started("exec_1", "work", "code_job", 1);
        let frame = ExecutionUpdate::from_event(&event);
        assert_eq!(frame.update_type, "node_started");
        assert_eq!(frame.data["node_id"], "work");
        assert_eq!(frame.data["exec_count"], 1);
    }
}
