//! Event filters.
//!
//! A filter is a pure predicate over events, attached at subscription time.
//! The built-in [`SubDiagramFilter`] scopes what a parent run's observers see
//! of a nested run: child node-level chatter is hidden, child terminal
//! status is allowed through so the parent can observe completion.

use super::{DomainEvent, EventType};

/// Pure predicate deciding whether a subscriber sees an event.
pub trait EventFilter: Send + Sync {
    fn matches(&self, event: &DomainEvent) -> bool;
}

/// Only events scoped to one execution.
pub struct ExecutionScopeFilter {
    pub execution_id: String,
}

impl ExecutionScopeFilter {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
        }
    }
}

impl EventFilter for ExecutionScopeFilter {
    fn matches(&self, event: &DomainEvent) -> bool {
        event.scope.execution_id == self.execution_id
    }
}

/// Scopes events around a nested (sub-diagram) run.
///
/// Child events are recognized by the `parent_execution_id` metadata tag the
/// sub-diagram executor stamps on its child's events.
pub struct SubDiagramFilter {
    pub parent_execution_id: String,
    /// Allow child execution-level events (started/terminal) through.
    pub propagate_to_sub: bool,
    /// Restrict strictly to the parent execution; child events never pass.
    pub scope_to_execution: bool,
}

impl SubDiagramFilter {
    pub fn new(parent_execution_id: impl Into<String>) -> Self {
        Self {
            parent_execution_id: parent_execution_id.into(),
            propagate_to_sub: true,
            scope_to_execution: false,
        }
    }
}

impl EventFilter for SubDiagramFilter {
    fn matches(&self, event: &DomainEvent) -> bool {
        if event.scope.execution_id == self.parent_execution_id {
            return true;
        }
        let is_child = event.parent_execution_id() == Some(self.parent_execution_id.as_str());
        if !is_child || self.scope_to_execution {
            return false;
        }
        if !self.propagate_to_sub {
            return false;
        }
        // Child runs surface only their lifecycle; node chatter stays inside.
        matches!(
            event.event_type,
            EventType::ExecutionStarted
                | EventType::ExecutionCompleted
                | EventType::ExecutionError
        )
    }
}

/// Global transport scope: hides node-level chatter of nested runs so a
/// parent's observers see their own events plus only each child's execution
/// lifecycle.
pub struct TransportScopeFilter;

impl EventFilter for TransportScopeFilter {
    fn matches(&self, event: &DomainEvent) -> bool {
        let nested = event
            .meta
            .get("is_sub_diagram")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !nested {
            return true;
        }
        matches!(
            event.event_type,
            EventType::ExecutionStarted
                | EventType::ExecutionCompleted
                | EventType::ExecutionError
        )
    }
}
