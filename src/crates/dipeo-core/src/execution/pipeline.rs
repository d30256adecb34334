//! The event pipeline: tracker mutation and event emission, fused.
//!
//! Every state transition the engine makes goes through here so the tracker
//! and the bus can never diverge. That fusion is what upholds the
//! `exec_counts[n] == number of node_started events` invariant.

use crate::diagram::ExecutableNode;
use crate::error::{DipeoError, Result};
use crate::events::{DomainEvent, InProcessEventBus, LogLevel};
use crate::execution::context::ExecutionContext;
use dipeo_state::{Envelope, LlmUsage, NodeId, Status};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Emits domain events for one execution, stamping sub-diagram metadata.
pub struct EventPipeline {
    ctx: Arc<ExecutionContext>,
    bus: Arc<InProcessEventBus>,
}

impl EventPipeline {
    pub fn new(ctx: Arc<ExecutionContext>, bus: Arc<InProcessEventBus>) -> Arc<Self> {
        Arc::new(Self { ctx, bus })
    }

    pub fn bus(&self) -> &Arc<InProcessEventBus> {
        &self.bus
    }

    fn stamp(&self, event: DomainEvent) -> DomainEvent {
        let mut event = event;
        if let Some(parent) = &self.ctx.parent_execution_id {
            event = event.with_meta("parent_execution_id", json!(parent));
        }
        if self.ctx.is_sub_diagram {
            event = event.with_meta("is_sub_diagram", json!(true));
        }
        event
    }

    pub fn emit_execution_started(&self) {
        let variables: BTreeMap<String, Value> = self.ctx.variables().into_iter().collect();
        self.bus.publish(self.stamp(DomainEvent::execution_started(
            self.ctx.execution_id.clone(),
            variables,
        )));
    }

    /// Record a node start in the tracker and announce it. Returns the
    /// execution count of this start.
    pub fn emit_node_started(&self, node: &ExecutableNode) -> Result<u32> {
        let (_started_at, count) = self.ctx.with_tracker(|t| t.mark_started(&node.id))?;
        self.bus.publish(self.stamp(DomainEvent::node_started(
            self.ctx.execution_id.clone(),
            node.id.clone(),
            node.node_type.to_string(),
            count,
        )));
        Ok(count)
    }

    pub fn emit_node_completed(
        &self,
        node: &ExecutableNode,
        output: Envelope,
        duration_ms: u64,
        llm_usage: Option<LlmUsage>,
    ) {
        let count = self
            .ctx
            .with_tracker(|t| {
                t.mark_completed(&node.id, output.clone(), llm_usage);
                t.execution_count(&node.id)
            });
        self.bus.publish(self.stamp(DomainEvent::node_completed(
            self.ctx.execution_id.clone(),
            node.id.clone(),
            output,
            duration_ms,
            count,
            llm_usage,
        )));
    }

    pub fn emit_node_error(&self, node: &ExecutableNode, error: &DipeoError) {
        let message = error.to_string();
        let count = self.ctx.with_tracker(|t| {
            t.mark_failed(&node.id, &message);
            t.execution_count(&node.id)
        });
        self.bus.publish(self.stamp(DomainEvent::node_error(
            self.ctx.execution_id.clone(),
            node.id.clone(),
            message,
            count,
        )));
    }

    pub fn emit_execution_completed(
        &self,
        status: Status,
        total_steps: u64,
        execution_path: Vec<NodeId>,
    ) {
        self.bus.publish(self.stamp(DomainEvent::execution_completed(
            self.ctx.execution_id.clone(),
            status,
            total_steps,
            execution_path,
        )));
    }

    pub fn emit_execution_error(&self, error: &DipeoError) {
        self.emit_execution_error_parts(error.kind(), &error.to_string());
    }

    /// Error emission with an explicit kind, for statuses (like an exhausted
    /// iteration budget) that are not carried by a `DipeoError` value.
    pub fn emit_execution_error_parts(&self, error_kind: &str, message: &str) {
        self.bus.publish(self.stamp(DomainEvent::execution_error(
            self.ctx.execution_id.clone(),
            error_kind,
            message,
        )));
    }

    pub fn emit_log(&self, level: LogLevel, message: impl Into<String>) {
        self.bus.publish(self.stamp(DomainEvent::execution_log(
            self.ctx.execution_id.clone(),
            level,
            message,
        )));
    }

    pub async fn wait_for_pending_events(&self) {
        self.bus.wait_for_pending_events().await;
    }
}
