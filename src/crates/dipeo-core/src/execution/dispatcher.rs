//! Single-node dispatch: gather inputs, invoke the handler, emit events.
//!
//! Parallelism across ready nodes is bounded by a global semaphore
//! (`ENGINE_MAX_CONCURRENT`). Each dispatch retries the handler under the
//! node's retry policy (exponential backoff with optional jitter) before a
//! `node_error` is emitted. A node failure is captured, never thrown: the
//! scheduler decides downstream whether the execution can still complete.

use crate::diagram::{ExecutableNode, NodeType, Packing, RetryPolicy};
use crate::error::{DipeoError, Result};
use crate::execution::context::ExecutionContext;
use crate::execution::pipeline::EventPipeline;
use crate::handlers::{HandlerRegistry, HandlerRequest};
use crate::registry::ServiceRegistry;
use dipeo_state::{Envelope, LlmUsage, NodeId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Outcome of one node dispatch.
pub struct DispatchResult {
    pub node_id: NodeId,
    pub output: Option<Envelope>,
}

/// Invokes the handler for one node with its input envelopes under a
/// concurrency semaphore.
pub struct NodeDispatcher {
    handlers: Arc<HandlerRegistry>,
    semaphore: Arc<Semaphore>,
}

impl NodeDispatcher {
    pub fn new(handlers: Arc<HandlerRegistry>, max_concurrent: usize) -> Self {
        Self {
            handlers,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Execute one node to completion (or failure). Emits `node_started`
    /// then exactly one of `node_completed`/`node_error`.
    pub async fn dispatch(
        &self,
        node: &ExecutableNode,
        ctx: &Arc<ExecutionContext>,
        pipeline: &Arc<EventPipeline>,
        services: &Arc<ServiceRegistry>,
    ) -> Result<DispatchResult> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| DipeoError::Execution("Dispatcher semaphore closed".into()))?;

        let inputs = match self.gather_inputs(node, ctx) {
            Ok(inputs) => inputs,
            Err(e) => {
                // Input coercion failures count as a started-and-failed run
                // so the event log explains what happened.
                pipeline.emit_node_started(node)?;
                let err = DipeoError::node_execution(&node.id, e.to_string());
                pipeline.emit_node_error(node, &err);
                return Ok(DispatchResult {
                    node_id: node.id.clone(),
                    output: None,
                });
            }
        };

        pipeline.emit_node_started(node)?;
        let started = Instant::now();

        match self.invoke_with_retry(node, &inputs, ctx, services).await {
            Ok(output) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let llm_usage = extract_llm_usage(&output);
                tracing::debug!(
                    node_id = %node.id,
                    node_type = %node.node_type,
                    duration_ms,
                    "Node completed"
                );
                pipeline.emit_node_completed(node, output.clone(), duration_ms, llm_usage);
                Ok(DispatchResult {
                    node_id: node.id.clone(),
                    output: Some(output),
                })
            }
            Err(error) => {
                let error = classify(node, error);
                tracing::warn!(
                    node_id = %node.id,
                    node_type = %node.node_type,
                    error = %error,
                    "Node failed"
                );
                pipeline.emit_node_error(node, &error);
                Ok(DispatchResult {
                    node_id: node.id.clone(),
                    output: None,
                })
            }
        }
    }

    async fn invoke_with_retry(
        &self,
        node: &ExecutableNode,
        inputs: &HashMap<String, Envelope>,
        ctx: &Arc<ExecutionContext>,
        services: &Arc<ServiceRegistry>,
    ) -> Result<Envelope> {
        let handler = self.handlers.get(node.node_type)?;
        let policy = node.retry.clone();
        let max_attempts = policy.as_ref().map(|p| p.max_attempts.max(1)).unwrap_or(1);

        let mut attempts = 0;
        let mut last_error = None;
        while attempts < max_attempts {
            attempts += 1;
            let request = HandlerRequest {
                node,
                inputs,
                services,
                ctx,
            };
            let remaining = ctx.remaining_time();
            let attempt = tokio::time::timeout(remaining, handler.handle(request)).await;
            match attempt {
                Ok(Ok(output)) => {
                    if attempts > 1 {
                        tracing::info!(
                            node_id = %node.id,
                            attempts,
                            "Node succeeded after retry"
                        );
                    }
                    return Ok(output);
                }
                Ok(Err(e)) => {
                    last_error = Some(e);
                    if attempts < max_attempts {
                        if let Some(policy) = &policy {
                            let delay = calculate_delay(policy, attempts);
                            tracing::warn!(
                                node_id = %node.id,
                                attempt = attempts,
                                max_attempts,
                                delay_ms = delay.as_millis() as u64,
                                "Node failed, retrying after delay"
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                Err(_) => {
                    return Err(DipeoError::timeout(
                        format!("node '{}'", node.id),
                        remaining,
                    ))
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| DipeoError::node_execution(&node.id, "no attempts were made")))
    }

    /// Read `node_outputs[source]` for every satisfied incoming edge and map
    /// the envelopes to target handle names.
    fn gather_inputs(
        &self,
        node: &ExecutableNode,
        ctx: &Arc<ExecutionContext>,
    ) -> Result<HashMap<String, Envelope>> {
        // (handle -> envelopes with their packing), in priority order.
        let mut by_handle: Vec<(String, Vec<(Envelope, Packing)>)> = Vec::new();

        ctx.with_tracker(|tracker| -> Result<()> {
            for edge in ctx.diagram.incoming(&node.id) {
                let Some(envelope) = tracker.output(&edge.source) else {
                    // Feedback edge before the first loop round, or a
                    // skipped source: nothing flows.
                    continue;
                };
                if let Some(branch) = envelope.meta.get("branch").and_then(|v| v.as_str()) {
                    let from_condition = ctx
                        .diagram
                        .node(&edge.source)
                        .map(|n| n.node_type == NodeType::Condition)
                        .unwrap_or(false);
                    if from_condition && branch != edge.source_handle {
                        continue;
                    }
                }
                let envelope = match edge.content_type {
                    Some(target_type) => envelope.coerce_to(target_type).map_err(|e| {
                        DipeoError::node_execution(&node.id, e.to_string())
                    })?,
                    None => envelope.clone(),
                };
                match by_handle.iter_mut().find(|(h, _)| h == &edge.target_handle) {
                    Some((_, list)) => list.push((envelope, edge.packing)),
                    None => by_handle.push((
                        edge.target_handle.clone(),
                        vec![(envelope, edge.packing)],
                    )),
                }
            }
            Ok(())
        })?;

        let trace_id = ctx.execution_id.clone();
        let mut inputs = HashMap::new();
        for (handle, envelopes) in by_handle {
            inputs.insert(handle, materialize(envelopes, &node.id, &trace_id));
        }
        Ok(inputs)
    }
}

/// Combine the envelopes arriving on one handle.
///
/// A single envelope passes through untouched. Multiple envelopes pack into
/// one array body; `spread` sources contribute their elements, `pack`
/// sources contribute themselves.
fn materialize(mut envelopes: Vec<(Envelope, Packing)>, node_id: &str, trace_id: &str) -> Envelope {
    if envelopes.len() == 1 {
        return envelopes.remove(0).0;
    }
    let mut items = Vec::new();
    for (envelope, packing) in envelopes {
        match (packing, envelope.body) {
            (Packing::Spread, Value::Array(elems)) => items.extend(elems),
            (_, body) => items.push(body),
        }
    }
    Envelope::new(Value::Array(items), node_id, trace_id)
}

/// Map handler failures into the error taxonomy.
fn classify(node: &ExecutableNode, error: DipeoError) -> DipeoError {
    match error {
        // A missing service surfaces as a node failure wrapping the key.
        DipeoError::ServiceResolution { key } => DipeoError::node_execution(
            &node.id,
            format!("required service '{key}' is not registered"),
        ),
        e @ (DipeoError::NodeExecution { .. }
        | DipeoError::Timeout { .. }
        | DipeoError::Cancelled(_)) => e,
        other => DipeoError::node_execution(&node.id, other.to_string()),
    }
}

fn calculate_delay(policy: &RetryPolicy, attempt: usize) -> Duration {
    let base = policy.initial_interval;
    let multiplier = policy.backoff_factor.powi((attempt - 1) as i32);
    let capped = (base * multiplier).min(policy.max_interval);
    let final_delay = if policy.jitter {
        use rand::Rng;
        let jitter_factor = rand::thread_rng().gen_range(0.0..0.25);
        capped * (1.0 + jitter_factor)
    } else {
        capped
    };
    Duration::from_secs_f64(final_delay.max(0.0))
}

fn extract_llm_usage(envelope: &Envelope) -> Option<LlmUsage> {
    envelope
        .meta
        .get("llm_usage")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}
