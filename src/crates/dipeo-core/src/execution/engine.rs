//! The execution engine run loop.
//!
//! One engine run is a single task that repeatedly asks the scheduler for
//! ready nodes, dispatches them in parallel (bounded by the global
//! semaphore), marks completions, and yields progress frames. Cancellation
//! and the execution deadline race the dispatch batch; on either, in-flight
//! handler futures are dropped, a terminal `execution_error` is published,
//! and the bus is drained so observers always see a terminal event.

use crate::config::{ENGINE_MAX_CONCURRENT, NODE_READY_POLL_INTERVAL};
use crate::diagram::ExecutableDiagram;
use crate::error::{DipeoError, Result};
use crate::events::InProcessEventBus;
use crate::execution::context::ExecutionContext;
use crate::execution::dispatcher::NodeDispatcher;
use crate::execution::options::ExecutionOptions;
use crate::execution::pipeline::EventPipeline;
use crate::execution::scheduler::{NodeScheduler, SchedulerStats};
use crate::handlers::HandlerRegistry;
use crate::registry::ServiceRegistry;
use crate::services;
use dipeo_state::{NodeId, Status};
use futures::stream::Stream;
use serde::Serialize;
use std::sync::Arc;

/// Fraction of nodes in a terminal state.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub percent: f64,
}

/// Frames yielded by [`ExecutionEngine::execute`].
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineUpdate {
    StepComplete {
        step: u64,
        executed_nodes: Vec<NodeId>,
        progress: Progress,
        scheduler_stats: SchedulerStats,
    },
    ExecutionComplete {
        total_steps: u64,
        execution_path: Vec<NodeId>,
        status: Status,
    },
    ExecutionError {
        error_kind: String,
        error: String,
    },
}

/// Owns the run loop for one or more executions.
pub struct ExecutionEngine {
    registry: Arc<ServiceRegistry>,
    bus: Arc<InProcessEventBus>,
    handlers: Arc<HandlerRegistry>,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        bus: Arc<InProcessEventBus>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            registry,
            bus,
            handlers,
        }
    }

    /// Run one execution, yielding progress frames and exactly one terminal
    /// frame.
    pub fn execute(
        &self,
        diagram: Arc<ExecutableDiagram>,
        execution_id: String,
        options: ExecutionOptions,
    ) -> impl Stream<Item = EngineUpdate> + Send {
        let registry = self.registry.clone();
        let bus = self.bus.clone();
        let handlers = self.handlers.clone();

        async_stream::stream! {
            let mut diagram = diagram;
            if let Some(budget) = options.max_iterations_override {
                let mut overridden = (*diagram).clone();
                for node in overridden.nodes.iter_mut() {
                    node.max_iterations = budget;
                }
                diagram = Arc::new(overridden);
            }

            let ctx = ExecutionContext::new(execution_id.clone(), diagram.clone(), &options);

            // Per-execution service scope: handlers resolve the live diagram
            // and context without cross-execution clobbering.
            let exec_registry = Arc::new(registry.create_child());
            exec_registry.register(services::DIAGRAM, diagram.clone());
            exec_registry.register(services::EXECUTION_CONTEXT, ctx.clone());

            let pipeline = EventPipeline::new(ctx.clone(), bus.clone());
            let mut scheduler = NodeScheduler::new(diagram.clone());
            let dispatcher = NodeDispatcher::new(handlers.clone(), ENGINE_MAX_CONCURRENT);

            tracing::info!(
                execution_id = %execution_id,
                diagram_id = %ctx.diagram_id,
                nodes = diagram.nodes.len(),
                timeout_s = ctx.timeout().as_secs(),
                "Starting execution"
            );
            pipeline.emit_execution_started();

            let mut step: u64 = 0;
            let outcome = loop {
                if ctx.abort.is_aborted() {
                    break Err(DipeoError::Cancelled("execution aborted".into()));
                }
                if ctx.deadline_expired() {
                    break Err(DipeoError::timeout("execution", ctx.timeout()));
                }

                let ready = ctx.with_tracker(|t| scheduler.ready_nodes(t));
                if ready.is_empty() {
                    let complete = ctx.with_tracker(|t| t.is_execution_complete(&diagram));
                    if complete {
                        break Ok(());
                    }
                    tokio::time::sleep(NODE_READY_POLL_INTERVAL).await;
                    continue;
                }

                step += 1;
                let batch: Vec<String> = ready.iter().map(|n| n.id.clone()).collect();
                tracing::debug!(execution_id = %execution_id, step, batch = ?batch, "Dispatching ready nodes");

                let dispatches = futures::future::join_all(ready.iter().map(|node| {
                    dispatcher.dispatch(node, &ctx, &pipeline, &exec_registry)
                }));

                let results = tokio::select! {
                    results = dispatches => results,
                    _ = ctx.abort.aborted() => {
                        break Err(DipeoError::Cancelled("execution aborted".into()));
                    }
                    _ = tokio::time::sleep(ctx.remaining_time()) => {
                        break Err(DipeoError::timeout("execution", ctx.timeout()));
                    }
                };

                let mut executed = Vec::new();
                let mut fatal = None;
                for result in results {
                    match result {
                        Ok(outcome) => {
                            if outcome.output.is_some() {
                                ctx.with_tracker(|t| {
                                    scheduler.mark_node_completed(&outcome.node_id, t)
                                });
                            }
                            executed.push(outcome.node_id);
                        }
                        Err(e) => {
                            fatal = Some(e);
                        }
                    }
                }
                if let Some(e) = fatal {
                    break Err(e);
                }

                let (progress, stats) = ctx.with_tracker(|t| {
                    let total = t.len();
                    let completed = t.terminal_count();
                    (
                        Progress {
                            completed,
                            total,
                            percent: if total == 0 {
                                100.0
                            } else {
                                completed as f64 * 100.0 / total as f64
                            },
                        },
                        scheduler.stats(t),
                    )
                });
                yield EngineUpdate::StepComplete {
                    step,
                    executed_nodes: executed,
                    progress,
                    scheduler_stats: stats,
                };
            };

            let terminal = match outcome {
                Ok(()) => {
                    let (status, path, error) = ctx.with_tracker(|t| {
                        let path: Vec<NodeId> = t.executed_nodes().to_vec();
                        let completed_terminal = diagram
                            .terminal_nodes()
                            .iter()
                            .any(|n| t.completed_nodes().contains(&n.id));
                        if completed_terminal {
                            (Status::Completed, path, None)
                        } else if t.any_failed() {
                            let (node, message) = t.first_error().unwrap_or_default();
                            (
                                Status::Failed,
                                path,
                                Some(DipeoError::node_execution(node, message)),
                            )
                        } else if let Some(node) = t.first_maxiter_reached() {
                            let budget = diagram
                                .node(&node)
                                .map(|n| n.max_iterations)
                                .unwrap_or_default();
                            (
                                Status::MaxiterReached,
                                path,
                                Some(DipeoError::MaxIterations { node, budget }),
                            )
                        } else {
                            (Status::Completed, path, None)
                        }
                    });

                    match status {
                        Status::Completed => {
                            tracing::info!(
                                execution_id = %execution_id,
                                total_steps = step,
                                "Execution completed"
                            );
                            pipeline.emit_execution_completed(Status::Completed, step, path.clone());
                            EngineUpdate::ExecutionComplete {
                                total_steps: step,
                                execution_path: path,
                                status: Status::Completed,
                            }
                        }
                        _ => {
                            let error = error.unwrap_or_else(|| {
                                DipeoError::Execution("execution did not complete".into())
                            });
                            let error_kind = error.kind().to_string();
                            tracing::warn!(
                                execution_id = %execution_id,
                                status = %status,
                                error = %error,
                                "Execution finished without success"
                            );
                            pipeline.emit_execution_error_parts(&error_kind, &error.to_string());
                            EngineUpdate::ExecutionError {
                                error_kind,
                                error: error.to_string(),
                            }
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        execution_id = %execution_id,
                        error = %error,
                        "Execution terminated abnormally"
                    );
                    pipeline.emit_execution_error(&error);
                    EngineUpdate::ExecutionError {
                        error_kind: error.kind().to_string(),
                        error: error.to_string(),
                    }
                }
            };

            // Observers must see the terminal event before the stream ends.
            bus.wait_for_pending_events().await;
            yield terminal;
        }
    }
}

impl ExecutionEngine {
    /// Drive a run to its terminal frame, discarding progress updates.
    pub async fn execute_to_end(
        &self,
        diagram: Arc<ExecutableDiagram>,
        execution_id: String,
        options: ExecutionOptions,
    ) -> Result<EngineUpdate> {
        use futures::StreamExt;
        let stream = self.execute(diagram, execution_id, options);
        futures::pin_mut!(stream);
        let mut terminal = None;
        while let Some(update) = stream.next().await {
            match update {
                EngineUpdate::StepComplete { .. } => {}
                other => terminal = Some(other),
            }
        }
        terminal.ok_or_else(|| DipeoError::Execution("engine yielded no terminal frame".into()))
    }
}
