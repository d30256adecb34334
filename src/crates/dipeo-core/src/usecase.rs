//! Top-level execute-diagram use case.
//!
//! Orchestrates one run end to end: compile the domain diagram, initialize
//! the state record, subscribe the metrics observer, drive the engine, and
//! yield a terminal frame whose status comes from the state store (the
//! canonical record), not from the engine's in-memory view.
//!
//! Sub-diagram and batch-item runs short-circuit terminal collection: the
//! engine is driven to completion and the state is read once, with no
//! status polling.

use crate::diagram::{DiagramCompiler, DomainDiagram};
use crate::error::{DipeoError, Result};
use crate::execution::{EngineUpdate, ExecutionEngine, ExecutionOptions, Progress};
use crate::observers::METRICS_OBSERVER;
use crate::registry::ServiceRegistry;
use crate::services::{EVENT_BUS, NODE_REGISTRY, STATE_STORE};
use dipeo_state::{ExecutionState, Status};
use futures::stream::Stream;
use futures::StreamExt;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Frames yielded by [`ExecuteDiagramUseCase::execute_diagram`].
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunUpdate {
    StepComplete {
        step: u64,
        executed_nodes: Vec<String>,
        progress: Progress,
        scheduler_stats: crate::execution::SchedulerStats,
    },
    ExecutionComplete {
        execution_id: String,
        status: Status,
    },
    ExecutionError {
        execution_id: String,
        status: Status,
        error: String,
    },
}

impl RunUpdate {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunUpdate::StepComplete { .. })
    }
}

/// Compile -> initialize state -> run engine -> yield terminal status.
pub struct ExecuteDiagramUseCase {
    registry: Arc<ServiceRegistry>,
}

impl ExecuteDiagramUseCase {
    /// Fails fast when the required services are not wired.
    pub fn new(registry: Arc<ServiceRegistry>) -> Result<Self> {
        for missing in [
            (!registry.has(STATE_STORE)).then_some(STATE_STORE.name()),
            (!registry.has(EVENT_BUS)).then_some(EVENT_BUS.name()),
            (!registry.has(NODE_REGISTRY)).then_some(NODE_REGISTRY.name()),
        ]
        .into_iter()
        .flatten()
        {
            return Err(DipeoError::service_resolution(missing));
        }
        Ok(Self { registry })
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Run a diagram, yielding progress frames and exactly one terminal
    /// frame.
    pub fn execute_diagram(
        &self,
        diagram: DomainDiagram,
        options: ExecutionOptions,
        execution_id: String,
    ) -> Pin<Box<dyn Stream<Item = RunUpdate> + Send>> {
        let registry = self.registry.clone();
        Box::pin(async_stream::stream! {
            let store = match registry.resolve(STATE_STORE) {
                Ok(store) => store,
                Err(e) => {
                    yield RunUpdate::ExecutionError {
                        execution_id: execution_id.clone(),
                        status: Status::Failed,
                        error: e.to_string(),
                    };
                    return;
                }
            };

            // 1. Compile.
            let compiled = match DiagramCompiler::new().compile(&diagram) {
                Ok(compiled) => Arc::new(compiled),
                Err(e) => {
                    tracing::error!(error = %e, "Compilation failed");
                    yield RunUpdate::ExecutionError {
                        execution_id: execution_id.clone(),
                        status: Status::Failed,
                        error: e.to_string(),
                    };
                    return;
                }
            };

            // 2. Initialize state (pending; running on the first event).
            if let Err(e) = store
                .initialize_state(
                    &execution_id,
                    &compiled.diagram_id,
                    options.variables.clone(),
                    options.metadata.clone(),
                )
                .await
            {
                yield RunUpdate::ExecutionError {
                    execution_id: execution_id.clone(),
                    status: Status::Failed,
                    error: e.to_string(),
                };
                return;
            }

            // 3. Metrics observation is idempotent per execution.
            if let Ok(metrics) = registry.resolve(METRICS_OBSERVER) {
                metrics.watch_execution(&execution_id, compiled.clone());
            }

            // 4. Run the engine.
            let bus = match registry.resolve(EVENT_BUS) {
                Ok(bus) => bus,
                Err(e) => {
                    yield RunUpdate::ExecutionError {
                        execution_id: execution_id.clone(),
                        status: Status::Failed,
                        error: e.to_string(),
                    };
                    return;
                }
            };
            let handlers = match registry.resolve(NODE_REGISTRY) {
                Ok(handlers) => handlers,
                Err(e) => {
                    yield RunUpdate::ExecutionError {
                        execution_id: execution_id.clone(),
                        status: Status::Failed,
                        error: e.to_string(),
                    };
                    return;
                }
            };

            let short_circuit = options.is_sub_diagram || options.is_batch_item;
            let engine = ExecutionEngine::new(registry.clone(), bus, handlers);
            let engine_stream = engine.execute(compiled, execution_id.clone(), options);
            futures::pin_mut!(engine_stream);

            let mut engine_error: Option<String> = None;
            while let Some(update) = engine_stream.next().await {
                match update {
                    EngineUpdate::StepComplete {
                        step,
                        executed_nodes,
                        progress,
                        scheduler_stats,
                    } => {
                        yield RunUpdate::StepComplete {
                            step,
                            executed_nodes,
                            progress,
                            scheduler_stats,
                        };
                    }
                    EngineUpdate::ExecutionComplete { .. } => {}
                    EngineUpdate::ExecutionError { error, .. } => {
                        engine_error = Some(error);
                    }
                }
            }

            // 5. Terminal status from the canonical record.
            let state = if short_circuit {
                store.get_state(&execution_id).await.ok().flatten()
            } else {
                poll_terminal_state(&store, &execution_id).await
            };

            yield match state {
                Some(state) if state.status == Status::Completed => RunUpdate::ExecutionComplete {
                    execution_id: execution_id.clone(),
                    status: Status::Completed,
                },
                Some(state) => RunUpdate::ExecutionError {
                    execution_id: execution_id.clone(),
                    status: if state.status.is_terminal() {
                        state.status
                    } else {
                        Status::Failed
                    },
                    error: state
                        .error
                        .or(engine_error)
                        .unwrap_or_else(|| format!("execution ended with status {}", state.status)),
                },
                None => RunUpdate::ExecutionError {
                    execution_id: execution_id.clone(),
                    status: Status::Failed,
                    error: engine_error
                        .unwrap_or_else(|| "execution state not found".to_string()),
                },
            };
        })
    }

    /// Drive a run to its terminal frame and return the final state record.
    /// Used by the sub-diagram executors.
    pub async fn execute_to_completion(
        &self,
        diagram: DomainDiagram,
        options: ExecutionOptions,
        execution_id: String,
    ) -> Result<ExecutionState> {
        let store = self.registry.resolve(STATE_STORE)?;
        let mut stream = self.execute_diagram(diagram, options, execution_id.clone());
        let mut terminal_error = None;
        while let Some(update) = stream.next().await {
            if let RunUpdate::ExecutionError { error, .. } = &update {
                terminal_error = Some(error.clone());
            }
        }
        match store.get_state(&execution_id).await? {
            Some(state) => Ok(state),
            None => Err(DipeoError::Execution(terminal_error.unwrap_or_else(|| {
                format!("no state recorded for execution '{execution_id}'")
            }))),
        }
    }
}

/// The engine already drained the bus, and persistence runs at high
/// priority, so the record is normally terminal on the first read. The poll
/// is a bounded safety net for slow repositories.
async fn poll_terminal_state(
    store: &Arc<dipeo_state::CacheFirstStateStore>,
    execution_id: &str,
) -> Option<ExecutionState> {
    for _ in 0..50 {
        match store.get_state(execution_id).await.ok().flatten() {
            Some(state) if state.status.is_terminal() => return Some(state),
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    store.get_state(execution_id).await.ok().flatten()
}
