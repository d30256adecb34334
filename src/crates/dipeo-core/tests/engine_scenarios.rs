//! End-to-end execution scenarios driven through the use case.

use dipeo_core::config::{new_execution_id, EnvSettings};
use dipeo_core::diagram::{
    DomainDiagram, DomainEdge, DomainNode, NodeConfig, OutputMode, PersonDef,
};
use dipeo_core::events::{EventType, SubDiagramFilter};
use dipeo_core::{
    abort_pair, wire_container, Container, ExecuteDiagramUseCase, ExecutionOptions, RunUpdate,
    Status,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn container() -> Container {
    let repo = Arc::new(dipeo_state::InMemoryStateRepository::new());
    let settings = EnvSettings {
        features: vec!["llm".into()],
        ..Default::default()
    };
    wire_container(repo, &settings, ".")
}

fn start(id: &str) -> DomainNode {
    DomainNode::new(
        id,
        NodeConfig::Start {
            custom_data: BTreeMap::new(),
        },
    )
}

fn code(id: &str, code: &str) -> DomainNode {
    DomainNode::new(id, NodeConfig::CodeJob { code: code.into() })
}

fn endpoint(id: &str) -> DomainNode {
    DomainNode::new(id, NodeConfig::Endpoint { save_to_file: None })
}

async fn run_to_end(
    container: &Container,
    diagram: DomainDiagram,
    options: ExecutionOptions,
) -> (String, Vec<RunUpdate>) {
    let execution_id = new_execution_id();
    let use_case = ExecuteDiagramUseCase::new(container.registry.clone()).unwrap();
    let mut stream = use_case.execute_diagram(diagram, options, execution_id.clone());
    let mut updates = Vec::new();
    while let Some(update) = stream.next().await {
        updates.push(update);
    }
    (execution_id, updates)
}

fn terminal(updates: &[RunUpdate]) -> &RunUpdate {
    updates.last().expect("stream yields a terminal frame")
}

/// Seed 1: `start -> code_job(x + 1) -> endpoint` with `{x: 1}`.
#[tokio::test]
async fn linear_diagram_completes_with_expected_output() {
    let container = container();
    let diagram = DomainDiagram {
        name: Some("linear".into()),
        nodes: vec![start("start"), code("work", "return x + 1"), endpoint("end")],
        edges: vec![
            DomainEdge::new("start", "work"),
            DomainEdge::new("work", "end"),
        ],
        ..Default::default()
    };

    let options = ExecutionOptions::new().with_variable("x", json!(1));
    let (execution_id, updates) = run_to_end(&container, diagram, options).await;

    assert!(matches!(
        terminal(&updates),
        RunUpdate::ExecutionComplete {
            status: Status::Completed,
            ..
        }
    ));

    let state = container
        .store
        .get_state(&execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, Status::Completed);
    assert_eq!(state.node_outputs["end"].body, json!(2));
    assert_eq!(
        state.executed_nodes,
        vec!["start".to_string(), "work".to_string(), "end".to_string()]
    );

    // A single linear run emits at least started + node lifecycle + completed.
    let events = container.bus.replay(&execution_id, 0);
    assert!(events.len() >= 4);
    assert_eq!(events[0].event_type, EventType::ExecutionStarted);
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::ExecutionCompleted));
}

/// Seed 2: the untaken conditional branch never starts.
#[tokio::test]
async fn conditional_takes_false_branch_only() {
    let container = container();
    let diagram = DomainDiagram {
        name: Some("conditional".into()),
        nodes: vec![
            start("start"),
            DomainNode::new(
                "condition",
                NodeConfig::Condition {
                    expression: "x > 0".into(),
                },
            ),
            code("a", "return 1"),
            code("b", "return 2"),
            endpoint("end"),
        ],
        edges: vec![
            DomainEdge::new("start", "condition"),
            DomainEdge::new("condition", "a").with_label("true"),
            DomainEdge::new("condition", "b").with_label("false"),
            DomainEdge::new("a", "end"),
            DomainEdge::new("b", "end"),
        ],
        ..Default::default()
    };

    let options = ExecutionOptions::new().with_variable("x", json!(-1));
    let (execution_id, updates) = run_to_end(&container, diagram, options).await;

    assert!(matches!(
        terminal(&updates),
        RunUpdate::ExecutionComplete { .. }
    ));
    let state = container
        .store
        .get_state(&execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        state.executed_nodes,
        vec![
            "start".to_string(),
            "condition".to_string(),
            "b".to_string(),
            "end".to_string()
        ]
    );
    assert!(!state.node_outputs.contains_key("a"));
    assert_eq!(state.node_outputs["end"].body, json!(2));
}

/// Seed 3: self-loop with an iteration cap fires exactly N times.
#[tokio::test]
async fn loop_with_iteration_cap_fires_exactly_n_times() {
    let container = container();
    let mut persons = BTreeMap::new();
    persons.insert(
        "Writer".to_string(),
        PersonDef {
            service: "echo".into(),
            model: "echo-1".into(),
            api_key_id: None,
        },
    );
    let diagram = DomainDiagram {
        name: Some("loop".into()),
        nodes: vec![
            start("start"),
            DomainNode::new(
                "writer",
                NodeConfig::PersonJob {
                    person: Some("Writer".into()),
                    prompt: "round".into(),
                    first_only_prompt: None,
                    max_iteration: Some(3),
                    resolved_person: None,
                },
            ),
            endpoint("end"),
        ],
        edges: vec![
            DomainEdge::new("start", "writer"),
            DomainEdge::new("writer", "writer"),
            DomainEdge::new("writer", "end"),
        ],
        persons,
        ..Default::default()
    };

    let (execution_id, updates) = run_to_end(&container, diagram, ExecutionOptions::new()).await;

    assert!(matches!(
        terminal(&updates),
        RunUpdate::ExecutionComplete {
            status: Status::Completed,
            ..
        }
    ));

    let starts = container
        .bus
        .replay(&execution_id, 0)
        .iter()
        .filter(|e| {
            e.event_type == EventType::NodeStarted
                && e.scope.node_id.as_deref() == Some("writer")
        })
        .count();
    assert_eq!(starts, 3);

    let state = container
        .store
        .get_state(&execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.exec_counts["writer"], 3);
    assert_eq!(state.status, Status::Completed);
}

/// Seed 4: batch sub-diagram squares its items in parallel.
#[tokio::test]
async fn batch_sub_diagram_maps_items_in_order() {
    let container = container();

    let child = DomainDiagram {
        name: Some("square".into()),
        nodes: vec![
            start("start"),
            code("square", "return default * default"),
            endpoint("end"),
        ],
        edges: vec![
            DomainEdge::new("start", "square"),
            DomainEdge::new("square", "end"),
        ],
        ..Default::default()
    };

    let parent = DomainDiagram {
        name: Some("batch-parent".into()),
        nodes: vec![
            start("start"),
            DomainNode::new(
                "fanout",
                NodeConfig::SubDiagram {
                    diagram_name: None,
                    diagram_data: Some(Box::new(child)),
                    batch: true,
                    batch_input_key: "items".into(),
                    batch_parallel: true,
                    max_concurrent: None,
                    output_mode: OutputMode::PureList,
                    result_key: "results".into(),
                },
            ),
            endpoint("end"),
        ],
        edges: vec![
            DomainEdge::new("start", "fanout"),
            DomainEdge::new("fanout", "end"),
        ],
        ..Default::default()
    };

    // A parent-scoped observer: child node chatter must not reach it, child
    // terminal status must.
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    struct Recorder(Arc<parking_lot::Mutex<Vec<(EventType, String)>>>);
    #[async_trait::async_trait]
    impl dipeo_core::EventHandler for Recorder {
        async fn on_event(&self, event: &dipeo_core::DomainEvent) -> dipeo_core::Result<()> {
            self.0
                .lock()
                .push((event.event_type, event.scope.execution_id.clone()));
            Ok(())
        }
    }

    let execution_id = new_execution_id();
    container.bus.subscribe(
        &[],
        Arc::new(Recorder(seen.clone())),
        dipeo_core::HandlerPriority::Normal,
        Some(Arc::new(SubDiagramFilter::new(execution_id.clone()))),
    );

    let options = ExecutionOptions::new().with_variable("items", json!([1, 2, 3]));
    let use_case = ExecuteDiagramUseCase::new(container.registry.clone()).unwrap();
    let mut stream = use_case.execute_diagram(parent, options, execution_id.clone());
    let mut last = None;
    while let Some(update) = stream.next().await {
        last = Some(update);
    }
    assert!(matches!(
        last,
        Some(RunUpdate::ExecutionComplete {
            status: Status::Completed,
            ..
        })
    ));

    let state = container
        .store
        .get_state(&execution_id)
        .await
        .unwrap()
        .unwrap();
    let fanout = &state.node_outputs["fanout"];
    assert_eq!(fanout.body, json!([1, 4, 9]));
    assert_eq!(fanout.meta["successful"], json!(3));
    assert_eq!(fanout.meta["failed"], json!(0));
    assert_eq!(state.node_outputs["end"].body, json!([1, 4, 9]));

    let observed = seen.lock().clone();
    // No child node-level events leaked through the parent-scoped filter...
    assert!(observed.iter().all(|(event_type, exec)| {
        exec == &execution_id
            || matches!(
                event_type,
                EventType::ExecutionStarted
                    | EventType::ExecutionCompleted
                    | EventType::ExecutionError
            )
    }));
    // ...but each child's terminal status did.
    let child_terminals = observed
        .iter()
        .filter(|(event_type, exec)| {
            exec != &execution_id && *event_type == EventType::ExecutionCompleted
        })
        .count();
    assert_eq!(child_terminals, 3);
}

/// Empty batch: empty result set, successful=0, failed=0.
#[tokio::test]
async fn batch_of_size_zero_yields_empty_result() {
    let container = container();
    let child = DomainDiagram {
        name: Some("noop".into()),
        nodes: vec![start("start"), endpoint("end")],
        edges: vec![DomainEdge::new("start", "end")],
        ..Default::default()
    };
    let parent = DomainDiagram {
        name: Some("batch-empty".into()),
        nodes: vec![
            start("start"),
            DomainNode::new(
                "fanout",
                NodeConfig::SubDiagram {
                    diagram_name: None,
                    diagram_data: Some(Box::new(child)),
                    batch: true,
                    batch_input_key: "items".into(),
                    batch_parallel: true,
                    max_concurrent: None,
                    output_mode: OutputMode::RichObject,
                    result_key: "results".into(),
                },
            ),
            endpoint("end"),
        ],
        edges: vec![
            DomainEdge::new("start", "fanout"),
            DomainEdge::new("fanout", "end"),
        ],
        ..Default::default()
    };

    let options = ExecutionOptions::new().with_variable("items", json!([]));
    let (execution_id, updates) = run_to_end(&container, parent, options).await;
    assert!(matches!(
        terminal(&updates),
        RunUpdate::ExecutionComplete { .. }
    ));

    let state = container
        .store
        .get_state(&execution_id)
        .await
        .unwrap()
        .unwrap();
    let body = &state.node_outputs["fanout"].body;
    assert_eq!(body["total_items"], json!(0));
    assert_eq!(body["successful"], json!(0));
    assert_eq!(body["failed"], json!(0));
    assert_eq!(body["results"], json!([]));
}

/// Batch parity with partial failures: errors map index-for-index.
#[tokio::test]
async fn batch_partial_failures_keep_sibling_results() {
    let container = container();
    // Child divides 10 by its input; item 0 divides by zero and fails.
    let child = DomainDiagram {
        name: Some("divide".into()),
        nodes: vec![
            start("start"),
            code("div", "return 10 / default"),
            endpoint("end"),
        ],
        edges: vec![
            DomainEdge::new("start", "div"),
            DomainEdge::new("div", "end"),
        ],
        ..Default::default()
    };
    let parent = DomainDiagram {
        name: Some("batch-partial".into()),
        nodes: vec![
            start("start"),
            DomainNode::new(
                "fanout",
                NodeConfig::SubDiagram {
                    diagram_name: None,
                    diagram_data: Some(Box::new(child)),
                    batch: true,
                    batch_input_key: "items".into(),
                    batch_parallel: false,
                    max_concurrent: None,
                    output_mode: OutputMode::RichObject,
                    result_key: "results".into(),
                },
            ),
            endpoint("end"),
        ],
        edges: vec![
            DomainEdge::new("start", "fanout"),
            DomainEdge::new("fanout", "end"),
        ],
        ..Default::default()
    };

    let options = ExecutionOptions::new().with_variable("items", json!([0, 5, 2]));
    let (execution_id, updates) = run_to_end(&container, parent, options).await;
    assert!(matches!(
        terminal(&updates),
        RunUpdate::ExecutionComplete { .. }
    ));

    let state = container
        .store
        .get_state(&execution_id)
        .await
        .unwrap()
        .unwrap();
    let body = &state.node_outputs["fanout"].body;
    assert_eq!(body["total_items"], json!(3));
    assert_eq!(body["successful"], json!(2));
    assert_eq!(body["failed"], json!(1));
    assert_eq!(body["results"], json!([2, 5]));
    let errors = body["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["index"], json!(0));
    assert_eq!(errors[0]["item"], json!(0));
}

/// Seed 5: execution deadline expires while a handler hangs.
#[tokio::test]
async fn timeout_yields_execution_error_and_drained_bus() {
    let container = container();

    // Override the code_job handler with one that sleeps forever.
    struct SleepyHandler;
    #[async_trait::async_trait]
    impl dipeo_core::NodeHandler for SleepyHandler {
        fn node_type(&self) -> dipeo_core::NodeType {
            dipeo_core::NodeType::CodeJob
        }
        async fn handle(
            &self,
            request: dipeo_core::HandlerRequest<'_>,
        ) -> dipeo_core::Result<dipeo_state::Envelope> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(request.envelope(Value::Null))
        }
    }
    let handlers = container
        .registry
        .resolve(dipeo_core::services::NODE_REGISTRY)
        .unwrap();
    handlers.register(Arc::new(SleepyHandler));

    let diagram = DomainDiagram {
        name: Some("slow".into()),
        nodes: vec![start("start"), code("hang", "1"), endpoint("end")],
        edges: vec![
            DomainEdge::new("start", "hang"),
            DomainEdge::new("hang", "end"),
        ],
        ..Default::default()
    };

    let options = ExecutionOptions::new().with_timeout(Duration::from_secs(1));
    let (execution_id, updates) = run_to_end(&container, diagram, options).await;

    let RunUpdate::ExecutionError { status, .. } = terminal(&updates) else {
        panic!("expected execution_error terminal frame");
    };
    assert_eq!(*status, Status::Failed);

    let events = container.bus.replay(&execution_id, 0);
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::ExecutionError));
    assert!(!events
        .iter()
        .any(|e| e.event_type == EventType::ExecutionCompleted));

    let state = container
        .store
        .get_state(&execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, Status::Failed);
}

/// Cancelling before the run starts: aborted terminal, no node_started.
#[tokio::test]
async fn cancel_at_zero_aborts_without_starting_nodes() {
    let container = container();
    let diagram = DomainDiagram {
        name: Some("never".into()),
        nodes: vec![start("start"), endpoint("end")],
        edges: vec![DomainEdge::new("start", "end")],
        ..Default::default()
    };

    let (handle, signal) = abort_pair();
    handle.abort();
    let options = ExecutionOptions::new().with_abort(signal);
    let (execution_id, updates) = run_to_end(&container, diagram, options).await;

    let RunUpdate::ExecutionError { status, .. } = terminal(&updates) else {
        panic!("expected execution_error terminal frame");
    };
    assert_eq!(*status, Status::Aborted);

    let events = container.bus.replay(&execution_id, 0);
    let errors = events
        .iter()
        .filter(|e| e.event_type == EventType::ExecutionError)
        .count();
    assert_eq!(errors, 1);
    assert!(!events
        .iter()
        .any(|e| e.event_type == EventType::NodeStarted));
}

/// Failed node with no alternate path fails the execution.
#[tokio::test]
async fn required_node_failure_fails_execution() {
    let container = container();
    let diagram = DomainDiagram {
        name: Some("failing".into()),
        nodes: vec![start("start"), code("bad", "return 1 / 0"), endpoint("end")],
        edges: vec![
            DomainEdge::new("start", "bad"),
            DomainEdge::new("bad", "end"),
        ],
        ..Default::default()
    };

    let (execution_id, updates) = run_to_end(&container, diagram, ExecutionOptions::new()).await;
    let RunUpdate::ExecutionError { status, error, .. } = terminal(&updates) else {
        panic!("expected execution_error terminal frame");
    };
    assert_eq!(*status, Status::Failed);
    assert!(error.contains("bad"));

    let state = container
        .store
        .get_state(&execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, Status::Failed);
    assert_eq!(
        state.node_states["bad"].status,
        dipeo_core::NodeStatus::Failed
    );
}

/// Metrics land in the persisted record after completion.
#[tokio::test]
async fn metrics_are_collected_into_state_metadata() {
    let container = container();
    let diagram = DomainDiagram {
        name: Some("metered".into()),
        nodes: vec![start("start"), code("work", "return 2 * 2"), endpoint("end")],
        edges: vec![
            DomainEdge::new("start", "work"),
            DomainEdge::new("work", "end"),
        ],
        ..Default::default()
    };

    let (execution_id, _) = run_to_end(&container, diagram, ExecutionOptions::new()).await;
    container.bus.wait_for_pending_events().await;
    // The metrics_collected event is published by a normal-priority observer
    // after the terminal event; give its persistence hop a moment.
    tokio::time::sleep(Duration::from_millis(50)).await;
    container.bus.wait_for_pending_events().await;

    let state = container
        .store
        .get_state(&execution_id)
        .await
        .unwrap()
        .unwrap();
    let metrics = state
        .metadata
        .get("metrics")
        .expect("metrics metadata recorded");
    assert_eq!(metrics["execution_id"], json!(execution_id));
    let path: Vec<&str> = metrics["critical_path"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert_eq!(path, vec!["start", "work", "end"]);
}
