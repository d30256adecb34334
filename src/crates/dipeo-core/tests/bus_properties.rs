//! Property-style invariants over the event bus, envelopes, and the
//! compiler, matching the guarantees the engine leans on.

use dipeo_core::diagram::{DiagramCompiler, DomainDiagram, DomainEdge, DomainNode, NodeConfig};
use dipeo_core::events::{
    DomainEvent, EventBusConfig, EventHandler, EventType, HandlerPriority, InProcessEventBus,
    LogLevel,
};
use dipeo_core::{ContentType, Envelope, Result};
use proptest::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Default)]
struct SeqRecorder {
    seen: parking_lot::Mutex<Vec<(String, u64)>>,
}

#[async_trait::async_trait]
impl EventHandler for SeqRecorder {
    fn name(&self) -> &str {
        "seq_recorder"
    }

    async fn on_event(&self, event: &DomainEvent) -> Result<()> {
        self.seen
            .lock()
            .push((event.scope.execution_id.clone(), event.seq));
        Ok(())
    }
}

/// Event monotonicity: per execution, seq values are 1..n with no gaps,
/// even when publishers interleave executions from several tasks.
#[tokio::test]
async fn seq_is_gap_free_under_concurrent_publishers() {
    let bus = InProcessEventBus::new(EventBusConfig::default());
    let recorder = Arc::new(SeqRecorder::default());
    bus.subscribe(&[], recorder.clone(), HandlerPriority::Normal, None);

    let mut tasks = Vec::new();
    for exec in ["exec_x", "exec_y", "exec_z"] {
        let bus = bus.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..100 {
                bus.publish(DomainEvent::execution_log(exec, LogLevel::Info, "tick"));
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    bus.wait_for_pending_events().await;

    let seen = recorder.seen.lock().clone();
    for exec in ["exec_x", "exec_y", "exec_z"] {
        let seqs: Vec<u64> = seen
            .iter()
            .filter(|(id, _)| id == exec)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(seqs, (1..=100).collect::<Vec<u64>>(), "{exec} out of order");
        let replayed: Vec<u64> = bus.replay(exec, 0).iter().map(|e| e.seq).collect();
        assert_eq!(replayed, (1..=100).collect::<Vec<u64>>());
    }
}

/// Replay completeness: exactly the events with seq > last_seq, in order.
#[tokio::test]
async fn replay_returns_exact_suffix() {
    let bus = InProcessEventBus::new(EventBusConfig::default());
    for i in 0..12 {
        bus.publish(DomainEvent::execution_log(
            "exec_r",
            LogLevel::Info,
            format!("event {i}"),
        ));
    }
    bus.wait_for_pending_events().await;

    for last_seen in [0u64, 5, 11, 12, 20] {
        let replayed: Vec<u64> = bus.replay("exec_r", last_seen).iter().map(|e| e.seq).collect();
        let expected: Vec<u64> = (last_seen + 1..=12).collect();
        assert_eq!(replayed, expected, "from_seq={last_seen}");
    }
}

/// Priority barrier: for every event, all HIGH handlers return before any
/// NORMAL handler runs, even with a slow HIGH handler.
#[tokio::test]
async fn high_tier_completes_before_normal_tier_per_event() {
    let bus = InProcessEventBus::new(EventBusConfig::default());
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    struct Tagged {
        tag: &'static str,
        slow: bool,
        order: Arc<parking_lot::Mutex<Vec<(&'static str, u64)>>>,
    }

    #[async_trait::async_trait]
    impl EventHandler for Tagged {
        fn name(&self) -> &str {
            self.tag
        }
        async fn on_event(&self, event: &DomainEvent) -> Result<()> {
            if self.slow {
                tokio::time::sleep(std::time::Duration::from_millis(3)).await;
            }
            self.order.lock().push((self.tag, event.seq));
            Ok(())
        }
    }

    bus.subscribe(
        &[],
        Arc::new(Tagged {
            tag: "persist",
            slow: true,
            order: order.clone(),
        }),
        HandlerPriority::High,
        None,
    );
    bus.subscribe(
        &[],
        Arc::new(Tagged {
            tag: "ui",
            slow: false,
            order: order.clone(),
        }),
        HandlerPriority::Normal,
        None,
    );

    for _ in 0..10 {
        bus.publish(DomainEvent::execution_log("exec_b", LogLevel::Info, "x"));
    }
    bus.wait_for_pending_events().await;

    let order = order.lock().clone();
    for seq in 1..=10u64 {
        let persist = order
            .iter()
            .position(|&(tag, s)| tag == "persist" && s == seq)
            .unwrap();
        let ui = order
            .iter()
            .position(|&(tag, s)| tag == "ui" && s == seq)
            .unwrap();
        assert!(
            persist < ui,
            "persistence must observe seq {seq} before the UI"
        );
    }
}

/// Idempotent subscribe: the same handler instance is delivered once.
#[tokio::test]
async fn duplicate_subscription_delivers_once() {
    let bus = InProcessEventBus::new(EventBusConfig::default());
    let recorder = Arc::new(SeqRecorder::default());
    let a = bus.subscribe(&[], recorder.clone(), HandlerPriority::Normal, None);
    let b = bus.subscribe(
        &[EventType::ExecutionLog],
        recorder.clone(),
        HandlerPriority::Normal,
        None,
    );
    assert_eq!(a, b);

    bus.publish(DomainEvent::execution_log("exec_i", LogLevel::Info, "x"));
    bus.wait_for_pending_events().await;
    assert_eq!(recorder.seen.lock().len(), 1);
}

fn linear_diagram(n_extra: usize) -> DomainDiagram {
    let mut nodes = vec![DomainNode::new(
        "start",
        NodeConfig::Start {
            custom_data: BTreeMap::new(),
        },
    )];
    let mut edges = Vec::new();
    let mut previous = "start".to_string();
    for i in 0..n_extra {
        let id = format!("n{i}");
        nodes.push(DomainNode::new(
            id.clone(),
            NodeConfig::CodeJob {
                code: format!("{i} + 1"),
            },
        ));
        edges.push(DomainEdge::new(previous.clone(), id.clone()));
        previous = id;
    }
    nodes.push(DomainNode::new(
        "end",
        NodeConfig::Endpoint { save_to_file: None },
    ));
    edges.push(DomainEdge::new(previous, "end"));
    DomainDiagram {
        name: Some("generated".into()),
        nodes,
        edges,
        ..Default::default()
    }
}

proptest! {
    /// Compiler determinism: same input, byte-identical executable output.
    #[test]
    fn compile_is_deterministic(n in 0usize..12) {
        let diagram = linear_diagram(n);
        let compiler = DiagramCompiler::new();
        let a = compiler.compile(&diagram).unwrap().canonical_json().unwrap();
        let b = compiler.compile(&diagram).unwrap().canonical_json().unwrap();
        prop_assert_eq!(a, b);
    }
}

fn arbitrary_json(depth: u32) -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        "[a-z0-9 ]{0,12}".prop_map(Value::String),
    ];
    leaf.prop_recursive(depth, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(|m| {
                Value::Object(m.into_iter().collect())
            }),
        ]
    })
}

proptest! {
    /// Envelope round-trip law: object -> raw_text equals the canonical JSON
    /// encoding, and parsing it back restores the object body.
    #[test]
    fn envelope_coercion_round_trips(body in arbitrary_json(3)) {
        let envelope = Envelope::new(body.clone(), "n1", "exec_prop");
        prop_assume!(envelope.content_type == ContentType::Object);

        let text = envelope.coerce_to(ContentType::RawText).unwrap();
        let expected = serde_json::to_string(&body).unwrap();
        prop_assert_eq!(
            text.body.as_str().unwrap(),
            expected.as_str()
        );

        let back = text.coerce_to(ContentType::Object).unwrap();
        prop_assert_eq!(back.body, body);
    }
}
