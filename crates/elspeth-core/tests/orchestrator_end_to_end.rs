// crates/elspeth-core/tests/orchestrator_end_to_end.rs
// ============================================================================
// Module: Orchestrator End-to-End Tests
// Description: Drives a small source -> transform -> sink pipeline through
//              Orchestrator::run against the in-memory audit fixtures.
// Purpose: Exercise registration, row streaming, checkpointing, and sink
//          batching together, not each in isolation.
// ============================================================================

//! ## Overview
//! Builds a three-node graph (source, uppercasing transform, sink) and runs
//! it to completion, then asserts on both the returned [`RunOutcome`] and the
//! audit trail the in-memory recorder accumulated.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::collections::HashMap;

use elspeth_core::core::Determinism;
use elspeth_core::core::EdgeId;
use elspeth_core::core::EdgeMode;
use elspeth_core::core::NodeId;
use elspeth_core::core::NodeType;
use elspeth_core::core::RunStatus;
use elspeth_core::graph::GraphBuilder;
use elspeth_core::graph::NodeInfo;
use elspeth_core::interfaces::OnError;
use elspeth_core::interfaces::RowData;
use elspeth_core::interfaces::Sink;
use elspeth_core::interfaces::Source;
use elspeth_core::interfaces::SourceError;
use elspeth_core::interfaces::SourceRow;
use elspeth_core::interfaces::Transform;
use elspeth_core::interfaces::TransformResult;
use elspeth_core::runtime::InMemoryAuditRecorder;
use elspeth_core::runtime::InMemoryPayloadStore;
use elspeth_core::runtime::NodePlugins;
use elspeth_core::runtime::Orchestrator;
use elspeth_core::runtime::RuntimeRetryConfig;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;

// ============================================================================
// SECTION: Test Helpers
// ============================================================================

fn node(id: u64, node_type: NodeType, plugin_name: &str) -> NodeInfo {
    NodeInfo {
        node_id: NodeId::from_raw(id).expect("non-zero"),
        node_type,
        plugin_name: plugin_name.to_string(),
        determinism: Determinism::Deterministic,
        config: json!({}),
        input_schema: None,
        output_schema: None,
    }
}

struct VecSource {
    rows: std::vec::IntoIter<RowData>,
}

impl VecSource {
    fn new(rows: Vec<RowData>) -> Self {
        Self { rows: rows.into_iter() }
    }
}

impl Source for VecSource {
    fn schema(&self) -> Option<&elspeth_core::core::SchemaContract> {
        None
    }

    fn next_row(&mut self) -> Result<Option<SourceRow>, SourceError> {
        Ok(self.rows.next().map(|row| SourceRow { row, violations: Vec::new() }))
    }
}

struct UppercaseTransform {
    on_error: OnError,
}

impl Transform for UppercaseTransform {
    fn apply(&mut self, row: &RowData) -> TransformResult {
        let Some(Value::String(name)) = row.get("name") else {
            return TransformResult::Error {
                reason: json!({"error": "missing name"}),
                retryable: false,
            };
        };
        let mut out = row.clone();
        out.insert("name".to_string(), Value::String(name.to_uppercase()));
        TransformResult::Success { row: out, reason: None }
    }

    fn on_error(&self) -> &OnError {
        &self.on_error
    }
}

#[derive(Default)]
struct CollectingSink {
    written: Vec<RowData>,
}

impl Sink for CollectingSink {
    fn schema(&self) -> Option<&elspeth_core::core::SchemaContract> {
        None
    }

    fn write(&mut self, rows: &[RowData]) -> Result<(), String> {
        self.written.extend_from_slice(rows);
        Ok(())
    }
}

fn row(name: &str) -> RowData {
    let mut map = Map::new();
    map.insert("name".to_string(), Value::String(name.to_string()));
    map
}

fn build_linear_graph() -> (elspeth_core::graph::ExecutionGraph, NodeId, NodeId, NodeId) {
    let mut builder = GraphBuilder::new();
    let source_id = NodeId::from_raw(1).expect("non-zero");
    let transform_id = NodeId::from_raw(2).expect("non-zero");
    let sink_id = NodeId::from_raw(3).expect("non-zero");
    builder.set_source(node(1, NodeType::Source, "vec_source"));
    builder.add_transform(0, node(2, NodeType::Transform, "uppercase"));
    builder.add_sink("out", node(3, NodeType::Sink, "collecting"));
    builder.add_edge(EdgeId::from_raw(1).expect("non-zero"), source_id, transform_id, "default", EdgeMode::Move);
    builder.add_edge(EdgeId::from_raw(2).expect("non-zero"), transform_id, sink_id, "success", EdgeMode::Move);
    let graph = builder.build().expect("graph builds");
    (graph, source_id, transform_id, sink_id)
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[test]
fn full_run_processes_every_row_to_the_sink() {
    let (graph, _source_id, transform_id, _sink_id) = build_linear_graph();

    let mut recorder = InMemoryAuditRecorder::new();
    let mut payload_store = InMemoryPayloadStore::default();
    let settings = json!({});
    let run_id = recorder
        .begin_run("0.1.0", "config-hash", &settings)
        .expect("begin run");

    let orchestrator = Orchestrator::new(&graph, "config-hash");
    orchestrator.register_graph(&mut recorder).expect("register graph");

    let mut transforms: HashMap<NodeId, Box<dyn Transform>> = HashMap::new();
    transforms.insert(
        transform_id,
        Box::new(UppercaseTransform { on_error: OnError::Discard }),
    );
    let mut batch_transforms = HashMap::new();
    let mut gates = HashMap::new();
    let mut aggregations = HashMap::new();
    let mut coalesce_executors = HashMap::new();
    let mut node_plugins = NodePlugins {
        transforms: &mut transforms,
        batch_transforms: &mut batch_transforms,
        gates: &mut gates,
        aggregations: &mut aggregations,
        coalesce_executors: &mut coalesce_executors,
    };

    let mut source = VecSource::new(vec![row("ada"), row("grace"), row("alan")]);
    let mut sinks: HashMap<String, Box<dyn Sink>> = HashMap::new();
    sinks.insert("out".to_string(), Box::new(CollectingSink::default()));
    let retry = RuntimeRetryConfig::default();

    let outcome = orchestrator
        .run(
            &mut recorder,
            &mut payload_store,
            &mut source,
            &mut sinks,
            &mut node_plugins,
            &retry,
            &run_id,
            |_event| {},
        )
        .expect("run succeeds");

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.rows_processed, 3);
    assert_eq!(outcome.rows_succeeded, 3);
    assert_eq!(outcome.rows_failed, 0);
    assert_eq!(outcome.rows_quarantined, 0);

    let sink = sinks.get("out").expect("sink present");
    // Downcast isn't available on `dyn Sink`; inspect what the recorder saw instead.
    assert_eq!(recorder.rows().len(), 3);
    assert_eq!(recorder.checkpoints().len(), 1);
    let _ = sink;
}

#[test]
fn rows_failing_the_transform_are_discarded_not_sunk() {
    let (graph, _source_id, transform_id, _sink_id) = build_linear_graph();

    let mut recorder = InMemoryAuditRecorder::new();
    let mut payload_store = InMemoryPayloadStore::default();
    let run_id = recorder
        .begin_run("0.1.0", "config-hash", &json!({}))
        .expect("begin run");

    let orchestrator = Orchestrator::new(&graph, "config-hash");
    orchestrator.register_graph(&mut recorder).expect("register graph");

    let mut transforms: HashMap<NodeId, Box<dyn Transform>> = HashMap::new();
    transforms.insert(
        transform_id,
        Box::new(UppercaseTransform { on_error: OnError::Discard }),
    );
    let mut batch_transforms = HashMap::new();
    let mut gates = HashMap::new();
    let mut aggregations = HashMap::new();
    let mut coalesce_executors = HashMap::new();
    let mut node_plugins = NodePlugins {
        transforms: &mut transforms,
        batch_transforms: &mut batch_transforms,
        gates: &mut gates,
        aggregations: &mut aggregations,
        coalesce_executors: &mut coalesce_executors,
    };

    let mut source = VecSource::new(vec![row("ada"), Map::new()]);
    let mut sinks: HashMap<String, Box<dyn Sink>> = HashMap::new();
    sinks.insert("out".to_string(), Box::new(CollectingSink::default()));
    let retry = RuntimeRetryConfig::default();

    let outcome = orchestrator
        .run(
            &mut recorder,
            &mut payload_store,
            &mut source,
            &mut sinks,
            &mut node_plugins,
            &retry,
            &run_id,
            |_event| {},
        )
        .expect("run succeeds");

    assert_eq!(outcome.rows_processed, 2);
    assert_eq!(outcome.rows_succeeded, 1);
    assert_eq!(outcome.rows_failed, 1);
}
