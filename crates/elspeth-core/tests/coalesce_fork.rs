// crates/elspeth-core/tests/coalesce_fork.rs
// ============================================================================
// Module: Gate Fork / Coalesce Join Tests
// Description: Drives a token through a gate that forks onto two branches,
//              each transformed independently, then rejoined at a coalesce
//              node before reaching a sink.
// Purpose: Exercise RouteResolution::Fork and CoalesceExecutor together
//          through the Row Processor, not just their own unit tests.
// ============================================================================

//! ## Overview
//! A fork produces one child token per branch; a `RequireAll` coalesce with
//! `Union` merge only releases a row once both children have arrived, and
//! the merged row carries fields from both branches.

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
use elspeth_core::core::TokenOutcome;
use elspeth_core::graph::CoalesceMergeStrategy;
use elspeth_core::graph::GraphBuilder;
use elspeth_core::graph::NodeInfo;
use elspeth_core::graph::RouteResolution;
use elspeth_core::interfaces::Gate;
use elspeth_core::interfaces::OnError;
use elspeth_core::interfaces::RowData;
use elspeth_core::interfaces::Transform;
use elspeth_core::interfaces::TransformResult;
use elspeth_core::runtime::AuditRecorder;
use elspeth_core::runtime::CoalesceExecutor;
use elspeth_core::runtime::CoalescePolicy;
use elspeth_core::runtime::InMemoryAuditRecorder;
use elspeth_core::runtime::NodePlugins;
use elspeth_core::runtime::RowProcessor;
use elspeth_core::runtime::RuntimeRetryConfig;
use elspeth_core::runtime::TokenManager;
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

struct ForkEverything;

impl Gate for ForkEverything {
    fn route(&mut self, _row: &RowData) -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }
}

struct MarkBranch {
    field: &'static str,
}

impl Transform for MarkBranch {
    fn apply(&mut self, row: &RowData) -> TransformResult {
        let mut out = row.clone();
        out.insert(self.field.to_string(), Value::Bool(true));
        TransformResult::Success { row: out, reason: None }
    }

    fn on_error(&self) -> &OnError {
        &OnError::Discard
    }
}

fn row(name: &str) -> RowData {
    let mut map = Map::new();
    map.insert("name".to_string(), Value::String(name.to_string()));
    map
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[test]
fn fork_then_require_all_coalesce_merges_both_branches() {
    let mut builder = GraphBuilder::new();
    let source_id = NodeId::from_raw(1).expect("non-zero");
    let gate_id = NodeId::from_raw(2).expect("non-zero");
    let branch_a_id = NodeId::from_raw(3).expect("non-zero");
    let branch_b_id = NodeId::from_raw(4).expect("non-zero");
    let coalesce_id = NodeId::from_raw(5).expect("non-zero");
    let sink_id = NodeId::from_raw(6).expect("non-zero");

    builder.set_source(node(1, NodeType::Source, "vec_source"));
    builder.add_gate("split", node(2, NodeType::Gate, "fork_everything"));
    builder.add_transform(0, node(3, NodeType::Transform, "mark_a"));
    builder.add_transform(1, node(4, NodeType::Transform, "mark_b"));
    builder.add_coalesce(
        "join",
        node(5, NodeType::Coalesce, "join"),
        ["a".to_string(), "b".to_string()],
    );
    builder.add_sink("out", node(6, NodeType::Sink, "collecting"));

    builder.add_edge(EdgeId::from_raw(1).expect("non-zero"), source_id, gate_id, "default", EdgeMode::Move);
    builder.add_edge(EdgeId::from_raw(2).expect("non-zero"), gate_id, branch_a_id, "a", EdgeMode::Move);
    builder.add_edge(EdgeId::from_raw(3).expect("non-zero"), gate_id, branch_b_id, "b", EdgeMode::Move);
    builder.add_edge(EdgeId::from_raw(4).expect("non-zero"), branch_a_id, coalesce_id, "success", EdgeMode::Move);
    builder.add_edge(EdgeId::from_raw(5).expect("non-zero"), branch_b_id, coalesce_id, "success", EdgeMode::Move);
    builder.add_edge(EdgeId::from_raw(6).expect("non-zero"), coalesce_id, sink_id, "success", EdgeMode::Move);
    builder.set_route_resolution(gate_id, "a", RouteResolution::Fork);
    builder.set_route_resolution(gate_id, "b", RouteResolution::Fork);
    builder.set_branch_gate("a", gate_id);
    builder.set_branch_gate("b", gate_id);

    let graph = builder.build().expect("graph builds");
    let entry_node = graph.get_pipeline_node_sequence().first().copied().expect("has pipeline nodes");
    assert_eq!(entry_node, gate_id);

    let mut recorder = InMemoryAuditRecorder::new();
    recorder.begin_run("0.1.0", "config-hash", &json!({})).expect("begin run");

    let mut transforms: HashMap<NodeId, Box<dyn Transform>> = HashMap::new();
    transforms.insert(branch_a_id, Box::new(MarkBranch { field: "seen_a" }));
    transforms.insert(branch_b_id, Box::new(MarkBranch { field: "seen_b" }));
    let mut batch_transforms = HashMap::new();
    let mut gates: HashMap<NodeId, Box<dyn Gate>> = HashMap::new();
    gates.insert(gate_id, Box::new(ForkEverything));
    let mut aggregations = HashMap::new();
    let mut coalesce_executors = HashMap::new();
    coalesce_executors.insert(
        coalesce_id,
        CoalesceExecutor::new(
            CoalescePolicy::RequireAll,
            CoalesceMergeStrategy::Union,
            vec!["a".to_string(), "b".to_string()],
            None,
            None,
        ),
    );
    let mut node_plugins = NodePlugins {
        transforms: &mut transforms,
        batch_transforms: &mut batch_transforms,
        gates: &mut gates,
        aggregations: &mut aggregations,
        coalesce_executors: &mut coalesce_executors,
    };

    let row_id = recorder.create_row(source_id, 0, "hash", None).expect("create row");
    let token_manager = TokenManager::new();
    let token_id = token_manager.allocate(&mut recorder, row_id).expect("allocate token");
    let token = TokenManager::describe(token_id, row_id, None, None, elspeth_core::core::Timestamp::now());

    let processor = RowProcessor::new(&graph);
    let retry = RuntimeRetryConfig::default();
    let result = processor
        .process_root(&mut recorder, &mut node_plugins, &retry, token, row("ada"), entry_node)
        .expect("process root");

    assert_eq!(result.sink_arrivals.len(), 1, "both branches must merge into a single sink arrival");
    let merged = &result.sink_arrivals[0].row;
    assert_eq!(merged.get("name"), Some(&Value::String("ada".to_string())));
    assert_eq!(merged.get("seen_a"), Some(&Value::Bool(true)));
    assert_eq!(merged.get("seen_b"), Some(&Value::Bool(true)));

    let forked = result.outcomes.iter().filter(|(_, o)| matches!(o, TokenOutcome::Forked)).count();
    let coalesced = result.outcomes.iter().filter(|(_, o)| matches!(o, TokenOutcome::Coalesced)).count();
    assert_eq!(forked, 1);
    assert_eq!(coalesced, 2);
}
