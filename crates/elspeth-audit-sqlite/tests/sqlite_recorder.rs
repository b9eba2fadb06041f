// crates/elspeth-audit-sqlite/tests/sqlite_recorder.rs
// ============================================================================
// Module: SQLite Recorder Integration Tests
// Description: End-to-end exercises of SqliteAuditRecorder against a real
//              on-disk database.
// ============================================================================

#![allow(clippy::unwrap_used, clippy::expect_used, reason = "test-only assertions")]

use elspeth_audit_sqlite::SqliteAuditRecorder;
use elspeth_core::core::CallStatus;
use elspeth_core::core::Determinism;
use elspeth_core::core::EdgeMode;
use elspeth_core::core::NodeStateStatus;
use elspeth_core::core::NodeType;
use elspeth_core::core::RunStatus;
use elspeth_core::core::TokenOutcome;
use elspeth_core::runtime::AuditRecorder;
use elspeth_core::runtime::RoutingEventInput;
use serde_json::json;
use tempfile::TempDir;

fn open_recorder() -> (TempDir, SqliteAuditRecorder) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("audit.sqlite3");
    let recorder = SqliteAuditRecorder::open(&path).expect("open store");
    (dir, recorder)
}

#[test]
fn records_a_full_row_lifecycle_through_a_checkpoint() {
    let (_dir, mut recorder) = open_recorder();

    let run_id = recorder
        .begin_run("0.1.0", "cfg-hash", &json!({"rows": 1}))
        .expect("begin run");

    let source = elspeth_core::core::NodeId::from_raw(1).expect("nonzero");
    let sink = elspeth_core::core::NodeId::from_raw(2).expect("nonzero");
    let edge = elspeth_core::core::EdgeId::from_raw(1).expect("nonzero");

    recorder
        .register_node(source, "memory_source", NodeType::Source, "0.1.0", Determinism::Deterministic, "hash-a", &json!({}))
        .expect("register source");
    recorder
        .register_node(sink, "jsonl_sink", NodeType::Sink, "0.1.0", Determinism::IoWrite, "hash-b", &json!({}))
        .expect("register sink");
    recorder
        .register_edge(edge, source, sink, "main", EdgeMode::Move)
        .expect("register edge");

    let row_id = recorder
        .create_row(source, 0, "row-hash", None)
        .expect("create row");
    let token_id = recorder.create_token(row_id, None, None).expect("create token");

    let state_id = recorder
        .begin_node_state(token_id, sink, 0, 0, "row-hash", None)
        .expect("begin node state");
    recorder
        .complete_node_state(state_id, NodeStateStatus::Completed, Some("out-hash"), None, None, None, Some(2))
        .expect("complete node state");

    let group = elspeth_core::core::RoutingGroupId::new("group-1");
    let events = recorder
        .record_routing_events(
            state_id,
            &group,
            &[RoutingEventInput {
                edge_id: edge,
                ordinal: 0,
                mode: EdgeMode::Move,
                reason_hash: None,
                reason_ref: None,
            }],
        )
        .expect("record routing events");
    assert_eq!(events.len(), 1);

    recorder
        .record_token_outcome(token_id, &TokenOutcome::Completed)
        .expect("record outcome");

    let checkpoint_id = recorder
        .create_checkpoint(&run_id, token_id, sink, 1, "topo-hash", "cfg-hash", None)
        .expect("create checkpoint");
    assert_eq!(checkpoint_id.get(), 1);

    let checkpoint = recorder
        .latest_checkpoint(&run_id)
        .expect("latest checkpoint")
        .expect("a checkpoint exists");
    assert_eq!(checkpoint.sequence_number, 1);
    assert_eq!(checkpoint.token_id, token_id);

    recorder
        .complete_run(&run_id, RunStatus::Completed)
        .expect("complete run");

    let unprocessed = recorder
        .get_unprocessed_row_data(&run_id, source, 0)
        .expect("unprocessed rows");
    assert!(unprocessed.is_empty(), "row index 0 already processed");
}

#[test]
fn retry_batch_reopens_a_fresh_attempt() {
    let (_dir, mut recorder) = open_recorder();
    let run_id = recorder.begin_run("0.1.0", "cfg-hash", &json!({})).expect("begin run");

    let node = elspeth_core::core::NodeId::from_raw(1).expect("nonzero");
    recorder
        .register_node(node, "counter", NodeType::Aggregation, "0.1.0", Determinism::Deterministic, "hash", &json!({}))
        .expect("register node");

    let row_id = recorder.create_row(node, 0, "row-hash", None).expect("create row");
    let token_id = recorder.create_token(row_id, None, None).expect("create token");
    let state_id = recorder
        .begin_node_state(token_id, node, 0, 0, "row-hash", None)
        .expect("begin node state");
    recorder
        .update_batch_status(state_id, NodeStateStatus::Pending)
        .expect("mark pending");

    let incomplete = recorder.get_incomplete_batches(&run_id).expect("incomplete batches");
    assert_eq!(incomplete.len(), 1);
    assert_eq!(incomplete[0].state_id, state_id);

    let retried_id = recorder.retry_batch(state_id).expect("retry batch");
    let retried = recorder.get_node_state(retried_id).expect("fetch retried state");
    assert_eq!(retried.attempt, 1);
    assert_eq!(retried.status, NodeStateStatus::Open);
}

#[test]
fn records_an_external_call() {
    let (_dir, mut recorder) = open_recorder();
    recorder.begin_run("0.1.0", "cfg-hash", &json!({})).expect("begin run");

    let node = elspeth_core::core::NodeId::from_raw(1).expect("nonzero");
    recorder
        .register_node(node, "enrich", NodeType::Transform, "0.1.0", Determinism::NonDeterministic, "hash", &json!({}))
        .expect("register node");
    let row_id = recorder.create_row(node, 0, "row-hash", None).expect("create row");
    let token_id = recorder.create_token(row_id, None, None).expect("create token");
    let state_id = recorder
        .begin_node_state(token_id, node, 0, 0, "row-hash", None)
        .expect("begin node state");

    let call_id = recorder
        .record_external_call(state_id, 0, "http", CallStatus::Success, "req-hash", None, "resp-hash", None, 0)
        .expect("record external call");
    assert_eq!(call_id.get(), 1);
}

#[test]
fn rejects_operations_before_a_run_has_begun() {
    let (_dir, mut recorder) = open_recorder();
    let node = elspeth_core::core::NodeId::from_raw(1).expect("nonzero");
    let err = recorder.register_node(node, "x", NodeType::Transform, "0.1.0", Determinism::Deterministic, "h", &json!({}));
    assert!(err.is_err());
}

#[test]
fn reopening_an_existing_store_preserves_schema() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("audit.sqlite3");
    {
        let mut recorder = SqliteAuditRecorder::open(&path).expect("open store");
        recorder.begin_run("0.1.0", "cfg-hash", &json!({})).expect("begin run");
    }
    let _recorder = SqliteAuditRecorder::open(&path).expect("reopen store");
}

#[test]
fn completing_a_run_deletes_its_checkpoints() {
    let (_dir, mut recorder) = open_recorder();
    let run_id = recorder.begin_run("0.1.0", "cfg-hash", &json!({})).expect("begin run");

    let source = elspeth_core::core::NodeId::from_raw(1).expect("nonzero");
    let row_id = recorder.create_row(source, 0, "row-hash", None).expect("create row");
    let token_id = recorder.create_token(row_id, None, None).expect("create token");
    recorder
        .create_checkpoint(&run_id, token_id, source, 1, "topo-hash", "cfg-hash", None)
        .expect("create checkpoint");
    assert!(recorder.latest_checkpoint(&run_id).expect("query checkpoint").is_some());

    recorder.complete_run(&run_id, RunStatus::Completed).expect("complete run");
    assert!(
        recorder.latest_checkpoint(&run_id).expect("query checkpoint").is_none(),
        "a completed run retains no checkpoints to resume from"
    );
}

#[test]
fn a_failed_run_keeps_its_checkpoint_for_recovery() {
    let (_dir, mut recorder) = open_recorder();
    let run_id = recorder.begin_run("0.1.0", "cfg-hash", &json!({})).expect("begin run");

    let source = elspeth_core::core::NodeId::from_raw(1).expect("nonzero");
    let row_id = recorder.create_row(source, 0, "row-hash", None).expect("create row");
    let token_id = recorder.create_token(row_id, None, None).expect("create token");
    recorder
        .create_checkpoint(&run_id, token_id, source, 1, "topo-hash", "cfg-hash", None)
        .expect("create checkpoint");

    recorder.complete_run(&run_id, RunStatus::Failed).expect("fail run");
    assert!(recorder.latest_checkpoint(&run_id).expect("query checkpoint").is_some());
}

#[test]
fn run_refs_snapshot_joins_calls_and_events_through_node_states() {
    let (_dir, mut recorder) = open_recorder();
    let run_id = recorder.begin_run("0.1.0", "cfg-hash", &json!({})).expect("begin run");

    let node = elspeth_core::core::NodeId::from_raw(1).expect("nonzero");
    recorder
        .register_node(node, "enrich", NodeType::Transform, "0.1.0", Determinism::NonDeterministic, "hash", &json!({}))
        .expect("register node");
    let row_id = recorder
        .create_row(node, 0, "row-hash", Some("row-blob-ref"))
        .expect("create row");
    let token_id = recorder.create_token(row_id, None, None).expect("create token");
    let state_id = recorder
        .begin_node_state(token_id, node, 0, 0, "row-hash", None)
        .expect("begin node state");
    recorder
        .record_external_call(state_id, 0, "http", CallStatus::Success, "req-hash", Some("req-blob-ref"), "resp-hash", Some("resp-blob-ref"), 0)
        .expect("record external call");

    let group = elspeth_core::core::RoutingGroupId::new("group-1");
    let edge = elspeth_core::core::EdgeId::from_raw(1).expect("nonzero");
    recorder
        .record_routing_events(
            state_id,
            &group,
            &[RoutingEventInput {
                edge_id: edge,
                ordinal: 0,
                mode: EdgeMode::Move,
                reason_hash: Some("reason-hash".to_string()),
                reason_ref: Some("reason-blob-ref".to_string()),
            }],
        )
        .expect("record routing events");

    let snapshot = recorder.run_refs_snapshot().expect("snapshot");
    let run_refs = snapshot.iter().find(|r| r.run_id == run_id).expect("run present in snapshot");
    assert!(run_refs.refs.contains("row-blob-ref"));
    assert!(run_refs.refs.contains("req-blob-ref"));
    assert!(run_refs.refs.contains("resp-blob-ref"));
    assert!(run_refs.refs.contains("reason-blob-ref"));
    assert!(run_refs.completed_at.is_none(), "run is still running");
}
