// crates/elspeth-core/src/core/records.rs
// ============================================================================
// Module: Audit Records
// Description: Run, node, edge, row, token, node-state, routing, call, and
//              checkpoint record types shared between the in-memory engine
//              and the audit recorder.
// Purpose: Capture deterministic run evolution for replay and verification.
// Dependencies: crate::core::{identifiers, time, schema}, serde
// ============================================================================

//! ## Overview
//! These types are the relational shape described in §3/§6 of the
//! specification. They are plain data: the recorder persists them, the row
//! processor produces them, and neither owns behaviour the other needs.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::identifiers::CallId;
use crate::core::identifiers::CheckpointId;
use crate::core::identifiers::EdgeId;
use crate::core::identifiers::EventId;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::RoutingGroupId;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;
use crate::core::schema::CheckpointedContract;
use crate::core::time::Timestamp;

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run is actively processing rows.
    Running,
    /// Run completed successfully; no checkpoints remain.
    Completed,
    /// Run failed; checkpoints are preserved for recovery.
    Failed,
}

/// A run, the top-level unit of execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier.
    pub run_id: RunId,
    /// Canonical-version tag of the engine that executed the run.
    pub canonical_version: String,
    /// Hash of the resolved pipeline configuration.
    pub config_hash: String,
    /// Settings JSON as configured for the run.
    pub settings_json: Value,
    /// Run lifecycle status.
    pub status: RunStatus,
    /// Wall-clock time the run began.
    pub started_at: Timestamp,
    /// Wall-clock time the run completed, if it has.
    pub completed_at: Option<Timestamp>,
    /// Source row schema, if known up front.
    pub source_schema_json: Option<Value>,
    /// Source schema contract, checkpoint-serialized.
    pub schema_contract: Option<CheckpointedContract>,
}

/// Node type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Emits rows into the graph.
    Source,
    /// Transforms row data.
    Transform,
    /// Chooses a routing label; never transforms row data.
    Gate,
    /// Buffers tokens and flushes on a trigger.
    Aggregation,
    /// Joins forked branches back together.
    Coalesce,
    /// Terminal write destination.
    Sink,
}

/// Determinism classification of a node's plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Determinism {
    /// Same input always produces the same output.
    Deterministic,
    /// Output may vary across invocations with identical input.
    NonDeterministic,
    /// Performs input-side I/O.
    IoRead,
    /// Performs output-side I/O.
    IoWrite,
}

/// A node belonging to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier, unique only within `run_id`.
    pub node_id: NodeId,
    /// Owning run.
    pub run_id: RunId,
    /// Plugin name implementing this node.
    pub plugin_name: String,
    /// Node type.
    pub node_type: NodeType,
    /// Plugin version string.
    pub plugin_version: String,
    /// Determinism classification.
    pub determinism: Determinism,
    /// Hash of the plugin configuration.
    pub config_hash: String,
    /// Plugin configuration JSON.
    pub config_json: Value,
    /// Wall-clock time the node was registered.
    pub registered_at: Timestamp,
    /// Input schema contract, if declared.
    pub input_schema: Option<CheckpointedContract>,
    /// Output schema contract, if declared.
    pub output_schema: Option<CheckpointedContract>,
}

/// Routing mode of an edge: how tokens traveling it are disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMode {
    /// The token's only path; moves onward without duplication.
    Move,
    /// The token continues on this edge and on others simultaneously.
    Copy,
    /// Carries failed/quarantined data; excluded from schema validation.
    Divert,
}

/// A directed, labeled edge between two nodes in the same run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Edge identifier.
    pub edge_id: EdgeId,
    /// Owning run.
    pub run_id: RunId,
    /// Source node.
    pub from_node_id: NodeId,
    /// Destination node.
    pub to_node_id: NodeId,
    /// Label distinguishing this edge from others sharing the same
    /// `(from_node_id, to_node_id)` pair.
    pub label: String,
    /// Default routing mode.
    pub default_mode: EdgeMode,
    /// Wall-clock time the edge was registered.
    pub created_at: Timestamp,
}

/// A row produced by a source at a given index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    /// Row identifier.
    pub row_id: RowId,
    /// Owning run.
    pub run_id: RunId,
    /// Source node that produced this row.
    pub source_node_id: NodeId,
    /// 0-based index within the source's emission order.
    pub row_index: u64,
    /// Canonical content hash of the row data.
    pub source_data_hash: String,
    /// Payload-store reference, if the row body was stored out of line.
    pub source_data_ref: Option<String>,
    /// Wall-clock time the row was recorded.
    pub created_at: Timestamp,
}

/// A row instance flowing through the graph.
///
/// # Invariants
/// - `token_id` is immutable; terminal outcomes are final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Token identifier.
    pub token_id: TokenId,
    /// Row this token carries.
    pub row_id: RowId,
    /// Parent token, if this token was produced by a fork or expansion.
    pub parent_token_id: Option<TokenId>,
    /// Branch name, if this token was produced by a fork.
    pub branch_name: Option<String>,
    /// Wall-clock time the token was allocated.
    pub created_at: Timestamp,
}

/// Node-state execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStateStatus {
    /// Execution has started and has not yet resolved.
    Open,
    /// Execution completed successfully.
    Completed,
    /// Execution failed terminally.
    Failed,
    /// Execution suspended (e.g. pending async batch); not yet terminal.
    Pending,
}

/// A per-(token, node, attempt) execution record.
///
/// # Invariants
/// - An `Open` state must resolve to a terminal state before its token may
///   advance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// State identifier.
    pub state_id: StateId,
    /// Token this execution applies to.
    pub token_id: TokenId,
    /// Node executed.
    pub node_id: NodeId,
    /// Owning run. Denormalized so that retention joins never have to go
    /// through `nodes`, whose `node_id` may be reused across runs.
    pub run_id: RunId,
    /// Position in the pipeline's topological order.
    pub step_index: u32,
    /// Retry attempt number, starting at 0.
    pub attempt: u32,
    /// Execution status.
    pub status: NodeStateStatus,
    /// Canonical hash of the input data.
    pub input_hash: String,
    /// Context snapshot before execution, if captured.
    pub context_before: Option<Value>,
    /// Canonical hash of the output data, if completed.
    pub output_hash: Option<String>,
    /// Structured error, if failed.
    pub error: Option<Value>,
    /// Explainable-transform success reason, if supplied.
    pub success_reason: Option<Value>,
    /// Context snapshot after execution, if captured.
    pub context_after: Option<Value>,
    /// Execution duration in milliseconds, once resolved.
    pub duration_ms: Option<u64>,
    /// Wall-clock time execution began.
    pub started_at: Timestamp,
    /// Wall-clock time execution resolved, if it has.
    pub completed_at: Option<Timestamp>,
}

/// One emitted edge decision tied to a node-state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingEvent {
    /// Event identifier.
    pub event_id: EventId,
    /// Node-state that produced this decision.
    pub state_id: StateId,
    /// Edge the token was routed onto.
    pub edge_id: EdgeId,
    /// Group shared by every routing event emitted as one logical decision.
    pub routing_group_id: RoutingGroupId,
    /// Sequential ordinal within the group, starting at 0.
    pub ordinal: u32,
    /// Routing mode (mirrors the edge's default mode).
    pub mode: EdgeMode,
    /// Canonical hash of the routing reason, if one was supplied.
    pub reason_hash: Option<String>,
    /// Payload-store reference for the reason, if stored out of line.
    pub reason_ref: Option<String>,
    /// Wall-clock time the event was recorded.
    pub created_at: Timestamp,
}

/// External-call status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Call succeeded.
    Success,
    /// Call failed terminally.
    Failed,
    /// Call is being retried.
    Retrying,
}

/// A side-effecting invocation performed inside a node-state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalCall {
    /// Call identifier.
    pub call_id: CallId,
    /// Owning node-state.
    pub state_id: StateId,
    /// Position of this call within its node-state, starting at 0.
    pub call_index: u32,
    /// Free-form call type (e.g. `"llm"`, `"http"`).
    pub call_type: String,
    /// Call status.
    pub status: CallStatus,
    /// Canonical hash of the request.
    pub request_hash: String,
    /// Payload-store reference for the request, if stored out of line.
    pub request_ref: Option<String>,
    /// Canonical hash of the response.
    pub response_hash: String,
    /// Payload-store reference for the response, if stored out of line.
    pub response_ref: Option<String>,
    /// Number of retries performed before this record was written.
    pub retries: u32,
    /// Wall-clock time the call started.
    pub started_at: Timestamp,
    /// Wall-clock time the call resolved.
    pub completed_at: Timestamp,
}

/// A durable progress marker: "everything up to this token, through this
/// node, has been persisted."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint identifier.
    pub checkpoint_id: CheckpointId,
    /// Owning run.
    pub run_id: RunId,
    /// Token that reached a sink.
    pub token_id: TokenId,
    /// Sink node the token was written to.
    pub node_id: NodeId,
    /// Monotonically increasing sequence number, per run.
    pub sequence_number: u64,
    /// Hash of the graph's node/edge topology at checkpoint time.
    pub topology_hash: String,
    /// Hash of the run's configuration at checkpoint time.
    pub config_hash: String,
    /// Checkpoint wire-format version.
    pub format_version: u32,
    /// Aggregation buffer snapshot, if any aggregation state existed.
    pub aggregation_state_json: Option<Value>,
    /// Wall-clock time the checkpoint was created.
    pub created_at: Timestamp,
}

/// Current checkpoint wire-format version produced by this engine.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Terminal (and non-terminal, in-flight) outcomes a token may reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenOutcome {
    /// Reached a sink and was written.
    Completed,
    /// Routed via a gate or `on_error` to a named sink.
    Routed {
        /// Destination sink name.
        sink_name: String,
    },
    /// Failed terminally (discarded on error, or retries exhausted with
    /// `on_error = discard`).
    Failed,
    /// Quarantined by source-level validation.
    Quarantined,
    /// Forked into child tokens; this token itself produces no further
    /// node-states.
    Forked,
    /// Entered an aggregation buffer; no output produced yet.
    Buffered,
    /// Consumed by an aggregation flush among other tokens, producing one
    /// or more downstream tokens.
    ConsumedInBatch,
    /// Merged at a coalesce point; the merged token flows onward.
    Coalesced,
    /// Expanded into one or more child tokens by an aggregation flush.
    Expanded,
}

/// A progress event emitted periodically during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Total rows processed so far.
    pub rows_processed: u64,
    /// Rows that reached a `Completed` outcome.
    pub rows_succeeded: u64,
    /// Rows that reached a `Failed` outcome.
    pub rows_failed: u64,
    /// Rows quarantined by source-level validation.
    pub rows_quarantined: u64,
    /// Elapsed wall-clock seconds since the run began.
    pub elapsed_seconds: f64,
}
