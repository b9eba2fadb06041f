// crates/elspeth-core/src/runtime/audit.rs
// ============================================================================
// Module: Audit Recorder / Payload Store traits
// Description: Backend-agnostic persistence seams the orchestrator drives.
// Purpose: Keep elspeth-core free of any concrete storage dependency; the
//          sqlite recorder and filesystem payload store live in sibling
//          crates and implement these traits.
// Dependencies: crate::core
// ============================================================================

use serde_json::Value;
use thiserror::Error;

use crate::core::CallId;
use crate::core::CallStatus;
use crate::core::Checkpoint;
use crate::core::CheckpointId;
use crate::core::Determinism;
use crate::core::Edge;
use crate::core::EdgeId;
use crate::core::EdgeMode;
use crate::core::EventId;
use crate::core::NodeId;
use crate::core::NodeState;
use crate::core::NodeStateStatus;
use crate::core::NodeType;
use crate::core::RoutingGroupId;
use crate::core::Row;
use crate::core::RowId;
use crate::core::RunId;
use crate::core::StateId;
use crate::core::Timestamp;
use crate::core::TokenId;
use crate::core::TokenOutcome;

/// Opaque recorder-backend failure. Tier-1: any error here is fatal to the
/// run, since it means the audit trail itself could not be written.
#[derive(Debug, Error)]
#[error("audit recorder error: {0}")]
pub struct RecorderError(pub String);

impl RecorderError {
    /// Wraps an arbitrary display-able backend error.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// One routing decision to be recorded as a group.
#[derive(Debug, Clone)]
pub struct RoutingEventInput {
    /// Edge the token was routed onto.
    pub edge_id: EdgeId,
    /// Ordinal within the group, starting at 0.
    pub ordinal: u32,
    /// Routing mode (mirrors the edge's default mode).
    pub mode: EdgeMode,
    /// Canonical hash of the routing reason, if supplied.
    pub reason_hash: Option<String>,
    /// Payload-store reference for the reason, if stored out of line.
    pub reason_ref: Option<String>,
}

/// An incomplete (pending) aggregation batch awaiting completion.
#[derive(Debug, Clone)]
pub struct IncompleteBatch {
    /// Node-state the batch is attached to.
    pub state_id: StateId,
    /// Aggregation node.
    pub node_id: NodeId,
    /// Tokens buffered into this batch.
    pub token_ids: Vec<TokenId>,
}

/// One run's completion state and every payload-store ref it touches,
/// used by [`crate::runtime::retention::find_expired_payload_refs`].
///
/// `refs` is the union of `row.source_data_ref`, `call.request_ref`,
/// `call.response_ref`, and `routing_event.reason_ref` across the run.
/// Recorders must join `external_calls`/`routing_events` to their owning
/// run through `node_states.run_id`, never through `nodes.node_id` alone:
/// a node id may be reused across runs, so joining through `nodes` makes
/// the join ambiguous.
#[derive(Debug, Clone)]
pub struct RunRefs {
    /// The run these refs belong to.
    pub run_id: RunId,
    /// When the run completed, if it has.
    pub completed_at: Option<Timestamp>,
    /// Every payload-store ref this run references.
    pub refs: std::collections::HashSet<String>,
}

/// The persistence seam the orchestrator drives. Implemented by the
/// sqlite-backed recorder crate; every method here corresponds to one
/// atomic audit operation.
pub trait AuditRecorder {
    /// Starts a new run, returning its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the run record cannot be written.
    fn begin_run(
        &mut self,
        canonical_version: &str,
        config_hash: &str,
        settings_json: &Value,
    ) -> Result<RunId, RecorderError>;

    /// Registers a node belonging to the current run.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the node record cannot be written.
    #[allow(clippy::too_many_arguments)]
    fn register_node(
        &mut self,
        node_id: NodeId,
        plugin_name: &str,
        node_type: NodeType,
        plugin_version: &str,
        determinism: Determinism,
        config_hash: &str,
        config_json: &Value,
    ) -> Result<(), RecorderError>;

    /// Registers an edge belonging to the current run.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the edge record cannot be written.
    fn register_edge(
        &mut self,
        edge_id: EdgeId,
        from_node_id: NodeId,
        to_node_id: NodeId,
        label: &str,
        default_mode: EdgeMode,
    ) -> Result<(), RecorderError>;

    /// Records a row produced by a source.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the row record cannot be written.
    fn create_row(
        &mut self,
        source_node_id: NodeId,
        row_index: u64,
        source_data_hash: &str,
        source_data_ref: Option<&str>,
    ) -> Result<RowId, RecorderError>;

    /// Allocates a token for a row, or a child token forked/expanded from a
    /// parent.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the token record cannot be written.
    fn create_token(
        &mut self,
        row_id: RowId,
        parent_token_id: Option<TokenId>,
        branch_name: Option<&str>,
    ) -> Result<TokenId, RecorderError>;

    /// Opens a node-state execution record.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the node-state record cannot be written.
    fn begin_node_state(
        &mut self,
        token_id: TokenId,
        node_id: NodeId,
        step_index: u32,
        attempt: u32,
        input_hash: &str,
        context_before: Option<&Value>,
    ) -> Result<StateId, RecorderError>;

    /// Resolves a node-state to a terminal or pending status.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the node-state record cannot be updated.
    #[allow(clippy::too_many_arguments)]
    fn complete_node_state(
        &mut self,
        state_id: StateId,
        status: NodeStateStatus,
        output_hash: Option<&str>,
        error: Option<&Value>,
        success_reason: Option<&Value>,
        context_after: Option<&Value>,
        duration_ms: Option<u64>,
    ) -> Result<(), RecorderError>;

    /// Records a group of routing events atomically: either every event in
    /// the group is persisted, or none are.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if any event in the group fails to write.
    fn record_routing_events(
        &mut self,
        state_id: StateId,
        group: &RoutingGroupId,
        events: &[RoutingEventInput],
    ) -> Result<Vec<EventId>, RecorderError>;

    /// Records one external side-effecting call made inside a node-state.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the call record cannot be written.
    #[allow(clippy::too_many_arguments)]
    fn record_external_call(
        &mut self,
        state_id: StateId,
        call_index: u32,
        call_type: &str,
        status: CallStatus,
        request_hash: &str,
        request_ref: Option<&str>,
        response_hash: &str,
        response_ref: Option<&str>,
        retries: u32,
    ) -> Result<CallId, RecorderError>;

    /// Lists every aggregation batch left in a pending state, for recovery.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the query fails.
    fn get_incomplete_batches(&mut self, run_id: &RunId) -> Result<Vec<IncompleteBatch>, RecorderError>;

    /// Updates a batch's node-state status directly (used by recovery).
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the update fails.
    fn update_batch_status(
        &mut self,
        state_id: StateId,
        status: NodeStateStatus,
    ) -> Result<(), RecorderError>;

    /// Re-opens a batch node-state for a fresh attempt.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the update fails.
    fn retry_batch(&mut self, state_id: StateId) -> Result<StateId, RecorderError>;

    /// Fetches a node-state record by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the query fails or the state is absent.
    fn get_node_state(&mut self, state_id: StateId) -> Result<NodeState, RecorderError>;

    /// Records the terminal (or in-flight) outcome reached by a token.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the outcome cannot be written.
    fn record_token_outcome(
        &mut self,
        token_id: TokenId,
        outcome: &TokenOutcome,
    ) -> Result<(), RecorderError>;

    /// Creates a checkpoint tied to a sink write.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the checkpoint cannot be written.
    #[allow(clippy::too_many_arguments)]
    fn create_checkpoint(
        &mut self,
        run_id: &RunId,
        token_id: TokenId,
        node_id: NodeId,
        sequence_number: u64,
        topology_hash: &str,
        config_hash: &str,
        aggregation_state_json: Option<&Value>,
    ) -> Result<CheckpointId, RecorderError>;

    /// Fetches the most recent checkpoint for a run, if any.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the query fails.
    fn latest_checkpoint(&mut self, run_id: &RunId) -> Result<Option<Checkpoint>, RecorderError>;

    /// Resolves the `row_index` of the row a token descends from. Used to
    /// translate a checkpoint's `token_id` into the `after_row_index`
    /// argument of [`Self::get_unprocessed_row_data`] on resume.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the query fails.
    fn row_index_for_token(&mut self, token_id: TokenId) -> Result<Option<u64>, RecorderError>;

    /// Marks a run as completed or failed.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the update fails.
    fn complete_run(&mut self, run_id: &RunId, status: crate::core::RunStatus) -> Result<(), RecorderError>;

    /// Reconstructs every row produced by `source_node_id`, in emission
    /// order, that has no corresponding sink checkpoint at or after
    /// `after_row_index`. Used to resume a run after a crash.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the query fails.
    fn get_unprocessed_row_data(
        &mut self,
        run_id: &RunId,
        source_node_id: NodeId,
        after_row_index: u64,
    ) -> Result<Vec<Row>, RecorderError>;

    /// Snapshots every run's completion state and referenced payload-store
    /// blobs, for retention sweeps.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the query fails.
    fn run_refs_snapshot(&mut self) -> Result<Vec<RunRefs>, RecorderError>;
}

/// Decides whether a failed run may resume against a candidate graph's
/// topology and configuration.
///
/// Resume is permitted only when the latest checkpoint's `format_version`,
/// `topology_hash`, and `config_hash` all match the candidate exactly: any
/// structural change to the graph or change to its configuration
/// invalidates resume.
pub struct CheckpointCompatibilityValidator;

impl CheckpointCompatibilityValidator {
    /// Returns the checkpoint to resume from, or `None` if the run has no
    /// checkpoint or the candidate graph/config is incompatible with the
    /// one the run was checkpointed against.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the checkpoint query fails.
    pub fn can_resume<R: AuditRecorder + ?Sized>(
        recorder: &mut R,
        run_id: &RunId,
        topology_hash: &str,
        config_hash: &str,
    ) -> Result<Option<Checkpoint>, RecorderError> {
        let Some(checkpoint) = recorder.latest_checkpoint(run_id)? else {
            return Ok(None);
        };
        if checkpoint.format_version != crate::core::CHECKPOINT_FORMAT_VERSION
            || checkpoint.topology_hash != topology_hash
            || checkpoint.config_hash != config_hash
        {
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }
}

/// Returns the highest-sequence checkpoint for `run_id`, or `None` if the
/// run has never checkpointed.
///
/// # Errors
///
/// Returns [`RecorderError`] if the query fails.
pub fn get_resume_point<R: AuditRecorder + ?Sized>(recorder: &mut R, run_id: &RunId) -> Result<Option<Checkpoint>, RecorderError> {
    recorder.latest_checkpoint(run_id)
}

/// Content-addressed payload storage for row/reason/call bodies too large
/// (or too sensitive) to inline in the audit database.
pub trait PayloadStore {
    /// Stores `bytes`, returning its content-addressed reference.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the write fails.
    fn store(&mut self, bytes: &[u8]) -> Result<String, RecorderError>;

    /// Returns whether a reference exists in the store.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the existence check fails.
    fn exists(&mut self, reference: &str) -> Result<bool, RecorderError>;

    /// Retrieves and integrity-checks the bytes for a reference.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the reference is absent or its content
    /// no longer hashes to the reference (corruption).
    fn retrieve(&mut self, reference: &str) -> Result<Vec<u8>, RecorderError>;

    /// Deletes a reference from the store, returning whether it was
    /// present.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the deletion fails.
    fn delete(&mut self, reference: &str) -> Result<bool, RecorderError>;
}
