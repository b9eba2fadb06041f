// crates/elspeth-core/src/runtime/memory.rs
// ============================================================================
// Module: In-Memory Audit Recorder / Payload Store
// Description: Simple in-memory implementations of AuditRecorder and
//              PayloadStore for tests and local examples.
// Purpose: Exercise the orchestrator and row processor without a SQLite
//          database or filesystem on disk.
// Dependencies: crate::core, crate::runtime::audit
// ============================================================================

//! ## Overview
//! [`InMemoryAuditRecorder`] and [`InMemoryPayloadStore`] are not intended
//! for production use: they hold every record in a `Vec` for the life of the
//! process and offer no durability. They exist so this crate's own
//! integration tests, and any downstream example, can drive a full run
//! without pulling in `elspeth-audit-sqlite` or `elspeth-payload-store`
//! (which themselves depend on this crate, making such a dependency
//! circular).

use std::collections::HashMap;

use crate::core::CallId;
use crate::core::CallStatus;
use crate::core::Checkpoint;
use crate::core::CheckpointId;
use crate::core::Determinism;
use crate::core::EdgeId;
use crate::core::EdgeMode;
use crate::core::EventId;
use crate::core::ExternalCall;
use crate::core::NodeId;
use crate::core::NodeState;
use crate::core::NodeStateStatus;
use crate::core::NodeType;
use crate::core::Row;
use crate::core::RowId;
use crate::core::RoutingGroupId;
use crate::core::records::RoutingEvent;
use crate::core::RunId;
use crate::core::RunStatus;
use crate::core::StateId;
use crate::core::Timestamp;
use crate::core::Token;
use crate::core::TokenId;
use crate::core::TokenOutcome;
use crate::core::hashing::hash_bytes;
use crate::runtime::audit::AuditRecorder;
use crate::runtime::audit::IncompleteBatch;
use crate::runtime::audit::PayloadStore;
use crate::runtime::audit::RecorderError;
use crate::runtime::audit::RoutingEventInput;

/// In-memory [`AuditRecorder`] for tests and examples. Every run's records
/// accumulate in the same recorder instance; nothing is ever evicted.
#[derive(Debug, Default)]
pub struct InMemoryAuditRecorder {
    run_counter: u64,
    current_run: Option<RunId>,
    nodes: Vec<(RunId, NodeId, String, NodeType, Determinism, serde_json::Value)>,
    edges: Vec<(RunId, EdgeId, NodeId, NodeId, String, EdgeMode)>,
    rows: Vec<Row>,
    tokens: Vec<Token>,
    node_states: Vec<NodeState>,
    routing_events: Vec<RoutingEvent>,
    external_calls: Vec<ExternalCall>,
    outcomes: HashMap<TokenId, TokenOutcome>,
    checkpoints: Vec<Checkpoint>,
    run_status: HashMap<RunId, RunStatus>,
    run_completed_at: HashMap<RunId, Timestamp>,
    next_row_id: u64,
    next_token_id: u64,
    next_state_id: u64,
    next_call_id: u64,
    next_checkpoint_id: u64,
    next_event_id: u64,
}

impl InMemoryAuditRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All checkpoints recorded so far, in creation order. Test-only
    /// accessor; the trait itself only exposes the latest one.
    #[must_use]
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// All token outcomes recorded so far.
    #[must_use]
    pub fn outcomes(&self) -> &HashMap<TokenId, TokenOutcome> {
        &self.outcomes
    }

    /// All rows recorded so far, in creation order.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Number of nodes registered across every run this recorder has seen.
    #[must_use]
    pub fn registered_node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges registered across every run this recorder has seen.
    #[must_use]
    pub fn registered_edge_count(&self) -> usize {
        self.edges.len()
    }

    /// All node-state records so far, in creation order.
    #[must_use]
    pub fn node_states(&self) -> &[NodeState] {
        &self.node_states
    }

    /// All routing events recorded so far, in creation order.
    #[must_use]
    pub fn routing_events(&self) -> &[RoutingEvent] {
        &self.routing_events
    }

    /// All external-call records so far, in creation order.
    #[must_use]
    pub fn external_calls(&self) -> &[ExternalCall] {
        &self.external_calls
    }

    /// Binds this recorder to an already-started run, for resume scenarios
    /// where `begin_run` was called on a different (or prior) recorder.
    pub fn resume(&mut self, run_id: RunId) {
        self.current_run = Some(run_id);
    }
}

impl AuditRecorder for InMemoryAuditRecorder {
    fn begin_run(
        &mut self,
        _canonical_version: &str,
        _config_hash: &str,
        _settings_json: &serde_json::Value,
    ) -> Result<RunId, RecorderError> {
        self.run_counter += 1;
        let run_id = RunId::new(format!("run-{}", self.run_counter));
        self.run_status.insert(run_id.clone(), RunStatus::Running);
        self.current_run = Some(run_id.clone());
        Ok(run_id)
    }

    fn register_node(
        &mut self,
        node_id: NodeId,
        plugin_name: &str,
        node_type: NodeType,
        _plugin_version: &str,
        determinism: Determinism,
        _config_hash: &str,
        config_json: &serde_json::Value,
    ) -> Result<(), RecorderError> {
        let run_id = self.current_run()?;
        self.nodes
            .push((run_id, node_id, plugin_name.to_string(), node_type, determinism, config_json.clone()));
        Ok(())
    }

    fn register_edge(
        &mut self,
        edge_id: EdgeId,
        from_node_id: NodeId,
        to_node_id: NodeId,
        label: &str,
        default_mode: EdgeMode,
    ) -> Result<(), RecorderError> {
        let run_id = self.current_run()?;
        self.edges
            .push((run_id, edge_id, from_node_id, to_node_id, label.to_string(), default_mode));
        Ok(())
    }

    fn create_row(
        &mut self,
        source_node_id: NodeId,
        row_index: u64,
        source_data_hash: &str,
        source_data_ref: Option<&str>,
    ) -> Result<RowId, RecorderError> {
        let run_id = self.current_run()?;
        self.next_row_id += 1;
        let row_id = RowId::from_raw(self.next_row_id).ok_or_else(|| RecorderError::new("row id overflow"))?;
        self.rows.push(Row {
            row_id,
            run_id,
            source_node_id,
            row_index,
            source_data_hash: source_data_hash.to_string(),
            source_data_ref: source_data_ref.map(str::to_string),
            created_at: Timestamp::now(),
        });
        Ok(row_id)
    }

    fn create_token(
        &mut self,
        row_id: RowId,
        parent_token_id: Option<TokenId>,
        branch_name: Option<&str>,
    ) -> Result<TokenId, RecorderError> {
        self.next_token_id += 1;
        let token_id = TokenId::from_raw(self.next_token_id).ok_or_else(|| RecorderError::new("token id overflow"))?;
        self.tokens.push(Token {
            token_id,
            row_id,
            parent_token_id,
            branch_name: branch_name.map(str::to_string),
            created_at: Timestamp::now(),
        });
        Ok(token_id)
    }

    fn begin_node_state(
        &mut self,
        token_id: TokenId,
        node_id: NodeId,
        step_index: u32,
        attempt: u32,
        input_hash: &str,
        context_before: Option<&serde_json::Value>,
    ) -> Result<StateId, RecorderError> {
        let run_id = self.current_run()?;
        self.next_state_id += 1;
        let state_id = StateId::from_raw(self.next_state_id).ok_or_else(|| RecorderError::new("state id overflow"))?;
        self.node_states.push(NodeState {
            state_id,
            token_id,
            node_id,
            run_id,
            step_index,
            attempt,
            status: NodeStateStatus::Open,
            input_hash: input_hash.to_string(),
            context_before: context_before.cloned(),
            output_hash: None,
            error: None,
            success_reason: None,
            context_after: None,
            duration_ms: None,
            started_at: Timestamp::now(),
            completed_at: None,
        });
        Ok(state_id)
    }

    fn complete_node_state(
        &mut self,
        state_id: StateId,
        status: NodeStateStatus,
        output_hash: Option<&str>,
        error: Option<&serde_json::Value>,
        success_reason: Option<&serde_json::Value>,
        context_after: Option<&serde_json::Value>,
        duration_ms: Option<u64>,
    ) -> Result<(), RecorderError> {
        let state = self
            .node_states
            .iter_mut()
            .find(|s| s.state_id == state_id)
            .ok_or_else(|| RecorderError::new("unknown state_id"))?;
        state.status = status;
        state.output_hash = output_hash.map(str::to_string);
        state.error = error.cloned();
        state.success_reason = success_reason.cloned();
        state.context_after = context_after.cloned();
        state.duration_ms = duration_ms;
        state.completed_at = Some(Timestamp::now());
        Ok(())
    }

    fn record_routing_events(
        &mut self,
        state_id: StateId,
        group: &RoutingGroupId,
        events: &[RoutingEventInput],
    ) -> Result<Vec<EventId>, RecorderError> {
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            self.next_event_id += 1;
            let event_id = EventId::from_raw(self.next_event_id).ok_or_else(|| RecorderError::new("event id overflow"))?;
            self.routing_events.push(RoutingEvent {
                event_id,
                state_id,
                edge_id: event.edge_id,
                routing_group_id: group.clone(),
                ordinal: event.ordinal,
                mode: event.mode,
                reason_hash: event.reason_hash.clone(),
                reason_ref: event.reason_ref.clone(),
                created_at: Timestamp::now(),
            });
            ids.push(event_id);
        }
        Ok(ids)
    }

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
    ) -> Result<CallId, RecorderError> {
        self.next_call_id += 1;
        let call_id = CallId::from_raw(self.next_call_id).ok_or_else(|| RecorderError::new("call id overflow"))?;
        let now = Timestamp::now();
        self.external_calls.push(ExternalCall {
            call_id,
            state_id,
            call_index,
            call_type: call_type.to_string(),
            status,
            request_hash: request_hash.to_string(),
            request_ref: request_ref.map(str::to_string),
            response_hash: response_hash.to_string(),
            response_ref: response_ref.map(str::to_string),
            retries,
            started_at: now,
            completed_at: now,
        });
        Ok(call_id)
    }

    fn get_incomplete_batches(&mut self, _run_id: &RunId) -> Result<Vec<IncompleteBatch>, RecorderError> {
        Ok(Vec::new())
    }

    fn update_batch_status(&mut self, state_id: StateId, status: NodeStateStatus) -> Result<(), RecorderError> {
        let state = self
            .node_states
            .iter_mut()
            .find(|s| s.state_id == state_id)
            .ok_or_else(|| RecorderError::new("unknown state_id"))?;
        state.status = status;
        Ok(())
    }

    fn retry_batch(&mut self, state_id: StateId) -> Result<StateId, RecorderError> {
        let state = self
            .node_states
            .iter()
            .find(|s| s.state_id == state_id)
            .ok_or_else(|| RecorderError::new("unknown state_id"))?
            .clone();
        self.begin_node_state(
            state.token_id,
            state.node_id,
            state.step_index,
            state.attempt + 1,
            &state.input_hash,
            state.context_before.as_ref(),
        )
    }

    fn get_node_state(&mut self, state_id: StateId) -> Result<NodeState, RecorderError> {
        self.node_states
            .iter()
            .find(|s| s.state_id == state_id)
            .cloned()
            .ok_or_else(|| RecorderError::new("unknown state_id"))
    }

    fn record_token_outcome(&mut self, token_id: TokenId, outcome: &TokenOutcome) -> Result<(), RecorderError> {
        self.outcomes.insert(token_id, outcome.clone());
        Ok(())
    }

    fn create_checkpoint(
        &mut self,
        run_id: &RunId,
        token_id: TokenId,
        node_id: NodeId,
        sequence_number: u64,
        topology_hash: &str,
        config_hash: &str,
        aggregation_state_json: Option<&serde_json::Value>,
    ) -> Result<CheckpointId, RecorderError> {
        self.next_checkpoint_id += 1;
        let checkpoint_id =
            CheckpointId::from_raw(self.next_checkpoint_id).ok_or_else(|| RecorderError::new("checkpoint id overflow"))?;
        self.checkpoints.push(Checkpoint {
            checkpoint_id,
            run_id: run_id.clone(),
            token_id,
            node_id,
            sequence_number,
            topology_hash: topology_hash.to_string(),
            config_hash: config_hash.to_string(),
            format_version: crate::core::CHECKPOINT_FORMAT_VERSION,
            aggregation_state_json: aggregation_state_json.cloned(),
            created_at: Timestamp::now(),
        });
        Ok(checkpoint_id)
    }

    fn latest_checkpoint(&mut self, run_id: &RunId) -> Result<Option<Checkpoint>, RecorderError> {
        Ok(self
            .checkpoints
            .iter()
            .filter(|c| &c.run_id == run_id)
            .max_by_key(|c| c.sequence_number)
            .cloned())
    }

    fn row_index_for_token(&mut self, token_id: TokenId) -> Result<Option<u64>, RecorderError> {
        let Some(token) = self.tokens.iter().find(|t| t.token_id == token_id) else {
            return Ok(None);
        };
        Ok(self.rows.iter().find(|r| r.row_id == token.row_id).map(|r| r.row_index))
    }

    fn complete_run(&mut self, run_id: &RunId, status: RunStatus) -> Result<(), RecorderError> {
        self.run_status.insert(run_id.clone(), status);
        self.run_completed_at.insert(run_id.clone(), Timestamp::now());
        if status == RunStatus::Completed {
            self.checkpoints.retain(|c| &c.run_id != run_id);
        }
        Ok(())
    }

    fn get_unprocessed_row_data(
        &mut self,
        run_id: &RunId,
        source_node_id: NodeId,
        after_row_index: u64,
    ) -> Result<Vec<Row>, RecorderError> {
        let mut rows: Vec<Row> = self
            .rows
            .iter()
            .filter(|r| &r.run_id == run_id && r.source_node_id == source_node_id && r.row_index > after_row_index)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.row_index);
        Ok(rows)
    }

    fn run_refs_snapshot(&mut self) -> Result<Vec<crate::runtime::audit::RunRefs>, RecorderError> {
        let run_ids: std::collections::HashSet<RunId> = self.run_status.keys().cloned().collect();
        let mut snapshot = Vec::with_capacity(run_ids.len());
        for run_id in run_ids {
            let mut refs = std::collections::HashSet::new();
            for row in self.rows.iter().filter(|r| r.run_id == run_id) {
                if let Some(r) = &row.source_data_ref {
                    refs.insert(r.clone());
                }
            }
            let state_ids: std::collections::HashSet<StateId> = self
                .node_states
                .iter()
                .filter(|s| s.run_id == run_id)
                .map(|s| s.state_id)
                .collect();
            for call in self.external_calls.iter().filter(|c| state_ids.contains(&c.state_id)) {
                if let Some(r) = &call.request_ref {
                    refs.insert(r.clone());
                }
                if let Some(r) = &call.response_ref {
                    refs.insert(r.clone());
                }
            }
            for event in self.routing_events.iter().filter(|e| state_ids.contains(&e.state_id)) {
                if let Some(r) = &event.reason_ref {
                    refs.insert(r.clone());
                }
            }
            snapshot.push(crate::runtime::audit::RunRefs {
                completed_at: self.run_completed_at.get(&run_id).copied(),
                run_id,
                refs,
            });
        }
        Ok(snapshot)
    }
}

impl InMemoryAuditRecorder {
    fn current_run(&self) -> Result<RunId, RecorderError> {
        self.current_run.clone().ok_or_else(|| RecorderError::new("no run in progress"))
    }
}

/// In-memory [`PayloadStore`] for tests and examples. Content-addressed by
/// the SHA-256 hex digest of the stored bytes, the same convention the
/// on-disk payload store uses.
#[derive(Debug, Default)]
pub struct InMemoryPayloadStore {
    blobs: HashMap<String, Vec<u8>>,
}

impl InMemoryPayloadStore {
    /// Creates an empty payload store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadStore for InMemoryPayloadStore {
    fn store(&mut self, bytes: &[u8]) -> Result<String, RecorderError> {
        let hash = hash_bytes(bytes);
        self.blobs.entry(hash.clone()).or_insert_with(|| bytes.to_vec());
        Ok(hash)
    }

    fn exists(&mut self, reference: &str) -> Result<bool, RecorderError> {
        Ok(self.blobs.contains_key(reference))
    }

    fn retrieve(&mut self, reference: &str) -> Result<Vec<u8>, RecorderError> {
        self.blobs
            .get(reference)
            .cloned()
            .ok_or_else(|| RecorderError::new(format!("payload '{reference}' not found")))
    }

    fn delete(&mut self, reference: &str) -> Result<bool, RecorderError> {
        Ok(self.blobs.remove(reference).is_some())
    }
}
