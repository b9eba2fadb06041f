// crates/elspeth-core/src/runtime/row_processor.rs
// ============================================================================
// Module: Row Processor
// Description: Drives one token (and every descendant token it produces)
//              through the execution graph, recording a node-state per hop
//              and returning the terminal outcome(s) reached.
// Purpose: The only place that turns graph edges + plugin results into
//          audited state transitions.
// Dependencies: crate::core, crate::graph, crate::interfaces, crate::runtime
// ============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;

use serde_json::Value;

use crate::core::NodeStateStatus;
use crate::core::NodeType;
use crate::core::RoutingGroupId;
use crate::core::StateId;
use crate::core::Token;
use crate::core::TokenId;
use crate::core::TokenOutcome;
use crate::core::WorkQueueOverrunError;
use crate::core::hashing::stable_hash;
use crate::graph::ExecutionGraph;
use crate::interfaces::BatchTransform;
use crate::interfaces::Gate;
use crate::interfaces::OnError;
use crate::interfaces::RowData;
use crate::interfaces::Transform;
use crate::interfaces::TransformResult;
use crate::runtime::AggregationExecutor;
use crate::runtime::CoalesceExecutor;
use crate::runtime::CoalesceOutcome;
use crate::runtime::audit::AuditRecorder;
use crate::runtime::audit::RecorderError;
use crate::runtime::audit::RoutingEventInput;
use crate::runtime::retry::RuntimeRetryConfig;
use crate::runtime::token_manager::TokenManager;

/// Hard ceiling on work-queue hops for a single root token (including every
/// descendant fork/expansion it produces). Tripping this indicates a
/// routing cycle the graph validator missed, not a slow pipeline.
pub const MAX_WORK_QUEUE_ITERATIONS: u32 = 100_000;

/// Plugin instances keyed by node, borrowed for the duration of one
/// `process_root` call. The row processor dispatches through these; it
/// owns none of them.
pub struct NodePlugins<'a> {
    /// Single-row transforms, keyed by node.
    pub transforms: &'a mut HashMap<crate::core::NodeId, Box<dyn Transform>>,
    /// Batch-aware transforms driven by an aggregation flush, keyed by node.
    pub batch_transforms: &'a mut HashMap<crate::core::NodeId, Box<dyn BatchTransform>>,
    /// Gates, keyed by node.
    pub gates: &'a mut HashMap<crate::core::NodeId, Box<dyn Gate>>,
    /// Aggregation buffers, keyed by node.
    pub aggregations: &'a mut HashMap<crate::core::NodeId, AggregationExecutor>,
    /// Coalesce joins, keyed by node.
    pub coalesce_executors: &'a mut HashMap<crate::core::NodeId, CoalesceExecutor>,
}

/// A row that reached a sink, pending the orchestrator's batched write.
pub struct SinkArrival {
    /// Sink name the row reached.
    pub sink_name: String,
    /// Contributing token.
    pub token_id: TokenId,
    /// The row payload as it reached the sink.
    pub row: RowData,
}

/// Outcome of driving one root token through the graph: every terminal
/// outcome reached (a single token may fork, so more than one outcome can
/// result), plus every row that arrived at a sink.
#[derive(Default)]
pub struct ProcessingResult {
    /// Terminal outcome recorded for each token, in resolution order.
    pub outcomes: Vec<(TokenId, TokenOutcome)>,
    /// Rows that reached a sink, pending write.
    pub sink_arrivals: Vec<SinkArrival>,
}

struct WorkItem {
    node_id: crate::core::NodeId,
    token: Token,
    row: RowData,
    step_index: u32,
    attempt: u32,
}

/// Drives tokens through the execution graph, one work-queue item at a
/// time.
pub struct RowProcessor<'g> {
    graph: &'g ExecutionGraph,
    token_manager: TokenManager,
}

impl<'g> RowProcessor<'g> {
    /// Creates a processor bound to a validated graph.
    #[must_use]
    pub fn new(graph: &'g ExecutionGraph) -> Self {
        Self {
            graph,
            token_manager: TokenManager::new(),
        }
    }

    /// Processes one root token (and every descendant it produces) to
    /// completion.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if any audit write fails (fatal), or
    /// [`WorkQueueOverrunError`] if the iteration guard trips.
    pub fn process_root(
        &self,
        recorder: &mut dyn AuditRecorder,
        plugins: &mut NodePlugins<'_>,
        retry_config: &RuntimeRetryConfig,
        root_token: Token,
        root_row: RowData,
        entry_node: crate::core::NodeId,
    ) -> Result<ProcessingResult, ProcessingError> {
        let mut result = ProcessingResult::default();
        let mut queue: VecDeque<WorkItem> = VecDeque::new();
        let step_index = *self.graph.build_step_map().get(&entry_node).unwrap_or(&0);
        queue.push_back(WorkItem {
            node_id: entry_node,
            token: root_token,
            row: root_row,
            step_index,
            attempt: 0,
        });

        self.drain_queue(recorder, plugins, retry_config, &mut queue, &mut result)?;
        Ok(result)
    }

    /// Closes out end-of-source: flushes every aggregation node still
    /// holding a pending window, then every coalesce node still holding a
    /// pending join, and drives whatever those flushes produce the rest of
    /// the way through the graph. Aggregation flushes first, since their
    /// output may itself feed a downstream coalesce node.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if any audit write fails, or
    /// [`WorkQueueOverrunError`] if the iteration guard trips.
    pub fn flush_end_of_source(
        &self,
        recorder: &mut dyn AuditRecorder,
        plugins: &mut NodePlugins<'_>,
        retry_config: &RuntimeRetryConfig,
    ) -> Result<ProcessingResult, ProcessingError> {
        let mut result = ProcessingResult::default();
        let mut queue: VecDeque<WorkItem> = VecDeque::new();

        let pending_aggregations: Vec<_> = plugins
            .aggregations
            .iter()
            .filter(|(_, executor)| executor.has_pending())
            .map(|(node_id, _)| *node_id)
            .collect();
        for node_id in pending_aggregations {
            self.flush_aggregation(recorder, plugins, node_id, &mut queue, &mut result)?;
        }

        let pending_coalesce: Vec<_> = plugins
            .coalesce_executors
            .iter()
            .filter(|(_, executor)| executor.has_pending())
            .map(|(node_id, _)| *node_id)
            .collect();
        for node_id in pending_coalesce {
            let Some(executor) = plugins.coalesce_executors.get_mut(&node_id) else {
                continue;
            };
            let step_index = *self.graph.build_step_map().get(&node_id).unwrap_or(&0);
            for (_, outcome) in executor.flush_pending() {
                self.apply_coalesce_outcome(recorder, node_id, step_index, outcome, &mut queue, &mut result)?;
            }
        }

        self.drain_queue(recorder, plugins, retry_config, &mut queue, &mut result)?;
        Ok(result)
    }

    fn drain_queue(
        &self,
        recorder: &mut dyn AuditRecorder,
        plugins: &mut NodePlugins<'_>,
        retry_config: &RuntimeRetryConfig,
        queue: &mut VecDeque<WorkItem>,
        result: &mut ProcessingResult,
    ) -> Result<(), ProcessingError> {
        let mut iterations: u32 = 0;
        while let Some(item) = queue.pop_front() {
            iterations += 1;
            if iterations > MAX_WORK_QUEUE_ITERATIONS {
                return Err(ProcessingError::Overrun(WorkQueueOverrunError {
                    token: item.token.token_id,
                    step: item.step_index,
                }));
            }
            self.dispatch(recorder, plugins, retry_config, item, queue, result)?;
        }
        Ok(())
    }

    fn dispatch(
        &self,
        recorder: &mut dyn AuditRecorder,
        plugins: &mut NodePlugins<'_>,
        retry_config: &RuntimeRetryConfig,
        item: WorkItem,
        queue: &mut VecDeque<WorkItem>,
        result: &mut ProcessingResult,
    ) -> Result<(), ProcessingError> {
        let node = self
            .graph
            .node(item.node_id)
            .ok_or_else(|| ProcessingError::Recorder(RecorderError::new("dispatch to unknown node")))?;

        match node.node_type {
            NodeType::Sink => {
                let sink_name = self
                    .graph
                    .get_sinks()
                    .iter()
                    .find(|(_, id)| **id == item.node_id)
                    .map(|(name, _)| name.clone())
                    .unwrap_or_default();
                result.sink_arrivals.push(SinkArrival {
                    sink_name,
                    token_id: item.token.token_id,
                    row: item.row,
                });
                recorder
                    .record_token_outcome(item.token.token_id, &TokenOutcome::Completed)
                    .map_err(ProcessingError::Recorder)?;
                result
                    .outcomes
                    .push((item.token.token_id, TokenOutcome::Completed));
                Ok(())
            }
            NodeType::Transform => self.dispatch_transform(recorder, plugins, retry_config, item, queue, result),
            NodeType::Gate => self.dispatch_gate(recorder, plugins, item, queue, result),
            NodeType::Aggregation => self.dispatch_aggregation(recorder, plugins, item, queue, result),
            NodeType::Coalesce => self.dispatch_coalesce(recorder, plugins, item, queue, result),
            NodeType::Source => Err(ProcessingError::Recorder(RecorderError::new(
                "work queue must never re-enter the source node",
            ))),
        }
    }

    fn dispatch_transform(
        &self,
        recorder: &mut dyn AuditRecorder,
        plugins: &mut NodePlugins<'_>,
        retry_config: &RuntimeRetryConfig,
        item: WorkItem,
        queue: &mut VecDeque<WorkItem>,
        result: &mut ProcessingResult,
    ) -> Result<(), ProcessingError> {
        let input_hash = stable_hash(&item.row).map_err(|e| ProcessingError::Recorder(RecorderError::new(e.to_string())))?;
        let state_id = recorder
            .begin_node_state(
                item.token.token_id,
                item.node_id,
                item.step_index,
                item.attempt,
                &input_hash,
                None,
            )
            .map_err(ProcessingError::Recorder)?;

        let transform = plugins
            .transforms
            .get_mut(&item.node_id)
            .ok_or_else(|| ProcessingError::Recorder(RecorderError::new("transform plugin missing")))?;
        let outcome = transform.apply(&item.row);

        match outcome {
            TransformResult::Success { row, reason } => {
                self.complete_state_success(recorder, state_id, &row, reason.as_ref())?;
                self.advance_single(item.token, row, item.node_id, item.step_index, queue);
            }
            TransformResult::SuccessMulti { rows, reason } => {
                self.complete_state_success(
                    recorder,
                    state_id,
                    rows.first().unwrap_or(&serde_json::Map::new()),
                    reason.as_ref(),
                )?;
                for row in rows {
                    let child = self
                        .token_manager
                        .expand(recorder, &item.token)
                        .map_err(ProcessingError::Recorder)?;
                    let child_token = TokenManager::describe(
                        child,
                        item.token.row_id,
                        Some(item.token.token_id),
                        None,
                        crate::core::Timestamp::now(),
                    );
                    self.advance_single(child_token, row, item.node_id, item.step_index, queue);
                }
                recorder
                    .record_token_outcome(item.token.token_id, &TokenOutcome::Expanded)
                    .map_err(ProcessingError::Recorder)?;
                result
                    .outcomes
                    .push((item.token.token_id, TokenOutcome::Expanded));
            }
            TransformResult::Error { reason, retryable } => {
                self.handle_transform_error(
                    recorder,
                    retry_config,
                    state_id,
                    &item,
                    transform.on_error().clone(),
                    &reason,
                    retryable,
                    queue,
                    result,
                )?;
            }
            TransformResult::Pending => {
                recorder
                    .complete_node_state(state_id, NodeStateStatus::Pending, None, None, None, None, None)
                    .map_err(ProcessingError::Recorder)?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_transform_error(
        &self,
        recorder: &mut dyn AuditRecorder,
        retry_config: &RuntimeRetryConfig,
        state_id: StateId,
        item: &WorkItem,
        on_error: OnError,
        reason: &Value,
        retryable: bool,
        queue: &mut VecDeque<WorkItem>,
        result: &mut ProcessingResult,
    ) -> Result<(), ProcessingError> {
        recorder
            .complete_node_state(state_id, NodeStateStatus::Failed, None, Some(reason), None, None, None)
            .map_err(ProcessingError::Recorder)?;

        if retryable && retry_config.check_exhausted(item.token.token_id, item.attempt + 1).is_ok() {
            queue.push_back(WorkItem {
                node_id: item.node_id,
                token: item.token.clone(),
                row: item.row.clone(),
                step_index: item.step_index,
                attempt: item.attempt + 1,
            });
            return Ok(());
        }

        match on_error {
            OnError::Discard => {
                recorder
                    .record_token_outcome(item.token.token_id, &TokenOutcome::Failed)
                    .map_err(ProcessingError::Recorder)?;
                result.outcomes.push((item.token.token_id, TokenOutcome::Failed));
            }
            OnError::RouteToSink(sink_name) => {
                let outcome = TokenOutcome::Routed {
                    sink_name: sink_name.clone(),
                };
                recorder
                    .record_token_outcome(item.token.token_id, &outcome)
                    .map_err(ProcessingError::Recorder)?;
                if let Some(sink_node) = self.graph.get_sinks().get(&sink_name) {
                    let step = *self.graph.build_step_map().get(sink_node).unwrap_or(&0);
                    queue.push_back(WorkItem {
                        node_id: *sink_node,
                        token: item.token.clone(),
                        row: item.row.clone(),
                        step_index: step,
                        attempt: 0,
                    });
                } else {
                    result.outcomes.push((item.token.token_id, outcome));
                }
            }
        }
        Ok(())
    }

    fn complete_state_success(
        &self,
        recorder: &mut dyn AuditRecorder,
        state_id: StateId,
        row: &RowData,
        reason: Option<&Value>,
    ) -> Result<(), ProcessingError> {
        let output_hash = stable_hash(row).map_err(|e| ProcessingError::Recorder(RecorderError::new(e.to_string())))?;
        recorder
            .complete_node_state(
                state_id,
                NodeStateStatus::Completed,
                Some(&output_hash),
                None,
                reason,
                None,
                None,
            )
            .map_err(ProcessingError::Recorder)
    }

    fn advance_single(
        &self,
        token: Token,
        row: RowData,
        from_node: crate::core::NodeId,
        _from_step: u32,
        queue: &mut VecDeque<WorkItem>,
    ) {
        if let Some(next) = self.graph.resolve_edge(from_node, "success") {
            let step = *self.graph.build_step_map().get(&next).unwrap_or(&0);
            queue.push_back(WorkItem {
                node_id: next,
                token,
                row,
                step_index: step,
                attempt: 0,
            });
        }
    }

    fn dispatch_gate(
        &self,
        recorder: &mut dyn AuditRecorder,
        plugins: &mut NodePlugins<'_>,
        item: WorkItem,
        queue: &mut VecDeque<WorkItem>,
        result: &mut ProcessingResult,
    ) -> Result<(), ProcessingError> {
        let input_hash = stable_hash(&item.row).map_err(|e| ProcessingError::Recorder(RecorderError::new(e.to_string())))?;
        let state_id = recorder
            .begin_node_state(item.token.token_id, item.node_id, item.step_index, item.attempt, &input_hash, None)
            .map_err(ProcessingError::Recorder)?;
        let gate = plugins
            .gates
            .get_mut(&item.node_id)
            .ok_or_else(|| ProcessingError::Recorder(RecorderError::new("gate plugin missing")))?;
        let labels = gate.route(&item.row);
        let reason = gate.reason();
        self.complete_state_success(recorder, state_id, &item.row, reason.as_ref())?;

        if labels.is_empty() {
            recorder
                .record_token_outcome(item.token.token_id, &TokenOutcome::Failed)
                .map_err(ProcessingError::Recorder)?;
            result.outcomes.push((item.token.token_id, TokenOutcome::Failed));
            return Ok(());
        }

        let group = RoutingGroupId::new(format!("{}-{}", item.token.token_id, state_id));
        let mut events = Vec::new();
        for (ordinal, label) in labels.iter().enumerate() {
            if let Some(edge) = self.graph.outgoing_edges(item.node_id).find(|e| e.label == *label) {
                events.push(RoutingEventInput {
                    edge_id: edge.edge_id,
                    ordinal: ordinal as u32,
                    mode: edge.mode,
                    reason_hash: None,
                    reason_ref: None,
                });
            }
        }
        if !events.is_empty() {
            recorder
                .record_routing_events(state_id, &group, &events)
                .map_err(ProcessingError::Recorder)?;
        }

        if labels.len() == 1 {
            if let Some(next) = self.graph.resolve_edge(item.node_id, &labels[0]) {
                let step = *self.graph.build_step_map().get(&next).unwrap_or(&0);
                queue.push_back(WorkItem {
                    node_id: next,
                    token: item.token,
                    row: item.row,
                    step_index: step,
                    attempt: 0,
                });
            }
            return Ok(());
        }

        for label in &labels {
            if let Some(next) = self.graph.resolve_edge(item.node_id, label) {
                let child = self
                    .token_manager
                    .fork(recorder, &item.token, label)
                    .map_err(ProcessingError::Recorder)?;
                let child_token = TokenManager::describe(
                    child,
                    item.token.row_id,
                    Some(item.token.token_id),
                    Some(label),
                    crate::core::Timestamp::now(),
                );
                let step = *self.graph.build_step_map().get(&next).unwrap_or(&0);
                queue.push_back(WorkItem {
                    node_id: next,
                    token: child_token,
                    row: item.row.clone(),
                    step_index: step,
                    attempt: 0,
                });
            }
        }
        recorder
            .record_token_outcome(item.token.token_id, &TokenOutcome::Forked)
            .map_err(ProcessingError::Recorder)?;
        result.outcomes.push((item.token.token_id, TokenOutcome::Forked));
        Ok(())
    }

    fn dispatch_aggregation(
        &self,
        recorder: &mut dyn AuditRecorder,
        plugins: &mut NodePlugins<'_>,
        item: WorkItem,
        queue: &mut VecDeque<WorkItem>,
        result: &mut ProcessingResult,
    ) -> Result<(), ProcessingError> {
        let executor = plugins
            .aggregations
            .get_mut(&item.node_id)
            .ok_or_else(|| ProcessingError::Recorder(RecorderError::new("aggregation buffer missing")))?;
        let should_flush = executor.buffer(item.token.token_id, item.token.row_id, item.row);
        recorder
            .record_token_outcome(item.token.token_id, &TokenOutcome::Buffered)
            .map_err(ProcessingError::Recorder)?;
        result.outcomes.push((item.token.token_id, TokenOutcome::Buffered));

        if should_flush {
            self.flush_aggregation(recorder, plugins, item.node_id, queue, result)?;
        }
        Ok(())
    }

    fn flush_aggregation(
        &self,
        recorder: &mut dyn AuditRecorder,
        plugins: &mut NodePlugins<'_>,
        node_id: crate::core::NodeId,
        queue: &mut VecDeque<WorkItem>,
        result: &mut ProcessingResult,
    ) -> Result<(), ProcessingError> {
        let Some(executor) = plugins.aggregations.get_mut(&node_id) else {
            return Ok(());
        };
        let Some(transform) = plugins.batch_transforms.get_mut(&node_id) else {
            return Ok(());
        };
        let flushed = executor
            .flush(transform.as_mut())
            .map_err(|e| ProcessingError::Recorder(RecorderError::new(e.to_string())))?;
        let Some((row_id, consumed_tokens, outcome)) = flushed else {
            return Ok(());
        };
        for token_id in &consumed_tokens {
            recorder
                .record_token_outcome(*token_id, &TokenOutcome::ConsumedInBatch)
                .map_err(ProcessingError::Recorder)?;
            result
                .outcomes
                .push((*token_id, TokenOutcome::ConsumedInBatch));
        }
        let produced_rows = match outcome {
            TransformResult::SuccessMulti { rows, .. } => rows,
            TransformResult::Success { row, .. } => vec![row],
            TransformResult::Error { .. } | TransformResult::Pending => Vec::new(),
        };
        if produced_rows.is_empty() {
            return Ok(());
        }
        let parent_id = *consumed_tokens
            .first()
            .expect("a successful flush never returns an empty token set");
        let parent_view = TokenManager::describe(parent_id, row_id, None, None, crate::core::Timestamp::now());
        for row in produced_rows {
            let child = self
                .token_manager
                .expand(recorder, &parent_view)
                .map_err(ProcessingError::Recorder)?;
            let child_token =
                TokenManager::describe(child, row_id, Some(parent_id), None, crate::core::Timestamp::now());
            self.advance_single(child_token, row, node_id, 0, queue);
        }
        Ok(())
    }

    fn dispatch_coalesce(
        &self,
        recorder: &mut dyn AuditRecorder,
        plugins: &mut NodePlugins<'_>,
        item: WorkItem,
        queue: &mut VecDeque<WorkItem>,
        result: &mut ProcessingResult,
    ) -> Result<(), ProcessingError> {
        let branch_name = item.token.branch_name.clone().unwrap_or_default();
        let join_key = item.token.row_id.to_string();
        let arriving_token = item.token.token_id;
        let node_id = item.node_id;
        let step_index = item.step_index;
        let executor = plugins
            .coalesce_executors
            .get_mut(&node_id)
            .ok_or_else(|| ProcessingError::Recorder(RecorderError::new("coalesce executor missing")))?;
        let outcomes = executor.admit(&join_key, item.token.row_id, &branch_name, arriving_token, item.row);

        for (key, outcome) in outcomes {
            if key == join_key && matches!(outcome, CoalesceOutcome::Pending | CoalesceOutcome::Joined { .. }) {
                recorder
                    .record_token_outcome(arriving_token, &TokenOutcome::Coalesced)
                    .map_err(ProcessingError::Recorder)?;
                result.outcomes.push((arriving_token, TokenOutcome::Coalesced));
            }
            self.apply_coalesce_outcome(recorder, node_id, step_index, outcome, queue, result)?;
        }
        Ok(())
    }

    /// Applies one [`CoalesceOutcome`]: advances a joined row downstream
    /// through the graph, or records a failure for every token an
    /// unsatisfied or late-arriving join leaves behind. Shared between the
    /// per-arrival path and the end-of-source flush.
    fn apply_coalesce_outcome(
        &self,
        recorder: &mut dyn AuditRecorder,
        node_id: crate::core::NodeId,
        step_index: u32,
        outcome: CoalesceOutcome,
        queue: &mut VecDeque<WorkItem>,
        result: &mut ProcessingResult,
    ) -> Result<(), ProcessingError> {
        match outcome {
            CoalesceOutcome::Pending => Ok(()),
            CoalesceOutcome::Joined { row_id, row, tokens } => {
                let primary = *tokens.first().expect("a completed join always has at least one contributing token");
                let parent_view = TokenManager::describe(primary, row_id, None, None, crate::core::Timestamp::now());
                let child = self
                    .token_manager
                    .coalesce(recorder, &parent_view)
                    .map_err(ProcessingError::Recorder)?;
                let child_token = TokenManager::describe(child, row_id, Some(primary), None, crate::core::Timestamp::now());
                self.advance_single(child_token, row, node_id, step_index, queue);
                Ok(())
            }
            CoalesceOutcome::LateArrival { token_id } => {
                recorder
                    .record_token_outcome(token_id, &TokenOutcome::Failed)
                    .map_err(ProcessingError::Recorder)?;
                result.outcomes.push((token_id, TokenOutcome::Failed));
                Ok(())
            }
            CoalesceOutcome::Failed { tokens, reason: _ } => {
                for token_id in tokens {
                    recorder
                        .record_token_outcome(token_id, &TokenOutcome::Failed)
                        .map_err(ProcessingError::Recorder)?;
                    result.outcomes.push((token_id, TokenOutcome::Failed));
                }
                Ok(())
            }
        }
    }
}

/// Errors surfaced while driving a root token through the graph.
#[derive(Debug)]
pub enum ProcessingError {
    /// An audit write failed; fatal to the run.
    Recorder(RecorderError),
    /// The work-queue iteration guard tripped.
    Overrun(WorkQueueOverrunError),
}

impl std::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recorder(e) => write!(f, "{e}"),
            Self::Overrun(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProcessingError {}
