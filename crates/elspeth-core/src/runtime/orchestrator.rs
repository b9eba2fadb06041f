// crates/elspeth-core/src/runtime/orchestrator.rs
// ============================================================================
// Module: Orchestrator
// Description: Owns the run lifecycle: registers the graph, streams rows
//              from the source, drives each row through the Row Processor,
//              batches sink writes, and checkpoints after each batch.
// Purpose: The single place that ties graph + plugins + recorder together
//          into a runnable pipeline.
// Dependencies: crate::core, crate::graph, crate::interfaces, crate::runtime
// ============================================================================

use std::collections::HashMap;

use crate::core::NodeId;
use crate::core::ProgressEvent;
use crate::core::RunId;
use crate::core::RunStatus;
use crate::core::TokenId;
use crate::core::TokenOutcome;
use crate::core::Violation;
use crate::core::hashing::canonical_json_bytes;
use crate::core::hashing::hash_bytes;
use crate::core::hashing::stable_hash;
use crate::graph::ExecutionGraph;
use crate::interfaces::RowData;
use crate::interfaces::Sink;
use crate::interfaces::Source;
use crate::interfaces::SourceError;
use crate::runtime::audit::AuditRecorder;
use crate::runtime::audit::PayloadStore;
use crate::runtime::audit::RecorderError;
use crate::runtime::retry::RuntimeRetryConfig;
use crate::runtime::row_processor::NodePlugins;
use crate::runtime::row_processor::ProcessingError;
use crate::runtime::row_processor::RowProcessor;
use crate::runtime::token_manager::TokenManager;

/// Emit a progress event, checkpoint, and flush sink buffers every this many
/// rows read from the source.
pub const PROGRESS_INTERVAL: u64 = 100;

/// Errors surfaced from a run.
#[derive(Debug)]
pub enum OrchestratorError {
    /// An audit write failed; fatal to the run.
    Recorder(RecorderError),
    /// The source failed to produce a row.
    Source(SourceError),
    /// A sink failed to write a batch.
    Sink(String),
    /// The row processor's work-queue guard tripped.
    Processing(ProcessingError),
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recorder(e) => write!(f, "{e}"),
            Self::Source(e) => write!(f, "{e}"),
            Self::Sink(e) => write!(f, "sink write failed: {e}"),
            Self::Processing(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<ProcessingError> for OrchestratorError {
    fn from(value: ProcessingError) -> Self {
        Self::Processing(value)
    }
}

/// Final summary of a completed (or failed) run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The run identifier.
    pub run_id: RunId,
    /// Final run status.
    pub status: RunStatus,
    /// Total rows read from the source.
    pub rows_processed: u64,
    /// Rows that reached a `Completed` outcome.
    pub rows_succeeded: u64,
    /// Rows that reached a `Failed` outcome.
    pub rows_failed: u64,
    /// Rows quarantined at source validation.
    pub rows_quarantined: u64,
}

/// Drives a full run: registration, row streaming, processing, sink
/// batching, and checkpointing.
pub struct Orchestrator<'g> {
    graph: &'g ExecutionGraph,
    config_hash: String,
}

impl<'g> Orchestrator<'g> {
    /// Binds an orchestrator to an already-validated graph and the
    /// canonical hash of the configuration that built it.
    #[must_use]
    pub fn new(graph: &'g ExecutionGraph, config_hash: impl Into<String>) -> Self {
        Self {
            graph,
            config_hash: config_hash.into(),
        }
    }

    /// Registers every node and edge in the graph with the recorder. Must
    /// be called once at the start of a fresh run (not on resume, where
    /// the graph was already registered by the original run).
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if any registration write fails.
    pub fn register_graph(&self, recorder: &mut dyn AuditRecorder) -> Result<(), RecorderError> {
        for node in self.graph.nodes() {
            let config_hash = stable_hash(&node.config).map_err(|e| RecorderError::new(e.to_string()))?;
            recorder.register_node(
                node.node_id,
                &node.plugin_name,
                node.node_type,
                "0.1.0",
                node.determinism,
                &config_hash,
                &node.config,
            )?;
        }
        for edge in self.graph.edges() {
            recorder.register_edge(edge.edge_id, edge.from, edge.to, &edge.label, edge.mode)?;
        }
        Ok(())
    }

    /// Runs the pipeline to completion (or until the source or a sink
    /// errors fatally).
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] on any fatal recorder, source, sink,
    /// or work-queue failure. A run that fails this way is left with
    /// `status = Failed` and its checkpoints intact for resume.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        recorder: &mut dyn AuditRecorder,
        payload_store: &mut dyn PayloadStore,
        source: &mut dyn Source,
        sinks: &mut HashMap<String, Box<dyn Sink>>,
        plugins: &mut NodePlugins<'_>,
        retry_config: &RuntimeRetryConfig,
        run_id: &RunId,
        mut on_progress: impl FnMut(ProgressEvent),
    ) -> Result<RunOutcome, OrchestratorError> {
        source.on_start().map_err(OrchestratorError::Source)?;
        for sink in sinks.values_mut() {
            sink.on_start();
        }

        let processor = RowProcessor::new(self.graph);
        let token_manager = TokenManager::new();
        let source_node = self.graph.get_source();
        let entry_node = self
            .graph
            .get_pipeline_node_sequence()
            .first()
            .copied()
            .unwrap_or(source_node);

        let mut sink_buffers: HashMap<String, Vec<(TokenId, RowData)>> = HashMap::new();
        let mut rows_processed: u64 = 0;
        let mut rows_succeeded: u64 = 0;
        let mut rows_failed: u64 = 0;
        let mut rows_quarantined: u64 = 0;
        let mut sequence_number: u64 = 0;
        let started = std::time::Instant::now();
        let mut row_index: u64 = 0;

        let run_result = (|| -> Result<(), OrchestratorError> {
            while let Some(source_row) = source.next_row().map_err(OrchestratorError::Source)? {
                rows_processed += 1;
                if !source_row.violations.is_empty() {
                    self.quarantine_row(recorder, payload_store, source_node, row_index, &source_row.row)?;
                    rows_quarantined += 1;
                    row_index += 1;
                    self.maybe_progress(
                        rows_processed,
                        rows_succeeded,
                        rows_failed,
                        rows_quarantined,
                        started,
                        &mut on_progress,
                    );
                    continue;
                }

                let input_bytes = canonical_json_bytes(&source_row.row)
                    .map_err(|e| OrchestratorError::Recorder(RecorderError::new(e.to_string())))?;
                let input_hash = hash_bytes(&input_bytes);
                let row_ref = payload_store
                    .store(&input_bytes)
                    .map_err(OrchestratorError::Recorder)?;
                let row_id = recorder
                    .create_row(source_node, row_index, &input_hash, Some(&row_ref))
                    .map_err(OrchestratorError::Recorder)?;
                let token_id = token_manager
                    .allocate(recorder, row_id)
                    .map_err(OrchestratorError::Recorder)?;
                let token = TokenManager::describe(token_id, row_id, None, None, crate::core::Timestamp::now());

                let result = processor.process_root(
                    recorder,
                    plugins,
                    retry_config,
                    token,
                    source_row.row,
                    entry_node,
                )?;

                for (_, outcome) in &result.outcomes {
                    match outcome {
                        TokenOutcome::Completed => rows_succeeded += 1,
                        TokenOutcome::Failed => rows_failed += 1,
                        _ => {}
                    }
                }
                for arrival in result.sink_arrivals {
                    sink_buffers
                        .entry(arrival.sink_name)
                        .or_default()
                        .push((arrival.token_id, arrival.row));
                }

                row_index += 1;
                if rows_processed % PROGRESS_INTERVAL == 0 {
                    self.flush_sinks(recorder, sinks, &mut sink_buffers, run_id, &mut sequence_number)?;
                }
                self.maybe_progress(
                    rows_processed,
                    rows_succeeded,
                    rows_failed,
                    rows_quarantined,
                    started,
                    &mut on_progress,
                );
            }

            let eos_result = processor.flush_end_of_source(recorder, plugins, retry_config)?;
            for (_, outcome) in &eos_result.outcomes {
                match outcome {
                    TokenOutcome::Completed => rows_succeeded += 1,
                    TokenOutcome::Failed => rows_failed += 1,
                    _ => {}
                }
            }
            for arrival in eos_result.sink_arrivals {
                sink_buffers
                    .entry(arrival.sink_name)
                    .or_default()
                    .push((arrival.token_id, arrival.row));
            }

            self.flush_sinks(recorder, sinks, &mut sink_buffers, run_id, &mut sequence_number)?;
            Ok(())
        })();

        source.on_complete().ok();
        source.close();
        for sink in sinks.values_mut() {
            sink.on_complete();
            sink.close();
        }

        let status = if run_result.is_ok() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        recorder
            .complete_run(run_id, status)
            .map_err(OrchestratorError::Recorder)?;

        run_result?;

        Ok(RunOutcome {
            run_id: run_id.clone(),
            status,
            rows_processed,
            rows_succeeded,
            rows_failed,
            rows_quarantined,
        })
    }

    fn quarantine_row(
        &self,
        recorder: &mut dyn AuditRecorder,
        payload_store: &mut dyn PayloadStore,
        source_node: NodeId,
        row_index: u64,
        row: &RowData,
    ) -> Result<(), OrchestratorError> {
        let bytes = canonical_json_bytes(row).map_err(|e| OrchestratorError::Recorder(RecorderError::new(e.to_string())))?;
        let hash = hash_bytes(&bytes);
        let row_ref = payload_store.store(&bytes).map_err(OrchestratorError::Recorder)?;
        let row_id = recorder
            .create_row(source_node, row_index, &hash, Some(&row_ref))
            .map_err(OrchestratorError::Recorder)?;
        let token_id = recorder
            .create_token(row_id, None, None)
            .map_err(OrchestratorError::Recorder)?;
        recorder
            .record_token_outcome(token_id, &TokenOutcome::Quarantined)
            .map_err(OrchestratorError::Recorder)
    }

    fn flush_sinks(
        &self,
        recorder: &mut dyn AuditRecorder,
        sinks: &mut HashMap<String, Box<dyn Sink>>,
        sink_buffers: &mut HashMap<String, Vec<(TokenId, RowData)>>,
        run_id: &RunId,
        sequence_number: &mut u64,
    ) -> Result<(), OrchestratorError> {
        let topology_hash = self
            .graph
            .topology_hash()
            .map_err(|e| OrchestratorError::Recorder(RecorderError::new(e.to_string())))?;
        let sink_nodes = self.graph.get_sinks();

        for (sink_name, buffered) in sink_buffers.iter_mut() {
            if buffered.is_empty() {
                continue;
            }
            let sink = sinks
                .get_mut(sink_name)
                .ok_or_else(|| OrchestratorError::Sink(format!("unknown sink '{sink_name}'")))?;
            let rows: Vec<RowData> = buffered.iter().map(|(_, row)| row.clone()).collect();
            sink.write(&rows).map_err(OrchestratorError::Sink)?;

            let last_token = buffered.last().map(|(token_id, _)| *token_id);
            let sink_node = sink_nodes.get(sink_name).copied().unwrap_or_else(|| self.graph.get_source());
            if let Some(token_id) = last_token {
                *sequence_number += 1;
                recorder
                    .create_checkpoint(
                        run_id,
                        token_id,
                        sink_node,
                        *sequence_number,
                        &topology_hash,
                        &self.config_hash,
                        None,
                    )
                    .map_err(OrchestratorError::Recorder)?;
            }
            buffered.clear();
        }
        Ok(())
    }

    fn maybe_progress(
        &self,
        rows_processed: u64,
        rows_succeeded: u64,
        rows_failed: u64,
        rows_quarantined: u64,
        started: std::time::Instant,
        on_progress: &mut impl FnMut(ProgressEvent),
    ) {
        if rows_processed % PROGRESS_INTERVAL != 0 {
            return;
        }
        on_progress(ProgressEvent {
            rows_processed,
            rows_succeeded,
            rows_failed,
            rows_quarantined,
            elapsed_seconds: started.elapsed().as_secs_f64(),
        });
    }
}

/// Classifies whether source-level violations should quarantine a row.
#[must_use]
pub fn should_quarantine(violations: &[Violation]) -> bool {
    !violations.is_empty()
}
