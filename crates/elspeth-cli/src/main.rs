// crates/elspeth-cli/src/main.rs
// ============================================================================
// Module: Elspeth CLI Entry Point
// Description: Command dispatcher for running and resuming a pipeline
//              against its demo plugin set.
// Purpose: Give the engine a runnable harness for manual testing; not a
//          product CLI.
// Dependencies: clap, elspeth-config, elspeth-core, elspeth-audit-sqlite,
//               elspeth-payload-store
// ============================================================================

//! ## Overview
//! `elspeth run` loads a [`elspeth_config::PipelineConfig`], resolves its
//! declared `plugin_name`s against the fixed demo set in [`plugins`], and
//! drives [`elspeth_core::runtime::Orchestrator::run`] to completion.
//! `elspeth resume` rebinds an existing run's recorder, reconstructs every
//! row the last checkpoint did not cover from the payload store, and
//! drives each one through [`elspeth_core::runtime::RowProcessor`]
//! directly — it never calls `Orchestrator::run`, since that would mint
//! fresh rows rather than continue existing ones.

mod plugins;
mod registry;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;
use elspeth_audit_sqlite::SqliteAuditRecorder;
use elspeth_core::core::ProgressEvent;
use elspeth_core::core::RunId;
use elspeth_core::core::Timestamp;
use elspeth_core::interfaces::Sink;
use elspeth_core::runtime::AuditRecorder;
use elspeth_core::runtime::NodePlugins;
use elspeth_core::runtime::Orchestrator;
use elspeth_core::runtime::PayloadStore;
use elspeth_core::runtime::RetryPolicyInput;
use elspeth_core::runtime::RowProcessor;
use elspeth_core::runtime::RuntimeRetryConfig;
use elspeth_core::runtime::TokenManager;
use elspeth_payload_store::FilePayloadStore;
use thiserror::Error;

/// Opaque plugin-resolution failure: unknown plugin name, malformed
/// per-node configuration, or an unresolvable coalesce reference.
#[derive(Debug, Error)]
#[error("plugin error: {0}")]
pub struct PluginError(String);

impl PluginError {
    /// Wraps an arbitrary message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Every way running or resuming a pipeline can fail.
#[derive(Debug, Error)]
enum CliError {
    /// Configuration could not be loaded or validated.
    #[error(transparent)]
    Config(#[from] elspeth_config::ConfigError),
    /// A plugin could not be resolved or constructed.
    #[error(transparent)]
    Plugin(#[from] PluginError),
    /// The audit store could not be opened.
    #[error(transparent)]
    Store(#[from] elspeth_audit_sqlite::SqliteStoreError),
    /// An audit write failed.
    #[error(transparent)]
    Recorder(#[from] elspeth_core::runtime::RecorderError),
    /// The run itself failed.
    #[error(transparent)]
    Orchestrator(#[from] elspeth_core::runtime::OrchestratorError),
    /// A resumed row failed while being driven through the graph.
    #[error(transparent)]
    Processing(#[from] elspeth_core::runtime::ProcessingError),
    /// The requested run id is unknown to the audit store.
    #[error("run '{0}' has no recorded checkpoint or rows to resume from")]
    UnknownRun(String),
    /// A resumed row's body could not be decoded.
    #[error("row {0} payload is not a valid JSON object: {1}")]
    CorruptRow(u64, serde_json::Error),
    /// A resumed row had no payload-store reference to reconstruct from.
    #[error("row {0} has no stored payload reference; cannot resume")]
    MissingPayloadRef(u64),
}

#[derive(Parser, Debug)]
#[command(name = "elspeth", disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs a pipeline from its configuration to completion.
    Run(RunCommand),
    /// Resumes an interrupted run from its last checkpoint.
    Resume(ResumeCommand),
}

#[derive(clap::Args, Debug)]
struct RunCommand {
    /// Path to the pipeline's TOML configuration.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Path to the SQLite audit database (created if absent).
    #[arg(long, value_name = "PATH", default_value = "elspeth-audit.db")]
    db: PathBuf,
    /// Directory root for the content-addressed payload store.
    #[arg(long, value_name = "DIR", default_value = "elspeth-payloads")]
    payload_dir: PathBuf,
}

#[derive(clap::Args, Debug)]
struct ResumeCommand {
    /// Run identifier to resume, as printed by a prior `run`.
    #[arg(long, value_name = "RUN_ID")]
    run_id: String,
    /// Path to the pipeline's TOML configuration (must match the original run).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Path to the SQLite audit database used by the original run.
    #[arg(long, value_name = "PATH", default_value = "elspeth-audit.db")]
    db: PathBuf,
    /// Directory root for the content-addressed payload store.
    #[arg(long, value_name = "DIR", default_value = "elspeth-payloads")]
    payload_dir: PathBuf,
}

fn print_progress(event: ProgressEvent) {
    println!(
        "progress: processed={} succeeded={} failed={} quarantined={} elapsed={:.1}s",
        event.rows_processed, event.rows_succeeded, event.rows_failed, event.rows_quarantined, event.elapsed_seconds
    );
}

fn retry_config(config: &elspeth_config::PipelineConfig) -> RuntimeRetryConfig {
    let input = config
        .retry
        .map(elspeth_config::RetryConfig::to_policy_input)
        .unwrap_or(RetryPolicyInput {
            max_retries: None,
            base_delay_ms: None,
            max_delay_ms: None,
            jitter: None,
        });
    RuntimeRetryConfig::from_policy(input)
}

fn run_pipeline(command: RunCommand) -> Result<(), CliError> {
    let (config, config_hash) = elspeth_config::load(command.config.as_deref())?;
    let graph = config.build_graph()?;

    let mut recorder = SqliteAuditRecorder::open(&command.db)?;
    let mut payload_store = FilePayloadStore::open(&command.payload_dir)?;

    let settings = serde_json::json!({ "run_name": config.run.name });
    let run_id = recorder.begin_run(env!("CARGO_PKG_VERSION"), &config_hash, &settings)?;

    let orchestrator = Orchestrator::new(&graph, config_hash);
    orchestrator.register_graph(&mut recorder)?;

    let mut plugin_set = registry::build(&graph, &config)?;
    let mut node_plugins = NodePlugins {
        transforms: &mut plugin_set.transforms,
        batch_transforms: &mut plugin_set.batch_transforms,
        gates: &mut plugin_set.gates,
        aggregations: &mut plugin_set.aggregations,
        coalesce_executors: &mut plugin_set.coalesce_executors,
    };
    let retry = retry_config(&config);

    let outcome = orchestrator.run(
        &mut recorder,
        &mut payload_store,
        plugin_set.source.as_mut(),
        &mut plugin_set.sinks,
        &mut node_plugins,
        &retry,
        &run_id,
        print_progress,
    )?;

    println!(
        "run {} finished: status={:?} processed={} succeeded={} failed={} quarantined={}",
        outcome.run_id, outcome.status, outcome.rows_processed, outcome.rows_succeeded, outcome.rows_failed, outcome.rows_quarantined
    );
    Ok(())
}

fn resume_pipeline(command: ResumeCommand) -> Result<(), CliError> {
    let (config, config_hash) = elspeth_config::load(command.config.as_deref())?;
    let graph = config.build_graph()?;
    let source_node = graph.get_source();
    let entry_node = graph.get_pipeline_node_sequence().first().copied().unwrap_or(source_node);

    let mut recorder = SqliteAuditRecorder::open(&command.db)?;
    let mut payload_store = FilePayloadStore::open(&command.payload_dir)?;
    let run_id = RunId::from(command.run_id.as_str());
    recorder.resume(run_id.clone());

    let after_row_index = match recorder.latest_checkpoint(&run_id)? {
        Some(checkpoint) => recorder.row_index_for_token(checkpoint.token_id)?.unwrap_or(0),
        None => 0,
    };

    let unprocessed = recorder.get_unprocessed_row_data(&run_id, source_node, after_row_index)?;
    if unprocessed.is_empty() {
        return Err(CliError::UnknownRun(command.run_id));
    }

    let mut plugin_set = registry::build(&graph, &config)?;
    let retry = retry_config(&config);
    let processor = RowProcessor::new(&graph);
    let token_manager = TokenManager::new();
    let topology_hash = graph.topology_hash().map_err(|e| elspeth_core::runtime::RecorderError::new(e.to_string()))?;
    let sink_nodes = graph.get_sinks();

    let mut rows_resumed = 0u64;
    for row in unprocessed {
        let row_ref = row.source_data_ref.clone().ok_or_else(|| CliError::MissingPayloadRef(row.row_index))?;
        let bytes = payload_store.retrieve(&row_ref)?;
        let row_data: elspeth_core::interfaces::RowData =
            serde_json::from_slice(&bytes).map_err(|e| CliError::CorruptRow(row.row_index, e))?;

        let token_id = token_manager.allocate(&mut recorder, row.row_id)?;
        let token = TokenManager::describe(token_id, row.row_id, None, None, Timestamp::now());

        let mut node_plugins = NodePlugins {
            transforms: &mut plugin_set.transforms,
            batch_transforms: &mut plugin_set.batch_transforms,
            gates: &mut plugin_set.gates,
            aggregations: &mut plugin_set.aggregations,
            coalesce_executors: &mut plugin_set.coalesce_executors,
        };
        let result = processor.process_root(&mut recorder, &mut node_plugins, &retry, token, row_data, entry_node)?;

        for arrival in result.sink_arrivals {
            let sink = plugin_set
                .sinks
                .get_mut(&arrival.sink_name)
                .ok_or_else(|| PluginError::new(format!("unknown sink '{}'", arrival.sink_name)))?;
            sink.write(&[arrival.row]).map_err(elspeth_core::runtime::OrchestratorError::Sink)?;

            let sink_node = sink_nodes.get(&arrival.sink_name).copied().unwrap_or(source_node);
            recorder.create_checkpoint(&run_id, arrival.token_id, sink_node, row.row_index + 1, &topology_hash, &config_hash, None)?;
        }
        rows_resumed += 1;
    }

    let mut node_plugins = NodePlugins {
        transforms: &mut plugin_set.transforms,
        batch_transforms: &mut plugin_set.batch_transforms,
        gates: &mut plugin_set.gates,
        aggregations: &mut plugin_set.aggregations,
        coalesce_executors: &mut plugin_set.coalesce_executors,
    };
    let eos_result = processor.flush_end_of_source(&mut recorder, &mut node_plugins, &retry)?;
    drop(node_plugins);

    for arrival in eos_result.sink_arrivals {
        let sink = plugin_set
            .sinks
            .get_mut(&arrival.sink_name)
            .ok_or_else(|| PluginError::new(format!("unknown sink '{}'", arrival.sink_name)))?;
        sink.write(&[arrival.row]).map_err(elspeth_core::runtime::OrchestratorError::Sink)?;

        let sink_node = sink_nodes.get(&arrival.sink_name).copied().unwrap_or(source_node);
        recorder.create_checkpoint(&run_id, arrival.token_id, sink_node, after_row_index + rows_resumed + 1, &topology_hash, &config_hash, None)?;
    }

    println!("resumed run {run_id}: replayed {rows_resumed} unprocessed row(s)");
    Ok(())
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(command) => run_pipeline(command),
        Commands::Resume(command) => resume_pipeline(command),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
