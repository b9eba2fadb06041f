// crates/elspeth-cli/src/registry.rs
// ============================================================================
// Module: Plugin Registry
// Description: Resolves a built ExecutionGraph's declared plugin names into
//              concrete demo plugin instances.
// Purpose: The thing elspeth-config deliberately does not do: turn
//          `plugin_name` strings into trait objects.
// Dependencies: elspeth-config, elspeth-core, crate::plugins
// ============================================================================

use std::collections::HashMap;
use std::time::Duration;

use elspeth_config::CoalesceConfig;
use elspeth_config::PipelineConfig;
use elspeth_core::core::NodeId;
use elspeth_core::core::NodeType;
use elspeth_core::graph::ExecutionGraph;
use elspeth_core::interfaces::BatchTransform;
use elspeth_core::interfaces::Gate;
use elspeth_core::interfaces::Sink;
use elspeth_core::interfaces::Source;
use elspeth_core::interfaces::Transform;
use elspeth_core::runtime::AggregationExecutor;
use elspeth_core::runtime::AggregationTrigger;
use elspeth_core::runtime::CoalesceExecutor;

use crate::PluginError;
use crate::plugins::CountAggregationTransform;
use crate::plugins::FieldGate;
use crate::plugins::JsonlSink;
use crate::plugins::MemorySource;
use crate::plugins::PassthroughTransform;
use crate::plugins::UppercaseTransform;

/// Every concrete plugin instance wired for one run, indexed the way
/// [`elspeth_core::runtime::NodePlugins`] expects.
pub struct PluginSet {
    /// The run's single source.
    pub source: Box<dyn Source>,
    /// Sinks, keyed by declared name.
    pub sinks: HashMap<String, Box<dyn Sink>>,
    /// Single-row transforms, keyed by node.
    pub transforms: HashMap<NodeId, Box<dyn Transform>>,
    /// Batch transforms driven by an aggregation flush, keyed by node.
    pub batch_transforms: HashMap<NodeId, Box<dyn BatchTransform>>,
    /// Gates, keyed by node.
    pub gates: HashMap<NodeId, Box<dyn Gate>>,
    /// Aggregation buffers, keyed by node.
    pub aggregations: HashMap<NodeId, AggregationExecutor>,
    /// Coalesce joins, keyed by node.
    pub coalesce_executors: HashMap<NodeId, CoalesceExecutor>,
}

fn aggregation_trigger(config: &serde_json::Value) -> AggregationTrigger {
    if let Some(n) = config.get("count").and_then(serde_json::Value::as_u64) {
        return AggregationTrigger::Count(n as usize);
    }
    if let Some(ms) = config.get("time_ms").and_then(serde_json::Value::as_u64) {
        return AggregationTrigger::Time(Duration::from_millis(ms));
    }
    AggregationTrigger::EndOfSource
}

fn build_coalesce_executor(entry: &CoalesceConfig) -> Result<CoalesceExecutor, PluginError> {
    let policy = entry
        .policy
        .to_runtime(entry.quorum)
        .map_err(|e| PluginError::new(e.to_string()))?;
    let merge_strategy = entry.merge_strategy.into();
    let timeout = entry.timeout_seconds.map(Duration::from_secs);
    Ok(CoalesceExecutor::new(
        policy,
        merge_strategy,
        entry.branches.clone(),
        entry.select_branch.clone(),
        timeout,
    ))
}

/// Resolves every node's declared `plugin_name` into a concrete demo
/// plugin instance.
///
/// # Errors
///
/// Returns [`PluginError`] for an unrecognized `plugin_name`, malformed
/// plugin configuration, or a coalesce node with no matching
/// `[[coalesce]]` entry.
pub fn build(graph: &ExecutionGraph, config: &PipelineConfig) -> Result<PluginSet, PluginError> {
    let mut source: Option<Box<dyn Source>> = None;
    let mut sinks: HashMap<String, Box<dyn Sink>> = HashMap::new();
    let mut transforms: HashMap<NodeId, Box<dyn Transform>> = HashMap::new();
    let mut batch_transforms: HashMap<NodeId, Box<dyn BatchTransform>> = HashMap::new();
    let mut gates: HashMap<NodeId, Box<dyn Gate>> = HashMap::new();
    let mut aggregations: HashMap<NodeId, AggregationExecutor> = HashMap::new();

    let sink_names = graph.get_sinks();
    for info in graph.nodes() {
        match info.node_type {
            NodeType::Source => {
                let built: Box<dyn Source> = match info.plugin_name.as_str() {
                    "memory_source" => Box::new(MemorySource::from_config(&info.config)?),
                    other => return Err(PluginError::new(format!("unknown source plugin '{other}'"))),
                };
                source = Some(built);
            }
            NodeType::Transform => {
                let built: Box<dyn Transform> = match info.plugin_name.as_str() {
                    "passthrough" => Box::new(PassthroughTransform::from_config(&info.config)),
                    "uppercase" => Box::new(UppercaseTransform::from_config(&info.config)),
                    other => return Err(PluginError::new(format!("unknown transform plugin '{other}'"))),
                };
                transforms.insert(info.node_id, built);
            }
            NodeType::Gate => {
                let built: Box<dyn Gate> = match info.plugin_name.as_str() {
                    "field_gate" => Box::new(FieldGate::from_config(&info.config)?),
                    other => return Err(PluginError::new(format!("unknown gate plugin '{other}'"))),
                };
                gates.insert(info.node_id, built);
            }
            NodeType::Aggregation => {
                let batch: Box<dyn BatchTransform> = match info.plugin_name.as_str() {
                    "count_aggregation" => Box::new(CountAggregationTransform::from_config(&info.config)),
                    other => return Err(PluginError::new(format!("unknown aggregation plugin '{other}'"))),
                };
                batch_transforms.insert(info.node_id, batch);
                aggregations.insert(info.node_id, AggregationExecutor::new(info.node_id, aggregation_trigger(&info.config)));
            }
            NodeType::Sink => {
                let name = sink_names
                    .iter()
                    .find(|(_, id)| **id == info.node_id)
                    .map(|(name, _)| name.clone())
                    .ok_or_else(|| PluginError::new(format!("sink node {} has no declared name", info.node_id.get())))?;
                let built: Box<dyn Sink> = match info.plugin_name.as_str() {
                    "jsonl_sink" => Box::new(JsonlSink::from_config(&info.config)?),
                    other => return Err(PluginError::new(format!("unknown sink plugin '{other}'"))),
                };
                sinks.insert(name, built);
            }
            NodeType::Coalesce => {}
        }
    }

    let mut coalesce_executors: HashMap<NodeId, CoalesceExecutor> = HashMap::new();
    for entry in &config.coalesce {
        let node_id = graph
            .coalesce_node(&entry.node)
            .ok_or_else(|| PluginError::new(format!("coalesce entry '{}' has no matching node", entry.node)))?;
        coalesce_executors.insert(node_id, build_coalesce_executor(entry)?);
    }

    let source = source.ok_or_else(|| PluginError::new("graph has no source node"))?;

    Ok(PluginSet {
        source,
        sinks,
        transforms,
        batch_transforms,
        gates,
        aggregations,
        coalesce_executors,
    })
}
