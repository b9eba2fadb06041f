// crates/elspeth-config/src/config.rs
// ============================================================================
// Module: Pipeline Configuration
// Description: TOML deserialization, validation, and graph construction for
//              a declarative pipeline topology.
// Purpose: Fail-closed configuration parsing with hard size/path limits,
//          mirroring the way configuration is loaded elsewhere in this
//          codebase.
// Dependencies: elspeth-core, serde, toml
// ============================================================================

//! ## Overview
//! A [`PipelineConfig`] is pure data: node and edge declarations, retry and
//! checkpoint policy, coalesce join settings, retention policy. Unknown
//! fields in any section are a hard deserialization error. [`load`]
//! resolves a config path, enforces a size ceiling, and validates the
//! parsed structure before returning it. [`PipelineConfig::build_graph`]
//! turns the declared nodes and edges into a validated
//! [`ExecutionGraph`](elspeth_core::graph::ExecutionGraph) — still pure
//! data, since [`elspeth_core::graph::NodeInfo`] carries no plugin instance,
//! only a plugin name for the caller to resolve.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use elspeth_core::core::Determinism;
use elspeth_core::core::EdgeId;
use elspeth_core::core::EdgeMode;
use elspeth_core::core::GraphValidationError;
use elspeth_core::core::NodeId;
use elspeth_core::core::NodeType;
use elspeth_core::core::hashing::hash_bytes;
use elspeth_core::graph::CoalesceMergeStrategy;
use elspeth_core::graph::ExecutionGraph;
use elspeth_core::graph::GraphBuilder;
use elspeth_core::graph::NodeInfo;
use elspeth_core::graph::RouteResolution;
use elspeth_core::runtime::CoalescePolicy;
use elspeth_core::runtime::RetryPolicyInput;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable used to override the config path.
const CONFIG_ENV_VAR: &str = "ELSPETH_CONFIG";
/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "elspeth.toml";
/// Maximum configuration file size in bytes.
const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;

/// Errors raised while loading, parsing, or validating a [`PipelineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<GraphValidationError> for ConfigError {
    fn from(err: GraphValidationError) -> Self {
        Self::Invalid(err.to_string())
    }
}

/// Loads, size-checks, and validates a [`PipelineConfig`] from `path`
/// (or, absent an explicit path, `ELSPETH_CONFIG` or `elspeth.toml`).
/// Returns the parsed configuration alongside the hex-encoded SHA-256 hash
/// of the raw file bytes, which callers record as the run's `config_hash`.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file cannot be read,
/// [`ConfigError::Parse`] on malformed TOML, and [`ConfigError::Invalid`]
/// on a path that fails the length limits or a structurally inconsistent
/// configuration.
pub fn load(path: Option<&Path>) -> Result<(PipelineConfig, String), ConfigError> {
    let resolved = resolve_path(path)?;
    validate_path(&resolved)?;
    let bytes = fs::read(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
    if bytes.len() > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
    }
    let content = std::str::from_utf8(&bytes).map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
    let config: PipelineConfig = toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
    config.validate()?;
    let config_hash = hash_bytes(&bytes);
    Ok((config, config_hash))
}

fn resolve_path(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    if let Ok(env_path) = env::var(CONFIG_ENV_VAR) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok(PathBuf::from(env_path));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_NAME))
}

fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("config path component too long".to_string()));
        }
    }
    Ok(())
}

/// `[run]` section: metadata describing the run, not itself part of the
/// graph.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Human-readable run name, recorded alongside the audit config blob.
    pub name: String,
    /// Optional free-text description.
    #[serde(default)]
    pub description: Option<String>,
}

/// How a gate's declared route label resolves, as written in TOML.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouteResolutionConfig {
    /// The token continues to the next node in pipeline order.
    Continue,
    /// The token is routed directly to a named sink.
    Sink,
    /// The token is forked into one child per declared branch.
    Fork,
}

/// One `[[node.route]]` entry declaring how a gate's label resolves.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    /// The gate's route label this entry describes.
    pub label: String,
    /// How the label resolves.
    pub resolution: RouteResolutionConfig,
    /// Sink name; required when `resolution = "sink"`.
    #[serde(default)]
    pub target: Option<String>,
    /// Declared branch names; required when `resolution = "fork"`.
    #[serde(default)]
    pub branches: Vec<String>,
}

fn default_plugin_version() -> String {
    "0.1.0".to_string()
}

fn default_node_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// One `[[node]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Node identifier, unique within this configuration.
    pub id: u64,
    /// Node type.
    pub kind: NodeType,
    /// Node name, required for every kind except `transform`.
    #[serde(default)]
    pub name: Option<String>,
    /// Plugin name the caller resolves against its own registry.
    pub plugin_name: String,
    /// Plugin version string, recorded for audit purposes.
    #[serde(default = "default_plugin_version")]
    pub plugin_version: String,
    /// Determinism classification.
    pub determinism: Determinism,
    /// Plugin configuration, passed through opaquely.
    #[serde(default = "default_node_config")]
    pub config: serde_json::Value,
    /// 0-based pipeline-sequence index; required for `transform` nodes.
    #[serde(default)]
    pub sequence_index: Option<usize>,
    /// Gate route declarations; only meaningful for `gate` nodes.
    #[serde(default)]
    pub route: Vec<RouteConfig>,
}

fn default_edge_mode() -> EdgeMode {
    EdgeMode::Move
}

/// One `[[edge]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeConfig {
    /// Edge identifier, unique within this configuration.
    pub id: u64,
    /// Source node id.
    pub from: u64,
    /// Destination node id.
    pub to: u64,
    /// Label distinguishing this edge among the source's outgoing edges.
    pub label: String,
    /// Routing mode.
    #[serde(default = "default_edge_mode")]
    pub mode: EdgeMode,
}

/// `[retry]` section, converted directly to
/// [`RetryPolicyInput`](elspeth_core::runtime::RetryPolicyInput).
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Requested maximum retry attempts.
    #[serde(default)]
    pub max_retries: Option<i64>,
    /// Requested base delay in milliseconds.
    #[serde(default)]
    pub base_delay_ms: Option<i64>,
    /// Requested maximum delay in milliseconds.
    #[serde(default)]
    pub max_delay_ms: Option<i64>,
    /// Whether jitter should be applied.
    #[serde(default)]
    pub jitter: Option<bool>,
}

impl RetryConfig {
    /// Converts to the engine's raw retry-policy input type.
    #[must_use]
    pub fn to_policy_input(self) -> RetryPolicyInput {
        RetryPolicyInput {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter: self.jitter,
        }
    }
}

/// Coalesce join policy as written in TOML; [`CoalescePolicy`] has no serde
/// derive, so this mirrors it on the config side with a manual conversion.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalescePolicyConfig {
    /// Every declared branch must arrive before the join fires.
    RequireAll,
    /// The join fires as soon as the first branch arrives.
    First,
    /// The join fires once `quorum` distinct branches have arrived.
    Quorum,
    /// The join fires once every arrived branch has reported terminal.
    BestEffort,
}

impl CoalescePolicyConfig {
    /// Converts to the engine's raw coalesce-policy type, resolving
    /// `quorum` against the declared count when `self` is `Quorum`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `self` is `Quorum` and `quorum`
    /// is `None`.
    pub fn to_runtime(self, quorum: Option<usize>) -> Result<CoalescePolicy, ConfigError> {
        match self {
            Self::RequireAll => Ok(CoalescePolicy::RequireAll),
            Self::First => Ok(CoalescePolicy::First),
            Self::BestEffort => Ok(CoalescePolicy::BestEffort),
            Self::Quorum => quorum
                .map(CoalescePolicy::Quorum)
                .ok_or_else(|| ConfigError::Invalid("coalesce policy 'quorum' requires a 'quorum' count".to_string())),
        }
    }
}

/// Coalesce merge strategy as written in TOML; [`CoalesceMergeStrategy`] has
/// no serde derive, so this mirrors it on the config side.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalesceMergeStrategyConfig {
    /// Fields from every branch are unioned.
    Union,
    /// Each branch's row is nested under its branch name.
    Nested,
    /// Only one declared branch's fields survive.
    Select,
}

impl From<CoalesceMergeStrategyConfig> for CoalesceMergeStrategy {
    fn from(value: CoalesceMergeStrategyConfig) -> Self {
        match value {
            CoalesceMergeStrategyConfig::Union => Self::Union,
            CoalesceMergeStrategyConfig::Nested => Self::Nested,
            CoalesceMergeStrategyConfig::Select => Self::Select,
        }
    }
}

/// One `[[coalesce]]` entry, naming the coalesce-kind node it configures.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoalesceConfig {
    /// Name of the `[[node]]` entry (kind = "coalesce") this configures.
    pub node: String,
    /// Branch names this join admits.
    pub branches: Vec<String>,
    /// Join-firing policy.
    pub policy: CoalescePolicyConfig,
    /// Required count when `policy = "quorum"`.
    #[serde(default)]
    pub quorum: Option<usize>,
    /// How admitted branch rows are merged.
    pub merge_strategy: CoalesceMergeStrategyConfig,
    /// Branch whose row becomes the output; required when
    /// `merge_strategy = "select"`, and must name one of `branches`.
    #[serde(default)]
    pub select_branch: Option<String>,
    /// How long a join may sit pending before it is forced closed (merged
    /// if `best_effort`, failed otherwise). `None` means only end-of-source
    /// closes a stalled join.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// `[checkpoint]` section: the checkpoint-frequency policy.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case", tag = "frequency", deny_unknown_fields)]
pub enum CheckpointConfig {
    /// Checkpoint after every sink write.
    EveryRow,
    /// Checkpoint after every `n`th sink write.
    EveryN {
        /// Checkpoint interval, in sink writes.
        n: u32,
    },
    /// Only checkpoint on an aggregation flush.
    AggregationOnly,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self::EveryRow
    }
}

/// `[retention]` section.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    /// Payload blobs older than this (and not referenced by any run still
    /// within its own retention window) are eligible for purge.
    pub payload_retention_days: i64,
}

/// The full declarative pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// `[run]` section.
    pub run: RunConfig,
    /// `[[node]]` entries.
    #[serde(rename = "node")]
    pub nodes: Vec<NodeConfig>,
    /// `[[edge]]` entries.
    #[serde(rename = "edge", default)]
    pub edges: Vec<EdgeConfig>,
    /// `[retry]` section.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// `[[coalesce]]` entries.
    #[serde(rename = "coalesce", default)]
    pub coalesce: Vec<CoalesceConfig>,
    /// `[checkpoint]` section.
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    /// `[retention]` section.
    #[serde(default)]
    pub retention: Option<RetentionConfig>,
}

impl PipelineConfig {
    /// Validates internal consistency: unique node/edge ids, required
    /// fields per node kind, and coalesce/route cross-references.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] on any inconsistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.name.trim().is_empty() {
            return Err(ConfigError::Invalid("run.name must be non-empty".to_string()));
        }
        if self.nodes.is_empty() {
            return Err(ConfigError::Invalid("at least one node is required".to_string()));
        }

        let mut seen_ids = std::collections::HashSet::new();
        let mut source_count = 0;
        for node in &self.nodes {
            if node.id == 0 {
                return Err(ConfigError::Invalid("node.id must be non-zero".to_string()));
            }
            if !seen_ids.insert(node.id) {
                return Err(ConfigError::Invalid(format!("duplicate node id {}", node.id)));
            }
            match node.kind {
                NodeType::Source => source_count += 1,
                NodeType::Transform => {
                    if node.sequence_index.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "transform node {} requires sequence_index",
                            node.id
                        )));
                    }
                }
                NodeType::Gate | NodeType::Aggregation | NodeType::Coalesce | NodeType::Sink => {
                    if node.name.as_deref().is_none_or(str::is_empty) {
                        return Err(ConfigError::Invalid(format!("node {} requires a non-empty name", node.id)));
                    }
                }
            }
            for route in &node.route {
                match route.resolution {
                    RouteResolutionConfig::Sink => {
                        if route.target.as_deref().is_none_or(str::is_empty) {
                            return Err(ConfigError::Invalid(format!(
                                "node {} route '{}' resolution=sink requires a target",
                                node.id, route.label
                            )));
                        }
                    }
                    RouteResolutionConfig::Fork => {
                        if route.branches.is_empty() {
                            return Err(ConfigError::Invalid(format!(
                                "node {} route '{}' resolution=fork requires at least one branch",
                                node.id, route.label
                            )));
                        }
                    }
                    RouteResolutionConfig::Continue => {}
                }
            }
        }
        if source_count != 1 {
            return Err(ConfigError::Invalid(format!("exactly one source node is required, found {source_count}")));
        }

        let mut seen_edge_ids = std::collections::HashSet::new();
        for edge in &self.edges {
            if edge.id == 0 {
                return Err(ConfigError::Invalid("edge.id must be non-zero".to_string()));
            }
            if !seen_edge_ids.insert(edge.id) {
                return Err(ConfigError::Invalid(format!("duplicate edge id {}", edge.id)));
            }
        }

        for coalesce in &self.coalesce {
            if matches!(coalesce.policy, CoalescePolicyConfig::Quorum) {
                let quorum = coalesce
                    .quorum
                    .ok_or_else(|| ConfigError::Invalid(format!("coalesce '{}' policy=quorum requires quorum", coalesce.node)))?;
                if quorum == 0 || quorum > coalesce.branches.len() {
                    return Err(ConfigError::Invalid(format!(
                        "coalesce '{}' quorum must be between 1 and the declared branch count",
                        coalesce.node
                    )));
                }
            }
            if matches!(coalesce.merge_strategy, CoalesceMergeStrategyConfig::Select) {
                let select_branch = coalesce.select_branch.as_deref().ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "coalesce '{}' merge_strategy=select requires select_branch",
                        coalesce.node
                    ))
                })?;
                if !coalesce.branches.iter().any(|b| b == select_branch) {
                    return Err(ConfigError::Invalid(format!(
                        "coalesce '{}' select_branch '{select_branch}' is not one of its declared branches",
                        coalesce.node
                    )));
                }
            }
            let matches_node = self
                .nodes
                .iter()
                .any(|n| n.kind == NodeType::Coalesce && n.name.as_deref() == Some(coalesce.node.as_str()));
            if !matches_node {
                return Err(ConfigError::Invalid(format!(
                    "coalesce entry references unknown coalesce node '{}'",
                    coalesce.node
                )));
            }
        }
        Ok(())
    }

    /// Builds a validated [`ExecutionGraph`] from the declared nodes and
    /// edges. Builds only topology data; no plugin instance is constructed
    /// here, and `plugin_name` is left for the caller to resolve.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] on an unresolved node reference or
    /// a structurally invalid graph (cycle, unreachable node, duplicate
    /// edge label, and so on).
    pub fn build_graph(&self) -> Result<ExecutionGraph, ConfigError> {
        self.validate()?;

        let mut id_map: HashMap<u64, NodeId> = HashMap::new();
        for node in &self.nodes {
            let node_id = NodeId::from_raw(node.id).ok_or_else(|| ConfigError::Invalid(format!("node id {} must be non-zero", node.id)))?;
            id_map.insert(node.id, node_id);
        }

        let mut builder = GraphBuilder::new();
        for node in &self.nodes {
            let node_id = *id_map.get(&node.id).expect("just inserted");
            let info = NodeInfo {
                node_id,
                node_type: node.kind,
                plugin_name: node.plugin_name.clone(),
                determinism: node.determinism,
                config: node.config.clone(),
                input_schema: None,
                output_schema: None,
            };
            match node.kind {
                NodeType::Source => builder.set_source(info),
                NodeType::Transform => {
                    let seq = node.sequence_index.expect("validated above");
                    builder.add_transform(seq, info);
                }
                NodeType::Gate => {
                    let name = node.name.clone().expect("validated above");
                    builder.add_gate(name, info);
                }
                NodeType::Aggregation => {
                    let name = node.name.clone().expect("validated above");
                    builder.add_aggregation(name, info);
                }
                NodeType::Coalesce => {
                    let name = node.name.clone().expect("validated above");
                    let branches = self
                        .coalesce
                        .iter()
                        .find(|c| c.node == name)
                        .map(|c| c.branches.clone())
                        .ok_or_else(|| ConfigError::Invalid(format!("coalesce node '{name}' has no matching [[coalesce]] entry")))?;
                    builder.add_coalesce(name, info, branches);
                }
                NodeType::Sink => {
                    let name = node.name.clone().expect("validated above");
                    builder.add_sink(name, info);
                }
            }
        }

        for edge in &self.edges {
            let edge_id = EdgeId::from_raw(edge.id).ok_or_else(|| ConfigError::Invalid(format!("edge id {} must be non-zero", edge.id)))?;
            let from = *id_map
                .get(&edge.from)
                .ok_or_else(|| ConfigError::Invalid(format!("edge {} references unknown node {}", edge.id, edge.from)))?;
            let to = *id_map
                .get(&edge.to)
                .ok_or_else(|| ConfigError::Invalid(format!("edge {} references unknown node {}", edge.id, edge.to)))?;
            builder.add_edge(edge_id, from, to, edge.label.clone(), edge.mode);
        }

        for node in &self.nodes {
            if node.kind != NodeType::Gate || node.route.is_empty() {
                continue;
            }
            let gate_id = *id_map.get(&node.id).expect("just inserted");
            for route in &node.route {
                match route.resolution {
                    RouteResolutionConfig::Continue => {
                        builder.set_route_resolution(gate_id, route.label.clone(), RouteResolution::Continue);
                    }
                    RouteResolutionConfig::Sink => {
                        let target = route.target.clone().expect("validated above");
                        builder.set_route_resolution(gate_id, route.label.clone(), RouteResolution::Sink(target));
                    }
                    RouteResolutionConfig::Fork => {
                        for branch in &route.branches {
                            builder.set_branch_gate(branch.clone(), gate_id);
                        }
                        builder.set_route_resolution(gate_id, route.label.clone(), RouteResolution::Fork);
                    }
                }
            }
        }

        builder.build().map_err(ConfigError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[run]
name = "demo"

[[node]]
id = 1
kind = "source"
plugin_name = "memory_source"
determinism = "DETERMINISTIC"

[[node]]
id = 2
kind = "sink"
name = "main"
plugin_name = "jsonl_sink"
determinism = "IO_WRITE"

[[edge]]
id = 1
from = 1
to = 2
label = "success"
mode = "move"
"#
    }

    #[test]
    fn parses_a_minimal_linear_pipeline() {
        let config: PipelineConfig = toml::from_str(minimal_toml()).expect("parse");
        config.validate().expect("validate");
        let graph = config.build_graph().expect("build graph");
        assert_eq!(graph.get_sinks().len(), 1);
    }

    #[test]
    fn rejects_unknown_fields() {
        let toml_text = format!("{}\nbogus = true\n", minimal_toml());
        let err = toml::from_str::<PipelineConfig>(&toml_text).expect_err("unknown top-level field must fail");
        assert!(err.to_string().contains("bogus") || err.to_string().contains("unknown"));
    }

    #[test]
    fn rejects_more_than_one_source() {
        let toml_text = format!(
            "{}\n[[node]]\nid = 3\nkind = \"source\"\nplugin_name = \"memory_source\"\ndeterminism = \"DETERMINISTIC\"\n",
            minimal_toml()
        );
        let config: PipelineConfig = toml::from_str(&toml_text).expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn gate_route_wiring_resolves_a_sink_label() {
        let toml_text = r#"
[run]
name = "gated"

[[node]]
id = 1
kind = "source"
plugin_name = "memory_source"
determinism = "DETERMINISTIC"

[[node]]
id = 2
kind = "gate"
name = "severity"
plugin_name = "field_gate"
determinism = "DETERMINISTIC"

[[node.route]]
label = "high"
resolution = "sink"
target = "errors"

[[node]]
id = 3
kind = "sink"
name = "errors"
plugin_name = "jsonl_sink"
determinism = "IO_WRITE"

[[edge]]
id = 1
from = 1
to = 2
label = "success"
mode = "move"

[[edge]]
id = 2
from = 2
to = 3
label = "high"
mode = "move"
"#;
        let config: PipelineConfig = toml::from_str(toml_text).expect("parse");
        let graph = config.build_graph().expect("build graph");
        let gate = graph.gate_node("severity").expect("gate registered");
        assert_eq!(graph.resolve_edge(gate, "high"), graph.get_sinks().get("errors").copied());
    }

    #[test]
    fn coalesce_entry_without_matching_node_is_rejected() {
        let toml_text = format!(
            "{}\n[[coalesce]]\nnode = \"missing\"\nbranches = [\"a\", \"b\"]\npolicy = \"require_all\"\nmerge_strategy = \"union\"\n",
            minimal_toml()
        );
        let config: PipelineConfig = toml::from_str(&toml_text).expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_config_converts_to_policy_input() {
        let retry = RetryConfig {
            max_retries: Some(5),
            base_delay_ms: Some(50),
            max_delay_ms: None,
            jitter: Some(false),
        };
        let input = retry.to_policy_input();
        assert_eq!(input.max_retries, Some(5));
        assert_eq!(input.jitter, Some(false));
    }
}
