// crates/elspeth-core/src/graph/validate.rs
// ============================================================================
// Module: Graph Validation
// Description: Acyclicity, reachability, and schema-edge validation.
// ============================================================================

use std::collections::HashMap;
use std::collections::HashSet;

use crate::core::EdgeMode;
use crate::core::FieldSource;
use crate::core::GraphValidationError;
use crate::core::GraphValidationWarning;
use crate::core::NodeId;
use crate::core::NodeType;

use super::EdgeInfo;
use super::ExecutionGraph;
use super::NodeInfo;

/// How a coalesce node combines its converging branch schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceMergeStrategy {
    /// Fields from every branch are unioned (spec merge semantics).
    Union,
    /// Each branch's row is nested under its branch name.
    Nested,
    /// Only one declared branch's fields survive.
    Select,
}

/// Coalesce-specific settings needed by edge-compatibility and
/// divert-interaction validation, supplied alongside the built graph since
/// coalesce policy is not itself part of [`NodeInfo`].
#[derive(Debug, Clone)]
pub struct CoalesceValidationConfig {
    /// The coalesce node this configuration describes.
    pub node: NodeId,
    /// Merge strategy used at this coalesce point.
    pub merge_strategy: CoalesceMergeStrategy,
    /// Whether this coalesce node requires every branch to arrive
    /// (`require_all` policy) before producing output.
    pub require_all: bool,
}

pub(super) fn check_acyclic(
    nodes: &HashMap<NodeId, NodeInfo>,
    edges: &[EdgeInfo],
) -> Result<(), GraphValidationError> {
    let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for edge in edges {
        adjacency.entry(edge.from).or_default().push(edge.to);
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: HashMap<NodeId, Mark> = HashMap::new();

    fn visit(
        node: NodeId,
        adjacency: &HashMap<NodeId, Vec<NodeId>>,
        marks: &mut HashMap<NodeId, Mark>,
    ) -> Result<(), GraphValidationError> {
        match marks.get(&node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(GraphValidationError::Cyclic),
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        if let Some(children) = adjacency.get(&node) {
            for &child in children {
                visit(child, adjacency, marks)?;
            }
        }
        marks.insert(node, Mark::Done);
        Ok(())
    }

    for &node in nodes.keys() {
        visit(node, &adjacency, &mut marks)?;
    }
    Ok(())
}

pub(super) fn check_reachable(
    source: NodeId,
    nodes: &HashMap<NodeId, NodeInfo>,
    outgoing: &HashMap<NodeId, Vec<usize>>,
    edges: &[EdgeInfo],
) -> Result<(), GraphValidationError> {
    let mut visited = HashSet::new();
    let mut stack = vec![source];
    while let Some(node) = stack.pop() {
        if !visited.insert(node) {
            continue;
        }
        if let Some(idxs) = outgoing.get(&node) {
            for &idx in idxs {
                stack.push(edges[idx].to);
            }
        }
    }
    for &node in nodes.keys() {
        if !visited.contains(&node) {
            return Err(GraphValidationError::Unreachable(node));
        }
    }
    Ok(())
}

pub(super) fn build_step_map(source: NodeId, pipeline_nodes: &[NodeId]) -> HashMap<NodeId, u32> {
    let mut map = HashMap::new();
    map.insert(source, 0);
    for (idx, &node) in pipeline_nodes.iter().enumerate() {
        map.insert(node, (idx + 1) as u32);
    }
    map
}

/// Validates schema compatibility across every non-divert edge: the
/// consumer's required fields must be satisfiable from the producer's
/// output schema, gates must be pass-through, and coalesce convergence
/// points must not mix observed with explicit schemas.
///
/// # Errors
///
/// Returns [`GraphValidationError`] on the first incompatible edge found.
pub fn validate_edge_compatibility(
    graph: &ExecutionGraph,
    coalesce_configs: &[CoalesceValidationConfig],
) -> Result<(), GraphValidationError> {
    for edge in graph.edges() {
        if matches!(edge.mode, EdgeMode::Divert) {
            continue;
        }
        let producer = graph.node(edge.from).expect("edge endpoint must exist");
        let consumer = graph.node(edge.to).expect("edge endpoint must exist");

        if matches!(producer.node_type, NodeType::Gate) {
            if let (Some(input), Some(output)) = (&producer.input_schema, &producer.output_schema)
            {
                if input.version_hash() != output.version_hash() {
                    return Err(GraphValidationError::GateNotPassThrough(producer.node_id));
                }
            }
        }

        if matches!(consumer.node_type, NodeType::Coalesce) {
            continue;
        }

        let Some(consumer_schema) = &consumer.input_schema else {
            continue;
        };
        let Some(producer_schema) = effective_output_schema(graph, edge.from, producer) else {
            continue;
        };
        let missing: Vec<String> = consumer_schema
            .fields()
            .iter()
            .filter(|f| f.required)
            .filter(|f| producer_schema.find_field(&f.normalized_name).is_none())
            .map(|f| f.normalized_name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(GraphValidationError::SchemaMismatch {
                producer_plugin: producer.plugin_name.clone(),
                consumer_plugin: consumer.plugin_name.clone(),
                missing_fields: missing,
            });
        }
    }

    for config in coalesce_configs {
        validate_coalesce_convergence(graph, config)?;
    }

    Ok(())
}

/// A gate's own schema is pass-through; its effective output schema for
/// edge-compatibility purposes is whatever its upstream producer declared.
fn effective_output_schema<'a>(
    graph: &'a ExecutionGraph,
    node_id: NodeId,
    node: &'a NodeInfo,
) -> Option<&'a crate::core::SchemaContract> {
    if !matches!(node.node_type, NodeType::Gate) {
        return node.output_schema.as_ref();
    }
    if node.output_schema.is_some() {
        return node.output_schema.as_ref();
    }
    let upstream_edge = graph.edges().iter().find(|e| e.to == node_id)?;
    let upstream = graph.node(upstream_edge.from)?;
    effective_output_schema(graph, upstream_edge.from, upstream)
}

fn validate_coalesce_convergence(
    graph: &ExecutionGraph,
    config: &CoalesceValidationConfig,
) -> Result<(), GraphValidationError> {
    if !matches!(config.merge_strategy, CoalesceMergeStrategy::Union) {
        return Ok(());
    }
    let incoming: Vec<&EdgeInfo> = graph.edges().iter().filter(|e| e.to == config.node).collect();
    let mut has_observed = false;
    let mut has_explicit = false;
    for edge in incoming {
        if let Some(producer) = graph.node(edge.from) {
            if let Some(schema) = effective_output_schema(graph, edge.from, producer) {
                let all_inferred = schema.fields().iter().all(|f| f.source == FieldSource::Inferred);
                if all_inferred && !schema.fields().is_empty() {
                    has_observed = true;
                } else {
                    has_explicit = true;
                }
            }
        }
    }
    if has_observed && has_explicit {
        return Err(GraphValidationError::MixedSchemaConvergence(config.node));
    }
    Ok(())
}

/// Emits a warning for every transform that diverts to a sink on error while
/// feeding a `require_all` coalesce, since the coalesce would then wait
/// forever for a branch that will never arrive.
pub(super) fn warn_divert_coalesce_interactions(
    graph: &ExecutionGraph,
    coalesce_configs: &[CoalesceValidationConfig],
) -> Vec<GraphValidationWarning> {
    let mut warnings = Vec::new();
    let require_all_nodes: HashSet<NodeId> = coalesce_configs
        .iter()
        .filter(|c| c.require_all)
        .map(|c| c.node)
        .collect();
    if require_all_nodes.is_empty() {
        return warnings;
    }
    for edge in graph.edges() {
        if !matches!(edge.mode, EdgeMode::Divert) {
            continue;
        }
        let Some(transform) = graph.node(edge.from) else {
            continue;
        };
        if !matches!(transform.node_type, NodeType::Transform) {
            continue;
        }
        for &coalesce in &require_all_nodes {
            if feeds_into(graph, edge.from, coalesce) {
                warnings.push(GraphValidationWarning::DivertIntoRequireAllCoalesce {
                    transform: edge.from,
                    coalesce,
                });
            }
        }
    }
    warnings
}

fn feeds_into(graph: &ExecutionGraph, from: NodeId, target: NodeId) -> bool {
    let mut visited = HashSet::new();
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        if node == target {
            return true;
        }
        if !visited.insert(node) {
            continue;
        }
        for edge in graph.outgoing_edges(node) {
            stack.push(edge.to);
        }
    }
    false
}
