// crates/elspeth-core/src/graph/mod.rs
// ============================================================================
// Module: Execution Graph
// Description: Validated, typed multi-edge DAG of source/transform/gate/
//              aggregation/coalesce/sink nodes.
// Purpose: Structural and schema-contract validation that must pass before
//          any row is allowed to flow.
// Dependencies: crate::core
// ============================================================================

//! ## Overview
//! The graph is a directed multigraph: parallel labeled edges between the
//! same ordered node pair are supported and required (a gate routing three
//! severity labels to one sink, for instance). Edge lookups are keyed by
//! `(from_node, label)`, so duplicate labels on the same node's outgoing
//! edges would silently corrupt the lookup and are rejected at build time.

mod validate;

use std::collections::HashMap;
use std::collections::HashSet;

use crate::core::Determinism;
use crate::core::EdgeId;
use crate::core::EdgeMode;
use crate::core::GraphValidationError;
use crate::core::GraphValidationWarning;
use crate::core::NodeId;
use crate::core::NodeType;
use crate::core::SchemaContract;

pub use validate::CoalesceMergeStrategy;
pub use validate::CoalesceValidationConfig;
pub use validate::validate_edge_compatibility;

/// Where a gate's declared route label resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteResolution {
    /// The token continues to the next node in pipeline order.
    Continue,
    /// The token is forked into one child per declared branch.
    Fork,
    /// The token is routed directly to the named sink.
    Sink(String),
}

/// Static, immutable information about one node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Node identifier.
    pub node_id: NodeId,
    /// Node type.
    pub node_type: NodeType,
    /// Plugin name implementing this node.
    pub plugin_name: String,
    /// Determinism classification.
    pub determinism: Determinism,
    /// Plugin configuration, as JSON.
    pub config: serde_json::Value,
    /// Declared input schema, if any.
    pub input_schema: Option<SchemaContract>,
    /// Declared output schema, if any.
    pub output_schema: Option<SchemaContract>,
}

/// One outgoing edge from a node.
#[derive(Debug, Clone)]
pub struct EdgeInfo {
    /// Edge identifier, stable for the life of the run.
    pub edge_id: EdgeId,
    /// Source node.
    pub from: NodeId,
    /// Destination node.
    pub to: NodeId,
    /// Label distinguishing this edge among the source's outgoing edges.
    pub label: String,
    /// Routing mode.
    pub mode: EdgeMode,
}

/// A validated execution graph.
///
/// Construction happens through [`GraphBuilder`]; a `ExecutionGraph` value
/// only exists once [`GraphBuilder::build`] has run acyclicity, reachability,
/// label-uniqueness, and (optionally) schema-edge validation.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    nodes: HashMap<NodeId, NodeInfo>,
    edges: Vec<EdgeInfo>,
    adjacency: HashMap<(NodeId, String), NodeId>,
    outgoing: HashMap<NodeId, Vec<usize>>,
    sink_id_map: HashMap<String, NodeId>,
    transform_id_map: HashMap<usize, NodeId>,
    config_gate_id_map: HashMap<String, NodeId>,
    aggregation_id_map: HashMap<String, NodeId>,
    coalesce_id_map: HashMap<String, NodeId>,
    branch_to_coalesce: HashMap<String, NodeId>,
    branch_gate_map: HashMap<String, NodeId>,
    route_resolution_map: HashMap<(NodeId, String), RouteResolution>,
    pipeline_nodes: Vec<NodeId>,
    node_step_map: HashMap<NodeId, u32>,
    source_node: NodeId,
}

impl ExecutionGraph {
    /// The node info for `node_id`, if it exists in this graph.
    #[must_use]
    pub fn node(&self, node_id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&node_id)
    }

    /// All nodes in the graph.
    #[must_use]
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    /// All edges in the graph.
    #[must_use]
    pub fn edges(&self) -> &[EdgeInfo] {
        &self.edges
    }

    /// The single source node.
    #[must_use]
    pub fn get_source(&self) -> NodeId {
        self.source_node
    }

    /// All sink nodes, by configured name.
    #[must_use]
    pub fn get_sinks(&self) -> &HashMap<String, NodeId> {
        &self.sink_id_map
    }

    /// The ordered sequence of non-source processing nodes.
    #[must_use]
    pub fn get_pipeline_node_sequence(&self) -> &[NodeId] {
        &self.pipeline_nodes
    }

    /// The audit step index for every node, including the source (step 0).
    #[must_use]
    pub fn build_step_map(&self) -> &HashMap<NodeId, u32> {
        &self.node_step_map
    }

    /// For every declared branch name, the first processing node a forked
    /// token on that branch should enter.
    #[must_use]
    pub fn get_branch_first_nodes(&self) -> HashMap<String, NodeId> {
        self.branch_gate_map
            .iter()
            .filter_map(|(branch, gate)| {
                let label_dest = self.route_resolution_map.get(&(*gate, branch.clone()))?;
                match label_dest {
                    RouteResolution::Sink(_) | RouteResolution::Continue => None,
                    RouteResolution::Fork => self
                        .adjacency
                        .get(&(*gate, branch.clone()))
                        .map(|n| (branch.clone(), *n)),
                }
            })
            .collect()
    }

    /// Nodes whose `on_success` path (a `Continue`-resolved edge labeled
    /// `"success"`, or any edge landing directly on a sink) terminates at a
    /// sink, mapped to that sink's name.
    #[must_use]
    pub fn get_terminal_sink_map(&self) -> HashMap<NodeId, String> {
        let mut map = HashMap::new();
        for edge in &self.edges {
            if let Some(sink_name) = self
                .sink_id_map
                .iter()
                .find(|(_, id)| **id == edge.to)
                .map(|(name, _)| name.clone())
            {
                map.insert(edge.from, sink_name);
            }
        }
        map
    }

    /// The edge label connecting `from_node` to the node registered under
    /// `sink_name`, if one exists.
    #[must_use]
    pub fn get_route_label(&self, from_node: NodeId, sink_name: &str) -> Option<&str> {
        let sink_node = self.sink_id_map.get(sink_name)?;
        self.edges
            .iter()
            .find(|e| e.from == from_node && e.to == *sink_node)
            .map(|e| e.label.as_str())
    }

    /// The full gate route-label resolution map.
    #[must_use]
    pub fn get_route_resolution_map(&self) -> &HashMap<(NodeId, String), RouteResolution> {
        &self.route_resolution_map
    }

    /// Resolves the destination node for `(from_node, label)`, if an edge
    /// with that label exists from that node.
    #[must_use]
    pub fn resolve_edge(&self, from_node: NodeId, label: &str) -> Option<NodeId> {
        self.adjacency.get(&(from_node, label.to_string())).copied()
    }

    /// Outgoing edges from `node_id`.
    #[must_use]
    pub fn outgoing_edges(&self, node_id: NodeId) -> impl Iterator<Item = &EdgeInfo> {
        self.outgoing
            .get(&node_id)
            .into_iter()
            .flat_map(|idxs| idxs.iter().map(|&i| &self.edges[i]))
    }

    /// Transform node registered at pipeline-sequence index `index`.
    #[must_use]
    pub fn transform_node(&self, index: usize) -> Option<NodeId> {
        self.transform_id_map.get(&index).copied()
    }

    /// Gate node registered under `name`.
    #[must_use]
    pub fn gate_node(&self, name: &str) -> Option<NodeId> {
        self.config_gate_id_map.get(name).copied()
    }

    /// Aggregation node registered under `name`.
    #[must_use]
    pub fn aggregation_node(&self, name: &str) -> Option<NodeId> {
        self.aggregation_id_map.get(name).copied()
    }

    /// Coalesce node registered under `name`.
    #[must_use]
    pub fn coalesce_node(&self, name: &str) -> Option<NodeId> {
        self.coalesce_id_map.get(name).copied()
    }

    /// Coalesce node that joins `branch_name`, if one is configured.
    #[must_use]
    pub fn coalesce_for_branch(&self, branch_name: &str) -> Option<NodeId> {
        self.branch_to_coalesce.get(branch_name).copied()
    }

    /// Re-derives a topology hash over every node and edge, used by the
    /// checkpoint manager to detect structural drift between runs.
    ///
    /// # Errors
    ///
    /// Returns a hashing error only on an internal bug.
    pub fn topology_hash(&self) -> Result<String, crate::core::hashing::HashError> {
        #[derive(serde::Serialize)]
        struct NodeShape {
            node_id: u64,
            node_type: NodeType,
            plugin_name: String,
        }
        #[derive(serde::Serialize)]
        struct EdgeShape {
            from: u64,
            to: u64,
            label: String,
            mode: EdgeMode,
        }
        let mut node_shapes: Vec<NodeShape> = self
            .nodes
            .values()
            .map(|n| NodeShape {
                node_id: n.node_id.get(),
                node_type: n.node_type,
                plugin_name: n.plugin_name.clone(),
            })
            .collect();
        node_shapes.sort_by_key(|n| n.node_id);
        let mut edge_shapes: Vec<EdgeShape> = self
            .edges
            .iter()
            .map(|e| EdgeShape {
                from: e.from.get(),
                to: e.to.get(),
                label: e.label.clone(),
                mode: e.mode,
            })
            .collect();
        edge_shapes.sort_by(|a, b| (a.from, a.to, a.label.clone()).cmp(&(b.from, b.to, b.label.clone())));
        crate::core::hashing::stable_hash(&(node_shapes, edge_shapes))
    }
}

/// Builder for [`ExecutionGraph`]. Populated from wired plugin instances
/// (source, transforms, sinks, aggregations, gates, coalesce settings) by
/// the orchestrator's caller, then validated once with [`GraphBuilder::build`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: HashMap<NodeId, NodeInfo>,
    edges: Vec<EdgeInfo>,
    sink_id_map: HashMap<String, NodeId>,
    transform_id_map: HashMap<usize, NodeId>,
    config_gate_id_map: HashMap<String, NodeId>,
    aggregation_id_map: HashMap<String, NodeId>,
    coalesce_id_map: HashMap<String, NodeId>,
    branch_to_coalesce: HashMap<String, NodeId>,
    branch_gate_map: HashMap<String, NodeId>,
    route_resolution_map: HashMap<(NodeId, String), RouteResolution>,
    pipeline_nodes: Vec<NodeId>,
    source_node: Option<NodeId>,
}

impl GraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the (sole) source node.
    pub fn set_source(&mut self, info: NodeInfo) {
        self.source_node = Some(info.node_id);
        self.nodes.insert(info.node_id, info);
    }

    /// Registers a transform node at its 0-based pipeline-sequence index.
    pub fn add_transform(&mut self, sequence_index: usize, info: NodeInfo) {
        self.transform_id_map.insert(sequence_index, info.node_id);
        self.pipeline_nodes.push(info.node_id);
        self.nodes.insert(info.node_id, info);
    }

    /// Registers a named gate node.
    pub fn add_gate(&mut self, name: impl Into<String>, info: NodeInfo) {
        self.config_gate_id_map.insert(name.into(), info.node_id);
        self.pipeline_nodes.push(info.node_id);
        self.nodes.insert(info.node_id, info);
    }

    /// Registers a named aggregation node.
    pub fn add_aggregation(&mut self, name: impl Into<String>, info: NodeInfo) {
        self.aggregation_id_map.insert(name.into(), info.node_id);
        self.pipeline_nodes.push(info.node_id);
        self.nodes.insert(info.node_id, info);
    }

    /// Registers a named coalesce node, and the branch names it joins.
    pub fn add_coalesce(
        &mut self,
        name: impl Into<String>,
        info: NodeInfo,
        branches: impl IntoIterator<Item = String>,
    ) {
        let node_id = info.node_id;
        self.coalesce_id_map.insert(name.into(), node_id);
        self.pipeline_nodes.push(node_id);
        self.nodes.insert(node_id, info);
        for branch in branches {
            self.branch_to_coalesce.insert(branch, node_id);
        }
    }

    /// Registers a named sink node.
    pub fn add_sink(&mut self, name: impl Into<String>, info: NodeInfo) {
        self.sink_id_map.insert(name.into(), info.node_id);
        self.nodes.insert(info.node_id, info);
    }

    /// Records that `branch_name` originates from `gate`.
    pub fn set_branch_gate(&mut self, branch_name: impl Into<String>, gate: NodeId) {
        self.branch_gate_map.insert(branch_name.into(), gate);
    }

    /// Adds a directed, labeled edge under a caller-assigned identifier.
    pub fn add_edge(
        &mut self,
        edge_id: EdgeId,
        from: NodeId,
        to: NodeId,
        label: impl Into<String>,
        mode: EdgeMode,
    ) {
        self.edges.push(EdgeInfo {
            edge_id,
            from,
            to,
            label: label.into(),
            mode,
        });
    }

    /// Records how a gate's declared route label resolves.
    pub fn set_route_resolution(
        &mut self,
        gate: NodeId,
        label: impl Into<String>,
        resolution: RouteResolution,
    ) {
        self.route_resolution_map.insert((gate, label.into()), resolution);
    }

    /// Builds and validates the graph. Runs structural validation
    /// (acyclicity, reachability, single source, at least one sink, unique
    /// outgoing labels, resolved gate routes). Schema-edge validation is a
    /// separate step; call [`ExecutionGraph::validate_edge_compatibility`]
    /// (via [`validate::validate_edge_compatibility`]) once the graph is built.
    ///
    /// # Errors
    ///
    /// Returns [`GraphValidationError`] on any structural violation.
    pub fn build(self) -> Result<ExecutionGraph, GraphValidationError> {
        let source_node = self
            .source_node
            .ok_or(GraphValidationError::SourceCount { count: 0 })?;

        let mut adjacency = HashMap::new();
        let mut outgoing: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut seen_labels: HashMap<NodeId, HashSet<String>> = HashMap::new();
        for (idx, edge) in self.edges.iter().enumerate() {
            let labels = seen_labels.entry(edge.from).or_default();
            if !labels.insert(edge.label.clone()) {
                return Err(GraphValidationError::DuplicateEdgeLabel {
                    node: edge.from,
                    label: edge.label.clone(),
                });
            }
            adjacency.insert((edge.from, edge.label.clone()), edge.to);
            outgoing.entry(edge.from).or_default().push(idx);
        }

        if self.sink_id_map.is_empty() {
            return Err(GraphValidationError::NoSinks);
        }

        validate::check_acyclic(&self.nodes, &self.edges)?;
        validate::check_reachable(source_node, &self.nodes, &outgoing, &self.edges)?;

        for ((gate, label), resolution) in &self.route_resolution_map {
            if matches!(resolution, RouteResolution::Fork) {
                continue;
            }
            if !adjacency.contains_key(&(*gate, label.clone())) {
                if let RouteResolution::Sink(sink_name) = resolution {
                    if !self.sink_id_map.contains_key(sink_name) {
                        return Err(GraphValidationError::UnresolvedRouteLabel {
                            node: *gate,
                            label: label.clone(),
                        });
                    }
                } else {
                    return Err(GraphValidationError::UnresolvedRouteLabel {
                        node: *gate,
                        label: label.clone(),
                    });
                }
            }
        }

        let node_step_map = validate::build_step_map(source_node, &self.pipeline_nodes);

        Ok(ExecutionGraph {
            nodes: self.nodes,
            edges: self.edges,
            adjacency,
            outgoing,
            sink_id_map: self.sink_id_map,
            transform_id_map: self.transform_id_map,
            config_gate_id_map: self.config_gate_id_map,
            aggregation_id_map: self.aggregation_id_map,
            coalesce_id_map: self.coalesce_id_map,
            branch_to_coalesce: self.branch_to_coalesce,
            branch_gate_map: self.branch_gate_map,
            route_resolution_map: self.route_resolution_map,
            pipeline_nodes: self.pipeline_nodes,
            node_step_map,
            source_node,
        })
    }
}

/// Non-fatal warnings surfaced alongside a successful build.
#[must_use]
pub fn warn_divert_coalesce_interactions(
    graph: &ExecutionGraph,
    coalesce_configs: &[CoalesceValidationConfig],
) -> Vec<GraphValidationWarning> {
    validate::warn_divert_coalesce_interactions(graph, coalesce_configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Determinism;
    use serde_json::json;

    fn node(id: u64, node_type: NodeType, plugin_name: &str) -> NodeInfo {
        NodeInfo {
            node_id: NodeId::from_raw(id).expect("non-zero"),
            node_type,
            plugin_name: plugin_name.to_string(),
            determinism: Determinism::Deterministic,
            config: json!({}),
            input_schema: None,
            output_schema: None,
        }
    }

    #[test]
    fn builds_a_minimal_linear_graph() {
        let mut builder = GraphBuilder::new();
        builder.set_source(node(1, NodeType::Source, "src"));
        builder.add_transform(0, node(2, NodeType::Transform, "xform"));
        builder.add_sink("out", node(3, NodeType::Sink, "sink"));
        let n1 = NodeId::from_raw(1).expect("non-zero");
        let n2 = NodeId::from_raw(2).expect("non-zero");
        let n3 = NodeId::from_raw(3).expect("non-zero");
        builder.add_edge(EdgeId::from_raw(1).expect("non-zero"), n1, n2, "default", EdgeMode::Move);
        builder.add_edge(EdgeId::from_raw(2).expect("non-zero"), n2, n3, "default", EdgeMode::Move);
        let graph = builder.build().expect("graph should build");
        assert_eq!(graph.get_source(), n1);
        assert_eq!(graph.get_sinks().len(), 1);
    }

    #[test]
    fn rejects_duplicate_outgoing_labels() {
        let mut builder = GraphBuilder::new();
        builder.set_source(node(1, NodeType::Source, "src"));
        builder.add_sink("a", node(2, NodeType::Sink, "sink_a"));
        builder.add_sink("b", node(3, NodeType::Sink, "sink_b"));
        let n1 = NodeId::from_raw(1).expect("non-zero");
        let n2 = NodeId::from_raw(2).expect("non-zero");
        let n3 = NodeId::from_raw(3).expect("non-zero");
        builder.add_edge(EdgeId::from_raw(1).expect("non-zero"), n1, n2, "dup", EdgeMode::Move);
        builder.add_edge(EdgeId::from_raw(2).expect("non-zero"), n1, n3, "dup", EdgeMode::Copy);
        let err = builder.build().expect_err("duplicate labels must fail");
        assert!(matches!(err, GraphValidationError::DuplicateEdgeLabel { .. }));
    }

    #[test]
    fn rejects_cycles() {
        let mut builder = GraphBuilder::new();
        builder.set_source(node(1, NodeType::Source, "src"));
        builder.add_transform(0, node(2, NodeType::Transform, "a"));
        builder.add_transform(1, node(3, NodeType::Transform, "b"));
        builder.add_sink("out", node(4, NodeType::Sink, "sink"));
        let n1 = NodeId::from_raw(1).expect("non-zero");
        let n2 = NodeId::from_raw(2).expect("non-zero");
        let n3 = NodeId::from_raw(3).expect("non-zero");
        let n4 = NodeId::from_raw(4).expect("non-zero");
        builder.add_edge(EdgeId::from_raw(1).expect("non-zero"), n1, n2, "default", EdgeMode::Move);
        builder.add_edge(EdgeId::from_raw(2).expect("non-zero"), n2, n3, "default", EdgeMode::Move);
        builder.add_edge(EdgeId::from_raw(3).expect("non-zero"), n3, n2, "back", EdgeMode::Move);
        builder.add_edge(EdgeId::from_raw(4).expect("non-zero"), n3, n4, "default", EdgeMode::Move);
        let err = builder.build().expect_err("cycle must fail");
        assert!(matches!(err, GraphValidationError::Cyclic));
    }

    #[test]
    fn rejects_unreachable_nodes() {
        let mut builder = GraphBuilder::new();
        builder.set_source(node(1, NodeType::Source, "src"));
        builder.add_sink("out", node(2, NodeType::Sink, "sink"));
        builder.add_transform(0, node(3, NodeType::Transform, "orphan"));
        let n1 = NodeId::from_raw(1).expect("non-zero");
        let n2 = NodeId::from_raw(2).expect("non-zero");
        builder.add_edge(EdgeId::from_raw(1).expect("non-zero"), n1, n2, "default", EdgeMode::Move);
        let err = builder.build().expect_err("unreachable node must fail");
        assert!(matches!(err, GraphValidationError::Unreachable(_)));
    }

    #[test]
    fn multiple_labeled_edges_between_same_pair_are_supported() {
        let mut builder = GraphBuilder::new();
        builder.set_source(node(1, NodeType::Source, "src"));
        builder.add_gate("severity", node(2, NodeType::Gate, "gate"));
        builder.add_sink("alerts", node(3, NodeType::Sink, "alerts"));
        let n1 = NodeId::from_raw(1).expect("non-zero");
        let n2 = NodeId::from_raw(2).expect("non-zero");
        let n3 = NodeId::from_raw(3).expect("non-zero");
        builder.add_edge(EdgeId::from_raw(1).expect("non-zero"), n1, n2, "default", EdgeMode::Move);
        builder.add_edge(EdgeId::from_raw(2).expect("non-zero"), n2, n3, "high", EdgeMode::Move);
        builder.add_edge(EdgeId::from_raw(3).expect("non-zero"), n2, n3, "medium", EdgeMode::Move);
        builder.add_edge(EdgeId::from_raw(4).expect("non-zero"), n2, n3, "low", EdgeMode::Move);
        builder.set_route_resolution(n2, "high", RouteResolution::Sink("alerts".to_string()));
        builder.set_route_resolution(n2, "medium", RouteResolution::Sink("alerts".to_string()));
        builder.set_route_resolution(n2, "low", RouteResolution::Sink("alerts".to_string()));
        let graph = builder.build().expect("graph should build");
        assert_eq!(graph.resolve_edge(n2, "high"), Some(n3));
        assert_eq!(graph.resolve_edge(n2, "medium"), Some(n3));
        assert_eq!(graph.resolve_edge(n2, "low"), Some(n3));
        assert_eq!(graph.edges().len(), 4);
    }
}
