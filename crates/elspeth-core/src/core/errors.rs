// crates/elspeth-core/src/core/errors.rs
// ============================================================================
// Module: Error Categories
// Description: Error types visible to orchestrator callers (see spec §6).
// Purpose: Distinguish fatal graph/config problems from in-run control-flow
//          signals so callers never have to pattern-match on strings.
// Dependencies: thiserror
// ============================================================================

use thiserror::Error;

use crate::core::identifiers::NodeId;
use crate::core::identifiers::TokenId;

/// Graph construction/validation failed before any row could flow.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphValidationError {
    /// The graph contains a cycle.
    #[error("graph contains a cycle")]
    Cyclic,
    /// The graph has no source node, or more than one.
    #[error("graph must have exactly one source, found {count}")]
    SourceCount {
        /// Number of source nodes found.
        count: usize,
    },
    /// The graph has no sink nodes.
    #[error("graph must have at least one sink")]
    NoSinks,
    /// A node is not reachable from the source.
    #[error("node {0} is not reachable from the source")]
    Unreachable(NodeId),
    /// Two outgoing edges from the same node shared a label.
    #[error("node {node} has duplicate outgoing edge label '{label}'")]
    DuplicateEdgeLabel {
        /// Node with the duplicate outgoing labels.
        node: NodeId,
        /// The label that was duplicated.
        label: String,
    },
    /// A gate route label had no entry in the route-resolution map.
    #[error("gate {node} declares route label '{label}' with no resolved destination")]
    UnresolvedRouteLabel {
        /// Gate node with the unresolved label.
        node: NodeId,
        /// The unresolved label.
        label: String,
    },
    /// A schema mismatch was detected across a non-divert edge.
    #[error(
        "schema mismatch from '{producer_plugin}' to '{consumer_plugin}': missing fields {missing_fields:?}"
    )]
    SchemaMismatch {
        /// Plugin name of the producing node.
        producer_plugin: String,
        /// Plugin name of the consuming node.
        consumer_plugin: String,
        /// Fields the consumer required that the producer did not supply.
        missing_fields: Vec<String>,
    },
    /// A gate's input and output schema differed; gates must be pass-through.
    #[error("gate {0} is not pass-through: input and output schemas differ")]
    GateNotPassThrough(NodeId),
    /// Mixed observed/explicit branches converged on the same consumer.
    #[error("node {0} receives both observed and explicit-schema branches")]
    MixedSchemaConvergence(NodeId),
}

/// A non-fatal warning produced by graph validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphValidationWarning {
    /// A transform with `on_error` DIVERT feeds a `require_all` coalesce,
    /// which would wait forever for the diverted branch.
    DivertIntoRequireAllCoalesce {
        /// Transform node that diverts on error.
        transform: NodeId,
        /// Coalesce node that would wait forever.
        coalesce: NodeId,
    },
}

/// Pre-flight route validation failed (gate destinations, `on_error`
/// targets, quarantine sinks).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteValidationError {
    /// A gate route resolves to a name that is neither `continue`, `fork`,
    /// nor an existing sink.
    #[error("gate {node} route '{label}' resolves to unknown destination '{destination}'")]
    UnknownGateDestination {
        /// Gate node.
        node: NodeId,
        /// Route label.
        label: String,
        /// Destination that does not exist.
        destination: String,
    },
    /// A transform's `on_error` target is neither `discard` nor an existing
    /// sink.
    #[error("transform {node} on_error targets unknown sink '{sink_name}'")]
    UnknownErrorSink {
        /// Transform node.
        node: NodeId,
        /// Sink name that does not exist.
        sink_name: String,
    },
    /// The source's `on_validation_failure` target is neither `discard` nor
    /// an existing sink.
    #[error("source on_validation_failure targets unknown sink '{0}'")]
    UnknownQuarantineSink(String),
    /// A plugin expected in the node-id map was missing (graph/plugin
    /// desync).
    #[error("node id assignment is missing for plugin '{0}'")]
    MissingNodeIdAssignment(String),
}

/// Retries against a retryable transform were exhausted.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("max retries ({attempts}) exceeded for token {token}")]
pub struct MaxRetriesExceeded {
    /// Token whose retries were exhausted.
    pub token: TokenId,
    /// Number of attempts made.
    pub attempts: u32,
}

/// Cooperative suspension signal: an async batch has not yet completed.
/// This is not a failure; run status is not set to `Failed`, and the
/// caller is expected to retry by invoking the orchestrator again.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("aggregation node {node} has a pending batch and cannot flush yet")]
pub struct BatchPendingError {
    /// Aggregation node awaiting completion.
    pub node: NodeId,
}

/// The work-queue iteration guard was exceeded, indicating a configuration
/// bug (e.g. a routing cycle the graph validator missed) rather than a
/// transient failure.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("token {token} exceeded the maximum work-queue iterations at step {step}")]
pub struct WorkQueueOverrunError {
    /// Token that overran the guard.
    pub token: TokenId,
    /// Step index at which the guard tripped.
    pub step: u32,
}
