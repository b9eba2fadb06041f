// crates/elspeth-core/src/interfaces/mod.rs
// ============================================================================
// Module: Plugin Interfaces
// Description: Backend-agnostic traits for source, transform, gate,
//              aggregation, and sink plugins.
// Purpose: Replace duck-typed plugin protocols with one trait per plugin
//          kind, matching each kind's actual contract.
// Dependencies: crate::core
// ============================================================================

//! ## Overview
//! Individual transform/sink/source implementations are explicitly out of
//! scope for this crate (they are "external collaborators"); this module
//! defines only the trait surface the orchestrator drives them through.
//! Implementations must be deterministic per their declared
//! [`crate::core::Determinism`] and must fail closed: a transform that
//! cannot produce a row reports `TransformResult::Error`, it does not
//! fabricate one.

use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

use crate::core::SchemaContract;

/// A row of data flowing through the graph. Field access is always via the
/// owning node's [`SchemaContract`]; this type carries no dynamic lookup
/// helpers of its own.
pub type RowData = Map<String, Value>;

/// What a transform should do with a row it cannot process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnError {
    /// Drop the row; it reaches a terminal `Failed` outcome.
    Discard,
    /// Route the row to the named sink via a `Divert` edge.
    RouteToSink(String),
}

/// The result of one transform invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformResult {
    /// Produced exactly one output row.
    Success {
        /// The transformed row.
        row: RowData,
        /// Optional explainable-transform success reason.
        reason: Option<Value>,
    },
    /// Produced more than one output row (batch-aware transforms only).
    SuccessMulti {
        /// The transformed rows, in emission order.
        rows: Vec<RowData>,
        /// Optional explainable-transform success reason, shared by the batch.
        reason: Option<Value>,
    },
    /// Failed to process the row.
    Error {
        /// Structured failure reason.
        reason: Value,
        /// Whether the Retry Manager should retry this invocation.
        retryable: bool,
    },
    /// An async batch transform has not yet produced output.
    Pending,
}

/// Errors a source can raise while streaming rows.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source could not read its underlying data.
    #[error("source read error: {0}")]
    Read(String),
}

/// One row emitted by a source, paired with its validation outcome.
pub struct SourceRow {
    /// The row payload.
    pub row: RowData,
    /// Violations found against the source's declared schema, if any.
    /// A non-empty list means the row should be quarantined rather than
    /// entering the graph.
    pub violations: Vec<crate::core::Violation>,
}

/// A node that emits rows into the graph.
pub trait Source {
    /// Returns the source's declared output schema, if fixed/flexible.
    fn schema(&self) -> Option<&SchemaContract>;

    /// Called once before any row is streamed.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if startup fails.
    fn on_start(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Streams the next row, or `None` at end of source.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the underlying read fails.
    fn next_row(&mut self) -> Result<Option<SourceRow>, SourceError>;

    /// Called once after the source is exhausted or the run ends.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if shutdown fails. Orchestrator cleanup
    /// records but does not propagate this.
    fn on_complete(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Releases any resources held by the source.
    fn close(&mut self) {}
}

/// A single-row transform.
pub trait Transform {
    /// Applies the transform to one row.
    fn apply(&mut self, row: &RowData) -> TransformResult;

    /// Policy applied when `apply` returns `TransformResult::Error` and
    /// retries (if any) are exhausted.
    fn on_error(&self) -> &OnError;

    /// Called once before any row is processed.
    fn on_start(&mut self) {}

    /// Called once after the run ends.
    fn on_complete(&mut self) {}

    /// Releases any resources held by the transform.
    fn close(&mut self) {}
}

/// A batch-aware transform invoked by the Aggregation Executor on flush.
pub trait BatchTransform {
    /// Applies the transform to a buffered batch of rows.
    fn apply_batch(&mut self, rows: &[RowData]) -> TransformResult;

    /// Policy applied when a batch invocation fails terminally.
    fn on_error(&self) -> &OnError;
}

/// A node that chooses a routing label without transforming row data.
pub trait Gate {
    /// Evaluates the gate against one row, returning the chosen route
    /// label(s). Multiple labels mean a fork.
    fn route(&mut self, row: &RowData) -> Vec<String>;

    /// Optional structured reason for the routing decision, shared by every
    /// label returned from the same `route` call.
    fn reason(&self) -> Option<Value> {
        None
    }
}

/// A terminal write destination.
pub trait Sink {
    /// Returns the sink's declared input schema, if fixed/flexible.
    fn schema(&self) -> Option<&SchemaContract>;

    /// Called once before any row is written.
    fn on_start(&mut self) {}

    /// Writes a batch of rows that reached this sink.
    ///
    /// # Errors
    ///
    /// Returns an opaque error message; a sink write failure fails the run.
    fn write(&mut self, rows: &[RowData]) -> Result<(), String>;

    /// Called once after the run ends.
    fn on_complete(&mut self) {}

    /// Releases any resources held by the sink.
    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Passthrough {
        on_error: OnError,
    }

    impl Transform for Passthrough {
        fn apply(&mut self, row: &RowData) -> TransformResult {
            TransformResult::Success {
                row: row.clone(),
                reason: None,
            }
        }

        fn on_error(&self) -> &OnError {
            &self.on_error
        }
    }

    #[test]
    fn passthrough_transform_echoes_row() {
        let mut transform = Passthrough {
            on_error: OnError::Discard,
        };
        let row = json!({"a": 1}).as_object().cloned().unwrap();
        let result = transform.apply(&row);
        assert_eq!(
            result,
            TransformResult::Success {
                row,
                reason: None
            }
        );
    }
}
