// crates/elspeth-core/src/runtime/aggregation.rs
// ============================================================================
// Module: Aggregation Executor
// Description: Per-node FIFO buffer with count/time/end-of-source flush
//              triggers, driving a batch-aware transform on flush.
// Purpose: Batch transforms see a bounded window of rows at once; this
//          module owns when that window closes, not what happens to it.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

use std::time::Duration;
use std::time::Instant;

use crate::core::BatchPendingError;
use crate::core::NodeId;
use crate::core::RowId;
use crate::core::TokenId;
use crate::interfaces::BatchTransform;
use crate::interfaces::OnError;
use crate::interfaces::RowData;
use crate::interfaces::TransformResult;

/// What causes a buffered aggregation to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationTrigger {
    /// Flush once `n` tokens have been buffered.
    Count(usize),
    /// Flush once `duration` has elapsed since the first token in the
    /// current window was buffered.
    Time(Duration),
    /// Flush only when the source is exhausted.
    EndOfSource,
}

struct Window {
    /// Row of the first token buffered into this window; end-of-source
    /// flushes have no triggering token of their own to borrow a row from,
    /// so the window remembers one.
    row_id: RowId,
    tokens: Vec<TokenId>,
    rows: Vec<RowData>,
    opened_at: Instant,
}

/// Buffers tokens for one aggregation node and flushes them through a
/// [`BatchTransform`] when the configured trigger fires.
pub struct AggregationExecutor {
    node_id: NodeId,
    trigger: AggregationTrigger,
    window: Option<Window>,
}

impl AggregationExecutor {
    /// Creates an executor for one aggregation node.
    #[must_use]
    pub fn new(node_id: NodeId, trigger: AggregationTrigger) -> Self {
        Self {
            node_id,
            trigger,
            window: None,
        }
    }

    /// Buffers one token/row pair. Returns `true` if the trigger condition
    /// is now met and [`Self::flush`] should be called.
    pub fn buffer(&mut self, token_id: TokenId, row_id: RowId, row: RowData) -> bool {
        let window = self.window.get_or_insert_with(|| Window {
            row_id,
            tokens: Vec::new(),
            rows: Vec::new(),
            opened_at: Instant::now(),
        });
        window.tokens.push(token_id);
        window.rows.push(row);
        self.should_flush()
    }

    fn should_flush(&self) -> bool {
        let Some(window) = &self.window else {
            return false;
        };
        match self.trigger {
            AggregationTrigger::Count(n) => window.tokens.len() >= n,
            AggregationTrigger::Time(d) => window.opened_at.elapsed() >= d,
            AggregationTrigger::EndOfSource => false,
        }
    }

    /// True if the buffer currently holds any tokens.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.window.as_ref().is_some_and(|w| !w.tokens.is_empty())
    }

    /// The node this executor buffers for.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Flushes the current window through `transform`, returning the
    /// window's representative row id, the contributing token ids, and the
    /// transform's result.
    ///
    /// Returns `Ok(None)` if the buffer is currently empty (nothing to
    /// flush).
    ///
    /// # Errors
    ///
    /// Returns [`BatchPendingError`] if the transform reports
    /// [`TransformResult::Pending`]; the window is left buffered so a
    /// subsequent flush attempt (after recovery) can retry it.
    pub fn flush(
        &mut self,
        transform: &mut dyn BatchTransform,
    ) -> Result<Option<(RowId, Vec<TokenId>, TransformResult)>, BatchPendingError> {
        let Some(window) = &self.window else {
            return Ok(None);
        };
        if window.tokens.is_empty() {
            return Ok(None);
        }
        let result = transform.apply_batch(&window.rows);
        if matches!(result, TransformResult::Pending) {
            return Err(BatchPendingError { node: self.node_id });
        }
        let window = self.window.take().expect("checked above");
        Ok(Some((window.row_id, window.tokens, result)))
    }

    /// The `on_error` policy to apply if a flush's `TransformResult::Error`
    /// must be resolved per-token (every buffered token shares the same
    /// outcome, since the batch transform failed as a unit).
    #[must_use]
    pub fn on_error_policy(transform: &dyn BatchTransform) -> &OnError {
        transform.on_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct CountingBatch {
        on_error: OnError,
    }

    impl BatchTransform for CountingBatch {
        fn apply_batch(&mut self, rows: &[RowData]) -> TransformResult {
            TransformResult::SuccessMulti {
                rows: rows.to_vec(),
                reason: None,
            }
        }
        fn on_error(&self) -> &OnError {
            &self.on_error
        }
    }

    fn tid(n: u64) -> TokenId {
        TokenId::from_raw(n).expect("non-zero")
    }

    fn node(n: u64) -> NodeId {
        NodeId::from_raw(n).expect("non-zero")
    }

    fn rid(n: u64) -> RowId {
        RowId::from_raw(n).expect("non-zero")
    }

    #[test]
    fn count_trigger_fires_at_threshold() {
        let mut exec = AggregationExecutor::new(node(1), AggregationTrigger::Count(2));
        assert!(!exec.buffer(tid(1), rid(1), json!({}).as_object().cloned().unwrap()));
        assert!(exec.buffer(tid(2), rid(1), json!({}).as_object().cloned().unwrap()));
    }

    #[test]
    fn flush_drains_the_window() {
        let mut exec = AggregationExecutor::new(node(1), AggregationTrigger::Count(1));
        exec.buffer(tid(1), rid(7), json!({"a": 1}).as_object().cloned().unwrap());
        let mut transform = CountingBatch {
            on_error: OnError::Discard,
        };
        let (row_id, tokens, result) = exec
            .flush(&mut transform)
            .expect("flush should not error")
            .expect("window had data");
        assert_eq!(row_id, rid(7));
        assert_eq!(tokens, vec![tid(1)]);
        assert!(matches!(result, TransformResult::SuccessMulti { .. }));
        assert!(!exec.has_pending());
    }

    #[test]
    fn end_of_source_trigger_never_auto_fires() {
        let mut exec = AggregationExecutor::new(node(1), AggregationTrigger::EndOfSource);
        assert!(!exec.buffer(tid(1), rid(1), json!({}).as_object().cloned().unwrap()));
        assert!(exec.has_pending());
    }
}
