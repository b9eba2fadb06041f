// crates/elspeth-core/src/runtime/coalesce.rs
// ============================================================================
// Module: Coalesce Executor
// Description: Joins forked branches back into a single token once the
//              configured join policy is satisfied.
// Purpose: Decouple "when do we have enough branches" (policy) from "how do
//          we combine their rows" (merge strategy) from "how long do we
//          remember a join key has already fired" (eviction).
// Dependencies: crate::core, crate::graph
// ============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use serde_json::Map;
use serde_json::Value;

use crate::core::RowId;
use crate::core::TokenId;
use crate::graph::CoalesceMergeStrategy;
use crate::interfaces::RowData;

/// Join-completion policy for a coalesce node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalescePolicy {
    /// Every declared branch must arrive before the join fires.
    RequireAll,
    /// The join fires as soon as the first branch arrives; later arrivals
    /// for the same key are discarded.
    First,
    /// The join fires once `n` distinct branches have arrived.
    Quorum(usize),
    /// The join fires once every *arrived* branch has reported terminal
    /// (success or discard); branches that never arrive do not block it,
    /// but only a timeout or end-of-source flush can close it out.
    BestEffort,
}

#[derive(Debug, Clone)]
struct PendingJoin {
    row_id: RowId,
    tokens: Vec<TokenId>,
    rows: HashMap<String, RowData>,
    started_at: Instant,
}

/// Result of admitting one branch's arrival, or of closing a join out at
/// timeout/end-of-source. Every arrival produces exactly one of these for
/// its own join key, plus zero or more for any *other* key this call
/// happened to time out in passing.
#[derive(Debug)]
pub enum CoalesceOutcome {
    /// Buffered; the join policy is not yet satisfied.
    Pending,
    /// The join fired: `row_id` is the join key's row, `row` the merged
    /// result, `tokens` every contributing token.
    Joined {
        /// Row the joined tokens all share.
        row_id: RowId,
        /// Merged row.
        row: RowData,
        /// Every token that contributed to the join.
        tokens: Vec<TokenId>,
    },
    /// A second arrival landed for a key whose join already fired. The
    /// arriving token itself is the only one affected.
    LateArrival {
        /// The late-arriving token.
        token_id: TokenId,
    },
    /// The join closed without being satisfied: a timeout or end-of-source
    /// flush for a policy that never reached completion, or a `select`
    /// merge whose configured branch never arrived.
    Failed {
        /// Every token the unresolved join was holding.
        tokens: Vec<TokenId>,
        /// Short machine-readable cause, e.g. `"coalesce_timeout"`,
        /// `"missing_branches"`, `"select_branch_missing"`.
        reason: &'static str,
    },
}

/// Executes one coalesce node's join policy over its incoming branches.
///
/// Completed join keys are remembered in a FIFO-bounded set so a
/// late-arriving duplicate for an already-completed key is recognized and
/// reported as a failure rather than silently starting a new, orphaned
/// join.
pub struct CoalesceExecutor {
    policy: CoalescePolicy,
    merge_strategy: CoalesceMergeStrategy,
    declared_branches: Vec<String>,
    select_branch: Option<String>,
    timeout: Option<Duration>,
    pending: HashMap<String, PendingJoin>,
    completed_keys: HashMap<String, ()>,
    completed_order: VecDeque<String>,
    completed_capacity: usize,
}

/// Default cap on remembered completed join keys before the oldest is
/// evicted to bound memory on long-running sources.
pub const DEFAULT_COMPLETED_CAPACITY: usize = 10_000;

impl CoalesceExecutor {
    /// Creates an executor for one coalesce node. `select_branch` is only
    /// meaningful (and should be `Some`) when `merge_strategy` is
    /// [`CoalesceMergeStrategy::Select`]; `timeout` bounds how long a join
    /// may sit pending before [`Self::admit`] or [`Self::flush_pending`]
    /// force it closed.
    #[must_use]
    pub fn new(
        policy: CoalescePolicy,
        merge_strategy: CoalesceMergeStrategy,
        declared_branches: Vec<String>,
        select_branch: Option<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            policy,
            merge_strategy,
            declared_branches,
            select_branch,
            timeout,
            pending: HashMap::new(),
            completed_keys: HashMap::new(),
            completed_order: VecDeque::new(),
            completed_capacity: DEFAULT_COMPLETED_CAPACITY,
        }
    }

    /// True if any join is currently buffered, awaiting more branches.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Admits one branch's row into the join for `join_key`. Timeouts for
    /// every *other* pending key are swept first, so a slow source can
    /// still surface a stalled sibling join's failure promptly rather than
    /// only at end-of-source.
    pub fn admit(
        &mut self,
        join_key: &str,
        row_id: RowId,
        branch_name: &str,
        token_id: TokenId,
        row: RowData,
    ) -> Vec<(String, CoalesceOutcome)> {
        let mut results = self.expire_timed_out(join_key);

        if self.completed_keys.contains_key(join_key) {
            results.push((join_key.to_string(), CoalesceOutcome::LateArrival { token_id }));
            return results;
        }

        let entry = self.pending.entry(join_key.to_string()).or_insert_with(|| PendingJoin {
            row_id,
            tokens: Vec::new(),
            rows: HashMap::new(),
            started_at: Instant::now(),
        });
        entry.tokens.push(token_id);
        entry.rows.insert(branch_name.to_string(), row);

        let satisfied = match self.policy {
            CoalescePolicy::RequireAll => self.declared_branches.iter().all(|b| entry.rows.contains_key(b)),
            CoalescePolicy::First => true,
            CoalescePolicy::Quorum(n) => entry.rows.len() >= n,
            CoalescePolicy::BestEffort => entry.rows.len() >= self.declared_branches.len(),
        };

        if !satisfied {
            results.push((join_key.to_string(), CoalesceOutcome::Pending));
            return results;
        }

        let entry = self.pending.remove(join_key).expect("entry inserted above");
        let outcome = self.complete(join_key, entry);
        results.push((join_key.to_string(), outcome));
        results
    }

    /// Forcibly closes out every still-pending join, used at end-of-source:
    /// `BestEffort` joins merge with whatever arrived, every other policy
    /// records a `missing_branches` failure for the branches that never
    /// showed up.
    pub fn flush_pending(&mut self) -> Vec<(String, CoalesceOutcome)> {
        let keys: Vec<String> = self.pending.keys().cloned().collect();
        let mut flushed = Vec::new();
        for key in keys {
            let Some(entry) = self.pending.remove(&key) else {
                continue;
            };
            let outcome = if matches!(self.policy, CoalescePolicy::BestEffort) {
                self.complete(&key, entry)
            } else {
                self.mark_completed(&key);
                CoalesceOutcome::Failed {
                    tokens: entry.tokens,
                    reason: "missing_branches",
                }
            };
            flushed.push((key, outcome));
        }
        flushed
    }

    /// Sweeps every pending key except `exclude_key` for expiry, closing
    /// each one out the same way [`Self::flush_pending`] would.
    fn expire_timed_out(&mut self, exclude_key: &str) -> Vec<(String, CoalesceOutcome)> {
        let Some(timeout) = self.timeout else {
            return Vec::new();
        };
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(key, entry)| key.as_str() != exclude_key && entry.started_at.elapsed() >= timeout)
            .map(|(key, _)| key.clone())
            .collect();

        let mut results = Vec::new();
        for key in expired {
            let Some(entry) = self.pending.remove(&key) else {
                continue;
            };
            let outcome = if matches!(self.policy, CoalescePolicy::BestEffort) {
                self.complete(&key, entry)
            } else {
                self.mark_completed(&key);
                CoalesceOutcome::Failed {
                    tokens: entry.tokens,
                    reason: "coalesce_timeout",
                }
            };
            results.push((key, outcome));
        }
        results
    }

    /// Marks `join_key` completed and merges its buffered rows, producing
    /// `Failed { reason: "select_branch_missing" }` instead of `Joined` if
    /// the merge strategy is `select` and its configured branch never
    /// arrived.
    fn complete(&mut self, join_key: &str, entry: PendingJoin) -> CoalesceOutcome {
        self.mark_completed(join_key);
        match self.merge(entry.rows) {
            Some(row) => CoalesceOutcome::Joined {
                row_id: entry.row_id,
                row,
                tokens: entry.tokens,
            },
            None => CoalesceOutcome::Failed {
                tokens: entry.tokens,
                reason: "select_branch_missing",
            },
        }
    }

    fn mark_completed(&mut self, join_key: &str) {
        self.completed_keys.insert(join_key.to_string(), ());
        self.completed_order.push_back(join_key.to_string());
        while self.completed_order.len() > self.completed_capacity {
            if let Some(evicted) = self.completed_order.pop_front() {
                self.completed_keys.remove(&evicted);
            }
        }
    }

    /// Combines one join's buffered branch rows. Returns `None` only for a
    /// `select` merge whose configured branch never arrived.
    fn merge(&self, rows: HashMap<String, RowData>) -> Option<RowData> {
        match self.merge_strategy {
            CoalesceMergeStrategy::Union => {
                let mut merged = Map::new();
                for branch in &self.declared_branches {
                    if let Some(row) = rows.get(branch) {
                        for (key, value) in row {
                            merged.insert(key.clone(), value.clone());
                        }
                    }
                }
                for (branch, row) in &rows {
                    if !self.declared_branches.contains(branch) {
                        for (key, value) in row {
                            merged.entry(key.clone()).or_insert_with(|| value.clone());
                        }
                    }
                }
                Some(merged)
            }
            CoalesceMergeStrategy::Nested => {
                let mut merged = Map::new();
                for (branch, row) in rows {
                    merged.insert(branch, Value::Object(row));
                }
                Some(merged)
            }
            CoalesceMergeStrategy::Select => {
                let branch = self.select_branch.as_deref()?;
                rows.get(branch).cloned()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(obj: Value) -> RowData {
        obj.as_object().cloned().unwrap()
    }

    fn tid(n: u64) -> TokenId {
        TokenId::from_raw(n).expect("non-zero")
    }

    fn rid(n: u64) -> RowId {
        RowId::from_raw(n).expect("non-zero")
    }

    fn only<'a>(outcomes: &'a [(String, CoalesceOutcome)], key: &str) -> &'a CoalesceOutcome {
        &outcomes.iter().find(|(k, _)| k == key).expect("key present").1
    }

    #[test]
    fn require_all_waits_for_every_declared_branch() {
        let mut exec = CoalesceExecutor::new(
            CoalescePolicy::RequireAll,
            CoalesceMergeStrategy::Union,
            vec!["a".to_string(), "b".to_string()],
            None,
            None,
        );
        let first = exec.admit("k1", rid(1), "a", tid(1), row(json!({"x": 1})));
        assert!(matches!(only(&first, "k1"), CoalesceOutcome::Pending));

        let second = exec.admit("k1", rid(1), "b", tid(2), row(json!({"y": 2})));
        let CoalesceOutcome::Joined { row, tokens, .. } = &only(&second, "k1") else {
            panic!("expected join to fire once both branches arrived");
        };
        assert_eq!(row.get("x"), Some(&json!(1)));
        assert_eq!(row.get("y"), Some(&json!(2)));
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn first_fires_immediately_and_records_late_arrival_as_failure() {
        let mut exec = CoalesceExecutor::new(
            CoalescePolicy::First,
            CoalesceMergeStrategy::Select,
            vec!["a".to_string(), "b".to_string()],
            Some("a".to_string()),
            None,
        );
        let first = exec.admit("k1", rid(1), "a", tid(1), row(json!({"x": 1})));
        assert!(matches!(only(&first, "k1"), CoalesceOutcome::Joined { .. }));

        let late = exec.admit("k1", rid(1), "b", tid(2), row(json!({"y": 2})));
        match only(&late, "k1") {
            CoalesceOutcome::LateArrival { token_id } => assert_eq!(*token_id, tid(2)),
            other => panic!("expected late arrival, got {other:?}"),
        }
    }

    #[test]
    fn quorum_fires_once_threshold_reached() {
        let mut exec = CoalesceExecutor::new(
            CoalescePolicy::Quorum(2),
            CoalesceMergeStrategy::Union,
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            None,
            None,
        );
        let first = exec.admit("k1", rid(1), "a", tid(1), row(json!({})));
        assert!(matches!(only(&first, "k1"), CoalesceOutcome::Pending));
        let second = exec.admit("k1", rid(1), "b", tid(2), row(json!({})));
        assert!(matches!(only(&second, "k1"), CoalesceOutcome::Joined { .. }));
    }

    #[test]
    fn nested_merge_keys_by_branch_name() {
        let mut exec = CoalesceExecutor::new(
            CoalescePolicy::RequireAll,
            CoalesceMergeStrategy::Nested,
            vec!["a".to_string(), "b".to_string()],
            None,
            None,
        );
        exec.admit("k1", rid(1), "a", tid(1), row(json!({"x": 1})));
        let joined = exec.admit("k1", rid(1), "b", tid(2), row(json!({"y": 2})));
        let CoalesceOutcome::Joined { row, .. } = only(&joined, "k1") else {
            panic!("expected join to complete");
        };
        assert_eq!(row.get("a"), Some(&json!({"x": 1})));
        assert_eq!(row.get("b"), Some(&json!({"y": 2})));
    }

    #[test]
    fn select_merge_fails_when_configured_branch_never_arrives() {
        let mut exec = CoalesceExecutor::new(
            CoalescePolicy::RequireAll,
            CoalesceMergeStrategy::Select,
            vec!["a".to_string(), "b".to_string()],
            Some("b".to_string()),
            None,
        );
        exec.admit("k1", rid(1), "a", tid(1), row(json!({"x": 1})));
        let joined = exec.admit("k1", rid(1), "b", tid(2), row(json!({"y": 2})));
        let CoalesceOutcome::Joined { row, .. } = only(&joined, "k1") else {
            panic!("expected join to complete once branch b arrives");
        };
        assert_eq!(row.get("y"), Some(&json!(2)));

        let mut missing_select = CoalesceExecutor::new(
            CoalescePolicy::RequireAll,
            CoalesceMergeStrategy::Select,
            vec!["a".to_string(), "b".to_string()],
            Some("c".to_string()),
            None,
        );
        missing_select.admit("k2", rid(2), "a", tid(3), row(json!({"x": 1})));
        let failed = missing_select.admit("k2", rid(2), "b", tid(4), row(json!({"y": 2})));
        match only(&failed, "k2") {
            CoalesceOutcome::Failed { reason, tokens } => {
                assert_eq!(*reason, "select_branch_missing");
                assert_eq!(tokens.len(), 2);
            }
            other => panic!("expected select_branch_missing failure, got {other:?}"),
        }
    }

    #[test]
    fn flush_pending_merges_best_effort_and_fails_require_all() {
        let mut best_effort = CoalesceExecutor::new(
            CoalescePolicy::BestEffort,
            CoalesceMergeStrategy::Union,
            vec!["a".to_string(), "b".to_string()],
            None,
            None,
        );
        best_effort.admit("k1", rid(1), "a", tid(1), row(json!({"x": 1})));
        let flushed = best_effort.flush_pending();
        assert_eq!(flushed.len(), 1);
        assert!(matches!(flushed[0].1, CoalesceOutcome::Joined { .. }));

        let mut require_all = CoalesceExecutor::new(
            CoalescePolicy::RequireAll,
            CoalesceMergeStrategy::Union,
            vec!["a".to_string(), "b".to_string()],
            None,
            None,
        );
        require_all.admit("k1", rid(1), "a", tid(1), row(json!({"x": 1})));
        let flushed = require_all.flush_pending();
        assert_eq!(flushed.len(), 1);
        match &flushed[0].1 {
            CoalesceOutcome::Failed { reason, tokens } => {
                assert_eq!(*reason, "missing_branches");
                assert_eq!(tokens.len(), 1);
            }
            other => panic!("expected missing_branches failure, got {other:?}"),
        }
    }

    #[test]
    fn timeout_closes_a_stalled_join_on_a_later_arrival() {
        let mut exec = CoalesceExecutor::new(
            CoalescePolicy::RequireAll,
            CoalesceMergeStrategy::Union,
            vec!["a".to_string(), "b".to_string()],
            None,
            Some(Duration::from_millis(0)),
        );
        exec.admit("k1", rid(1), "a", tid(1), row(json!({"x": 1})));
        std::thread::sleep(Duration::from_millis(5));
        let arrival = exec.admit("k2", rid(2), "a", tid(2), row(json!({"x": 2})));
        match only(&arrival, "k1") {
            CoalesceOutcome::Failed { reason, tokens } => {
                assert_eq!(*reason, "coalesce_timeout");
                assert_eq!(tokens.len(), 1);
            }
            other => panic!("expected k1 to time out, got {other:?}"),
        }
        assert!(matches!(only(&arrival, "k2"), CoalesceOutcome::Pending));
    }

    #[test]
    fn late_arrival_after_completion_is_reported_not_dropped() {
        let mut exec = CoalesceExecutor::new(
            CoalescePolicy::RequireAll,
            CoalesceMergeStrategy::Union,
            vec!["a".to_string(), "b".to_string()],
            None,
            None,
        );
        exec.admit("k1", rid(1), "a", tid(1), row(json!({})));
        exec.admit("k1", rid(1), "b", tid(2), row(json!({})));
        let late = exec.admit("k1", rid(1), "a", tid(3), row(json!({})));
        match only(&late, "k1") {
            CoalesceOutcome::LateArrival { token_id } => assert_eq!(*token_id, tid(3)),
            other => panic!("expected late arrival, got {other:?}"),
        }
    }
}
