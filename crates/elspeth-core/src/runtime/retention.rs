// crates/elspeth-core/src/runtime/retention.rs
// ============================================================================
// Module: Retention / Purge
// Description: Finds payload-store blobs safe to delete once every run
//              that references them has aged out of its retention window,
//              and drives the actual deletes.
// Purpose: Bound payload-store growth without ever deleting a blob a
//          still-relevant run might need to resume or re-audit.
// Dependencies: crate::runtime::audit
// ============================================================================

//! ## Overview
//! Content-addressing means one blob may be referenced by many runs.
//! [`find_expired_payload_refs`] only returns a ref once every run that
//! references it has completed and aged past `retention_days`; a still-
//! running or still-fresh run keeps every blob it touches alive, even ones
//! shared with an otherwise-expired run. [`purge_payloads`] then deletes
//! each returned ref from the payload store, tolerating refs already gone
//! and never touching the audit database's own hashes.

use std::collections::HashSet;

use crate::core::Timestamp;
use crate::runtime::audit::PayloadStore;
use crate::runtime::audit::RecorderError;
use crate::runtime::audit::RunRefs;

const SECONDS_PER_DAY: i64 = 86_400;

/// Outcome of a [`purge_payloads`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PurgeResult {
    /// Number of refs actually deleted.
    pub deleted_count: u64,
    /// Total bytes freed across deleted refs.
    pub bytes_freed: u64,
    /// Refs that were already absent; not counted as failures.
    pub skipped_count: u64,
    /// Refs that existed but whose delete call returned `false`.
    pub failed_refs: Vec<String>,
    /// Wall-clock time the sweep took.
    pub duration_seconds: f64,
}

/// Finds every payload-store ref eligible for deletion: referenced only by
/// runs that completed before `retention_days` ago (relative to `as_of`,
/// or [`Timestamp::now`] if absent), and not also referenced by any run
/// still running or still within its own retention window.
#[must_use]
pub fn find_expired_payload_refs(snapshot: &[RunRefs], retention_days: i64, as_of: Option<Timestamp>) -> HashSet<String> {
    let cutoff = as_of.unwrap_or_else(Timestamp::now).unix_seconds() - retention_days * SECONDS_PER_DAY;

    let mut live_refs: HashSet<String> = HashSet::new();
    let mut expired_refs: HashSet<String> = HashSet::new();
    for run in snapshot {
        let is_expired = run.completed_at.is_some_and(|t| t.unix_seconds() <= cutoff);
        if is_expired {
            expired_refs.extend(run.refs.iter().cloned());
        } else {
            live_refs.extend(run.refs.iter().cloned());
        }
    }
    expired_refs.difference(&live_refs).cloned().collect()
}

/// Deletes every ref in `refs` from `store`. A ref already absent is
/// counted as skipped, not failed; a ref that exists but whose delete call
/// returns `false` is recorded as failed. Never modifies the audit
/// database.
///
/// # Errors
///
/// Returns [`RecorderError`] only if the store itself errors, not for a
/// missing or undeleteable ref, both of which are reported in the result.
pub fn purge_payloads(store: &mut impl PayloadStore, refs: &HashSet<String>) -> Result<PurgeResult, RecorderError> {
    let started = Timestamp::now();
    let mut result = PurgeResult::default();
    for reference in refs {
        if !store.exists(reference)? {
            result.skipped_count += 1;
            continue;
        }
        let bytes_freed = store.retrieve(reference).map(|bytes| bytes.len() as u64).unwrap_or(0);
        if store.delete(reference)? {
            result.deleted_count += 1;
            result.bytes_freed += bytes_freed;
        } else {
            result.failed_refs.push(reference.clone());
        }
    }
    result.duration_seconds = (Timestamp::now().unix_seconds() - started.unix_seconds()) as f64;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunId;

    fn refs(run_id: &str, completed_at: Option<Timestamp>, refs: &[&str]) -> RunRefs {
        RunRefs {
            run_id: RunId::from(run_id),
            completed_at,
            refs: refs.iter().map(|r| (*r).to_string()).collect(),
        }
    }

    #[test]
    fn shared_ref_survives_until_every_referencing_run_expires() {
        let now = Timestamp::now();
        let long_ago = Timestamp::from_offset(now.as_offset() - time::Duration::days(400));

        let snapshot = vec![
            refs("old-run", Some(long_ago), &["shared-ref", "old-only-ref"]),
            refs("fresh-run", Some(now), &["shared-ref"]),
        ];

        let expired = find_expired_payload_refs(&snapshot, 30, Some(now));
        assert!(expired.contains("old-only-ref"));
        assert!(!expired.contains("shared-ref"), "still referenced by a fresh run");
    }

    #[test]
    fn running_run_keeps_its_refs_alive_regardless_of_age() {
        let now = Timestamp::now();
        let long_ago = Timestamp::from_offset(now.as_offset() - time::Duration::days(400));

        let snapshot = vec![refs("still-running", None, &["ref-a"])];
        let expired = find_expired_payload_refs(&snapshot, 30, Some(now));
        assert!(expired.is_empty());

        let snapshot = vec![refs("completed-long-ago", Some(long_ago), &["ref-b"])];
        let expired = find_expired_payload_refs(&snapshot, 30, Some(now));
        assert!(expired.contains("ref-b"));
    }

    #[test]
    fn purge_deletes_existing_refs_and_skips_missing_ones() {
        let mut store = crate::runtime::InMemoryPayloadStore::default();
        let kept_ref = store.store(b"keep me").expect("store kept blob");
        let doomed_ref = store.store(b"delete me").expect("store doomed blob");

        let mut to_purge = HashSet::new();
        to_purge.insert(doomed_ref.clone());
        to_purge.insert("never-existed-ref".to_string());

        let result = purge_payloads(&mut store, &to_purge).expect("purge");
        assert_eq!(result.deleted_count, 1);
        assert_eq!(result.bytes_freed, "delete me".len() as u64);
        assert_eq!(result.skipped_count, 1);
        assert!(result.failed_refs.is_empty());
        assert!(result.duration_seconds >= 0.0);

        assert!(!store.exists(&doomed_ref).expect("exists check"));
        assert!(store.exists(&kept_ref).expect("exists check"));
    }
}
