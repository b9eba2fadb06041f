// crates/elspeth-core/src/runtime/token_manager.rs
// ============================================================================
// Module: Token Manager
// Description: Token lifecycle: allocation for new rows, forking for gate
//              multi-route, expansion for aggregation flush.
// Purpose: Central place that decides parent/branch linkage; the recorder
//          only persists what this module decides.
// Dependencies: crate::core, crate::runtime::audit
// ============================================================================

use crate::core::RowId;
use crate::core::Token;
use crate::core::TokenId;
use crate::core::Timestamp;
use crate::runtime::audit::AuditRecorder;
use crate::runtime::audit::RecorderError;

/// Drives token allocation through the [`AuditRecorder`]. Holds no state of
/// its own beyond what the recorder already tracks; it exists to give
/// allocation/fork/expansion one well-named call site instead of scattering
/// `create_token` calls with ad hoc parent/branch arguments through the row
/// processor.
#[derive(Debug, Default)]
pub struct TokenManager;

impl TokenManager {
    /// Creates a token manager.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Allocates the root token for a freshly read row.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the token record cannot be written.
    pub fn allocate(
        &self,
        recorder: &mut dyn AuditRecorder,
        row_id: RowId,
    ) -> Result<TokenId, RecorderError> {
        recorder.create_token(row_id, None, None)
    }

    /// Forks a child token onto a named branch from a gate decision.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the token record cannot be written.
    pub fn fork(
        &self,
        recorder: &mut dyn AuditRecorder,
        parent: &Token,
        branch_name: &str,
    ) -> Result<TokenId, RecorderError> {
        recorder.create_token(parent.row_id, Some(parent.token_id), Some(branch_name))
    }

    /// Expands a child token produced by an aggregation flush. Expanded
    /// tokens carry no branch name: they are siblings of one flush, not
    /// branches of a route.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the token record cannot be written.
    pub fn expand(
        &self,
        recorder: &mut dyn AuditRecorder,
        parent: &Token,
    ) -> Result<TokenId, RecorderError> {
        recorder.create_token(parent.row_id, Some(parent.token_id), None)
    }

    /// Merges a set of coalesced tokens into one successor token. The
    /// convention is the same as expansion: the first branch's row carries
    /// the parent linkage, since a coalesced token has multiple logical
    /// parents but the schema only models one.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the token record cannot be written.
    pub fn coalesce(
        &self,
        recorder: &mut dyn AuditRecorder,
        primary_parent: &Token,
    ) -> Result<TokenId, RecorderError> {
        recorder.create_token(primary_parent.row_id, Some(primary_parent.token_id), None)
    }

    /// Builds the in-memory [`Token`] value for an identifier just
    /// allocated through the recorder. The recorder is the source of truth
    /// for `created_at`; callers that need the exact persisted timestamp
    /// should re-read it, this is for immediate in-flight use only.
    #[must_use]
    pub fn describe(
        token_id: TokenId,
        row_id: RowId,
        parent_token_id: Option<TokenId>,
        branch_name: Option<&str>,
        now: Timestamp,
    ) -> Token {
        Token {
            token_id,
            row_id,
            parent_token_id,
            branch_name: branch_name.map(str::to_string),
            created_at: now,
        }
    }
}
