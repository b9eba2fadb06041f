// crates/elspeth-audit-sqlite/src/lib.rs
// ============================================================================
// Crate: elspeth-audit-sqlite
// Description: SQLite-backed implementation of elspeth_core::runtime::AuditRecorder.
// ============================================================================

//! A durable, file-backed [`AuditRecorder`](elspeth_core::runtime::AuditRecorder)
//! implementation. See [`store`] for the concrete recorder and its schema.

mod store;

pub use store::SqliteAuditRecorder;
pub use store::SqliteStoreError;
