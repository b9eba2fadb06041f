// crates/elspeth-core/src/core/identifiers.rs
// ============================================================================
// Module: Elspeth Identifiers
// Description: Canonical opaque identifiers for runs, nodes, edges, and tokens.
// Purpose: Provide strongly typed, serializable identifiers with stable wire forms.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Identifiers are opaque and serialize as numbers or strings on the wire.
//! Numeric identifiers enforce non-zero, 1-based invariants at construction
//! boundaries. `NodeId`, `EdgeId`, `RowId`, `TokenId`, and `StateId` are only
//! meaningful in combination with the `RunId` that scopes them: a node_id may
//! be reused across runs, so every join on these identifiers elsewhere in the
//! crate is run-scoped.

use std::fmt;
use std::num::NonZeroU64;

use serde::Deserialize;
use serde::Serialize;

/// Run identifier. Opaque string, typically a UUID, assigned at `begin_run`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Creates a new run identifier from an owned string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

macro_rules! scoped_numeric_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        ///
        /// # Invariants
        /// - Always >= 1 (non-zero, 1-based).
        /// - Only unique within the `RunId` that scopes it.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(NonZeroU64);

        impl $name {
            /// Creates a new identifier from a non-zero value.
            #[must_use]
            pub const fn new(id: NonZeroU64) -> Self {
                Self(id)
            }

            /// Creates an identifier from a raw value (returns `None` if zero).
            #[must_use]
            pub fn from_raw(raw: u64) -> Option<Self> {
                NonZeroU64::new(raw).map(Self)
            }

            /// Returns the raw identifier value (always >= 1).
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0.get()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.get().fmt(f)
            }
        }
    };
}

scoped_numeric_id!(NodeId, "Node identifier scoped to a run.");
scoped_numeric_id!(EdgeId, "Edge identifier scoped to a run.");
scoped_numeric_id!(RowId, "Row identifier scoped to a run.");
scoped_numeric_id!(TokenId, "Token identifier scoped to a run.");
scoped_numeric_id!(StateId, "Node-state identifier scoped to a run.");
scoped_numeric_id!(CallId, "External-call identifier scoped to a run.");
scoped_numeric_id!(CheckpointId, "Checkpoint identifier scoped to a run.");
scoped_numeric_id!(EventId, "Routing-event identifier scoped to a run.");

/// Identifier shared by a group of routing events emitted as one logical
/// decision (fork, multi-route gate).
///
/// # Invariants
/// - Opaque UTF-8 string; generated fresh for every routing decision group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingGroupId(String);

impl RoutingGroupId {
    /// Creates a new routing-group identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_rejects_zero() {
        assert_eq!(NodeId::from_raw(0), None);
        assert!(NodeId::from_raw(1).is_some());
    }

    #[test]
    fn run_id_display_roundtrips() {
        let id = RunId::new("run-123");
        assert_eq!(id.to_string(), "run-123");
        assert_eq!(id.as_str(), "run-123");
    }

    #[test]
    fn scoped_ids_are_ordered() {
        let a = NodeId::from_raw(1).expect("non-zero");
        let b = NodeId::from_raw(2).expect("non-zero");
        assert!(a < b);
    }
}
