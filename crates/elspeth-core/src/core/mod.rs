// crates/elspeth-core/src/core/mod.rs
// ============================================================================
// Module: Core
// Description: Foundational record types, identifiers, hashing, and schema
//              contracts shared by the graph and runtime modules.
// ============================================================================

pub mod errors;
pub mod hashing;
pub mod identifiers;
pub mod records;
pub mod schema;
pub mod time;

pub use errors::BatchPendingError;
pub use errors::GraphValidationError;
pub use errors::GraphValidationWarning;
pub use errors::MaxRetriesExceeded;
pub use errors::RouteValidationError;
pub use errors::WorkQueueOverrunError;
pub use identifiers::CallId;
pub use identifiers::CheckpointId;
pub use identifiers::EdgeId;
pub use identifiers::EventId;
pub use identifiers::NodeId;
pub use identifiers::RoutingGroupId;
pub use identifiers::RowId;
pub use identifiers::RunId;
pub use identifiers::StateId;
pub use identifiers::TokenId;
pub use records::CHECKPOINT_FORMAT_VERSION;
pub use records::CallStatus;
pub use records::Checkpoint;
pub use records::Determinism;
pub use records::Edge;
pub use records::EdgeMode;
pub use records::ExternalCall;
pub use records::Node;
pub use records::NodeState;
pub use records::NodeStateStatus;
pub use records::NodeType;
pub use records::ProgressEvent;
pub use records::Row;
pub use records::Run;
pub use records::RunStatus;
pub use records::Token;
pub use records::TokenOutcome;
pub use schema::CheckpointedContract;
pub use schema::ContractError;
pub use schema::ContractMergeError;
pub use schema::FieldContract;
pub use schema::FieldSource;
pub use schema::FieldType;
pub use schema::SchemaContract;
pub use schema::SchemaMode;
pub use schema::Violation;
pub use time::Timestamp;
