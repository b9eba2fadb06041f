// crates/elspeth-config/src/lib.rs
// ============================================================================
// Crate: elspeth-config
// Description: Declarative TOML pipeline configuration loading and the
//              pure-data execution graph it describes.
// ============================================================================

//! Loads a [`PipelineConfig`] from TOML and turns its declarative node/edge
//! topology into an [`elspeth_core::graph::ExecutionGraph`] via
//! [`elspeth_core::graph::GraphBuilder`]. This crate never constructs a
//! plugin instance: a node's `plugin_name` is a string the caller resolves
//! against its own plugin registry (see the CLI's demo plugin set).

mod config;

pub use config::CheckpointConfig;
pub use config::CoalesceConfig;
pub use config::CoalesceMergeStrategyConfig;
pub use config::CoalescePolicyConfig;
pub use config::ConfigError;
pub use config::EdgeConfig;
pub use config::NodeConfig;
pub use config::PipelineConfig;
pub use config::RetentionConfig;
pub use config::RetryConfig;
pub use config::RouteConfig;
pub use config::RouteResolutionConfig;
pub use config::RunConfig;
pub use config::load;
