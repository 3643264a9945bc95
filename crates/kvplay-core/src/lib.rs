//! kvplay-core — member configuration and status types.
//!
//! Loads `cluster.toml`, validates the member set before anything is
//! launched, and renders each member's process arguments.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ClusterConfig, InitialClusterState, NodeConfig, parse_duration};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
