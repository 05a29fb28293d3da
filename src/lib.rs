//! Meshline: sidecar proxy data plane building blocks.
//!
//! This facade crate re-exports the workspace members:
//!
//! - [`common`] - configuration schema, request context, error taxonomy
//! - [`metrics`] - per-cluster atomic statistics
//! - [`upstream`] - cluster management, load balancing, health checking,
//!   and connection pooling
//!
//! Most users want [`upstream::ClusterManager`] as the entry point for both
//! the control-plane and request-path sides.

pub use meshline_common as common;
pub use meshline_metrics as metrics;
pub use meshline_upstream as upstream;

pub use meshline_common::{ClusterConfig, HostConfig, LbContext, UpstreamError};
pub use meshline_upstream::{ClusterManager, ClusterSnapshot, Protocol};
