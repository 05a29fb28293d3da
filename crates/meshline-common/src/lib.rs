//! Meshline Common Types
//!
//! Shared building blocks used by every meshline crate:
//!
//! - [`config`] - control-plane facing configuration schema (clusters, hosts,
//!   health checks, load-balancer subsets)
//! - [`context`] - request-scoped context handed from the downstream side to
//!   the upstream core (headers, metadata match criteria, cancellation)
//! - [`error`] - the error taxonomy surfaced by the upstream core
//!
//! The configuration schema is structural: it defines the shape the xDS-style
//! adaptor decodes into, not a wire format. Validation is limited to
//! structural checks (parseable addresses, non-zero thresholds); semantic
//! validation belongs to the control plane.

pub mod config;
pub mod context;
pub mod error;

pub use config::*;
pub use context::*;
pub use error::{Result, UpstreamError};
