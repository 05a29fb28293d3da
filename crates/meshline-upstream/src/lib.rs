//! Meshline Upstream Core
//!
//! This crate is the upstream half of the meshline sidecar data plane: the
//! in-memory model of clusters and their hosts, the load balancers that
//! pick a host per request, the per-(protocol, host) connection pools, the
//! active health checker, and the copy-on-write snapshot machinery that
//! lets request handlers read a cluster while the control plane rewrites
//! it.
//!
//! # Architecture
//!
//! The busiest shared state in the proxy lives here, so the design keeps
//! the request path free of long-held locks:
//!
//! 1. **Snapshots over locks**: readers pin a configuration generation
//!    through an RCU cell ([`rcu`]) and read the cluster's priority set,
//!    info, and load balancer from one consistent cluster value.
//! 2. **Shared hosts**: a [`host::Host`] is shared by reference between the
//!    priority set, pools, and the health checker; a health-flag flip is
//!    immediately visible everywhere without replacing any structure.
//! 3. **Lazy pools**: connection pools are created on first use per
//!    (protocol, host address) and reused across requests; cold starts are
//!    absorbed by the manager's bounded retry schedule.
//! 4. **Synchronous membership callbacks**: replacing the hosts of a
//!    priority notifies health checking, subset indices, stat gauges, and
//!    the pool reaper with the `(added, removed)` diff before the mutator
//!    returns.
//!
//! # Request path
//!
//! ```text
//! GetClusterSnapshot -> LoadBalancer::choose_host -> conn_pool_for_cluster
//!                   -> ConnectionPool::new_stream -> StreamEncoder
//! ```
//!
//! # Control plane path
//!
//! The xDS-style adaptor calls [`manager::ClusterManager`] mutators
//! (`add_or_update_primary_cluster`, `update_cluster_hosts`, …). Writes to
//! one cluster are totally ordered by its update mutex; readers never
//! block on them.

pub mod cluster;
pub mod conn_pool;
pub mod health_check;
pub mod host;
pub mod host_set;
pub mod load_balancer;
pub mod manager;
pub mod rcu;

pub use cluster::{Cluster, ClusterInfo};
pub use conn_pool::{
    acquire_stream, pool_factory, register_pool_factory, ConnectionPool, PoolSettings,
    Protocol, StreamEncoder, StreamReceiver, StreamResetReason, TcpConnPool,
};
pub use health_check::{
    create_health_checker, register_session_factory, HealthCheckCb, HealthChecker,
    HealthCheckSession, HealthCheckSessionFactory,
};
pub use host::{CreateConnectionData, Host};
pub use host_set::{CallbackId, HostSet, PrioritySet, MAX_PRIORITY};
pub use load_balancer::{
    new_load_balancer, register_lb_type, LoadBalancer, SubsetLoadBalancer,
};
pub use manager::{ClusterManager, ClusterSnapshot};
