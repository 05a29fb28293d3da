//! Cluster manager: the registry the control plane writes and the request
//! path reads.
//!
//! Hot-path readers take a [`ClusterSnapshot`] (an RCU read ticket plus the
//! current cluster value) and must return it with
//! [`ClusterManager::put_cluster_snapshot`]. Control-plane mutators are
//! serialized per cluster by the primary cluster's update mutex; across
//! clusters no ordering is guaranteed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use meshline_common::{
    ClusterConfig, HostConfig, LoadBalancerContext, MetadataMatchCriteria, Result, UpstreamError,
};
use meshline_metrics::MetricsRegistry;

use crate::cluster::{Cluster, ClusterInfo};
use crate::conn_pool::{pool_factory, ConnectionPool, Protocol};
use crate::health_check::HealthCheckCb;
use crate::host::{CreateConnectionData, Host};
use crate::host_set::{PrioritySet, MAX_PRIORITY};
use crate::load_balancer::LoadBalancer;
use crate::rcu;

/// Host choices attempted before falling back to the wait schedule.
const CYCLE_TIMES: usize = 5;

/// How long a config publish waits for prior snapshot readers to drain
/// before proceeding with a warning.
const CONFIG_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Read-only, time-pinned view of one cluster. The three references are
/// taken from the same cluster value, so they are mutually consistent for
/// the snapshot's whole lifetime.
pub struct ClusterSnapshot {
    cluster: Arc<Cluster>,
    config: rcu::ReadGuard<Arc<ClusterConfig>>,
}

impl ClusterSnapshot {
    pub fn priority_set(&self) -> &Arc<PrioritySet> {
        self.cluster.priority_set()
    }

    pub fn cluster_info(&self) -> &Arc<ClusterInfo> {
        self.cluster.info()
    }

    pub fn load_balancer(&self) -> &Arc<dyn LoadBalancer> {
        self.cluster.load_balancer()
    }

    /// The configuration generation this snapshot pinned.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// With no criteria: true iff any priority has hosts. With criteria:
    /// whether the subset they select is non-empty.
    pub fn is_exists_hosts(&self, criteria: Option<&MetadataMatchCriteria>) -> bool {
        match criteria {
            None => self
                .cluster
                .priority_set()
                .host_sets_by_priority()
                .iter()
                .any(|hs| !hs.is_empty()),
            Some(criteria) => match self.cluster.subset_lb() {
                Some(subset) => subset.hosts_for_criteria(criteria) > 0,
                None => {
                    tracing::error!(
                        cluster = self.cluster.info().name(),
                        "host existence query has criteria but cluster has no subset config"
                    );
                    false
                }
            },
        }
    }
}

/// The authoritative record for one cluster.
struct PrimaryCluster {
    cluster: ArcSwap<Cluster>,
    config_cell: rcu::Value<Arc<ClusterConfig>>,
    config_used: Mutex<Arc<ClusterConfig>>,
    added_via_api: AtomicBool,
    update_lock: Mutex<()>,
}

impl PrimaryCluster {
    fn new(
        cluster: Arc<Cluster>,
        config: ClusterConfig,
        added_via_api: bool,
    ) -> Arc<PrimaryCluster> {
        let config = Arc::new(config);
        Arc::new(PrimaryCluster {
            cluster: ArcSwap::new(cluster),
            config_cell: rcu::Value::new(Arc::clone(&config)),
            config_used: Mutex::new(config),
            added_via_api: AtomicBool::new(added_via_api),
            update_lock: Mutex::new(()),
        })
    }

    fn added_via_api(&self) -> bool {
        self.added_via_api.load(Ordering::Acquire)
    }

    fn current_config(&self) -> Arc<ClusterConfig> {
        Arc::clone(&self.config_used.lock().unwrap())
    }

    fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            cluster: self.cluster.load_full(),
            config: self.config_cell.load(),
        }
    }

    fn publish_config(&self, config: Arc<ClusterConfig>) {
        *self.config_used.lock().unwrap() = Arc::clone(&config);
        let name = config.name.clone();
        if let Err(UpstreamError::RcuBlocked) =
            self.config_cell.update(config, CONFIG_DRAIN_TIMEOUT)
        {
            // readers still pin the prior generation; it is released when
            // the last of them drops its snapshot
            tracing::warn!(
                cluster = %name,
                "snapshot readers did not drain in time, previous config generation lingers"
            );
        }
    }

    /// Swaps in a replacement cluster value. The old value is stopped so
    /// its health-check tasks do not outlive it.
    fn update_cluster(&self, cluster: Arc<Cluster>, config: ClusterConfig, added_via_api: bool) {
        let _guard = self.update_lock.lock().unwrap();
        let old = self.cluster.swap(cluster);
        old.stop();
        self.added_via_api.store(added_via_api, Ordering::Release);
        self.publish_config(Arc::new(config));
    }

    /// Replaces hosts at one priority and rewrites the stored config's host
    /// list from the live hosts, preserving order and metadata.
    fn update_hosts(&self, priority: u32, hosts: Vec<Arc<Host>>) {
        let _guard = self.update_lock.lock().unwrap();
        let cluster = self.cluster.load_full();
        cluster.update_hosts(priority, hosts);

        let mut config = (*self.current_config()).clone();
        config.hosts = cluster
            .priority_set()
            .host_sets_by_priority()
            .iter()
            .flat_map(|hs| hs.hosts())
            .map(|h| h.config())
            .collect();
        self.publish_config(Arc::new(config));
    }
}

pub struct ClusterManager {
    source_addr: Option<SocketAddr>,
    primary_clusters: DashMap<String, Arc<PrimaryCluster>>,
    pools: Arc<DashMap<Protocol, Arc<DashMap<String, Arc<dyn ConnectionPool>>>>>,
    pool_create_lock: Mutex<()>,
    metrics: Arc<MetricsRegistry>,
}

static GLOBAL_INSTANCE: OnceLock<Mutex<Option<Arc<ClusterManager>>>> = OnceLock::new();

fn global_slot() -> &'static Mutex<Option<Arc<ClusterManager>>> {
    GLOBAL_INSTANCE.get_or_init(Default::default)
}

impl ClusterManager {
    pub fn new(source_addr: Option<SocketAddr>) -> Arc<ClusterManager> {
        Arc::new(ClusterManager {
            source_addr,
            primary_clusters: DashMap::new(),
            pools: Arc::new(DashMap::new()),
            pool_create_lock: Mutex::new(()),
            metrics: Arc::new(MetricsRegistry::new()),
        })
    }

    /// Bootstrap constructor: registers the static clusters from the file
    /// config plus their host lists (priority 0). Static clusters reject
    /// later API updates and removal.
    pub fn with_static_config(
        source_addr: Option<SocketAddr>,
        clusters: Vec<ClusterConfig>,
        cluster_hosts: HashMap<String, Vec<HostConfig>>,
    ) -> Arc<ClusterManager> {
        let manager = ClusterManager::new(source_addr);
        for cfg in clusters {
            let name = cfg.name.clone();
            if let Err(e) = manager.load_cluster(cfg, false) {
                tracing::error!(cluster = %name, error = %e, "failed to load static cluster");
            }
        }
        for (name, hosts) in cluster_hosts {
            if let Err(e) = manager.update_cluster_hosts(&name, 0, hosts) {
                tracing::error!(cluster = %name, error = %e, "failed to seed static hosts");
            }
        }
        manager
    }

    /// The process-wide instance. Repeat calls return the existing manager;
    /// calling with a different source address is a wiring bug.
    pub fn global(source_addr: Option<SocketAddr>) -> Arc<ClusterManager> {
        let mut slot = global_slot().lock().unwrap();
        if let Some(existing) = slot.as_ref() {
            if existing.source_addr != source_addr {
                panic!(
                    "cluster manager already initialized with source address {:?}",
                    existing.source_addr
                );
            }
            return Arc::clone(existing);
        }
        let manager = ClusterManager::new(source_addr);
        *slot = Some(Arc::clone(&manager));
        manager
    }

    /// Tears down the process-wide instance. Test seam.
    pub fn destroy_global() {
        if let Some(manager) = global_slot().lock().unwrap().take() {
            manager.shutdown();
        }
    }

    pub fn source_address(&self) -> Option<SocketAddr> {
        self.source_addr
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn cluster_exists(&self, name: &str) -> bool {
        self.primary_clusters.contains_key(name)
    }

    /// Adds a new cluster or replaces an API-added one. Replacing keeps the
    /// live host list; an identical config is a logged no-op.
    pub fn add_or_update_primary_cluster(&self, cfg: ClusterConfig) -> Result<()> {
        cfg.validate()?;
        let name = cfg.name.clone();

        let existing = self
            .primary_clusters
            .get(&name)
            .map(|e| Arc::clone(e.value()));
        let Some(pc) = existing else {
            self.load_cluster(cfg, true)?;
            tracing::info!(cluster = %name, "cluster added");
            return Ok(());
        };

        if !pc.added_via_api() {
            return Err(UpstreamError::ClusterNotUpdatable(name));
        }
        if *pc.current_config() == cfg {
            tracing::debug!(cluster = %name, "duplicate cluster config, nothing to update");
            return Ok(());
        }

        let stats = self.metrics.cluster(&name);
        let new_cluster = Cluster::new(&cfg, stats)?;
        // the live host list wins over whatever the new config carries
        let old_cluster = pc.cluster.load_full();
        for host_set in old_cluster.priority_set().host_sets_by_priority() {
            let configs: Vec<HostConfig> =
                host_set.hosts().iter().map(|h| h.config()).collect();
            let rebuilt = new_cluster.make_hosts(&configs)?;
            new_cluster.update_hosts(host_set.priority(), rebuilt);
        }
        new_cluster.initialize();
        self.register_pool_reaper(&new_cluster);
        pc.update_cluster(new_cluster, cfg, true);
        tracing::info!(cluster = %name, "cluster updated");
        Ok(())
    }

    /// Removes API-added clusters. Static or unknown names produce an error
    /// naming them; the API-added ones in the list are removed regardless.
    pub fn remove_primary_cluster(&self, names: &[&str]) -> Result<()> {
        let mut static_names = Vec::new();
        let mut missing = Vec::new();

        for name in names {
            let entry = self
                .primary_clusters
                .get(*name)
                .map(|e| Arc::clone(e.value()));
            match entry {
                None => missing.push(name.to_string()),
                Some(pc) if !pc.added_via_api() => static_names.push(name.to_string()),
                Some(pc) => {
                    self.primary_clusters.remove(*name);
                    let cluster = pc.cluster.load_full();
                    cluster.stop();
                    for host in cluster.priority_set().all_hosts() {
                        self.drop_pools_for(host.address_string());
                    }
                    self.metrics.remove_cluster(name);
                    tracing::info!(cluster = %name, "cluster removed");
                }
            }
        }

        if !missing.is_empty() {
            return Err(UpstreamError::ClusterNotFound(missing.join(", ")));
        }
        if !static_names.is_empty() {
            return Err(UpstreamError::ClusterNotUpdatable(static_names.join(", ")));
        }
        Ok(())
    }

    /// Attaches a health-transition callback to a live cluster.
    pub fn add_cluster_health_check_callbacks(&self, name: &str, cb: HealthCheckCb) -> bool {
        match self.primary_clusters.get(name) {
            Some(pc) => pc.cluster.load().add_health_check_callback(cb),
            None => false,
        }
    }

    /// Replaces the hosts of `name` at `priority`.
    pub fn update_cluster_hosts(
        &self,
        name: &str,
        priority: u32,
        hosts: Vec<HostConfig>,
    ) -> Result<()> {
        let pc = self.primary(name)?;
        check_priority(priority)?;
        let cluster = pc.cluster.load_full();
        let hosts = cluster.make_hosts(&hosts)?;
        pc.update_hosts(priority, hosts);
        tracing::info!(cluster = %name, priority, "cluster hosts updated");
        Ok(())
    }

    /// Adds hosts to `name` at `priority`, keeping the existing ones.
    pub fn append_cluster_hosts(
        &self,
        name: &str,
        priority: u32,
        hosts: Vec<HostConfig>,
    ) -> Result<()> {
        let pc = self.primary(name)?;
        check_priority(priority)?;
        let cluster = pc.cluster.load_full();
        let mut combined = cluster.hosts_at(priority);
        combined.extend(cluster.make_hosts(&hosts)?);
        pc.update_hosts(priority, combined);
        tracing::info!(cluster = %name, "hosts appended");
        Ok(())
    }

    /// Removes the single host whose address matches, searching every
    /// priority.
    pub fn remove_cluster_host(&self, name: &str, address: &str) -> Result<()> {
        if address.is_empty() {
            return Err(UpstreamError::InvalidConfig(
                "host address is empty".into(),
            ));
        }
        let pc = self.primary(name)?;
        let cluster = pc.cluster.load_full();
        for host_set in cluster.priority_set().host_sets_by_priority() {
            let mut hosts = host_set.hosts();
            if let Some(pos) = hosts.iter().position(|h| h.address_string() == address) {
                hosts.remove(pos);
                pc.update_hosts(host_set.priority(), hosts);
                tracing::info!(cluster = %name, host = %address, "host removed");
                return Ok(());
            }
        }
        Err(UpstreamError::HostNotFound {
            cluster: name.to_string(),
            address: address.to_string(),
        })
    }

    /// Returns a snapshot or `None` for unknown clusters. Must be paired
    /// with [`ClusterManager::put_cluster_snapshot`].
    pub fn get_cluster_snapshot(&self, name: &str) -> Option<ClusterSnapshot> {
        self.primary_clusters.get(name).map(|pc| pc.snapshot())
    }

    /// Returns the snapshot's read ticket.
    pub fn put_cluster_snapshot(&self, snapshot: ClusterSnapshot) {
        drop(snapshot);
    }

    /// Chooses a host through the snapshot's load balancer and returns the
    /// first pool for it that becomes ready. Up to [`CYCLE_TIMES`] choices
    /// are tried immediately; cold pools are then re-polled through an
    /// escalating wait schedule (1, 10, 100, 1000 ms).
    pub async fn conn_pool_for_cluster(
        &self,
        lb_ctx: &dyn LoadBalancerContext,
        snapshot: &ClusterSnapshot,
        protocol: Protocol,
    ) -> Result<Arc<dyn ConnectionPool>> {
        let name = snapshot.cluster_info().name().to_string();
        let stats = Arc::clone(snapshot.cluster_info().stats());
        stats.record_request();
        let ctx = lb_ctx.downstream_context();

        let mut candidates: Vec<Arc<dyn ConnectionPool>> = Vec::with_capacity(CYCLE_TIMES);
        for _ in 0..CYCLE_TIMES {
            if ctx.is_cancelled() {
                return Err(UpstreamError::Canceled);
            }
            let Some(host) = snapshot.load_balancer().choose_host(lb_ctx) else {
                stats.record_no_available_host();
                return Err(UpstreamError::NoHealthyHost(name));
            };
            tracing::debug!(
                cluster = %name,
                host = host.address_string(),
                %protocol,
                "load balancer chose host"
            );
            let pool = self.get_or_create_pool(&host, protocol)?;
            if pool.check_and_init(ctx) {
                return Ok(pool);
            }
            candidates.push(pool);
        }

        // cold start: first request may be waiting on the TCP handshake
        let mut wait = Duration::from_millis(1);
        for _ in 0..4 {
            tokio::time::sleep(wait).await;
            if ctx.is_cancelled() {
                return Err(UpstreamError::Canceled);
            }
            for pool in &candidates {
                if pool.check_and_init(ctx) {
                    return Ok(Arc::clone(pool));
                }
            }
            wait *= 10;
        }

        stats.record_no_available_host();
        Err(UpstreamError::NoHealthyHost(name))
    }

    /// Chooses a host and dials it directly, bypassing the pools.
    pub async fn tcp_conn_for_cluster(
        &self,
        lb_ctx: &dyn LoadBalancerContext,
        snapshot: &ClusterSnapshot,
    ) -> Result<CreateConnectionData> {
        match snapshot.load_balancer().choose_host(lb_ctx) {
            Some(host) => host.create_connection().await,
            None => Err(UpstreamError::NoHealthyHost(
                snapshot.cluster_info().name().to_string(),
            )),
        }
    }

    /// Stops all background work and drops every pool.
    pub fn shutdown(&self) {
        for entry in self.primary_clusters.iter() {
            entry.value().cluster.load().stop();
        }
        for protocol_pools in self.pools.iter() {
            for pool in protocol_pools.value().iter() {
                pool.value().shutdown();
            }
            protocol_pools.value().clear();
        }
    }

    fn load_cluster(&self, cfg: ClusterConfig, added_via_api: bool) -> Result<()> {
        let stats = self.metrics.cluster(&cfg.name);
        let cluster = Cluster::new(&cfg, stats)?;
        cluster.initialize();
        self.register_pool_reaper(&cluster);
        self.primary_clusters
            .insert(cfg.name.clone(), PrimaryCluster::new(cluster, cfg, added_via_api));
        Ok(())
    }

    fn primary(&self, name: &str) -> Result<Arc<PrimaryCluster>> {
        self.primary_clusters
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| UpstreamError::ClusterNotFound(name.to_string()))
    }

    /// Evicts pools whose host address left this cluster. Keyed off the
    /// priority set's removal callbacks so pools do not outlive their host.
    fn register_pool_reaper(&self, cluster: &Arc<Cluster>) {
        let pools = Arc::clone(&self.pools);
        cluster
            .priority_set()
            .add_member_update_cb(Box::new(move |_, _, removed| {
                for host in removed {
                    for protocol_pools in pools.iter() {
                        if let Some((_, pool)) =
                            protocol_pools.value().remove(host.address_string())
                        {
                            pool.shutdown();
                        }
                    }
                }
            }));
    }

    fn drop_pools_for(&self, address: &str) {
        for protocol_pools in self.pools.iter() {
            if let Some((_, pool)) = protocol_pools.value().remove(address) {
                pool.shutdown();
            }
        }
    }

    fn protocol_pools(&self, protocol: Protocol) -> Arc<DashMap<String, Arc<dyn ConnectionPool>>> {
        Arc::clone(
            self.pools
                .entry(protocol)
                .or_insert_with(|| Arc::new(DashMap::new()))
                .value(),
        )
    }

    fn get_or_create_pool(
        &self,
        host: &Arc<Host>,
        protocol: Protocol,
    ) -> Result<Arc<dyn ConnectionPool>> {
        let pools = self.protocol_pools(protocol);
        let address = host.address_string();
        if let Some(pool) = pools.get(address) {
            return Ok(Arc::clone(pool.value()));
        }
        // double-checked: pool creation is rare, contention does not matter
        let _guard = self.pool_create_lock.lock().unwrap();
        if let Some(pool) = pools.get(address) {
            return Ok(Arc::clone(pool.value()));
        }
        let factory = pool_factory(protocol)
            .ok_or_else(|| UpstreamError::PoolFactoryMissing(protocol.to_string()))?;
        let pool = factory(Arc::clone(host));
        pools.insert(address.to_string(), Arc::clone(&pool));
        Ok(pool)
    }
}

fn check_priority(priority: u32) -> Result<()> {
    if priority > MAX_PRIORITY {
        return Err(UpstreamError::InvalidConfig(format!(
            "priority {} out of range",
            priority
        )));
    }
    Ok(())
}
