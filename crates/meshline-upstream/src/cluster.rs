//! Cluster composition.
//!
//! A [`Cluster`] binds one immutable [`ClusterInfo`] to one [`PrioritySet`]
//! and one load balancer instance over it. Host membership is mutated in
//! place through the priority set; the cluster value itself is replaced
//! only when its configuration changes.

use std::sync::Arc;
use std::time::Duration;

use meshline_common::{
    ClusterConfig, ClusterType, HostConfig, LbType, Result, TlsConfig,
};
use meshline_metrics::ClusterStats;

use crate::health_check::{create_health_checker, HealthCheckCb, HealthChecker};
use crate::host::Host;
use crate::host_set::PrioritySet;
use crate::load_balancer::{new_load_balancer, LoadBalancer, SubsetLoadBalancer};

/// Immutable per-cluster identity and limits.
#[derive(Debug)]
pub struct ClusterInfo {
    name: String,
    cluster_type: ClusterType,
    lb_type: LbType,
    connect_timeout: Duration,
    max_request_per_conn: u32,
    per_conn_buffer_limit_bytes: u32,
    tls: Option<TlsConfig>,
    stats: Arc<ClusterStats>,
}

impl ClusterInfo {
    pub fn from_config(cfg: &ClusterConfig, stats: Arc<ClusterStats>) -> Arc<ClusterInfo> {
        Arc::new(ClusterInfo {
            name: cfg.name.clone(),
            cluster_type: cfg.cluster_type,
            lb_type: cfg.lb_type.clone(),
            connect_timeout: cfg.connect_timeout(),
            max_request_per_conn: cfg.max_request_per_conn,
            per_conn_buffer_limit_bytes: cfg.per_conn_buffer_limit_bytes,
            tls: cfg.tls_context.clone(),
            stats,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cluster_type(&self) -> ClusterType {
        self.cluster_type
    }

    pub fn lb_type(&self) -> &LbType {
        &self.lb_type
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn max_request_per_conn(&self) -> u32 {
        self.max_request_per_conn
    }

    pub fn per_conn_buffer_limit_bytes(&self) -> u32 {
        self.per_conn_buffer_limit_bytes
    }

    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    pub fn stats(&self) -> &Arc<ClusterStats> {
        &self.stats
    }
}

pub struct Cluster {
    info: Arc<ClusterInfo>,
    priority_set: Arc<PrioritySet>,
    lb: Arc<dyn LoadBalancer>,
    subset_lb: Option<Arc<SubsetLoadBalancer>>,
    health_checker: Option<Arc<HealthChecker>>,
}

impl Cluster {
    /// Builds the cluster from its config, including its hosts at priority
    /// 0. Call [`Cluster::initialize`] afterwards to begin health checking.
    pub fn new(cfg: &ClusterConfig, stats: Arc<ClusterStats>) -> Result<Arc<Cluster>> {
        cfg.validate()?;
        let info = ClusterInfo::from_config(cfg, Arc::clone(&stats));
        let priority_set = PrioritySet::new();

        let (lb, subset_lb): (Arc<dyn LoadBalancer>, Option<Arc<SubsetLoadBalancer>>) =
            match &cfg.lb_subset_config {
                Some(subset_cfg) if !subset_cfg.subset_selectors.is_empty() => {
                    let subset = SubsetLoadBalancer::new(
                        cfg.lb_type.clone(),
                        Arc::clone(&priority_set),
                        subset_cfg,
                    );
                    let lb: Arc<dyn LoadBalancer> = Arc::clone(&subset) as Arc<dyn LoadBalancer>;
                    (lb, Some(subset))
                }
                _ => (
                    Arc::from(new_load_balancer(&cfg.lb_type, Arc::clone(&priority_set))),
                    None,
                ),
            };

        let health_checker = cfg
            .health_check
            .as_ref()
            .map(|hc| create_health_checker(hc, &cfg.name, Arc::clone(&stats)));

        // keep the healthy/total gauge in step with membership changes
        {
            let weak_ps = Arc::downgrade(&priority_set);
            let gauge_stats = Arc::clone(&stats);
            priority_set.add_member_update_cb(Box::new(move |_, _, _| {
                if let Some(ps) = weak_ps.upgrade() {
                    refresh_host_gauge(&ps, &gauge_stats);
                }
            }));
        }

        let cluster = Arc::new(Cluster {
            info: Arc::clone(&info),
            priority_set: Arc::clone(&priority_set),
            lb,
            subset_lb,
            health_checker,
        });

        if !cfg.hosts.is_empty() {
            let hosts = cluster.make_hosts(&cfg.hosts)?;
            cluster.update_hosts(0, hosts);
        }
        Ok(cluster)
    }

    /// Starts background work (active health checking). Separate from
    /// construction so a replacement cluster can be fully built before the
    /// old one is torn down.
    pub fn initialize(&self) {
        if let Some(hc) = &self.health_checker {
            hc.start(&self.priority_set);

            let weak_ps = Arc::downgrade(&self.priority_set);
            let stats = Arc::clone(&self.info.stats);
            hc.add_callback(Arc::new(move |_, _| {
                if let Some(ps) = weak_ps.upgrade() {
                    refresh_host_gauge(&ps, &stats);
                }
            }));
        }
    }

    /// Stops background work. Replaced or removed clusters must be stopped
    /// so their probe tasks do not keep running against stale hosts.
    pub fn stop(&self) {
        if let Some(hc) = &self.health_checker {
            hc.stop();
        }
    }

    pub fn info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }

    pub fn priority_set(&self) -> &Arc<PrioritySet> {
        &self.priority_set
    }

    pub fn load_balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.lb
    }

    pub fn subset_lb(&self) -> Option<&Arc<SubsetLoadBalancer>> {
        self.subset_lb.as_ref()
    }

    pub fn health_checker(&self) -> Option<&Arc<HealthChecker>> {
        self.health_checker.as_ref()
    }

    pub fn add_health_check_callback(&self, cb: HealthCheckCb) -> bool {
        match &self.health_checker {
            Some(hc) => {
                hc.add_callback(cb);
                true
            }
            None => false,
        }
    }

    /// Builds host objects bound to this cluster's info.
    pub fn make_hosts(&self, configs: &[HostConfig]) -> Result<Vec<Arc<Host>>> {
        configs
            .iter()
            .map(|hc| Host::new(hc.clone(), Arc::clone(&self.info)))
            .collect()
    }

    pub fn update_hosts(&self, priority: u32, hosts: Vec<Arc<Host>>) {
        self.priority_set.update_hosts(priority, hosts);
        refresh_host_gauge(&self.priority_set, &self.info.stats);
    }

    pub fn hosts_at(&self, priority: u32) -> Vec<Arc<Host>> {
        self.priority_set.get_or_create_host_set(priority).hosts()
    }
}

fn refresh_host_gauge(priority_set: &PrioritySet, stats: &ClusterStats) {
    let mut healthy = 0u64;
    let mut total = 0u64;
    for host_set in priority_set.host_sets_by_priority() {
        for host in host_set.hosts() {
            total += 1;
            if host.health() {
                healthy += 1;
            }
        }
    }
    stats.set_host_counts(healthy, total);
}
