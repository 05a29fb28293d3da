// Copyright 2025 Meshline Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::snapshot::{ClusterStatsSnapshot, RegistrySnapshot};

/// Per-cluster counters. All increments are relaxed atomics; readers take a
/// snapshot and accept slight skew between fields.
#[derive(Debug, Default)]
pub struct ClusterStats {
    upstream_requests_total: AtomicU64,
    lb_no_available_host: AtomicU64,
    health_check_failures: AtomicU64,
    health_check_recoveries: AtomicU64,
    pool_connections_created: AtomicU64,
    pool_connect_failures: AtomicU64,
    healthy_hosts: AtomicU64,
    total_hosts: AtomicU64,
}

impl ClusterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.upstream_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_available_host(&self) {
        self.lb_no_available_host.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check_recovery(&self) {
        self.health_check_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_created(&self) {
        self.pool_connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.pool_connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_host_counts(&self, healthy: u64, total: u64) {
        self.healthy_hosts.store(healthy, Ordering::Relaxed);
        self.total_hosts.store(total, Ordering::Relaxed);
    }

    pub fn healthy_hosts(&self) -> u64 {
        self.healthy_hosts.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, cluster: &str) -> ClusterStatsSnapshot {
        ClusterStatsSnapshot {
            cluster: cluster.to_string(),
            upstream_requests_total: self.upstream_requests_total.load(Ordering::Relaxed),
            lb_no_available_host: self.lb_no_available_host.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
            health_check_recoveries: self.health_check_recoveries.load(Ordering::Relaxed),
            pool_connections_created: self.pool_connections_created.load(Ordering::Relaxed),
            pool_connect_failures: self.pool_connect_failures.load(Ordering::Relaxed),
            healthy_hosts: self.healthy_hosts.load(Ordering::Relaxed),
            total_hosts: self.total_hosts.load(Ordering::Relaxed),
        }
    }
}

/// Cluster-name keyed stats storage.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    clusters: RwLock<HashMap<String, Arc<ClusterStats>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stats handle for a cluster, creating it on first use.
    pub fn cluster(&self, name: &str) -> Arc<ClusterStats> {
        if let Some(stats) = self.clusters.read().unwrap().get(name) {
            return Arc::clone(stats);
        }
        let mut clusters = self.clusters.write().unwrap();
        Arc::clone(
            clusters
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ClusterStats::new())),
        )
    }

    /// Drops the stats of a removed cluster. Outstanding handles keep their
    /// counters alive but the registry stops exporting them.
    pub fn remove_cluster(&self, name: &str) {
        self.clusters.write().unwrap().remove(name);
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let clusters = self.clusters.read().unwrap();
        let mut entries: Vec<ClusterStatsSnapshot> = clusters
            .iter()
            .map(|(name, stats)| stats.snapshot(name))
            .collect();
        entries.sort_by(|a, b| a.cluster.cmp(&b.cluster));
        RegistrySnapshot { clusters: entries }
    }
}
