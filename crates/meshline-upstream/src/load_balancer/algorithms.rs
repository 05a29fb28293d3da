//! Built-in load balancing algorithms.
//!
//! All of them skip unhealthy hosts, return `None` on an empty healthy set
//! without further work, and return a lone healthy host unconditionally.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use meshline_common::LoadBalancerContext;

use super::{eligible_hosts, LoadBalancer};
use crate::host::Host;
use crate::host_set::PrioritySet;

/// Uniform random pick.
pub struct RandomLoadBalancer {
    priority_set: Arc<PrioritySet>,
}

impl RandomLoadBalancer {
    pub fn new(priority_set: Arc<PrioritySet>) -> Self {
        RandomLoadBalancer { priority_set }
    }
}

impl LoadBalancer for RandomLoadBalancer {
    fn choose_host(&self, _ctx: &dyn LoadBalancerContext) -> Option<Arc<Host>> {
        let hosts = eligible_hosts(&self.priority_set);
        match hosts.len() {
            0 => None,
            1 => Some(Arc::clone(&hosts[0])),
            n => {
                let idx = rand::thread_rng().gen_range(0..n);
                Some(Arc::clone(&hosts[idx]))
            }
        }
    }
}

/// Strict rotation over the healthy hosts.
pub struct RoundRobinLoadBalancer {
    priority_set: Arc<PrioritySet>,
    index: AtomicUsize,
}

impl RoundRobinLoadBalancer {
    pub fn new(priority_set: Arc<PrioritySet>) -> Self {
        RoundRobinLoadBalancer {
            priority_set,
            index: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn choose_host(&self, _ctx: &dyn LoadBalancerContext) -> Option<Arc<Host>> {
        let hosts = eligible_hosts(&self.priority_set);
        match hosts.len() {
            0 => None,
            1 => Some(Arc::clone(&hosts[0])),
            n => {
                let idx = self.index.fetch_add(1, Ordering::Relaxed) % n;
                Some(Arc::clone(&hosts[idx]))
            }
        }
    }
}

/// Rotation proportional to host weights. All-zero weights degrade to plain
/// round-robin.
pub struct WeightedRoundRobinLoadBalancer {
    priority_set: Arc<PrioritySet>,
    index: AtomicU64,
}

impl WeightedRoundRobinLoadBalancer {
    pub fn new(priority_set: Arc<PrioritySet>) -> Self {
        WeightedRoundRobinLoadBalancer {
            priority_set,
            index: AtomicU64::new(0),
        }
    }
}

impl LoadBalancer for WeightedRoundRobinLoadBalancer {
    fn choose_host(&self, _ctx: &dyn LoadBalancerContext) -> Option<Arc<Host>> {
        let hosts = eligible_hosts(&self.priority_set);
        match hosts.len() {
            0 => None,
            1 => Some(Arc::clone(&hosts[0])),
            n => {
                let total: u64 = hosts.iter().map(|h| h.weight() as u64).sum();
                let tick = self.index.fetch_add(1, Ordering::Relaxed);
                if total == 0 {
                    return Some(Arc::clone(&hosts[(tick % n as u64) as usize]));
                }
                let mut point = tick % total;
                for host in &hosts {
                    let weight = host.weight() as u64;
                    if point < weight {
                        return Some(Arc::clone(host));
                    }
                    point -= weight;
                }
                // zero-weight tail hosts; rotation lands on the last one
                Some(Arc::clone(&hosts[n - 1]))
            }
        }
    }
}

/// Fewest outstanding streams; ties broken randomly.
pub struct LeastRequestLoadBalancer {
    priority_set: Arc<PrioritySet>,
}

impl LeastRequestLoadBalancer {
    pub fn new(priority_set: Arc<PrioritySet>) -> Self {
        LeastRequestLoadBalancer { priority_set }
    }
}

impl LoadBalancer for LeastRequestLoadBalancer {
    fn choose_host(&self, _ctx: &dyn LoadBalancerContext) -> Option<Arc<Host>> {
        let hosts = eligible_hosts(&self.priority_set);
        match hosts.len() {
            0 => None,
            1 => Some(Arc::clone(&hosts[0])),
            _ => {
                let min = hosts.iter().map(|h| h.active_streams()).min()?;
                let tied: Vec<&Arc<Host>> = hosts
                    .iter()
                    .filter(|h| h.active_streams() == min)
                    .collect();
                let idx = if tied.len() == 1 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..tied.len())
                };
                Some(Arc::clone(tied[idx]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::make_hosts;
    use super::*;
    use meshline_common::{HealthFlag, LbContext};
    use std::collections::HashMap;

    fn priority_set(addrs: &[&str]) -> Arc<PrioritySet> {
        let ps = PrioritySet::new();
        ps.update_hosts(0, make_hosts(addrs));
        ps
    }

    fn count_picks(lb: &dyn LoadBalancer, calls: usize) -> HashMap<String, usize> {
        let ctx = LbContext::new();
        let mut counts = HashMap::new();
        for _ in 0..calls {
            let host = lb.choose_host(&ctx).unwrap();
            *counts.entry(host.address_string().to_string()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_empty_set_returns_none() {
        let ps = PrioritySet::new();
        let ctx = LbContext::new();
        assert!(RandomLoadBalancer::new(Arc::clone(&ps)).choose_host(&ctx).is_none());
        assert!(RoundRobinLoadBalancer::new(Arc::clone(&ps)).choose_host(&ctx).is_none());
        assert!(WeightedRoundRobinLoadBalancer::new(Arc::clone(&ps))
            .choose_host(&ctx)
            .is_none());
        assert!(LeastRequestLoadBalancer::new(ps).choose_host(&ctx).is_none());
    }

    #[test]
    fn test_all_unhealthy_returns_none() {
        let ps = priority_set(&["127.0.0.1:1000", "127.0.0.1:1001"]);
        for host in ps.get_or_create_host_set(0).hosts() {
            host.set_health_flag(HealthFlag::FailedActiveHealthCheck);
        }
        let lb = RoundRobinLoadBalancer::new(ps);
        assert!(lb.choose_host(&LbContext::new()).is_none());
    }

    #[test]
    fn test_single_host_always_chosen() {
        let ps = priority_set(&["127.0.0.1:1000"]);
        let lb = RandomLoadBalancer::new(ps);
        let counts = count_picks(&lb, 50);
        assert_eq!(counts["127.0.0.1:1000"], 50);
    }

    #[test]
    fn test_round_robin_is_fair() {
        let ps = priority_set(&["127.0.0.1:1000", "127.0.0.1:1001", "127.0.0.1:1002"]);
        let lb = RoundRobinLoadBalancer::new(ps);
        let counts = count_picks(&lb, 300);
        assert_eq!(counts["127.0.0.1:1000"], 100);
        assert_eq!(counts["127.0.0.1:1001"], 100);
        assert_eq!(counts["127.0.0.1:1002"], 100);
    }

    #[test]
    fn test_random_is_roughly_uniform() {
        let ps = priority_set(&["127.0.0.1:1000", "127.0.0.1:1001"]);
        let lb = RandomLoadBalancer::new(ps);
        let counts = count_picks(&lb, 1000);
        let a = counts["127.0.0.1:1000"];
        assert!((450..=550).contains(&a), "random split off: {}", a);
    }

    #[test]
    fn test_weighted_round_robin_ratio() {
        let ps = PrioritySet::new();
        let hosts = make_hosts(&["127.0.0.1:1000", "127.0.0.1:1001"]);
        // rebuild with explicit weights 9:1
        let info = Arc::clone(hosts[0].cluster_info());
        let weighted = vec![
            crate::host::Host::new(
                meshline_common::HostConfig::new("127.0.0.1:1000").with_weight(9),
                Arc::clone(&info),
            )
            .unwrap(),
            crate::host::Host::new(
                meshline_common::HostConfig::new("127.0.0.1:1001").with_weight(1),
                Arc::clone(&info),
            )
            .unwrap(),
        ];
        ps.update_hosts(0, weighted);

        let lb = WeightedRoundRobinLoadBalancer::new(ps);
        let counts = count_picks(&lb, 1000);
        assert_eq!(counts["127.0.0.1:1000"], 900);
        assert_eq!(counts["127.0.0.1:1001"], 100);
    }

    #[test]
    fn test_weighted_all_zero_degrades_to_round_robin() {
        let ps = PrioritySet::new();
        let info = super::super::tests::make_hosts(&["127.0.0.1:9"])[0]
            .cluster_info()
            .clone();
        let hosts = vec![
            Host::new(
                meshline_common::HostConfig::new("127.0.0.1:1000").with_weight(0),
                Arc::clone(&info),
            )
            .unwrap(),
            Host::new(
                meshline_common::HostConfig::new("127.0.0.1:1001").with_weight(0),
                Arc::clone(&info),
            )
            .unwrap(),
        ];
        ps.update_hosts(0, hosts);

        let lb = WeightedRoundRobinLoadBalancer::new(ps);
        let counts = count_picks(&lb, 100);
        assert_eq!(counts["127.0.0.1:1000"], 50);
        assert_eq!(counts["127.0.0.1:1001"], 50);
    }

    #[test]
    fn test_least_request_prefers_idle_host() {
        let ps = priority_set(&["127.0.0.1:1000", "127.0.0.1:1001"]);
        let hosts = ps.get_or_create_host_set(0).hosts();
        hosts[0].stream_acquired();
        hosts[0].stream_acquired();

        let lb = LeastRequestLoadBalancer::new(Arc::clone(&ps));
        for _ in 0..20 {
            assert_eq!(
                lb.choose_host(&LbContext::new()).unwrap().address_string(),
                "127.0.0.1:1001"
            );
        }

        // balance the counts: both become eligible again
        hosts[1].stream_acquired();
        hosts[1].stream_acquired();
        let counts = count_picks(&lb, 100);
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn test_unhealthy_host_skipped_and_recovers() {
        let ps = priority_set(&["127.0.0.1:1000", "127.0.0.1:1001"]);
        let hosts = ps.get_or_create_host_set(0).hosts();
        hosts[0].set_health_flag(HealthFlag::FailedActiveHealthCheck);

        let lb = RandomLoadBalancer::new(Arc::clone(&ps));
        let counts = count_picks(&lb, 100);
        assert_eq!(counts["127.0.0.1:1001"], 100);

        hosts[0].clear_health_flag(HealthFlag::FailedActiveHealthCheck);
        let counts = count_picks(&lb, 200);
        assert!(counts.contains_key("127.0.0.1:1000"));
    }
}
