//! Metadata subset load balancing.
//!
//! Hosts are partitioned by the value tuples they carry for each configured
//! selector (a set of metadata keys). Every observed tuple gets its own sub
//! host set with its own base load balancer. A request's metadata match
//! criteria select the partition; when nothing matches, the configured
//! fallback policy decides.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use meshline_common::{
    FallbackPolicy, LbSubsetConfig, LbType, LoadBalancerContext, MetadataMatchCriteria,
};

use super::{new_load_balancer, LoadBalancer};
use crate::host::Host;
use crate::host_set::{CallbackId, PrioritySet};

type SubsetKey = Vec<(String, String)>;

struct SubsetEntry {
    priority_set: Arc<PrioritySet>,
    lb: Box<dyn LoadBalancer>,
}

impl SubsetEntry {
    fn new(base_kind: &LbType) -> SubsetEntry {
        let priority_set = PrioritySet::new();
        let lb = new_load_balancer(base_kind, Arc::clone(&priority_set));
        SubsetEntry { priority_set, lb }
    }

    fn host_count(&self) -> usize {
        self.priority_set
            .host_sets_by_priority()
            .iter()
            .map(|hs| hs.len())
            .sum()
    }
}

#[derive(Default)]
struct SubsetIndex {
    subsets: HashMap<SubsetKey, SubsetEntry>,
    default_entry: Option<SubsetEntry>,
}

pub struct SubsetLoadBalancer {
    base_kind: LbType,
    priority_set: Arc<PrioritySet>,
    // each selector kept sorted so criteria keys map to exactly one selector
    selectors: Vec<Vec<String>>,
    fallback_policy: FallbackPolicy,
    default_subset: MetadataMatchCriteria,
    index: RwLock<SubsetIndex>,
    fallback_lb: Box<dyn LoadBalancer>,
    member_cb: Mutex<Option<CallbackId>>,
}

impl SubsetLoadBalancer {
    pub fn new(
        base_kind: LbType,
        priority_set: Arc<PrioritySet>,
        config: &LbSubsetConfig,
    ) -> Arc<SubsetLoadBalancer> {
        let mut selectors: Vec<Vec<String>> = config
            .subset_selectors
            .iter()
            .map(|keys| {
                let mut keys = keys.clone();
                keys.sort();
                keys.dedup();
                keys
            })
            .filter(|keys| !keys.is_empty())
            .collect();
        selectors.dedup();

        let fallback_lb = new_load_balancer(&base_kind, Arc::clone(&priority_set));
        let lb = Arc::new(SubsetLoadBalancer {
            base_kind,
            priority_set: Arc::clone(&priority_set),
            selectors,
            fallback_policy: config.fallback_policy,
            default_subset: config.default_subset.clone(),
            index: RwLock::new(SubsetIndex::default()),
            fallback_lb,
            member_cb: Mutex::new(None),
        });
        lb.rebuild();

        let weak: Weak<SubsetLoadBalancer> = Arc::downgrade(&lb);
        let id = priority_set.add_member_update_cb(Box::new(move |_, _, _| {
            if let Some(lb) = weak.upgrade() {
                lb.rebuild();
            }
        }));
        *lb.member_cb.lock().unwrap() = Some(id);
        lb
    }

    /// Recomputes every subset from the parent priority set.
    fn rebuild(&self) {
        let mut index = SubsetIndex::default();

        for host_set in self.priority_set.host_sets_by_priority() {
            let priority = host_set.priority();
            let hosts = host_set.hosts();

            for selector in &self.selectors {
                let mut grouped: HashMap<SubsetKey, Vec<Arc<Host>>> = HashMap::new();
                for host in &hosts {
                    if let Some(key) = subset_key(selector, host) {
                        grouped.entry(key).or_default().push(Arc::clone(host));
                    }
                }
                for (key, members) in grouped {
                    index
                        .subsets
                        .entry(key)
                        .or_insert_with(|| SubsetEntry::new(&self.base_kind))
                        .priority_set
                        .update_hosts(priority, members);
                }
            }

            if self.fallback_policy == FallbackPolicy::DefaultSubset {
                let members: Vec<Arc<Host>> = hosts
                    .iter()
                    .filter(|h| {
                        self.default_subset
                            .iter()
                            .all(|(k, v)| h.metadata().get(k) == Some(v))
                    })
                    .cloned()
                    .collect();
                if !members.is_empty() {
                    index
                        .default_entry
                        .get_or_insert_with(|| SubsetEntry::new(&self.base_kind))
                        .priority_set
                        .update_hosts(priority, members);
                }
            }
        }

        *self.index.write().unwrap() = index;
    }

    fn fallback(&self, ctx: &dyn LoadBalancerContext) -> Option<Arc<Host>> {
        match self.fallback_policy {
            FallbackPolicy::NoFallback => None,
            FallbackPolicy::AnyEndpoint => self.fallback_lb.choose_host(ctx),
            FallbackPolicy::DefaultSubset => self
                .index
                .read()
                .unwrap()
                .default_entry
                .as_ref()
                .and_then(|entry| entry.lb.choose_host(ctx)),
        }
    }

    /// Number of hosts in the subset the criteria select; 0 when nothing
    /// matches. Used by the cluster snapshot's host-existence query.
    pub fn hosts_for_criteria(&self, criteria: &MetadataMatchCriteria) -> usize {
        let Some(key) = self.matching_key(criteria) else {
            return 0;
        };
        self.index
            .read()
            .unwrap()
            .subsets
            .get(&key)
            .map(|entry| entry.host_count())
            .unwrap_or(0)
    }

    /// The subset key for `criteria` iff its key set equals a configured
    /// selector exactly.
    fn matching_key(&self, criteria: &MetadataMatchCriteria) -> Option<SubsetKey> {
        if criteria.is_empty() {
            return None;
        }
        let matched = self.selectors.iter().any(|selector| {
            selector.len() == criteria.len()
                && selector.iter().all(|k| criteria.contains_key(k))
        });
        if !matched {
            return None;
        }
        Some(
            criteria
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl LoadBalancer for SubsetLoadBalancer {
    fn choose_host(&self, ctx: &dyn LoadBalancerContext) -> Option<Arc<Host>> {
        if let Some(criteria) = ctx.metadata_match_criteria() {
            if let Some(key) = self.matching_key(criteria) {
                let index = self.index.read().unwrap();
                if let Some(entry) = index.subsets.get(&key) {
                    return entry.lb.choose_host(ctx);
                }
            }
        }
        self.fallback(ctx)
    }
}

impl Drop for SubsetLoadBalancer {
    fn drop(&mut self) {
        if let Some(id) = self.member_cb.lock().unwrap().take() {
            self.priority_set.remove_member_update_cb(id);
        }
    }
}

fn subset_key(selector: &[String], host: &Host) -> Option<SubsetKey> {
    let mut key = Vec::with_capacity(selector.len());
    for k in selector {
        let v = host.metadata().get(k)?;
        key.push((k.clone(), v.clone()));
    }
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterInfo;
    use meshline_common::{ClusterConfig, HostConfig, LbContext};
    use meshline_metrics::ClusterStats;

    fn host(addr: &str, name: &str, pairs: &[(&str, &str)]) -> Arc<Host> {
        let info =
            ClusterInfo::from_config(&ClusterConfig::new("test"), Arc::new(ClusterStats::new()));
        let mut config = HostConfig::new(addr).with_hostname(name);
        for (k, v) in pairs {
            config = config.with_metadata(*k, *v);
        }
        Host::new(config, info).unwrap()
    }

    fn example_priority_set() -> Arc<PrioritySet> {
        let ps = PrioritySet::new();
        ps.update_hosts(
            0,
            vec![
                host("127.0.0.1:8080", "e1", &[("version", "1.0"), ("zone", "a")]),
                host("127.0.0.1:8081", "e2", &[("version", "1.0"), ("zone", "b")]),
                host("127.0.0.1:8082", "e3", &[("version", "1.1"), ("zone", "a")]),
                host("127.0.0.1:8083", "e4", &[("version", "1.1"), ("zone", "b")]),
                host("127.0.0.1:8084", "e5", &[("version", "1.0")]),
            ],
        );
        ps
    }

    fn subset_config(policy: FallbackPolicy) -> LbSubsetConfig {
        LbSubsetConfig {
            subset_selectors: vec![vec!["version".into()], vec!["version".into(), "zone".into()]],
            fallback_policy: policy,
            default_subset: [("version".to_string(), "1.0".to_string())].into(),
        }
    }

    fn criteria(pairs: &[(&str, &str)]) -> MetadataMatchCriteria {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_exact_selector_match() {
        let ps = example_priority_set();
        let lb = SubsetLoadBalancer::new(
            LbType::RoundRobin,
            ps,
            &subset_config(FallbackPolicy::NoFallback),
        );

        let ctx = LbContext::new().with_criteria(criteria(&[("version", "1.0")]));
        for _ in 0..30 {
            let picked = lb.choose_host(&ctx).unwrap();
            assert!(matches!(picked.hostname(), "e1" | "e2" | "e5"));
        }

        let ctx = LbContext::new().with_criteria(criteria(&[("version", "1.1"), ("zone", "a")]));
        for _ in 0..10 {
            assert_eq!(lb.choose_host(&ctx).unwrap().hostname(), "e3");
        }
    }

    #[test]
    fn test_no_fallback_returns_none() {
        let ps = example_priority_set();
        let lb = SubsetLoadBalancer::new(
            LbType::RoundRobin,
            ps,
            &subset_config(FallbackPolicy::NoFallback),
        );
        let ctx = LbContext::new().with_criteria(criteria(&[("version", "9.9")]));
        assert!(lb.choose_host(&ctx).is_none());

        // criteria keys not matching any selector
        let ctx = LbContext::new().with_criteria(criteria(&[("stage", "canary")]));
        assert!(lb.choose_host(&ctx).is_none());

        // no criteria at all
        assert!(lb.choose_host(&LbContext::new()).is_none());
    }

    #[test]
    fn test_any_endpoint_fallback() {
        let ps = example_priority_set();
        let lb = SubsetLoadBalancer::new(
            LbType::RoundRobin,
            ps,
            &subset_config(FallbackPolicy::AnyEndpoint),
        );
        let ctx = LbContext::new().with_criteria(criteria(&[("stage", "canary")]));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            seen.insert(lb.choose_host(&ctx).unwrap().hostname().to_string());
        }
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn test_default_subset_fallback() {
        let ps = example_priority_set();
        let lb = SubsetLoadBalancer::new(
            LbType::RoundRobin,
            ps,
            &subset_config(FallbackPolicy::DefaultSubset),
        );
        let ctx = LbContext::new().with_criteria(criteria(&[("stage", "canary")]));
        for _ in 0..30 {
            let picked = lb.choose_host(&ctx).unwrap();
            assert!(matches!(picked.hostname(), "e1" | "e2" | "e5"));
        }
    }

    #[test]
    fn test_rebuild_on_membership_change() {
        let ps = example_priority_set();
        let lb = SubsetLoadBalancer::new(
            LbType::RoundRobin,
            Arc::clone(&ps),
            &subset_config(FallbackPolicy::NoFallback),
        );

        let ctx = LbContext::new().with_criteria(criteria(&[("version", "1.1"), ("zone", "a")]));
        assert_eq!(lb.choose_host(&ctx).unwrap().hostname(), "e3");

        // drop e3; the (1.1, a) subset disappears
        ps.update_hosts(
            0,
            vec![
                host("127.0.0.1:8080", "e1", &[("version", "1.0"), ("zone", "a")]),
                host("127.0.0.1:8083", "e4", &[("version", "1.1"), ("zone", "b")]),
            ],
        );
        assert!(lb.choose_host(&ctx).is_none());

        let ctx = LbContext::new().with_criteria(criteria(&[("version", "1.0")]));
        assert_eq!(lb.choose_host(&ctx).unwrap().hostname(), "e1");
    }

    #[test]
    fn test_hosts_for_criteria_counts() {
        let ps = example_priority_set();
        let lb = SubsetLoadBalancer::new(
            LbType::RoundRobin,
            ps,
            &subset_config(FallbackPolicy::NoFallback),
        );
        assert_eq!(lb.hosts_for_criteria(&criteria(&[("version", "1.0")])), 3);
        assert_eq!(
            lb.hosts_for_criteria(&criteria(&[("version", "1.1"), ("zone", "b")])),
            1
        );
        assert_eq!(lb.hosts_for_criteria(&criteria(&[("version", "9.9")])), 0);
        assert_eq!(lb.hosts_for_criteria(&criteria(&[("stage", "canary")])), 0);
    }

    #[test]
    fn test_unhealthy_subset_member_skipped() {
        use meshline_common::HealthFlag;

        let ps = example_priority_set();
        let hosts = ps.get_or_create_host_set(0).hosts();
        let lb = SubsetLoadBalancer::new(
            LbType::RoundRobin,
            ps,
            &subset_config(FallbackPolicy::NoFallback),
        );

        // flag e1; the version=1.0 subset still serves from e2/e5
        hosts[0].set_health_flag(HealthFlag::FailedActiveHealthCheck);
        let ctx = LbContext::new().with_criteria(criteria(&[("version", "1.0")]));
        for _ in 0..30 {
            let picked = lb.choose_host(&ctx).unwrap();
            assert!(matches!(picked.hostname(), "e2" | "e5"));
        }
    }

    #[test]
    fn test_callback_deregistered_on_drop() {
        let ps = example_priority_set();
        let lb = SubsetLoadBalancer::new(
            LbType::RoundRobin,
            Arc::clone(&ps),
            &subset_config(FallbackPolicy::NoFallback),
        );
        drop(lb);
        // replacement after drop must not fire into a dead subset index
        ps.update_hosts(0, vec![host("127.0.0.1:9000", "e9", &[("version", "2.0")])]);
    }
}
