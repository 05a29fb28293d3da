//! Load balancer family.
//!
//! A [`LoadBalancer`] picks one host per request from its bound
//! [`PrioritySet`]. Built-in algorithms cover random, round-robin, weighted
//! round-robin, and least-request; custom kinds register a factory in the
//! process-wide registry and can be referenced from cluster configs by name.
//! An unregistered kind falls back to round-robin.

mod algorithms;
pub mod subset;

pub use algorithms::{
    LeastRequestLoadBalancer, RandomLoadBalancer, RoundRobinLoadBalancer,
    WeightedRoundRobinLoadBalancer,
};
pub use subset::SubsetLoadBalancer;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use meshline_common::{LbType, LoadBalancerContext};

use crate::host::Host;
use crate::host_set::PrioritySet;

pub trait LoadBalancer: Send + Sync {
    /// Picks one host for the request, or `None` if no host is available.
    fn choose_host(&self, ctx: &dyn LoadBalancerContext) -> Option<Arc<Host>>;
}

/// Builds a load balancer over a priority set.
pub type LbFactory = Arc<dyn Fn(Arc<PrioritySet>) -> Box<dyn LoadBalancer> + Send + Sync>;

static LB_REGISTRY: OnceLock<RwLock<HashMap<LbType, LbFactory>>> = OnceLock::new();
static UNKNOWN_KINDS_WARNED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<LbType, LbFactory>> {
    LB_REGISTRY.get_or_init(Default::default)
}

/// Registers a custom load balancer kind. Registering an existing kind
/// replaces its factory; clusters created afterwards pick up the new one.
pub fn register_lb_type<F>(kind: LbType, factory: F)
where
    F: Fn(Arc<PrioritySet>) -> Box<dyn LoadBalancer> + Send + Sync + 'static,
{
    registry()
        .write()
        .unwrap()
        .insert(kind, Arc::new(factory));
}

/// Instantiates the load balancer for `kind` over `priority_set`. Unknown
/// kinds fall back to round-robin, warning once per kind.
pub fn new_load_balancer(kind: &LbType, priority_set: Arc<PrioritySet>) -> Box<dyn LoadBalancer> {
    if let Some(factory) = registry().read().unwrap().get(kind) {
        return factory(priority_set);
    }
    match kind {
        LbType::Random => Box::new(RandomLoadBalancer::new(priority_set)),
        LbType::RoundRobin => Box::new(RoundRobinLoadBalancer::new(priority_set)),
        LbType::WeightedRoundRobin => {
            Box::new(WeightedRoundRobinLoadBalancer::new(priority_set))
        }
        LbType::LeastRequest => Box::new(LeastRequestLoadBalancer::new(priority_set)),
        LbType::Custom(name) => {
            let warned = UNKNOWN_KINDS_WARNED.get_or_init(Default::default);
            if warned.lock().unwrap().insert(name.clone()) {
                tracing::warn!(
                    kind = %name,
                    "unknown load balancer kind, falling back to round robin"
                );
            }
            Box::new(RoundRobinLoadBalancer::new(priority_set))
        }
    }
}

/// Healthy hosts of the preferred (lowest non-empty) priority.
pub(crate) fn eligible_hosts(priority_set: &PrioritySet) -> Vec<Arc<Host>> {
    for host_set in priority_set.host_sets_by_priority() {
        let healthy = host_set.healthy_hosts();
        if !healthy.is_empty() {
            return healthy;
        }
    }
    Vec::new()
}
