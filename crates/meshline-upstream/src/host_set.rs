//! Host grouping by priority.
//!
//! A [`HostSet`] holds the hosts of one priority; a [`PrioritySet`] holds
//! the dense vector of host sets. Replacing the hosts of a priority fires
//! the registered member-update callbacks synchronously with the
//! `(added, removed)` diff computed by address equality. Callbacks must not
//! block; they are used to refresh health-check sessions, subset indices,
//! and pool eviction.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::host::Host;

/// Highest priority index a cluster may use.
pub const MAX_PRIORITY: u32 = 127;

/// Hosts at one priority.
#[derive(Debug)]
pub struct HostSet {
    priority: u32,
    hosts: RwLock<Vec<Arc<Host>>>,
}

impl HostSet {
    fn new(priority: u32) -> Self {
        HostSet {
            priority,
            hosts: RwLock::new(Vec::new()),
        }
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.read().unwrap().clone()
    }

    /// Hosts whose derived health flag is currently clear.
    pub fn healthy_hosts(&self) -> Vec<Arc<Host>> {
        self.hosts
            .read()
            .unwrap()
            .iter()
            .filter(|h| h.health())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().unwrap().is_empty()
    }

    fn replace(&self, hosts: Vec<Arc<Host>>) {
        *self.hosts.write().unwrap() = hosts;
    }
}

/// Handle for deregistering a member-update callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

pub type MemberUpdateCb = Box<dyn Fn(u32, &[Arc<Host>], &[Arc<Host>]) + Send + Sync>;

/// Dense vector of host sets indexed by priority.
#[derive(Default)]
pub struct PrioritySet {
    host_sets: RwLock<Vec<Arc<HostSet>>>,
    callbacks: RwLock<Vec<(CallbackId, MemberUpdateCb)>>,
    next_cb_id: AtomicU64,
}

impl std::fmt::Debug for PrioritySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrioritySet")
            .field("host_sets", &self.host_sets.read().unwrap().len())
            .field("callbacks", &self.callbacks.read().unwrap().len())
            .finish()
    }
}

impl PrioritySet {
    pub fn new() -> Arc<PrioritySet> {
        Arc::new(PrioritySet::default())
    }

    /// Returns the host set at `priority`, creating empty sets densely up to
    /// it. Priorities beyond [`MAX_PRIORITY`] are a programming error.
    pub fn get_or_create_host_set(&self, priority: u32) -> Arc<HostSet> {
        assert!(priority <= MAX_PRIORITY, "priority out of range");
        {
            let sets = self.host_sets.read().unwrap();
            if let Some(set) = sets.get(priority as usize) {
                return Arc::clone(set);
            }
        }
        let mut sets = self.host_sets.write().unwrap();
        while sets.len() <= priority as usize {
            let next_priority = sets.len() as u32;
            sets.push(Arc::new(HostSet::new(next_priority)));
        }
        Arc::clone(&sets[priority as usize])
    }

    pub fn host_sets_by_priority(&self) -> Vec<Arc<HostSet>> {
        self.host_sets.read().unwrap().clone()
    }

    /// All hosts across priorities, ascending priority order.
    pub fn all_hosts(&self) -> Vec<Arc<Host>> {
        self.host_sets_by_priority()
            .iter()
            .flat_map(|hs| hs.hosts())
            .collect()
    }

    pub fn add_member_update_cb(&self, cb: MemberUpdateCb) -> CallbackId {
        let id = CallbackId(self.next_cb_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.write().unwrap().push((id, cb));
        id
    }

    pub fn remove_member_update_cb(&self, id: CallbackId) {
        self.callbacks.write().unwrap().retain(|(cid, _)| *cid != id);
    }

    /// Replaces the hosts at `priority` and fires member-update callbacks
    /// synchronously with the `(added, removed)` diff by address.
    pub fn update_hosts(&self, priority: u32, hosts: Vec<Arc<Host>>) {
        let host_set = self.get_or_create_host_set(priority);

        let old = host_set.hosts();
        let old_addrs: HashSet<&str> = old.iter().map(|h| h.address_string()).collect();
        let new_addrs: HashSet<&str> = hosts.iter().map(|h| h.address_string()).collect();

        let added: Vec<Arc<Host>> = hosts
            .iter()
            .filter(|h| !old_addrs.contains(h.address_string()))
            .cloned()
            .collect();
        let removed: Vec<Arc<Host>> = old
            .iter()
            .filter(|h| !new_addrs.contains(h.address_string()))
            .cloned()
            .collect();

        host_set.replace(hosts);

        if added.is_empty() && removed.is_empty() {
            return;
        }
        let callbacks = self.callbacks.read().unwrap();
        for (_, cb) in callbacks.iter() {
            cb(priority, &added, &removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterInfo;
    use meshline_common::{ClusterConfig, HostConfig};
    use meshline_metrics::ClusterStats;
    use std::sync::Mutex;

    fn make_hosts(addrs: &[&str]) -> Vec<Arc<Host>> {
        let info =
            ClusterInfo::from_config(&ClusterConfig::new("test"), Arc::new(ClusterStats::new()));
        addrs
            .iter()
            .map(|a| Host::new(HostConfig::new(*a), Arc::clone(&info)).unwrap())
            .collect()
    }

    #[test]
    fn test_dense_priorities() {
        let ps = PrioritySet::new();
        ps.get_or_create_host_set(3);
        let sets = ps.host_sets_by_priority();
        assert_eq!(sets.len(), 4);
        for (i, set) in sets.iter().enumerate() {
            assert_eq!(set.priority(), i as u32);
        }
    }

    #[test]
    #[should_panic(expected = "priority out of range")]
    fn test_priority_cap() {
        let ps = PrioritySet::new();
        ps.get_or_create_host_set(MAX_PRIORITY + 1);
    }

    #[test]
    fn test_update_hosts_replaces_set() {
        let ps = PrioritySet::new();
        ps.update_hosts(0, make_hosts(&["127.0.0.1:1000", "127.0.0.1:1001"]));
        assert_eq!(ps.get_or_create_host_set(0).len(), 2);

        ps.update_hosts(0, make_hosts(&["127.0.0.1:1001"]));
        let hosts = ps.get_or_create_host_set(0).hosts();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].address_string(), "127.0.0.1:1001");
    }

    #[test]
    fn test_healthy_hosts_filters_flagged() {
        use meshline_common::HealthFlag;

        let ps = PrioritySet::new();
        let hosts = make_hosts(&["127.0.0.1:1000", "127.0.0.1:1001"]);
        hosts[0].set_health_flag(HealthFlag::FailedActiveHealthCheck);
        ps.update_hosts(0, hosts);

        let healthy = ps.get_or_create_host_set(0).healthy_hosts();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].address_string(), "127.0.0.1:1001");
    }

    #[test]
    fn test_member_update_callback_diff() {
        let ps = PrioritySet::new();
        let observed: Arc<Mutex<Vec<(Vec<String>, Vec<String>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        ps.add_member_update_cb(Box::new(move |_, added, removed| {
            sink.lock().unwrap().push((
                added.iter().map(|h| h.address_string().to_string()).collect(),
                removed.iter().map(|h| h.address_string().to_string()).collect(),
            ));
        }));

        ps.update_hosts(0, make_hosts(&["127.0.0.1:1000", "127.0.0.1:1001"]));
        ps.update_hosts(0, make_hosts(&["127.0.0.1:1001", "127.0.0.1:1002"]));

        let events = observed.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].0,
            vec!["127.0.0.1:1000".to_string(), "127.0.0.1:1001".to_string()]
        );
        assert!(events[0].1.is_empty());
        assert_eq!(events[1].0, vec!["127.0.0.1:1002".to_string()]);
        assert_eq!(events[1].1, vec!["127.0.0.1:1000".to_string()]);
    }

    #[test]
    fn test_no_callback_on_identical_replacement() {
        let ps = PrioritySet::new();
        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        ps.add_member_update_cb(Box::new(move |_, _, _| {
            *sink.lock().unwrap() += 1;
        }));

        ps.update_hosts(0, make_hosts(&["127.0.0.1:1000"]));
        assert_eq!(*count.lock().unwrap(), 1);
        // same address set again: no membership change, no callback
        ps.update_hosts(0, make_hosts(&["127.0.0.1:1000"]));
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_callback_deregistration() {
        let ps = PrioritySet::new();
        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        let id = ps.add_member_update_cb(Box::new(move |_, _, _| {
            *sink.lock().unwrap() += 1;
        }));

        ps.update_hosts(0, make_hosts(&["127.0.0.1:1000"]));
        ps.remove_member_update_cb(id);
        ps.update_hosts(0, make_hosts(&["127.0.0.1:1001"]));
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
