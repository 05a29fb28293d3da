//! Active health checking.
//!
//! One checker per cluster. Each host gets its own probe task; probes for a
//! host are serialized by that task while hosts probe concurrently. A
//! configurable random jitter spreads the first probes out. A probe that
//! exceeds the timeout counts as a failure and fires the session's
//! `on_timeout` hook.
//!
//! Threshold behavior: `unhealthy_threshold` consecutive failures set
//! `FailedActiveHealthCheck` on the host; `healthy_threshold` consecutive
//! successes clear it. Registered callbacks fire on transitions only, never
//! per probe.

pub mod session;

pub use session::{
    register_session_factory, session_factory, HealthCheckSession, HealthCheckSessionFactory,
    TcpDialSession, TcpDialSessionFactory,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use rand::Rng;
use tokio::task::JoinHandle;

use meshline_common::{HealthCheckConfig, HealthFlag};
use meshline_metrics::ClusterStats;

use crate::host::Host;
use crate::host_set::{CallbackId, PrioritySet};

/// Fired with `(host, healthy?)` when a host transitions between healthy
/// and unhealthy.
pub type HealthCheckCb = Arc<dyn Fn(&Arc<Host>, bool) + Send + Sync>;

/// Builds the checker for a cluster's health-check spec, resolving the
/// probe session factory by protocol string. Unknown protocols probe with
/// a plain TCP dial.
pub fn create_health_checker(
    cfg: &HealthCheckConfig,
    cluster_name: &str,
    stats: Arc<ClusterStats>,
) -> Arc<HealthChecker> {
    let factory: Arc<dyn HealthCheckSessionFactory> = match session_factory(&cfg.protocol) {
        Some(factory) => factory,
        None => {
            if cfg.protocol != "tcp" {
                tracing::warn!(
                    cluster = cluster_name,
                    protocol = %cfg.protocol,
                    "no health check session factory registered, using tcp dial"
                );
            }
            Arc::new(TcpDialSessionFactory)
        }
    };
    HealthChecker::new(cfg.clone(), factory, cluster_name, stats)
}

/// Per-session probe bookkeeping, owned by the host's probe task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeState {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug)]
struct SessionState {
    state: ProbeState,
    success_streak: u32,
    failure_streak: u32,
}

impl SessionState {
    fn new() -> SessionState {
        SessionState {
            state: ProbeState::Unknown,
            success_streak: 0,
            failure_streak: 0,
        }
    }
}

pub struct HealthChecker {
    cluster_name: String,
    config: HealthCheckConfig,
    session_factory: Arc<dyn HealthCheckSessionFactory>,
    callbacks: RwLock<Vec<HealthCheckCb>>,
    sessions: Mutex<HashMap<String, JoinHandle<()>>>,
    watched: Mutex<Option<(Arc<PrioritySet>, CallbackId)>>,
    stats: Arc<ClusterStats>,
    weak_self: Weak<HealthChecker>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        session_factory: Arc<dyn HealthCheckSessionFactory>,
        cluster_name: &str,
        stats: Arc<ClusterStats>,
    ) -> Arc<HealthChecker> {
        Arc::new_cyclic(|weak_self| HealthChecker {
            cluster_name: cluster_name.to_string(),
            config,
            session_factory,
            callbacks: RwLock::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
            watched: Mutex::new(None),
            stats,
            weak_self: weak_self.clone(),
        })
    }

    pub fn add_callback(&self, cb: HealthCheckCb) {
        self.callbacks.write().unwrap().push(cb);
    }

    /// Begins probing every host in `priority_set` and follows its
    /// membership changes until [`HealthChecker::stop`].
    pub fn start(&self, priority_set: &Arc<PrioritySet>) {
        {
            let mut watched = self.watched.lock().unwrap();
            if watched.is_some() {
                return;
            }
            let weak = self.weak_self.clone();
            let id = priority_set.add_member_update_cb(Box::new(move |_, added, removed| {
                if let Some(checker) = weak.upgrade() {
                    for host in removed {
                        checker.unwatch_host(host.address_string());
                    }
                    for host in added {
                        checker.watch_host(Arc::clone(host));
                    }
                }
            }));
            *watched = Some((Arc::clone(priority_set), id));
        }
        for host in priority_set.all_hosts() {
            self.watch_host(host);
        }
    }

    /// Cancels every probe task, including in-flight probes.
    pub fn stop(&self) {
        if let Some((priority_set, id)) = self.watched.lock().unwrap().take() {
            priority_set.remove_member_update_cb(id);
        }
        let mut sessions = self.sessions.lock().unwrap();
        for (_, handle) in sessions.drain() {
            handle.abort();
        }
    }

    fn watch_host(&self, host: Arc<Host>) {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(host.address_string()) {
            return;
        }
        let session = self.session_factory.new_session(&self.config, &host);
        let addr = host.address_string().to_string();
        let handle = tokio::spawn(run_session(self.weak_self.clone(), host, session));
        sessions.insert(addr, handle);
    }

    fn unwatch_host(&self, addr: &str) {
        if let Some(handle) = self.sessions.lock().unwrap().remove(addr) {
            // aborting discards any in-flight probe result
            handle.abort();
        }
    }

    /// Applies one probe result to the host, performing threshold-gated
    /// transitions and firing callbacks only when the flag actually flips.
    fn handle_result(&self, host: &Arc<Host>, session: &mut SessionState, probe_ok: bool) {
        if probe_ok {
            session.failure_streak = 0;
            session.success_streak += 1;
            let recovered = match session.state {
                ProbeState::Unknown => true,
                ProbeState::Unhealthy => session.success_streak >= self.config.healthy_threshold,
                ProbeState::Healthy => false,
            };
            if recovered && session.state != ProbeState::Healthy {
                session.state = ProbeState::Healthy;
                let was_flagged = host.contains_health_flag(HealthFlag::FailedActiveHealthCheck);
                host.clear_health_flag(HealthFlag::FailedActiveHealthCheck);
                if was_flagged {
                    self.stats.record_health_check_recovery();
                    tracing::info!(
                        cluster = %self.cluster_name,
                        host = host.address_string(),
                        "host passed active health check, marking healthy"
                    );
                    self.run_callbacks(host, true);
                }
            }
        } else {
            session.success_streak = 0;
            session.failure_streak += 1;
            if session.state != ProbeState::Unhealthy
                && session.failure_streak >= self.config.unhealthy_threshold
            {
                session.state = ProbeState::Unhealthy;
                let was_flagged = host.contains_health_flag(HealthFlag::FailedActiveHealthCheck);
                host.set_health_flag(HealthFlag::FailedActiveHealthCheck);
                if !was_flagged {
                    self.stats.record_health_check_failure();
                    tracing::warn!(
                        cluster = %self.cluster_name,
                        host = host.address_string(),
                        failures = session.failure_streak,
                        "host failed active health check, marking unhealthy"
                    );
                    self.run_callbacks(host, false);
                }
            }
        }
    }

    fn run_callbacks(&self, host: &Arc<Host>, healthy: bool) {
        let callbacks = self.callbacks.read().unwrap();
        for cb in callbacks.iter() {
            cb(host, healthy);
        }
    }
}

async fn run_session(
    checker: Weak<HealthChecker>,
    host: Arc<Host>,
    session: Box<dyn HealthCheckSession>,
) {
    let (interval, probe_timeout, jitter_ms) = match checker.upgrade() {
        Some(c) => (
            c.config.interval(),
            c.config.timeout(),
            c.config.initial_jitter_ms,
        ),
        None => return,
    };

    if jitter_ms > 0 {
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        tokio::time::sleep(std::time::Duration::from_millis(jitter)).await;
    }

    let mut state = SessionState::new();
    loop {
        let probe_ok = match tokio::time::timeout(probe_timeout, session.check_health()).await {
            Ok(ok) => ok,
            Err(_) => {
                session.on_timeout();
                false
            }
        };
        match checker.upgrade() {
            Some(c) => c.handle_result(&host, &mut state, probe_ok),
            None => return,
        }
        tokio::time::sleep(interval).await;
    }
}
