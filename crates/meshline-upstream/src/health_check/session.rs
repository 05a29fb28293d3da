//! Health check probe sessions.
//!
//! A session knows how to perform one probe against one host. The default
//! session is a plain TCP dial; protocol-specific sessions (RPC ping, HTTP
//! GET) register a factory under their protocol string. Unknown protocols
//! fall back to the TCP dial.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;

use meshline_common::HealthCheckConfig;

use crate::host::Host;

#[async_trait]
pub trait HealthCheckSession: Send + Sync {
    /// Performs one probe. The checker enforces the configured timeout.
    async fn check_health(&self) -> bool;

    /// Called when the probe timed out instead of completing.
    fn on_timeout(&self) {}
}

pub trait HealthCheckSessionFactory: Send + Sync {
    fn new_session(&self, cfg: &HealthCheckConfig, host: &Arc<Host>)
        -> Box<dyn HealthCheckSession>;
}

/// Default probe: the host is healthy if a TCP connect succeeds.
pub struct TcpDialSession {
    addr: SocketAddr,
}

#[async_trait]
impl HealthCheckSession for TcpDialSession {
    async fn check_health(&self) -> bool {
        tokio::net::TcpStream::connect(self.addr).await.is_ok()
    }
}

pub struct TcpDialSessionFactory;

impl HealthCheckSessionFactory for TcpDialSessionFactory {
    fn new_session(
        &self,
        _cfg: &HealthCheckConfig,
        host: &Arc<Host>,
    ) -> Box<dyn HealthCheckSession> {
        Box::new(TcpDialSession {
            addr: host.address(),
        })
    }
}

static SESSION_FACTORIES: OnceLock<RwLock<HashMap<String, Arc<dyn HealthCheckSessionFactory>>>> =
    OnceLock::new();

fn factories() -> &'static RwLock<HashMap<String, Arc<dyn HealthCheckSessionFactory>>> {
    SESSION_FACTORIES.get_or_init(Default::default)
}

pub fn register_session_factory(protocol: &str, factory: Arc<dyn HealthCheckSessionFactory>) {
    factories()
        .write()
        .unwrap()
        .insert(protocol.to_string(), factory);
}

/// Resolves the session factory for a protocol string. `None` means the
/// caller should use the TCP-dial default.
pub fn session_factory(protocol: &str) -> Option<Arc<dyn HealthCheckSessionFactory>> {
    factories().read().unwrap().get(protocol).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterInfo;
    use meshline_common::{ClusterConfig, HostConfig};
    use meshline_metrics::ClusterStats;

    fn test_host(addr: &str) -> Arc<Host> {
        let info =
            ClusterInfo::from_config(&ClusterConfig::new("test"), Arc::new(ClusterStats::new()));
        Host::new(HostConfig::new(addr), info).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_dial_session_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let host = test_host(&addr.to_string());
        let session =
            TcpDialSessionFactory.new_session(&HealthCheckConfig::default(), &host);
        assert!(session.check_health().await);
    }

    #[tokio::test]
    async fn test_tcp_dial_session_refused() {
        let host = test_host("127.0.0.1:1");
        let session =
            TcpDialSessionFactory.new_session(&HealthCheckConfig::default(), &host);
        assert!(!session.check_health().await);
    }

    #[test]
    fn test_factory_registry() {
        struct AlwaysHealthy;
        #[async_trait]
        impl HealthCheckSession for AlwaysHealthy {
            async fn check_health(&self) -> bool {
                true
            }
        }
        struct AlwaysHealthyFactory;
        impl HealthCheckSessionFactory for AlwaysHealthyFactory {
            fn new_session(
                &self,
                _cfg: &HealthCheckConfig,
                _host: &Arc<Host>,
            ) -> Box<dyn HealthCheckSession> {
                Box::new(AlwaysHealthy)
            }
        }

        assert!(session_factory("grpc-ping").is_none());
        register_session_factory("grpc-ping", Arc::new(AlwaysHealthyFactory));
        assert!(session_factory("grpc-ping").is_some());
    }
}
