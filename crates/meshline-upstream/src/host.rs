//! Upstream endpoint descriptor.
//!
//! A [`Host`] is immutable for its lifetime except for the health-flag
//! bitset; any configuration change constructs a new `Host`. Hosts are
//! shared by reference between the priority set, connection pools, and the
//! health checker, so a flag flip is visible everywhere without replacing
//! any of them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio::time::timeout;

use meshline_common::{HealthFlag, HostConfig, Result, UpstreamError};

use crate::cluster::ClusterInfo;

/// A freshly dialed upstream transport. The caller owns closing it.
#[derive(Debug)]
pub struct CreateConnectionData {
    pub stream: TcpStream,
    pub remote_addr: SocketAddr,
}

#[derive(Debug)]
pub struct Host {
    config: HostConfig,
    addr: SocketAddr,
    cluster_info: Arc<ClusterInfo>,
    // bitset of HealthFlag values; advisory, may flip right after a read
    health_flags: Mutex<u64>,
    active_streams: AtomicU32,
}

impl Host {
    pub fn new(config: HostConfig, cluster_info: Arc<ClusterInfo>) -> Result<Arc<Host>> {
        let addr: SocketAddr = config.address.parse()?;
        let mut flags = 0u64;
        for f in &config.health_flags {
            flags |= f.bit();
        }
        Ok(Arc::new(Host {
            config,
            addr,
            cluster_info,
            health_flags: Mutex::new(flags),
            active_streams: AtomicU32::new(0),
        }))
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn address_string(&self) -> &str {
        &self.config.address
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    pub fn weight(&self) -> u32 {
        self.config.weight
    }

    pub fn metadata(&self) -> &meshline_common::Metadata {
        &self.config.metadata
    }

    pub fn cluster_info(&self) -> &Arc<ClusterInfo> {
        &self.cluster_info
    }

    /// True iff no health flag is set.
    pub fn health(&self) -> bool {
        *self.health_flags.lock().unwrap() == 0
    }

    pub fn set_health_flag(&self, flag: HealthFlag) {
        *self.health_flags.lock().unwrap() |= flag.bit();
    }

    pub fn clear_health_flag(&self, flag: HealthFlag) {
        *self.health_flags.lock().unwrap() &= !flag.bit();
    }

    pub fn contains_health_flag(&self, flag: HealthFlag) -> bool {
        *self.health_flags.lock().unwrap() & flag.bit() != 0
    }

    /// Streams currently open through this host, across all pools.
    pub fn active_streams(&self) -> u32 {
        self.active_streams.load(Ordering::Relaxed)
    }

    pub(crate) fn stream_acquired(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stream_released(&self) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
    }

    /// The host's configuration with its current health flags folded in,
    /// used to rewrite the owning cluster's config on host updates.
    pub fn config(&self) -> HostConfig {
        let mut config = self.config.clone();
        let flags = *self.health_flags.lock().unwrap();
        config.health_flags = [
            HealthFlag::FailedActiveHealthCheck,
            HealthFlag::FailedOutlierCheck,
            HealthFlag::FailedEds,
        ]
        .into_iter()
        .filter(|f| flags & f.bit() != 0)
        .collect();
        config
    }

    /// Dials the host within the cluster's connect timeout.
    pub async fn create_connection(&self) -> Result<CreateConnectionData> {
        let connect_timeout = self.cluster_info.connect_timeout();
        let stream = timeout(connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| UpstreamError::Timeout(connect_timeout.as_millis() as u64))?
            .map_err(|e| UpstreamError::ConnectionFailure(format!("{}: {}", self.addr, e)))?;
        let remote_addr = stream.peer_addr()?;
        Ok(CreateConnectionData {
            stream,
            remote_addr,
        })
    }
}
