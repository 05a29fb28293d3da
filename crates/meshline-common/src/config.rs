use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpstreamError};

/// How a cluster learns about its hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    /// Hosts are provided directly in the cluster config or via host updates.
    #[default]
    Simple,
    /// Hosts are delivered by the control plane's endpoint discovery stream.
    Eds,
    /// Hosts are resolved from DNS and re-resolved periodically.
    StrictDns,
}

/// Load balancer kind. Built-in kinds have canonical names; anything else is
/// a custom kind resolved through the process-wide factory registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LbType {
    Random,
    RoundRobin,
    WeightedRoundRobin,
    LeastRequest,
    Custom(String),
}

impl Default for LbType {
    fn default() -> Self {
        LbType::RoundRobin
    }
}

impl LbType {
    pub fn as_str(&self) -> &str {
        match self {
            LbType::Random => "random",
            LbType::RoundRobin => "round_robin",
            LbType::WeightedRoundRobin => "weighted_round_robin",
            LbType::LeastRequest => "least_request",
            LbType::Custom(name) => name,
        }
    }
}

impl From<&str> for LbType {
    fn from(s: &str) -> Self {
        match s {
            "random" => LbType::Random,
            "round_robin" => LbType::RoundRobin,
            "weighted_round_robin" => LbType::WeightedRoundRobin,
            "least_request" => LbType::LeastRequest,
            other => LbType::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for LbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for LbType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LbType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct LbTypeVisitor;

        impl<'de> Visitor<'de> for LbTypeVisitor {
            type Value = LbType;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a load balancer kind string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<LbType, E> {
                Ok(LbType::from(v))
            }
        }

        deserializer.deserialize_str(LbTypeVisitor)
    }
}

/// Health condition bits carried on a host. A host is healthy iff none are
/// set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthFlag {
    FailedActiveHealthCheck,
    FailedOutlierCheck,
    FailedEds,
}

impl HealthFlag {
    pub fn bit(self) -> u64 {
        match self {
            HealthFlag::FailedActiveHealthCheck => 0x1,
            HealthFlag::FailedOutlierCheck => 0x2,
            HealthFlag::FailedEds => 0x4,
        }
    }
}

/// One upstream endpoint as delivered by the control plane.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// "ip:port" address of the endpoint.
    pub address: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Health flags pre-set by the control plane (e.g. an EDS stream marking
    /// an endpoint failed before the proxy has probed it).
    #[serde(default)]
    pub health_flags: Vec<HealthFlag>,
}

fn default_weight() -> u32 {
    1
}

impl HostConfig {
    pub fn new(address: impl Into<String>) -> Self {
        HostConfig {
            address: address.into(),
            weight: 1,
            ..Default::default()
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Active health check spec for a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Probe protocol, resolved through the session factory registry.
    /// Unknown protocols fall back to a plain TCP dial.
    #[serde(default = "default_hc_protocol")]
    pub protocol: String,
    #[serde(default = "default_hc_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_hc_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    /// Upper bound of the random delay added before the first probe of each
    /// host, to spread probes out.
    #[serde(default)]
    pub initial_jitter_ms: u64,
}

fn default_hc_protocol() -> String {
    "tcp".to_string()
}

fn default_hc_interval() -> u64 {
    5000
}

fn default_hc_timeout() -> u64 {
    2000
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    3
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        HealthCheckConfig {
            protocol: default_hc_protocol(),
            interval_ms: default_hc_interval(),
            timeout_ms: default_hc_timeout(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            initial_jitter_ms: 0,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What the subset load balancer does when no subset matches the request's
/// metadata criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Fail the pick.
    #[default]
    NoFallback,
    /// Pick from the whole cluster as if no subsets were configured.
    AnyEndpoint,
    /// Pick from the subset selected by `default_subset`.
    DefaultSubset,
}

/// Metadata subset partitioning spec.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LbSubsetConfig {
    /// Each selector is a set of metadata keys; the distinct value tuples
    /// observed across hosts form one sub host set per tuple.
    #[serde(default)]
    pub subset_selectors: Vec<Vec<String>>,
    #[serde(default)]
    pub fallback_policy: FallbackPolicy,
    #[serde(default)]
    pub default_subset: BTreeMap<String, String>,
}

/// Upstream TLS settings. The handshake itself is plumbed outside this core;
/// the cluster only carries the declaration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// One upstream cluster as delivered by the control plane.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub cluster_type: ClusterType,
    #[serde(default)]
    pub lb_type: LbType,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_request_per_conn")]
    pub max_request_per_conn: u32,
    #[serde(default = "default_per_conn_buffer_limit")]
    pub per_conn_buffer_limit_bytes: u32,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub lb_subset_config: Option<LbSubsetConfig>,
    #[serde(default)]
    pub tls_context: Option<TlsConfig>,
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_max_request_per_conn() -> u32 {
    1024
}

fn default_per_conn_buffer_limit() -> u32 {
    16 * 1024
}

impl ClusterConfig {
    pub fn new(name: impl Into<String>) -> Self {
        ClusterConfig {
            name: name.into(),
            connect_timeout_ms: default_connect_timeout(),
            max_request_per_conn: default_max_request_per_conn(),
            per_conn_buffer_limit_bytes: default_per_conn_buffer_limit(),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Structural validation only. Addresses must parse, thresholds must be
    /// non-zero, subset selectors must not contain empty key lists.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(UpstreamError::InvalidConfig("cluster name is empty".into()));
        }
        for host in &self.hosts {
            host.address
                .parse::<std::net::SocketAddr>()
                .map_err(|e| {
                    UpstreamError::InvalidConfig(format!(
                        "host address {:?}: {}",
                        host.address, e
                    ))
                })?;
        }
        if let Some(hc) = &self.health_check {
            if hc.healthy_threshold == 0 || hc.unhealthy_threshold == 0 {
                return Err(UpstreamError::InvalidConfig(
                    "health check thresholds must be >= 1".into(),
                ));
            }
        }
        if let Some(subset) = &self.lb_subset_config {
            for selector in &subset.subset_selectors {
                if selector.is_empty() || selector.iter().any(|k| k.is_empty()) {
                    return Err(UpstreamError::InvalidConfig(
                        "subset selector contains an empty key".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Convenience alias for the host metadata shape.
pub type Metadata = BTreeMap<String, String>;

/// Downstream request headers as seen by the load balancer context.
pub type Headers = HashMap<String, String>;
