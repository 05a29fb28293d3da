use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("cluster {0} not found")]
    ClusterNotFound(String),

    #[error("cluster {0} was not added via API and cannot be changed")]
    ClusterNotUpdatable(String),

    #[error("host {address} not found in cluster {cluster}")]
    HostNotFound { cluster: String, address: String },

    #[error("no healthy host in cluster {0}")]
    NoHealthyHost(String),

    #[error("config readers did not drain in time, previous generation still referenced")]
    RcuBlocked,

    #[error("no connection pool factory registered for protocol {0}")]
    PoolFactoryMissing(String),

    #[error("connection pool for {0} has no ready connection")]
    ConnectionNotReady(String),

    #[error("connection pool for {0} is at stream capacity")]
    PoolOverflow(String),

    #[error("upstream connection failure: {0}")]
    ConnectionFailure(String),

    #[error("request canceled")]
    Canceled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("address parse error: {0}")]
    AddressParse(#[from] std::net::AddrParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, UpstreamError>;
