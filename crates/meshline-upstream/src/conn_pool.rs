//! Per-(protocol, host) connection pooling.
//!
//! A pool owns a bounded set of transport connections toward one host and
//! hands out streams over them. `check_and_init` is the non-blocking,
//! idempotent entry point: it reports whether a connection is `Ready` and,
//! if not, kicks off at most one asynchronous connect. Callers poll it from
//! the manager's retry schedule or park on [`ConnectionPool::readiness`].
//!
//! Connection state machine:
//!
//! ```text
//!   NotInit --connect--> Connecting --ok--> Ready
//!                            |
//!                            +--err--> Failed --cooldown--> NotInit
//!   Ready --peer-close/io-err--> Draining --last-stream-done--> Closed
//! ```
//!
//! HTTP/2 and RPC multiplex streams over a single connection up to the
//! per-connection cap; HTTP/1 serializes, so a busy connection makes the
//! pool open another one up to its connection cap, after which stream
//! requests overflow and the caller queues.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify};

use meshline_common::{RequestContext, Result, UpstreamError};

use crate::host::Host;

/// Upstream protocols the pool layer distinguishes. Codecs live outside the
/// core; the pool only cares about connection and stream concurrency rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http1,
    Http2,
    Rpc,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http1",
            Protocol::Http2 => "http2",
            Protocol::Rpc => "rpc",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DEFAULT_HTTP1_MAX_CONNS: usize = 8;
const FAILED_COOLDOWN: Duration = Duration::from_millis(500);

/// Concurrency shape of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub max_concurrent_streams: u32,
}

impl PoolSettings {
    pub fn for_protocol(protocol: Protocol, max_request_per_conn: u32) -> PoolSettings {
        match protocol {
            Protocol::Http1 => PoolSettings {
                max_connections: DEFAULT_HTTP1_MAX_CONNS,
                max_concurrent_streams: 1,
            },
            Protocol::Http2 | Protocol::Rpc => PoolSettings {
                max_connections: 1,
                max_concurrent_streams: max_request_per_conn.max(1),
            },
        }
    }
}

/// Why an in-flight stream was terminated by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamResetReason {
    ConnectionFailure,
    ConnectionTermination,
}

/// Sink for stream-level events. The protocol codec implements this; the
/// pool only ever calls it to complete in-flight streams on connection
/// failure or shutdown.
pub trait StreamReceiver: Send + Sync {
    fn on_reset(&self, reason: StreamResetReason);
}

#[derive(Clone)]
struct Transport {
    stream: Arc<AsyncMutex<TcpStream>>,
    remote: SocketAddr,
}

enum ConnState {
    NotInit,
    Connecting,
    Ready(Transport),
    Failed(Instant),
    Draining(Transport),
    Closed,
}

struct PooledConn {
    id: u64,
    state: Mutex<ConnState>,
    streams: Mutex<HashMap<u64, Arc<dyn StreamReceiver>>>,
    next_stream_id: AtomicU64,
}

impl PooledConn {
    fn new(id: u64) -> Arc<PooledConn> {
        Arc::new(PooledConn {
            id,
            state: Mutex::new(ConnState::NotInit),
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(0),
        })
    }

    fn ready_transport(&self) -> Option<Transport> {
        match &*self.state.lock().unwrap() {
            ConnState::Ready(t) => Some(t.clone()),
            _ => None,
        }
    }

    fn is_closed(&self) -> bool {
        matches!(*self.state.lock().unwrap(), ConnState::Closed)
    }

    fn active_streams(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    /// Removes a completed stream. Returns false if the pool already reset
    /// it (the caller must not double-release accounting then).
    fn stream_done(&self, stream_id: u64) -> bool {
        let present = self.streams.lock().unwrap().remove(&stream_id).is_some();
        if present {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, ConnState::Draining(_)) && self.active_streams() == 0 {
                *state = ConnState::Closed;
            }
        }
        present
    }
}

/// Write half handed to the caller for one allocated stream. Dropping it
/// (or calling [`StreamEncoder::complete`]) releases the stream slot.
pub struct StreamEncoder {
    conn: Arc<PooledConn>,
    transport: Transport,
    stream_id: u64,
    host: Arc<Host>,
    notify: Arc<Notify>,
    done: bool,
}

impl StreamEncoder {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn connection_id(&self) -> u64 {
        self.conn.id
    }

    /// Shared transport for the protocol codec to write through.
    pub fn transport(&self) -> Arc<AsyncMutex<TcpStream>> {
        Arc::clone(&self.transport.stream)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.transport.remote
    }

    pub fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if self.conn.stream_done(self.stream_id) {
            self.host.stream_released();
        }
        self.notify.notify_waiters();
    }
}

impl Drop for StreamEncoder {
    fn drop(&mut self) {
        self.finish();
    }
}

pub trait ConnectionPool: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn host(&self) -> Arc<Host>;

    /// Non-blocking and idempotent: true iff the pool has a `Ready`
    /// connection right now. Otherwise starts one asynchronous connect (if
    /// none is in flight) and returns false.
    fn check_and_init(&self, ctx: &RequestContext) -> bool;

    /// Allocates a stream on a `Ready` connection, round-robin among them.
    fn new_stream(
        &self,
        ctx: &RequestContext,
        receiver: Arc<dyn StreamReceiver>,
    ) -> Result<StreamEncoder>;

    /// The owning I/O pump observed a connection error. In-flight streams
    /// complete with `ConnectionFailure`.
    fn on_connection_error(&self, conn_id: u64);

    /// The peer closed gracefully; existing streams drain, no new ones.
    fn on_peer_close(&self, conn_id: u64);

    /// Notified whenever a connection becomes ready or a stream slot frees.
    fn readiness(&self) -> Arc<Notify>;

    fn shutdown(&self);
}

/// The stock pool implementation over raw TCP transports.
pub struct TcpConnPool {
    protocol: Protocol,
    host: Arc<Host>,
    settings: PoolSettings,
    conns: Mutex<Vec<Arc<PooledConn>>>,
    next_conn_id: AtomicU64,
    rr: AtomicUsize,
    notify: Arc<Notify>,
    closed: AtomicBool,
}

impl TcpConnPool {
    pub fn new(protocol: Protocol, host: Arc<Host>) -> Arc<TcpConnPool> {
        let settings =
            PoolSettings::for_protocol(protocol, host.cluster_info().max_request_per_conn());
        Arc::new(TcpConnPool {
            protocol,
            host,
            settings,
            conns: Mutex::new(Vec::new()),
            next_conn_id: AtomicU64::new(0),
            rr: AtomicUsize::new(0),
            notify: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Starts a connect on an idle slot if none is already in flight.
    /// Callers hold the conns lock.
    fn ensure_connecting(&self, conns: &mut Vec<Arc<PooledConn>>) {
        for conn in conns.iter() {
            if matches!(*conn.state.lock().unwrap(), ConnState::Connecting) {
                return;
            }
        }
        for conn in conns.iter() {
            let mut state = conn.state.lock().unwrap();
            let eligible = match *state {
                ConnState::NotInit => true,
                ConnState::Failed(since) => since.elapsed() >= FAILED_COOLDOWN,
                _ => false,
            };
            if eligible {
                *state = ConnState::Connecting;
                drop(state);
                self.spawn_connect(Arc::clone(conn));
                return;
            }
        }
        let usable = conns
            .iter()
            .filter(|c| {
                !matches!(
                    *c.state.lock().unwrap(),
                    ConnState::Draining(_) | ConnState::Closed
                )
            })
            .count();
        if usable < self.settings.max_connections {
            let conn = PooledConn::new(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
            *conn.state.lock().unwrap() = ConnState::Connecting;
            conns.push(Arc::clone(&conn));
            self.spawn_connect(conn);
        }
    }

    fn spawn_connect(&self, conn: Arc<PooledConn>) {
        let host = Arc::clone(&self.host);
        let notify = Arc::clone(&self.notify);
        let protocol = self.protocol;
        tokio::spawn(async move {
            let outcome = host.create_connection().await;
            // shutdown may have closed the slot while the dial was in flight
            let mut state = conn.state.lock().unwrap();
            if matches!(*state, ConnState::Connecting) {
                match outcome {
                    Ok(data) => {
                        tracing::debug!(
                            host = host.address_string(),
                            %protocol,
                            conn = conn.id,
                            "upstream connection established"
                        );
                        host.cluster_info().stats().record_connection_created();
                        *state = ConnState::Ready(Transport {
                            stream: Arc::new(AsyncMutex::new(data.stream)),
                            remote: data.remote_addr,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(
                            host = host.address_string(),
                            %protocol,
                            conn = conn.id,
                            error = %e,
                            "upstream connect failed"
                        );
                        host.cluster_info().stats().record_connect_failure();
                        *state = ConnState::Failed(Instant::now());
                    }
                }
            }
            drop(state);
            // wake pollers either way; on failure they re-enter check_and_init
            notify.notify_waiters();
        });
    }

    fn reset_conn(&self, conn: &Arc<PooledConn>, reason: StreamResetReason) {
        let receivers: Vec<Arc<dyn StreamReceiver>> = {
            let mut streams = conn.streams.lock().unwrap();
            streams.drain().map(|(_, r)| r).collect()
        };
        *conn.state.lock().unwrap() = ConnState::Closed;
        for receiver in receivers {
            self.host.stream_released();
            receiver.on_reset(reason);
        }
        self.notify.notify_waiters();
    }
}

impl ConnectionPool for TcpConnPool {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn host(&self) -> Arc<Host> {
        Arc::clone(&self.host)
    }

    fn check_and_init(&self, ctx: &RequestContext) -> bool {
        if ctx.is_cancelled() || self.closed.load(Ordering::Acquire) {
            return false;
        }
        if !self.host.health() {
            return false;
        }
        let mut conns = self.conns.lock().unwrap();
        conns.retain(|c| !c.is_closed());
        if conns.iter().any(|c| c.ready_transport().is_some()) {
            return true;
        }
        self.ensure_connecting(&mut conns);
        false
    }

    fn new_stream(
        &self,
        ctx: &RequestContext,
        receiver: Arc<dyn StreamReceiver>,
    ) -> Result<StreamEncoder> {
        if ctx.is_cancelled() {
            return Err(UpstreamError::Canceled);
        }
        let addr = self.host.address_string().to_string();
        let mut conns = self.conns.lock().unwrap();

        let ready: Vec<(Arc<PooledConn>, Transport)> = conns
            .iter()
            .filter_map(|c| c.ready_transport().map(|t| (Arc::clone(c), t)))
            .collect();
        if ready.is_empty() {
            return Err(UpstreamError::ConnectionNotReady(addr));
        }

        let start = self.rr.fetch_add(1, Ordering::Relaxed);
        for i in 0..ready.len() {
            let (conn, transport) = &ready[(start + i) % ready.len()];
            if conn.active_streams() >= self.settings.max_concurrent_streams as usize {
                continue;
            }
            let stream_id = conn.next_stream_id.fetch_add(1, Ordering::Relaxed) + 1;
            conn.streams.lock().unwrap().insert(stream_id, receiver);
            self.host.stream_acquired();
            return Ok(StreamEncoder {
                conn: Arc::clone(conn),
                transport: transport.clone(),
                stream_id,
                host: Arc::clone(&self.host),
                notify: Arc::clone(&self.notify),
                done: false,
            });
        }

        // every ready connection is at its stream cap; grow if allowed
        self.ensure_connecting(&mut conns);
        Err(UpstreamError::PoolOverflow(addr))
    }

    fn on_connection_error(&self, conn_id: u64) {
        let conn = {
            let conns = self.conns.lock().unwrap();
            conns.iter().find(|c| c.id == conn_id).cloned()
        };
        if let Some(conn) = conn {
            tracing::warn!(
                host = self.host.address_string(),
                conn = conn_id,
                "upstream connection failed, resetting in-flight streams"
            );
            self.reset_conn(&conn, StreamResetReason::ConnectionFailure);
        }
    }

    fn on_peer_close(&self, conn_id: u64) {
        let conn = {
            let conns = self.conns.lock().unwrap();
            conns.iter().find(|c| c.id == conn_id).cloned()
        };
        if let Some(conn) = conn {
            let mut state = conn.state.lock().unwrap();
            if let ConnState::Ready(transport) = &*state {
                if conn.active_streams() == 0 {
                    *state = ConnState::Closed;
                } else {
                    *state = ConnState::Draining(transport.clone());
                }
            }
        }
    }

    fn readiness(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let conns: Vec<Arc<PooledConn>> = self.conns.lock().unwrap().drain(..).collect();
        for conn in conns {
            self.reset_conn(&conn, StreamResetReason::ConnectionTermination);
        }
    }
}

/// Builds a pool for one host; registered per protocol.
pub type PoolFactory = Arc<dyn Fn(Arc<Host>) -> Arc<dyn ConnectionPool> + Send + Sync>;

static POOL_FACTORIES: OnceLock<RwLock<HashMap<Protocol, PoolFactory>>> = OnceLock::new();

fn factories() -> &'static RwLock<HashMap<Protocol, PoolFactory>> {
    POOL_FACTORIES.get_or_init(|| {
        let mut map: HashMap<Protocol, PoolFactory> = HashMap::new();
        for protocol in [Protocol::Http1, Protocol::Http2, Protocol::Rpc] {
            let factory: PoolFactory = Arc::new(move |host| {
                let pool: Arc<dyn ConnectionPool> = TcpConnPool::new(protocol, host);
                pool
            });
            map.insert(protocol, factory);
        }
        RwLock::new(map)
    })
}

/// Replaces the pool factory for a protocol (e.g. a TLS-wrapping pool).
pub fn register_pool_factory(protocol: Protocol, factory: PoolFactory) {
    factories().write().unwrap().insert(protocol, factory);
}

pub fn pool_factory(protocol: Protocol) -> Option<PoolFactory> {
    factories().read().unwrap().get(&protocol).cloned()
}

/// Obtains a stream from `pool`, waiting for connection establishment or a
/// freed stream slot up to `timeout`. Queued waiters re-enter
/// `check_and_init` whenever the pool signals readiness.
pub async fn acquire_stream(
    pool: &Arc<dyn ConnectionPool>,
    ctx: &RequestContext,
    receiver: Arc<dyn StreamReceiver>,
    timeout: Duration,
) -> Result<StreamEncoder> {
    let deadline = Instant::now() + timeout;
    loop {
        if ctx.is_cancelled() {
            return Err(UpstreamError::Canceled);
        }
        if pool.check_and_init(ctx) {
            match pool.new_stream(ctx, Arc::clone(&receiver)) {
                Ok(encoder) => return Ok(encoder),
                Err(UpstreamError::PoolOverflow(_)) | Err(UpstreamError::ConnectionNotReady(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if Instant::now() >= deadline {
            return Err(UpstreamError::Timeout(timeout.as_millis() as u64));
        }
        let notify = pool.readiness();
        // bounded park: a wakeup can race the check above, so never wait long
        let _ = tokio::time::timeout(Duration::from_millis(20), notify.notified()).await;
    }
}
