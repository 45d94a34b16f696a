use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use hmux_common::protocol::error::{HmuxError, Result};
use hmux_common::transport::TcpTransport;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::connection::{Connection, DEFAULT_ACK_SIZE};

/// Per-backend pool configuration.
///
/// # Default Configuration
///
/// - `max_connections`: 256
/// - `idle_pool_size`: 16
/// - `ring_capacity`: 64
/// - `idle_timeout`: 10 seconds
/// - `connect_timeout`: 5 seconds
/// - `socket_timeout`: 30 seconds
/// - `fail_recover_time`: 15 seconds
/// - `ack_size`: 64 KiB
/// - `backup`: false
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use hmux_client::BackendConfig;
///
/// let config = BackendConfig::new("10.0.0.5:6802")
///     .with_max_connections(32)
///     .with_idle_timeout(Duration::from_secs(30));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Backend address, `host:port`
    pub address: String,
    /// Cap on `active + connecting`
    pub max_connections: usize,
    /// Most idle connections the ring will hold
    pub idle_pool_size: usize,
    /// Backing slots of the idle ring
    pub ring_capacity: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
    /// How long an Inactive backend is passed over before it gets another try
    pub fail_recover_time: Duration,
    /// Request body bytes sent between yield/ack handshakes
    pub ack_size: usize,
    /// Backup backends only take traffic when no primary can
    pub backup: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            max_connections: 256,
            idle_pool_size: 16,
            ring_capacity: 64,
            idle_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(30),
            fail_recover_time: Duration::from_secs(15),
            ack_size: DEFAULT_ACK_SIZE,
            backup: false,
        }
    }
}

impl BackendConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_idle_pool_size(mut self, size: usize) -> Self {
        self.idle_pool_size = size;
        self
    }

    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_fail_recover_time(mut self, time: Duration) -> Self {
        self.fail_recover_time = time;
        self
    }

    pub fn with_ack_size(mut self, ack_size: usize) -> Self {
        self.ack_size = ack_size;
        self
    }

    /// Marks the backend as a backup.
    pub fn with_backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    /// Checks the configuration for values the pool cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`HmuxError::InvalidConfig`] if:
    /// - The address is empty
    /// - `max_connections`, `idle_pool_size` or `ack_size` is zero
    /// - `idle_pool_size` does not fit below `ring_capacity`
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(HmuxError::InvalidConfig("backend address is empty".to_string()));
        }
        if self.max_connections == 0 {
            return Err(HmuxError::InvalidConfig(format!(
                "{}: max_connections must be at least 1",
                self.address
            )));
        }
        if self.idle_pool_size == 0 {
            return Err(HmuxError::InvalidConfig(format!(
                "{}: idle_pool_size must be at least 1",
                self.address
            )));
        }
        if self.ack_size == 0 {
            return Err(HmuxError::InvalidConfig(format!(
                "{}: ack_size must be at least 1",
                self.address
            )));
        }
        if self.idle_pool_size >= self.ring_capacity {
            return Err(HmuxError::InvalidConfig(format!(
                "{}: idle_pool_size {} must be below ring_capacity {}",
                self.address, self.idle_pool_size, self.ring_capacity
            )));
        }
        Ok(())
    }
}

/// Backend availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackendState {
    Active,
    Inactive,
}

/// Fixed-capacity circular buffer of idle entries.
///
/// New entries go in at the head. [`pop_newest`](Self::pop_newest) takes the
/// most recently pushed entry (LIFO recycling) while
/// [`pop_oldest_if`](Self::pop_oldest_if) takes from the tail (expiry). The
/// backing array is larger than the admission limit so that head and tail
/// never meet on a full ring.
pub struct IdleRing<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    limit: usize,
}

impl<T> IdleRing<T> {
    /// Creates a ring with `capacity` slots holding at most `limit` entries.
    /// `limit` is clamped to `capacity - 1`.
    pub fn new(capacity: usize, limit: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
            limit: limit.min(capacity - 1),
        }
    }

    pub fn len(&self) -> usize {
        let cap = self.slots.len();
        (self.head + cap - self.tail) % cap
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Pushes at the head, handing the item back when the ring is at its limit.
    pub fn push(&mut self, item: T) -> std::result::Result<(), T> {
        if self.len() >= self.limit {
            return Err(item);
        }
        self.slots[self.head] = Some(item);
        self.head = (self.head + 1) % self.slots.len();
        Ok(())
    }

    /// Takes the most recently pushed entry.
    pub fn pop_newest(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let cap = self.slots.len();
        self.head = (self.head + cap - 1) % cap;
        self.slots[self.head].take()
    }

    /// Takes the oldest entry if `predicate` accepts it.
    pub fn pop_oldest_if(&mut self, predicate: impl FnOnce(&T) -> bool) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let oldest = self.slots[self.tail].as_ref()?;
        if !predicate(oldest) {
            return None;
        }
        let item = self.slots[self.tail].take();
        self.tail = (self.tail + 1) % self.slots.len();
        item
    }

    /// Removes every entry, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.len());
        while !self.is_empty() {
            if let Some(item) = self.slots[self.tail].take() {
                items.push(item);
            }
            self.tail = (self.tail + 1) % self.slots.len();
        }
        items
    }
}

/// Point-in-time view of a backend, for logs and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub address: String,
    pub backup: bool,
    pub state: BackendState,
    pub closed: bool,
    pub active: i64,
    pub connecting: i64,
    pub idle: usize,
    pub keepalive_total: u64,
    pub connect_total: u64,
    pub failure_total: u64,
}

struct BackendInner {
    state: BackendState,
    closed: bool,
    failed_at: Option<Instant>,
    ring: IdleRing<Connection>,
    active: i64,
    connecting: i64,
}

/// One application-server endpoint and its connection pool.
///
/// # Architecture
///
/// - Released connections wait in an [`IdleRing`] and are recycled LIFO
/// - Admission control caps `active + connecting` at `max_connections`
/// - A failed connect or a relay failure flips the backend Inactive and
///   drains the ring; the next successful connect or release flips it back
/// - Idle connections are expired a few at a time on release, there is no
///   sweeper task
///
/// # Thread Safety
///
/// All bookkeeping happens under one `std::sync::Mutex` per backend, never
/// held across an `.await`. Sockets are connected and closed outside it.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use hmux_client::{Backend, BackendConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = Arc::new(Backend::new(BackendConfig::new("127.0.0.1:6802"))?);
///
/// let lease = backend.acquire().await?;
/// // drive the connection...
/// backend.release(lease).await;
/// # Ok(())
/// # }
/// ```
pub struct Backend {
    config: BackendConfig,
    transport: TcpTransport,
    inner: Mutex<BackendInner>,
    next_trace_id: AtomicU64,
    keepalive_total: AtomicU64,
    connect_total: AtomicU64,
    failure_total: AtomicU64,
}

impl Backend {
    /// Creates a backend in the Active state with an empty pool.
    ///
    /// # Errors
    ///
    /// Returns [`HmuxError::InvalidConfig`] if the configuration does not
    /// validate.
    pub fn new(config: BackendConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            transport: TcpTransport::new(config.connect_timeout),
            inner: Mutex::new(BackendInner {
                state: BackendState::Active,
                closed: false,
                failed_at: None,
                ring: IdleRing::new(config.ring_capacity, config.idle_pool_size),
                active: 0,
                connecting: 0,
            }),
            config,
            next_trace_id: AtomicU64::new(1),
            keepalive_total: AtomicU64::new(0),
            connect_total: AtomicU64::new(0),
            failure_total: AtomicU64::new(0),
        })
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn state(&self) -> BackendState {
        self.lock_inner().state
    }

    pub fn is_closed(&self) -> bool {
        self.lock_inner().closed
    }

    pub fn is_backup(&self) -> bool {
        self.config.backup
    }

    /// True when the backend should be offered traffic at `now`: it is
    /// Active, or it has been Inactive for at least `fail_recover_time`.
    /// A shut-down backend is never available.
    pub fn is_available(&self, now: Instant) -> bool {
        let inner = self.lock_inner();
        if inner.closed {
            return false;
        }
        match (inner.state, inner.failed_at) {
            (BackendState::Active, _) => true,
            (BackendState::Inactive, Some(failed_at)) => {
                now.saturating_duration_since(failed_at) >= self.config.fail_recover_time
            }
            (BackendState::Inactive, None) => true,
        }
    }

    /// Hands out a connection, recycling an idle one when possible.
    ///
    /// 1. Pop the most recently released idle connection. If it is still
    ///    fresh, return it; if it expired, close it and fall through. Only
    ///    one pool entry is tried per call.
    /// 2. Otherwise open a new connection if `active + connecting` is below
    ///    `max_connections`.
    ///
    /// # Errors
    ///
    /// - [`HmuxError::NoBackendAvailable`] after [`shutdown`](Self::shutdown)
    /// - [`HmuxError::PoolExhausted`] when admission control rejects the
    ///   connect; no socket is opened
    /// - [`HmuxError::Connect`] when the connect fails; the backend goes
    ///   Inactive
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        self.acquire_with(true).await
    }

    /// Like [`acquire`](Self::acquire) but never recycles: the lease is
    /// always a freshly opened connection. Used to retry a request whose
    /// pooled connection turned out to be stale.
    ///
    /// # Errors
    ///
    /// Same as [`acquire`](Self::acquire).
    pub async fn acquire_new(self: &Arc<Self>) -> Result<PooledConnection> {
        self.acquire_with(false).await
    }

    async fn acquire_with(self: &Arc<Self>, recycle: bool) -> Result<PooledConnection> {
        let now = Instant::now();
        let mut expired = None;

        {
            let mut inner = self.lock_inner();
            if inner.closed {
                return Err(HmuxError::NoBackendAvailable);
            }

            if recycle && inner.state == BackendState::Active {
                if let Some(mut conn) = inner.ring.pop_newest() {
                    if conn.is_expired(now, self.config.idle_timeout) {
                        expired = Some(conn);
                    } else {
                        conn.clear_idle();
                        inner.active += 1;
                        self.keepalive_total.fetch_add(1, Ordering::Relaxed);
                        debug!("hmux[{}] recycle {}", conn.trace_id(), self.config.address);
                        return Ok(PooledConnection::new(conn, self.clone(), true));
                    }
                }
            }

            let in_use = inner.active + inner.connecting;
            if in_use >= self.config.max_connections as i64 {
                warn!(
                    "{}: pool exhausted ({} active, {} connecting, max {})",
                    self.config.address, inner.active, inner.connecting, self.config.max_connections
                );
                return Err(HmuxError::PoolExhausted {
                    backend: self.config.address.clone(),
                    max: self.config.max_connections,
                });
            }
            inner.connecting += 1;
        }

        if let Some(mut conn) = expired {
            debug!("hmux[{}] idle connection expired", conn.trace_id());
            conn.close().await;
        }

        self.connect().await
    }

    async fn connect(self: &Arc<Self>) -> Result<PooledConnection> {
        let guard = ConnectingGuard { backend: self };
        let trace_id = self.next_trace_id.fetch_add(1, Ordering::Relaxed);
        let result = Connection::open(
            &self.transport,
            &self.config.address,
            trace_id,
            self.config.socket_timeout,
        )
        .await
        .map(|conn| conn.with_ack_size(self.config.ack_size));
        guard.disarm();

        let (drained, err) = {
            let mut inner = self.lock_inner();
            inner.connecting -= 1;

            match result {
                Ok(conn) => {
                    inner.active += 1;
                    self.connect_total.fetch_add(1, Ordering::Relaxed);
                    if inner.state == BackendState::Inactive && !inner.closed {
                        inner.state = BackendState::Active;
                        inner.failed_at = None;
                        info!("{}: backend recovered on connect", self.config.address);
                    }
                    return Ok(PooledConnection::new(conn, self.clone(), false));
                }
                Err(e) => {
                    warn!("{}: connect failed: {}", self.config.address, e);
                    (self.fail_locked(&mut inner), e)
                }
            }
        };

        close_all(drained).await;
        Err(err)
    }

    /// Returns a lease to the pool or closes its connection.
    ///
    /// A reusable connection flips an Inactive backend back to Active and is
    /// parked in the idle ring if there is room. A broken connection, or one
    /// the backend ended with exit, is closed without touching the state.
    /// Either way the oldest idle entries are expired while they are stale.
    pub async fn release(&self, mut lease: PooledConnection) {
        let Some(mut conn) = lease.conn.take() else {
            return;
        };
        let now = Instant::now();

        let (rejected, expired) = {
            let mut inner = self.lock_inner();
            inner.active = (inner.active - 1).max(0);

            let rejected = if !conn.is_reusable() || inner.closed {
                Some(conn)
            } else {
                if inner.state == BackendState::Inactive {
                    inner.state = BackendState::Active;
                    inner.failed_at = None;
                    info!("{}: backend recovered on release", self.config.address);
                }
                conn.mark_idle(now);
                inner.ring.push(conn).err()
            };

            let mut expired = Vec::new();
            let idle_timeout = self.config.idle_timeout;
            while let Some(stale) = inner
                .ring
                .pop_oldest_if(|c| c.is_expired(now, idle_timeout))
            {
                expired.push(stale);
            }
            (rejected, expired)
        };

        if let Some(mut conn) = rejected {
            conn.close().await;
        }
        if !expired.is_empty() {
            debug!("{}: expired {} idle connections", self.config.address, expired.len());
            close_all(expired).await;
        }
    }

    /// Signals that the backend failed mid-request: flips it Inactive and
    /// closes every idle connection.
    pub async fn mark_failed(&self) {
        let drained = {
            let mut inner = self.lock_inner();
            self.fail_locked(&mut inner)
        };
        warn!("{}: backend marked inactive", self.config.address);
        close_all(drained).await;
    }

    /// Takes the backend out of service: flips it Inactive, stops all pooling
    /// and closes every idle connection. Leases still out are closed when
    /// released.
    pub async fn shutdown(&self) {
        let drained = {
            let mut inner = self.lock_inner();
            inner.closed = true;
            inner.state = BackendState::Inactive;
            inner.ring.drain()
        };
        info!(
            "{}: shutting down, closing {} idle connections",
            self.config.address,
            drained.len()
        );
        close_all(drained).await;
    }

    /// Puts a shut-down backend back in service. It stays Inactive until its
    /// next successful connect.
    pub fn start(&self) {
        let mut inner = self.lock_inner();
        if inner.closed {
            inner.closed = false;
            inner.failed_at = None;
            info!("{}: backend started", self.config.address);
        }
    }

    pub fn stats(&self) -> BackendStats {
        let inner = self.lock_inner();
        BackendStats {
            address: self.config.address.clone(),
            backup: self.config.backup,
            state: inner.state,
            closed: inner.closed,
            active: inner.active,
            connecting: inner.connecting,
            idle: inner.ring.len(),
            keepalive_total: self.keepalive_total.load(Ordering::Relaxed),
            connect_total: self.connect_total.load(Ordering::Relaxed),
            failure_total: self.failure_total.load(Ordering::Relaxed),
        }
    }

    fn fail_locked(&self, inner: &mut BackendInner) -> Vec<Connection> {
        self.failure_total.fetch_add(1, Ordering::Relaxed);
        inner.state = BackendState::Inactive;
        inner.failed_at = Some(Instant::now());
        inner.ring.drain()
    }

    /// Accounts for a lease dropped without being released.
    fn abandon(&self, conn: Connection) {
        let mut inner = self.lock_inner();
        inner.active = (inner.active - 1).max(0);
        debug!("hmux[{}] lease dropped without release", conn.trace_id());
    }

    fn lock_inner(&self) -> MutexGuard<'_, BackendInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("address", &self.config.address)
            .field("state", &self.state())
            .finish()
    }
}

async fn close_all(conns: Vec<Connection>) {
    for mut conn in conns {
        conn.close().await;
    }
}

/// Undoes the `connecting` count if the connect future is dropped.
struct ConnectingGuard<'a> {
    backend: &'a Backend,
}

impl ConnectingGuard<'_> {
    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.backend.lock_inner();
        inner.connecting = (inner.connecting - 1).max(0);
    }
}

/// A connection on loan from a [`Backend`].
///
/// Dereferences to the [`Connection`]. Hand it back with
/// [`Backend::release`]; a lease that is dropped instead still gives its
/// slot back, but its socket is closed rather than pooled.
pub struct PooledConnection {
    conn: Option<Connection>,
    backend: Arc<Backend>,
    recycled: bool,
}

impl PooledConnection {
    fn new(conn: Connection, backend: Arc<Backend>, recycled: bool) -> Self {
        Self {
            conn: Some(conn),
            backend,
            recycled,
        }
    }

    /// The backend this connection belongs to.
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// True when the connection came out of the idle ring rather than
    /// being opened for this lease.
    pub fn is_recycled(&self) -> bool {
        self.recycled
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("lease holds its connection until released")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("lease holds its connection until released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.backend.abandon(conn);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("backend", &self.backend.address())
            .field("recycled", &self.recycled)
            .field("connection", &self.conn)
            .finish()
    }
}
