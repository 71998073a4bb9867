//! Adaptive connection pool
//!
//! The pool opens connections as demand requires and prunes them again once
//! demand subsides, without dropping below the most recent peak in between
//! so a surge followed by a lull does not thrash.
//!
//! Three background tasks run for the lifetime of the pool:
//! - **grow**: wakes on a demand signal and opens connections while borrowers
//!   are waiting or the pool is below its low-water mark, backing off after
//!   factory failures
//! - **prune**: periodically retires idle connections above
//!   `max(min_connections, recent peak)`
//! - **retire**: destroys connections handed to the retirement queue
//!
//! No lock is ever held across borrow, return and grow at the same time: each
//! step touches one queue or one counter.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_pool::prelude::*;
//!
//! let pool = ConnectionPool::new(
//!     PoolConfig::new().with_min_connections(2).with_max_connections(10),
//!     Arc::new(MyFactory),
//! )?;
//!
//! let mut session = pool.session();
//! let conn = pool.get_connection(&mut session).await?;
//! conn.call(|raw| async move { raw.ping().await }).await?;
//! pool.release_connection(&mut session, conn).await?;
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionFactory, OwnerId};
use crate::error::{Error, Result};
use crate::sync::{BlockingQueue, BoundedBlockingQueue, Semaphore};

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live connections (available + allocated)
    pub total_connections: usize,
    /// Connections waiting in the available queue
    pub available_connections: usize,
    /// Connections currently allocated to callers
    pub active_connections: usize,
    /// Borrowers waiting beyond the available supply
    pub connection_deficit: u64,
    /// Connections retired because they became invalid
    pub churned_connections: u64,
    /// Connections waiting to be destroyed
    pub retiring_connections: usize,
    /// Total number of connections opened
    pub connections_created: u64,
    /// Total number of connections destroyed
    pub connections_destroyed: u64,
    /// Total number of borrows served from the available queue
    pub acquisitions: u64,
    /// Total number of borrows served from a session's cached connection
    pub reuses: u64,
    /// Number of borrows that timed out
    pub timeouts: u64,
    /// Number of failed open attempts
    pub open_failures: u64,
    /// Number of failed destroy attempts
    pub destroy_failures: u64,
    /// Total wait time for connections (in milliseconds)
    pub total_wait_time_ms: u64,
}

/// Atomic pool counters for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_destroyed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub reuses: AtomicU64,
    pub timeouts: AtomicU64,
    pub open_failures: AtomicU64,
    pub destroy_failures: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection destruction
    pub fn record_destroyed(&self) {
        self.connections_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition from the available queue
    pub fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record a borrow served from a session's cache
    pub fn record_reuse(&self) {
        self.reuses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a borrow timeout
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed open
    pub fn record_open_failure(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed destroy
    pub fn record_destroy_failure(&self) {
        self.destroy_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Calculate average wait time in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        if acquisitions == 0 {
            0.0
        } else {
            self.total_wait_time_ms.load(Ordering::Relaxed) as f64 / acquisitions as f64
        }
    }
}

/// Retirement queue, optionally bounded
enum RetireQueue<T> {
    Unbounded(BlockingQueue<T>),
    Bounded(BoundedBlockingQueue<T>),
}

impl<T> RetireQueue<T> {
    fn new(capacity: usize) -> Self {
        if capacity == 0 {
            Self::Unbounded(BlockingQueue::new())
        } else {
            Self::Bounded(BoundedBlockingQueue::new(capacity))
        }
    }

    async fn add(&self, item: T) {
        match self {
            Self::Unbounded(queue) => queue.add(item),
            Self::Bounded(queue) => queue.add(item).await,
        }
    }

    /// Wait for room without handing over an item
    async fn reserve(&self) {
        if let Self::Bounded(queue) = self {
            queue.reserve().await;
        }
    }

    /// Append into room taken by `reserve`
    fn push_reserved(&self, item: T) {
        match self {
            Self::Unbounded(queue) => queue.add(item),
            Self::Bounded(queue) => queue.push_reserved(item),
        }
    }

    async fn remove(&self) -> T {
        match self {
            Self::Unbounded(queue) => queue.remove().await,
            Self::Bounded(queue) => queue.remove().await,
        }
    }

    fn try_remove(&self) -> Option<T> {
        match self {
            Self::Unbounded(queue) => queue.try_remove(),
            Self::Bounded(queue) => queue.try_remove(),
        }
    }

    fn size(&self) -> usize {
        match self {
            Self::Unbounded(queue) => queue.size(),
            Self::Bounded(queue) => queue.size(),
        }
    }
}

/// State shared between the pool handle, its sessions and its background tasks
struct PoolShared<F: ConnectionFactory> {
    id: String,
    config: PoolConfig,
    factory: Arc<F>,
    total_connections: AtomicUsize,
    available: BlockingQueue<Arc<Connection<F>>>,
    /// Positive: surplus available connections. Negative: unmet demand.
    connections_supply: AtomicI64,
    demand: Semaphore,
    active_ceiling: AtomicUsize,
    retire_queue: RetireQueue<Arc<Connection<F>>>,
    churned_connections: AtomicU64,
    backoff: Mutex<Backoff>,
    next_connection_id: AtomicU64,
    next_owner_id: AtomicU64,
    stats: AtomicPoolStats,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    self_ref: Weak<PoolShared<F>>,
}

/// A borrow in progress. Dropping it before the borrow completes gives back
/// the registered demand and any connection popped but not yet judged.
struct PendingBorrow<'a, F: ConnectionFactory> {
    shared: &'a PoolShared<F>,
    popped: Option<Arc<Connection<F>>>,
    completed: bool,
}

impl<F: ConnectionFactory> Drop for PendingBorrow<'_, F> {
    fn drop(&mut self) {
        if let Some(conn) = self.popped.take() {
            if self.shared.is_closed() {
                self.shared.connections_supply.fetch_sub(1, Ordering::AcqRel);
                self.shared.total_connections.fetch_sub(1, Ordering::AcqRel);
                self.shared.retire_detached(conn);
            } else {
                self.shared.available.add(conn);
            }
        }
        if !self.completed {
            self.shared.connections_supply.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// A connection on its way to the retirement queue. If the hand-off is
/// cancelled while waiting for room, it finishes on a detached task.
struct PendingRetire<'a, F: ConnectionFactory> {
    shared: &'a PoolShared<F>,
    conn: Option<Arc<Connection<F>>>,
}

impl<F: ConnectionFactory> Drop for PendingRetire<'_, F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.retire_detached(conn);
        }
    }
}

/// A caller's borrowing context.
///
/// A session carries the caller identity that connections are allocated to,
/// and caches the connection it currently holds so repeated borrows from the
/// same session reuse it without touching the shared queues. The session is
/// owned by the caller; nothing else reads or writes its slot.
///
/// Dropping a session that still holds a connection hands the connection
/// back to the pool on a background task.
pub struct Session<F: ConnectionFactory> {
    owner: OwnerId,
    cached: Option<Arc<Connection<F>>>,
    pool: Arc<PoolShared<F>>,
}

impl<F: ConnectionFactory> Session<F> {
    /// Identity connections are allocated to
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// The connection this session currently holds, if any
    pub fn cached(&self) -> Option<&Arc<Connection<F>>> {
        self.cached.as_ref()
    }
}

impl<F: ConnectionFactory> Drop for Session<F> {
    fn drop(&mut self) {
        let Some(conn) = self.cached.take() else {
            return;
        };
        if conn.release(self.owner).is_err() {
            return;
        }
        warn!(
            pool = %self.pool.id,
            connection = %conn,
            owner = %self.owner,
            "Session dropped while holding a connection; returning it to the pool"
        );
        match Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(&self.pool);
                handle.spawn(async move {
                    pool.give_back(conn).await;
                });
            }
            Err(_) => {
                self.pool.total_connections.fetch_sub(1, Ordering::AcqRel);
                self.pool.retire_detached(conn);
            }
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for Session<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("owner", &self.owner)
            .field("cached", &self.cached.as_ref().map(|c| c.id()))
            .field("pool", &self.pool.id)
            .finish()
    }
}

/// Adaptive pool of [`Connection`]s.
///
/// Must be created inside a tokio runtime; the background tasks are spawned on
/// the current runtime. Dropping the pool stops them.
pub struct ConnectionPool<F: ConnectionFactory> {
    shared: Arc<PoolShared<F>>,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a pool and start its grow, prune and retire tasks.
    ///
    /// Fails with [`Error::Configuration`] if the sizing is inconsistent.
    pub fn new(config: PoolConfig, factory: Arc<F>) -> Result<Self> {
        config.validate()?;
        let handle = Handle::try_current()
            .map_err(|_| Error::internal("connection pool must be created inside a tokio runtime"))?;

        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new_cyclic(|weak: &Weak<PoolShared<F>>| {
            let id = config
                .name
                .clone()
                .unwrap_or_else(|| format!("pool-{:x}", weak.as_ptr() as *const () as usize));
            PoolShared {
                id,
                backoff: Mutex::new(Backoff::new(&config)),
                retire_queue: RetireQueue::new(config.retire_queue_capacity),
                config,
                factory,
                total_connections: AtomicUsize::new(0),
                available: BlockingQueue::new(),
                connections_supply: AtomicI64::new(0),
                demand: Semaphore::new(0, 1),
                active_ceiling: AtomicUsize::new(0),
                churned_connections: AtomicU64::new(0),
                next_connection_id: AtomicU64::new(1),
                next_owner_id: AtomicU64::new(1),
                stats: AtomicPoolStats::new(),
                closed: AtomicBool::new(false),
                shutdown_tx,
                self_ref: weak.clone(),
            }
        });

        info!(
            pool = %shared.id,
            min_connections = shared.config.min_connections,
            max_connections = shared.config.max_connections,
            "Connection pool started"
        );

        handle.spawn(Arc::clone(&shared).grow_loop(shared.shutdown_tx.subscribe()));
        handle.spawn(Arc::clone(&shared).prune_loop(shared.shutdown_tx.subscribe()));
        handle.spawn(Arc::clone(&shared).retire_loop(shared.shutdown_tx.subscribe()));

        shared.resize_pool();

        Ok(Self { shared })
    }

    /// Pool identifier (configured name or a generated id)
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Open a new borrowing context
    pub fn session(&self) -> Session<F> {
        Session {
            owner: OwnerId::new(self.shared.next_owner_id.fetch_add(1, Ordering::Relaxed)),
            cached: None,
            pool: Arc::clone(&self.shared),
        }
    }

    /// Borrow a connection for `session`.
    ///
    /// A session that already holds a connection gets the same one back.
    /// Otherwise the caller waits up to the connection timeout for one to
    /// become available, waking the grow task if supply is short.
    pub async fn get_connection(&self, session: &mut Session<F>) -> Result<Arc<Connection<F>>> {
        self.check_session(session)?;
        if self.shared.is_closed() {
            return Err(Error::PoolClosed);
        }

        if let Some(conn) = &session.cached {
            conn.allocate(session.owner);
            self.shared.stats.record_reuse();
            debug!(
                pool = %self.shared.id,
                connection = %conn,
                reuse = true,
                "Connection allocated"
            );
            return Ok(Arc::clone(conn));
        }

        let conn = self.shared.borrow().await?;
        conn.allocate(session.owner);
        self.shared.update_active_ceiling();
        session.cached = Some(Arc::clone(&conn));

        debug!(
            pool = %self.shared.id,
            connection = %conn,
            owner = %session.owner,
            reuse = false,
            "Connection allocated"
        );
        Ok(conn)
    }

    /// Return a connection borrowed through `session`.
    ///
    /// Fails with [`Error::DoubleRelease`] if the session does not own the
    /// connection; the pool is left untouched in that case. A connection that
    /// has captured an error is retired instead of being made available.
    pub async fn release_connection(
        &self,
        session: &mut Session<F>,
        conn: Arc<Connection<F>>,
    ) -> Result<()> {
        self.check_session(session)?;
        conn.release(session.owner)?;

        if session
            .cached
            .as_ref()
            .is_some_and(|cached| Arc::ptr_eq(cached, &conn))
        {
            session.cached = None;
        }

        self.shared.give_back(conn).await;
        Ok(())
    }

    /// Wake the grow task if the pool is below its low-water mark
    pub fn resize_pool(&self) {
        self.shared.resize_pool();
    }

    /// Live connections (available + allocated)
    pub fn total_connections(&self) -> usize {
        self.shared.total_connections.load(Ordering::Acquire)
    }

    /// Connections waiting in the available queue
    pub fn available_connections(&self) -> usize {
        self.shared.available.size()
    }

    /// Connections currently allocated to callers
    pub fn active_connections(&self) -> usize {
        self.shared.active_connections()
    }

    /// Borrowers waiting beyond the available supply
    pub fn connection_deficit(&self) -> u64 {
        self.shared.connection_deficit()
    }

    /// Connections retired because they became invalid
    pub fn churned_connections(&self) -> u64 {
        self.shared.churned_connections.load(Ordering::Acquire)
    }

    /// Message of the open failure behind the current backoff window, if any
    pub fn last_open_error(&self) -> Option<String> {
        self.shared.backoff.lock().last_error().map(str::to_owned)
    }

    /// Snapshot of the pool counters
    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        PoolStats {
            total_connections: shared.total_connections.load(Ordering::Acquire),
            available_connections: shared.available.size(),
            active_connections: shared.active_connections(),
            connection_deficit: shared.connection_deficit(),
            churned_connections: shared.churned_connections.load(Ordering::Acquire),
            retiring_connections: shared.retire_queue.size(),
            connections_created: shared.stats.connections_created.load(Ordering::Relaxed),
            connections_destroyed: shared.stats.connections_destroyed.load(Ordering::Relaxed),
            acquisitions: shared.stats.acquisitions.load(Ordering::Relaxed),
            reuses: shared.stats.reuses.load(Ordering::Relaxed),
            timeouts: shared.stats.timeouts.load(Ordering::Relaxed),
            open_failures: shared.stats.open_failures.load(Ordering::Relaxed),
            destroy_failures: shared.stats.destroy_failures.load(Ordering::Relaxed),
            total_wait_time_ms: shared.stats.total_wait_time_ms.load(Ordering::Relaxed),
        }
    }

    /// Whether the pool has been closed
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stop the background tasks and destroy every idle or retiring
    /// connection. Connections still allocated are destroyed when they are
    /// released. Borrowers that are waiting fail with [`Error::PoolClosed`].
    pub async fn close(&self) -> Result<()> {
        if !self.shared.begin_shutdown() {
            return Ok(());
        }
        self.shared.drain().await;
        info!(pool = %self.shared.id, "Connection pool closed");
        Ok(())
    }

    fn check_session(&self, session: &Session<F>) -> Result<()> {
        if Arc::ptr_eq(&session.pool, &self.shared) {
            Ok(())
        } else {
            Err(Error::internal(format!(
                "session {} belongs to pool [{}], not [{}]",
                session.owner, session.pool.id, self.shared.id
            )))
        }
    }
}

impl<F: ConnectionFactory> Drop for ConnectionPool<F> {
    fn drop(&mut self) {
        if !self.shared.begin_shutdown() {
            return;
        }
        if let Ok(handle) = Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            handle.spawn(async move {
                shared.drain().await;
            });
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.shared.id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<F: ConnectionFactory> PoolShared<F> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flip to closed and signal the tasks. Returns false if already closed.
    fn begin_shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown_tx.send_replace(true);
        true
    }

    fn active_connections(&self) -> usize {
        self.total_connections
            .load(Ordering::Acquire)
            .saturating_sub(self.available.size())
    }

    fn connection_deficit(&self) -> u64 {
        let supply = self.connections_supply.load(Ordering::Acquire);
        if supply < 0 {
            supply.unsigned_abs()
        } else {
            0
        }
    }

    fn update_active_ceiling(&self) {
        self.active_ceiling
            .fetch_max(self.active_connections(), Ordering::AcqRel);
    }

    fn resize_pool(&self) {
        if self.total_connections.load(Ordering::Acquire) < self.config.min_connections {
            debug!(pool = %self.id, "Connection pool resized to fit dimensions");
            self.demand.release(1);
        }
    }

    /// Whether the grow task should open another connection
    fn needs_growth(&self) -> bool {
        let total = self.total_connections.load(Ordering::Acquire);
        let supply = self.connections_supply.load(Ordering::Acquire);
        (supply < 0 || total < self.config.min_connections)
            && total < self.config.max_connections_limit()
    }

    /// Take a connection off the available queue for a borrower.
    async fn borrow(&self) -> Result<Arc<Connection<F>>> {
        let timeout = self.config.effective_connection_timeout();
        let start = Instant::now();
        let mut shutdown = self.shutdown_tx.subscribe();

        self.connections_supply.fetch_sub(1, Ordering::AcqRel);
        let mut pending = PendingBorrow {
            shared: self,
            popped: None,
            completed: false,
        };

        loop {
            let conn = match self.available.try_remove() {
                Some(conn) => Some(conn),
                None => {
                    self.demand.release(1);
                    debug!(pool = %self.id, "Wait for connection to become available");

                    let remaining = timeout.saturating_sub(start.elapsed());
                    tokio::select! {
                        conn = self.available.remove_timeout(remaining) => conn,
                        _ = stopped(&mut shutdown) => return Err(Error::PoolClosed),
                    }
                }
            };

            let Some(conn) = conn else {
                self.stats.record_timeout();
                return Err(Error::timeout(format!(
                    "timed out waiting for connection from pool [{}] after {}ms",
                    self.id,
                    timeout.as_millis()
                )));
            };

            pending.popped = Some(Arc::clone(&conn));
            let valid = conn.is_valid(self.config.validate_on_borrow).await;
            pending.popped = None;

            // The popped connection consumed this borrower's demand. Retiring
            // it leaves the borrower waiting again, so demand is counted again.
            if !valid {
                debug!(
                    pool = %self.id,
                    connection = %conn,
                    "Connection is no longer valid and is being retired"
                );
                self.connections_supply.fetch_sub(1, Ordering::AcqRel);
                self.churned_connections.fetch_add(1, Ordering::AcqRel);
                self.total_connections.fetch_sub(1, Ordering::AcqRel);
                self.retire(conn).await;
            } else if conn.is_end_of_life() {
                debug!(
                    pool = %self.id,
                    connection = %conn,
                    "Connection has reached end-of-life and is being retired"
                );
                self.connections_supply.fetch_sub(1, Ordering::AcqRel);
                self.total_connections.fetch_sub(1, Ordering::AcqRel);
                self.retire(conn).await;
            } else {
                pending.completed = true;
                self.stats
                    .record_acquisition(start.elapsed().as_millis() as u64);
                return Ok(conn);
            }
        }
    }

    /// Put a released connection back into circulation, or retire it.
    async fn give_back(&self, conn: Arc<Connection<F>>) {
        if self.is_closed() {
            self.total_connections.fetch_sub(1, Ordering::AcqRel);
            self.destroy(conn).await;
        } else if !conn.is_valid(false).await {
            debug!(
                pool = %self.id,
                connection = %conn,
                "Connection is no longer valid and is being retired"
            );
            self.churned_connections.fetch_add(1, Ordering::AcqRel);
            self.total_connections.fetch_sub(1, Ordering::AcqRel);
            self.retire(conn).await;
        } else {
            self.connections_supply.fetch_add(1, Ordering::AcqRel);
            self.available.add(Arc::clone(&conn));
            debug!(pool = %self.id, connection = %conn, "Connection released");
        }
    }

    /// Hand a connection to the retire task, waiting for room in a bounded queue
    async fn retire(&self, conn: Arc<Connection<F>>) {
        let mut pending = PendingRetire {
            shared: self,
            conn: Some(conn),
        };
        self.retire_queue.reserve().await;
        if let Some(conn) = pending.conn.take() {
            self.retire_queue.push_reserved(conn);
        }
    }

    /// Retire a connection from a context that cannot await
    fn retire_detached(&self, conn: Arc<Connection<F>>) {
        match (self.self_ref.upgrade(), Handle::try_current()) {
            (Some(shared), Ok(handle)) => {
                handle.spawn(async move {
                    if shared.is_closed() {
                        shared.destroy(conn).await;
                    } else {
                        shared.retire_queue.add(conn).await;
                    }
                });
            }
            _ => warn!(
                pool = %self.id,
                connection = %conn,
                "No runtime available; connection dropped without being destroyed"
            ),
        }
    }

    /// Destroy a connection through the factory. Failures are logged only.
    async fn destroy(&self, conn: Arc<Connection<F>>) {
        let id = conn.id();
        // run on its own task so a panicking factory cannot take the caller down
        match tokio::spawn(async move { conn.close().await }).await {
            Ok(Ok(())) => self.stats.record_destroyed(),
            Ok(Err(_)) => self.stats.record_destroy_failure(),
            Err(e) => {
                error!(pool = %self.id, connection = id, error = %e, "Connection destroy task failed");
                self.stats.record_destroy_failure();
            }
        }
    }

    /// Open a connection through the factory on its own task.
    async fn open_connection(&self) -> Result<Arc<Connection<F>>> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let factory = Arc::clone(&self.factory);
        let config = self.config.clone();
        match tokio::spawn(async move { Connection::open(id, factory, &config).await }).await {
            Ok(result) => result.map(Arc::new),
            Err(e) => Err(Error::internal(format!("connection open task failed: {}", e))),
        }
    }

    /// Destroy everything idle or retiring. Used on shutdown.
    async fn drain(&self) {
        while let Some(conn) = self.available.try_remove() {
            self.connections_supply.fetch_sub(1, Ordering::AcqRel);
            self.total_connections.fetch_sub(1, Ordering::AcqRel);
            self.destroy(conn).await;
        }
        while let Some(conn) = self.retire_queue.try_remove() {
            self.destroy(conn).await;
        }
    }

    async fn grow_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = self.demand.acquire_and_drain() => {}
            }

            while self.needs_growth() {
                let remaining = self.backoff.lock().remaining();
                if let Some(remaining) = remaining {
                    debug!(
                        pool = %self.id,
                        backoff_ms = remaining.as_millis() as u64,
                        "Backing off before opening connection"
                    );
                    tokio::select! {
                        _ = stopped(&mut shutdown) => return,
                        _ = tokio::time::sleep(remaining) => {}
                    }
                    continue;
                }

                match self.open_connection().await {
                    Ok(conn) => {
                        self.total_connections.fetch_add(1, Ordering::AcqRel);
                        self.connections_supply.fetch_add(1, Ordering::AcqRel);
                        self.stats.record_created();
                        self.backoff.lock().record_success();
                        debug!(pool = %self.id, connection = %conn, "Connection added to pool");
                        self.available.add(conn);
                        if self.is_closed() {
                            // close() may have drained before this connection arrived
                            self.drain().await;
                            return;
                        }
                    }
                    Err(e) => {
                        self.stats.record_open_failure();
                        let period = self.backoff.lock().record_failure(&e);
                        error!(
                            pool = %self.id,
                            error = %e,
                            backoff_ms = period.as_millis() as u64,
                            "Failed to open connection"
                        );
                    }
                }

                if self.is_closed() {
                    return;
                }
            }
        }
        debug!(pool = %self.id, "Grow task stopped");
    }

    async fn prune_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.pruning_enabled() {
            debug!(pool = %self.id, "Pruning disabled");
            return;
        }

        let mut last_prune = Instant::now();
        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = tokio::time::sleep(self.config.prune_interval) => {}
            }

            if last_prune.elapsed() > self.config.inactivity_timeout {
                last_prune = Instant::now();
                let pruned = self.prune().await;
                if pruned > 0 {
                    debug!(pool = %self.id, pruned, "Pruned idle connections");
                }
            }
        }
        debug!(pool = %self.id, "Prune task stopped");
    }

    /// Retire idle connections above `max(min_connections, peak)`, then
    /// reset the peak so the next window measures afresh.
    async fn prune(&self) -> usize {
        let floor = self
            .config
            .min_connections
            .max(self.active_ceiling.load(Ordering::Acquire));
        let mut pruned = 0;

        while self.total_connections.load(Ordering::Acquire) > floor {
            let Some(conn) = self.available.try_remove() else {
                break;
            };
            debug!(
                pool = %self.id,
                connection = %conn,
                "Connection has expired and is being retired"
            );
            self.connections_supply.fetch_sub(1, Ordering::AcqRel);
            self.total_connections.fetch_sub(1, Ordering::AcqRel);
            self.retire(conn).await;
            pruned += 1;
        }

        self.active_ceiling.store(0, Ordering::Release);
        pruned
    }

    async fn retire_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let conn = tokio::select! {
                _ = stopped(&mut shutdown) => break,
                conn = self.retire_queue.remove() => conn,
            };
            debug!(pool = %self.id, connection = %conn, "Retiring connection");
            self.destroy(conn).await;
        }

        while let Some(conn) = self.retire_queue.try_remove() {
            self.destroy(conn).await;
        }
        debug!(pool = %self.id, "Retire task stopped");
    }
}

/// Resolves once the shutdown flag is set (or its sender is gone)
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoopFactory;

    #[async_trait]
    impl ConnectionFactory for NoopFactory {
        type Resource = ();

        async fn connect(&self, _config: &PoolConfig) -> Result<()> {
            Ok(())
        }

        async fn destroy(&self, _resource: &()) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prune_holds_recent_peak_for_one_window() {
        let pool = ConnectionPool::new(
            PoolConfig::new()
                .with_min_connections(1)
                .with_max_connections(10)
                .with_prune_interval(Duration::ZERO),
            Arc::new(NoopFactory),
        )
        .unwrap();

        let mut sessions: Vec<_> = (0..5).map(|_| pool.session()).collect();
        let mut held = Vec::new();
        for session in sessions.iter_mut() {
            held.push(pool.get_connection(session).await.unwrap());
        }
        assert_eq!(pool.shared.active_ceiling.load(Ordering::Acquire), 5);
        for (session, conn) in sessions.iter_mut().zip(held) {
            pool.release_connection(session, conn).await.unwrap();
        }
        assert_eq!(pool.total_connections(), 5);

        // the first pass keeps the burst's peak
        assert_eq!(pool.shared.prune().await, 0);
        assert_eq!(pool.total_connections(), 5);
        assert_eq!(pool.shared.active_ceiling.load(Ordering::Acquire), 0);

        // with the peak reset, the next pass falls back to the low-water mark
        assert_eq!(pool.shared.prune().await, 4);
        assert_eq!(pool.total_connections(), 1);
        assert_eq!(pool.available_connections(), 1);
        assert_eq!(pool.connection_deficit(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prune_respects_peak_of_current_window() {
        let pool = ConnectionPool::new(
            PoolConfig::new()
                .with_min_connections(0)
                .with_max_connections(10)
                .with_prune_interval(Duration::ZERO),
            Arc::new(NoopFactory),
        )
        .unwrap();

        let mut a = pool.session();
        let mut b = pool.session();
        let ca = pool.get_connection(&mut a).await.unwrap();
        let cb = pool.get_connection(&mut b).await.unwrap();
        pool.release_connection(&mut a, ca).await.unwrap();
        pool.release_connection(&mut b, cb).await.unwrap();
        pool.shared.prune().await;
        assert_eq!(pool.total_connections(), 2);

        // one borrower in the new window: only the idle surplus above it goes
        let ca = pool.get_connection(&mut a).await.unwrap();
        pool.release_connection(&mut a, ca).await.unwrap();
        assert_eq!(pool.shared.prune().await, 1);
        assert_eq!(pool.total_connections(), 1);
    }

    #[test]
    fn test_session_dropped_outside_runtime_uncounts_connection() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let (pool, session) = runtime.block_on(async {
            let pool = ConnectionPool::new(PoolConfig::new(), Arc::new(NoopFactory)).unwrap();
            let mut session = pool.session();
            pool.get_connection(&mut session).await.unwrap();
            (pool, session)
        });
        assert_eq!(pool.total_connections(), 1);
        assert!(Handle::try_current().is_err());

        drop(session);
        assert_eq!(pool.total_connections(), 0);
        assert_eq!(pool.available_connections(), 0);
        assert_eq!(pool.shared.retire_queue.size(), 0);
    }

    #[test]
    fn test_atomic_pool_stats() {
        let stats = AtomicPoolStats::new();

        stats.record_created();
        stats.record_created();
        stats.record_acquisition(100);
        stats.record_acquisition(200);
        stats.record_destroyed();
        stats.record_timeout();
        stats.record_open_failure();
        stats.record_reuse();

        assert_eq!(stats.connections_created.load(Ordering::Relaxed), 2);
        assert_eq!(stats.connections_destroyed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.acquisitions.load(Ordering::Relaxed), 2);
        assert_eq!(stats.timeouts.load(Ordering::Relaxed), 1);
        assert_eq!(stats.open_failures.load(Ordering::Relaxed), 1);
        assert_eq!(stats.reuses.load(Ordering::Relaxed), 1);
        assert!((stats.avg_wait_time_ms() - 150.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_retire_queue_variants() {
        let unbounded = RetireQueue::new(0);
        assert!(matches!(unbounded, RetireQueue::Unbounded(_)));
        unbounded.add(1).await;
        assert_eq!(unbounded.size(), 1);
        assert_eq!(unbounded.remove().await, 1);

        let bounded = RetireQueue::new(2);
        assert!(matches!(bounded, RetireQueue::Bounded(_)));
        bounded.add(1).await;
        bounded.add(2).await;
        assert_eq!(bounded.try_remove(), Some(1));
        assert_eq!(bounded.size(), 1);
    }
}
