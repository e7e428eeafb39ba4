use crate::error::{Error, Result};
use crate::guard::ConnectionGuard;
use crate::settings::PoolSettings;
use crate::state::{State, Status};
use crate::time_connection::TimeConnection;
use crate::Manager;
use dark_std::sync::AtomicDuration;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// What a returning connection (or a freed slot) turns into for the oldest waiter.
pub(crate) enum Grant<C> {
    /// A probed connection, ready to use
    Ready(TimeConnection<C>),
    /// A reserved slot; the waiter opens the connection itself
    Slot,
}

struct Inner<C> {
    /// LIFO: the most recently checked-in connection is handed out first
    idle: Vec<TimeConnection<C>>,
    /// FIFO queue of blocked acquirers
    waiters: VecDeque<(u64, Sender<Grant<C>>)>,
    next_waiter: u64,
    /// Physical connections, counting slots reserved for connects in flight
    size: u64,
    last_error: Option<Instant>,
}

impl<C> Inner<C> {
    /// Gives `grant` to the oldest waiter still listening. Hands it back when
    /// nobody is.
    fn hand_off(&mut self, mut grant: Grant<C>) -> std::result::Result<(), Grant<C>> {
        while let Some((_, tx)) = self.waiters.pop_front() {
            match tx.try_send(grant) {
                Ok(()) => return Ok(()),
                Err(e) => grant = e.into_inner(),
            }
        }
        Err(grant)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Stats {
    acquired: AtomicU64,
    opened: AtomicU64,
    retired: AtomicU64,
    /// acquisitions and releases since the monitor last looked
    interval_ops: AtomicU64,
    /// failed connects and failed probes since the monitor last looked
    interval_failures: AtomicU64,
}

/// Pool of physical connections for one alias.
///
/// Cloning is cheap and every clone refers to the same pool.
pub struct Pool<M: Manager> {
    pub manager: Arc<M>,
    id: u64,
    alias: Arc<str>,
    settings: Arc<PoolSettings>,
    created_at: Instant,
    inner: Arc<Mutex<Inner<M::Connection>>>,
    status: Arc<AtomicU8>,
    pub(crate) in_use: Arc<AtomicU64>,
    pub(crate) waits: Arc<AtomicU64>,
    pub(crate) connecting: Arc<AtomicU64>,
    stats: Arc<Stats>,
    returned: Arc<Notify>,
    /// timeout of one liveness probe, default 10s
    pub timeout_check: Arc<AtomicDuration>,
}

impl<M: Manager> Debug for Pool<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        Debug::fmt(&state, f)
    }
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            id: self.id,
            alias: self.alias.clone(),
            settings: self.settings.clone(),
            created_at: self.created_at,
            inner: self.inner.clone(),
            status: self.status.clone(),
            in_use: self.in_use.clone(),
            waits: self.waits.clone(),
            connecting: self.connecting.clone(),
            stats: self.stats.clone(),
            returned: self.returned.clone(),
            timeout_check: self.timeout_check.clone(),
        }
    }
}

impl<M: Manager> Pool<M> {
    /// An empty pool. Connections are opened on demand.
    pub fn new(alias: &str, settings: PoolSettings, manager: M) -> Self {
        Self {
            manager: Arc::new(manager),
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            alias: Arc::from(alias),
            settings: Arc::new(settings),
            created_at: Instant::now(),
            inner: Arc::new(Mutex::new(Inner {
                idle: Vec::new(),
                waiters: VecDeque::new(),
                next_waiter: 0,
                size: 0,
                last_error: None,
            })),
            status: Arc::new(AtomicU8::new(Status::Active.as_u8())),
            in_use: Arc::new(AtomicU64::new(0)),
            waits: Arc::new(AtomicU64::new(0)),
            connecting: Arc::new(AtomicU64::new(0)),
            stats: Arc::new(Stats::default()),
            returned: Arc::new(Notify::new()),
            timeout_check: Arc::new(AtomicDuration::new(Some(Duration::from_secs(10)))),
        }
    }

    /// Validates `settings`, builds the pool and opens `min_connections`
    /// (at least one) connections.
    ///
    /// Failing to open the very first connection means the target is
    /// unusable and is reported as [`Error::Fatal`].
    pub async fn open(alias: &str, settings: PoolSettings, manager: M) -> Result<Self> {
        settings.validate()?;
        let pool = Self::new(alias, settings, manager);
        let warm = pool.settings.min_connections.max(1);
        for i in 0..warm {
            match pool.manager.connect().await {
                Ok(conn) => {
                    pool.stats.opened.fetch_add(1, Ordering::Relaxed);
                    let mut inner = pool.inner.lock();
                    inner.size += 1;
                    inner.idle.push(TimeConnection::new(conn));
                }
                Err(e) if i == 0 => {
                    return Err(Error::connect(alias, true, e));
                }
                Err(e) => {
                    warn!(alias, opened = i, error = %e, "could not warm up pool, continuing with fewer connections");
                    break;
                }
            }
        }
        info!(alias, pool = pool.id, size = pool.inner.lock().size, "connection pool ready");
        Ok(pool)
    }

    /// Acquire with the pool's configured `acquire_timeout`.
    pub async fn get(&self) -> Result<ConnectionGuard<M>> {
        self.get_timeout(Some(self.settings.acquire_timeout)).await
    }

    /// Acquire a connection, waiting at most `d` (`None` waits forever).
    pub async fn get_timeout(&self, d: Option<Duration>) -> Result<ConnectionGuard<M>> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        defer!(|| {
            self.waits.fetch_sub(1, Ordering::SeqCst);
        });
        match d {
            None => self.acquire().await,
            Some(d) => tokio::time::timeout(d, self.acquire())
                .await
                .map_err(|_e| Error::Timeout(d))?,
        }
    }

    async fn acquire(&self) -> Result<ConnectionGuard<M>> {
        self.stats.interval_ops.fetch_add(1, Ordering::Relaxed);
        loop {
            let step = {
                let mut inner = self.inner.lock();
                if self.status() != Status::Active {
                    return Err(Error::Draining(self.alias.to_string()));
                }
                if let Some(conn) = inner.idle.pop() {
                    Step::Ready(conn)
                } else if inner.size < self.settings.capacity() {
                    inner.size += 1;
                    Step::Open(inner.size > self.settings.max_connections)
                } else {
                    let id = inner.next_waiter;
                    inner.next_waiter += 1;
                    let (tx, rx) = flume::bounded(1);
                    inner.waiters.push_back((id, tx));
                    Step::Wait(Waiter { pool: self, id, rx })
                }
            };
            match step {
                Step::Ready(conn) => return Ok(self.check_out(conn)),
                Step::Open(overflow) => {
                    if overflow {
                        debug!(alias = %self.alias, "baseline exhausted, opening overflow connection");
                    }
                    return self.open_slot().await;
                }
                Step::Wait(waiter) => {
                    let grant = waiter.rx.recv_async().await;
                    drop(waiter);
                    match grant {
                        Ok(Grant::Ready(conn)) => return Ok(self.check_out(conn)),
                        Ok(Grant::Slot) => return self.open_slot().await,
                        // queue dropped by a drain, the status check above reports it
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    /// Fills a slot already counted in `size`.
    async fn open_slot(&self) -> Result<ConnectionGuard<M>> {
        let mut slot = Slot {
            pool: self,
            armed: true,
        };
        self.connecting.fetch_add(1, Ordering::SeqCst);
        defer!(|| {
            self.connecting.fetch_sub(1, Ordering::SeqCst);
        });
        match self.manager.connect().await {
            Ok(conn) => {
                if self.status() != Status::Active {
                    // drained while connecting; the armed slot is given back on return
                    self.manager.close(conn).await;
                    return Err(Error::Draining(self.alias.to_string()));
                }
                slot.armed = false;
                self.stats.opened.fetch_add(1, Ordering::Relaxed);
                Ok(self.check_out(TimeConnection::new(conn)))
            }
            Err(e) => {
                self.record_failure();
                let fatal = self.manager.is_fatal(&e);
                warn!(alias = %self.alias, fatal, error = %e, "failed to open connection");
                Err(Error::connect(&self.alias, fatal, e))
            }
        }
    }

    fn check_out(&self, conn: TimeConnection<M::Connection>) -> ConnectionGuard<M> {
        self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard::new(conn, self.clone())
    }

    /// Return a connection; same as [`ConnectionGuard::release`].
    pub async fn release(&self, guard: ConnectionGuard<M>) {
        debug_assert!(guard.pool().same_pool(self));
        guard.release().await
    }

    /// Takes back a checked-out connection: probe, then idle stack, waiter,
    /// or close.
    pub(crate) async fn recycle(&self, mut conn: TimeConnection<M::Connection>, broken: bool) {
        self.stats.interval_ops.fetch_add(1, Ordering::Relaxed);
        let healthy = if broken {
            false
        } else if self.settings.health_checks && self.status() == Status::Active {
            self.probe(&mut conn.connection).await
        } else {
            true
        };
        if healthy {
            conn.touch();
            if let Some(conn) = self.check_in(conn) {
                self.manager.close(conn.into_connection()).await;
            }
        } else {
            self.record_failure();
            self.stats.retired.fetch_add(1, Ordering::Relaxed);
            self.free_slot();
            self.manager.close(conn.into_connection()).await;
        }
        self.finish_return();
    }

    /// Synchronous return path for guards dropped outside a runtime.
    pub(crate) fn discard(&self, conn: TimeConnection<M::Connection>) {
        self.free_slot();
        drop(conn);
        self.finish_return();
    }

    fn finish_return(&self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        if self.status() != Status::Active {
            self.returned.notify_waiters();
        }
    }

    async fn probe(&self, conn: &mut M::Connection) -> bool {
        let limit = self
            .timeout_check
            .get()
            .unwrap_or(Duration::from_secs(10));
        match tokio::time::timeout(limit, self.manager.check(conn)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(alias = %self.alias, error = %e, "liveness probe failed, retiring connection");
                false
            }
            Err(_) => {
                debug!(alias = %self.alias, ?limit, "liveness probe timed out, retiring connection");
                false
            }
        }
    }

    /// Places a healthy connection. Returns it when it has to be closed
    /// instead: pool no longer active, or overflow nobody is waiting for.
    fn check_in(&self, conn: TimeConnection<M::Connection>) -> Option<TimeConnection<M::Connection>> {
        let mut inner = self.inner.lock();
        if self.status() != Status::Active {
            inner.size -= 1;
            return Some(conn);
        }
        let conn = match inner.hand_off(Grant::Ready(conn)) {
            Err(Grant::Ready(conn)) => conn,
            _ => return None,
        };
        if inner.size > self.settings.max_connections {
            inner.size -= 1;
            return Some(conn);
        }
        inner.idle.push(conn);
        None
    }

    /// Gives up one slot of `size`, passing it to the oldest waiter if any.
    fn free_slot(&self) {
        let mut inner = self.inner.lock();
        if self.status() == Status::Active && inner.hand_off(Grant::Slot).is_ok() {
            return;
        }
        inner.size -= 1;
    }

    /// Closes `conn` without a caller to await it.
    fn close_detached(&self, conn: TimeConnection<M::Connection>) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            handle.spawn(async move {
                manager.close(conn.into_connection()).await;
            });
        }
    }

    fn record_failure(&self) {
        self.stats.interval_failures.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().last_error = Some(Instant::now());
    }

    /// Stops accepting acquisitions. Queued acquirers are woken and fail with
    /// [`Error::Draining`]. Returns false if the pool was not active.
    pub fn mark_draining(&self) -> bool {
        let mut inner = self.inner.lock();
        if self.status() != Status::Active {
            return false;
        }
        self.status.store(Status::Draining.as_u8(), Ordering::SeqCst);
        inner.waiters.clear();
        true
    }

    /// Drains the pool: refuses new acquisitions, closes idle connections,
    /// waits up to `grace` for checked-out connections to come back, then
    /// closes the pool. Connections still out after that are closed as they
    /// are released. Safe to call more than once.
    pub async fn drain_and_close(&self, grace: Duration) {
        if self.status() == Status::Closed {
            return;
        }
        self.mark_draining();
        let idle = {
            let mut inner = self.inner.lock();
            let idle = std::mem::take(&mut inner.idle);
            inner.size -= idle.len() as u64;
            idle
        };
        for conn in idle {
            self.manager.close(conn.into_connection()).await;
        }
        let deadline = Instant::now() + grace;
        loop {
            let returned = self.returned.notified();
            let outstanding = self.in_use.load(Ordering::SeqCst);
            if outstanding == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, returned).await.is_err() {
                warn!(alias = %self.alias, pool = self.id, outstanding, "grace period elapsed, force closing pool");
                break;
            }
        }
        self.status.store(Status::Closed.as_u8(), Ordering::SeqCst);
        info!(alias = %self.alias, pool = self.id, "connection pool closed");
    }

    /// Closes idle connections beyond `target`, least recently used first.
    /// Returns how many were closed.
    pub async fn shrink_idle(&self, target: u64) -> u64 {
        let excess = {
            let mut inner = self.inner.lock();
            let keep = target as usize;
            if inner.idle.len() <= keep {
                return 0;
            }
            let n = inner.idle.len() - keep;
            let excess: Vec<_> = inner.idle.drain(..n).collect();
            inner.size -= n as u64;
            excess
        };
        let n = excess.len() as u64;
        for conn in excess {
            self.manager.close(conn.into_connection()).await;
        }
        n
    }

    /// Opens connections until `size` is back at `min_connections`, handing
    /// each one to a waiter or the idle stack. Stops at the first connect
    /// failure. Returns how many were opened.
    pub async fn replenish(&self) -> u64 {
        let mut opened = 0;
        loop {
            {
                let mut inner = self.inner.lock();
                if self.status() != Status::Active
                    || inner.size >= self.settings.min_connections
                    || inner.size >= self.settings.capacity()
                {
                    break;
                }
                inner.size += 1;
            }
            let mut slot = Slot {
                pool: self,
                armed: true,
            };
            match self.manager.connect().await {
                Ok(conn) => {
                    slot.armed = false;
                    self.stats.opened.fetch_add(1, Ordering::Relaxed);
                    if let Some(conn) = self.check_in(TimeConnection::new(conn)) {
                        self.manager.close(conn.into_connection()).await;
                        break;
                    }
                    opened += 1;
                }
                Err(e) => {
                    self.record_failure();
                    warn!(alias = %self.alias, error = %e, "could not restore minimum connections");
                    break;
                }
            }
        }
        if opened > 0 {
            debug!(alias = %self.alias, pool = self.id, opened, "pool topped up to minimum");
        }
        opened
    }

    /// Reads and resets the (operations, failures) counters of the current
    /// monitoring interval.
    pub fn take_interval(&self) -> (u64, u64) {
        (
            self.stats.interval_ops.swap(0, Ordering::Relaxed),
            self.stats.interval_failures.swap(0, Ordering::Relaxed),
        )
    }

    pub fn state(&self) -> State {
        let inner = self.inner.lock();
        let max = self.settings.max_connections;
        State {
            alias: self.alias.to_string(),
            status: self.status(),
            min_connections: self.settings.min_connections,
            max_connections: max,
            max_overflow: self.settings.max_overflow,
            size: inner.size,
            overflow: inner.size.saturating_sub(max),
            idle: inner.idle.len() as u64,
            in_use: self.in_use.load(Ordering::SeqCst),
            waits: self.waits.load(Ordering::SeqCst),
            connecting: self.connecting.load(Ordering::SeqCst),
            acquired: self.stats.acquired.load(Ordering::Relaxed),
            opened: self.stats.opened.load(Ordering::Relaxed),
            retired: self.stats.retired.load(Ordering::Relaxed),
            age_secs: self.age().as_secs_f64(),
            last_error_secs: inner.last_error.map(|t| t.elapsed().as_secs_f64()),
        }
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Process-unique id of this pool instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether both handles refer to the same pool instance.
    pub fn same_pool(&self, other: &Pool<M>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Set the timeout of one liveness probe.
    pub fn set_timeout_check(&self, duration: Option<Duration>) {
        self.timeout_check.store(duration);
    }

    pub fn get_timeout_check(&self) -> Option<Duration> {
        self.timeout_check.get()
    }
}

enum Step<'a, M: Manager> {
    Ready(TimeConnection<M::Connection>),
    Open(bool),
    Wait(Waiter<'a, M>),
}

/// A place in the wait queue. Dropping it (timeout, cancelled future)
/// leaves the queue and passes on anything that was handed to it.
struct Waiter<'a, M: Manager> {
    pool: &'a Pool<M>,
    id: u64,
    rx: Receiver<Grant<M::Connection>>,
}

impl<M: Manager> Drop for Waiter<'_, M> {
    fn drop(&mut self) {
        let grant = {
            let mut inner = self.pool.inner.lock();
            inner.waiters.retain(|(id, _)| *id != self.id);
            // senders only send under the lock, so nothing can arrive after this
            self.rx.try_recv().ok()
        };
        match grant {
            Some(Grant::Ready(conn)) => {
                if let Some(conn) = self.pool.check_in(conn) {
                    self.pool.close_detached(conn);
                }
            }
            Some(Grant::Slot) => self.pool.free_slot(),
            None => {}
        }
    }
}

/// A reserved unit of `size` whose connect has not finished yet.
struct Slot<'a, M: Manager> {
    pool: &'a Pool<M>,
    armed: bool,
}

impl<M: Manager> Drop for Slot<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.free_slot();
        }
    }
}
