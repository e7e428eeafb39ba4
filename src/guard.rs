use crate::pool::Pool;
use crate::time_connection::TimeConnection;
use crate::Manager;
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::time::Duration;

/// A connection checked out of a [`Pool`].
///
/// Prefer [`ConnectionGuard::release`]; dropping the guard releases it on a
/// spawned task instead.
pub struct ConnectionGuard<M: Manager> {
    pub inner: Option<TimeConnection<M::Connection>>,
    pool: Pool<M>,
    broken: bool,
}

impl<M: Manager> ConnectionGuard<M> {
    pub(crate) fn new(conn: TimeConnection<M::Connection>, pool: Pool<M>) -> ConnectionGuard<M> {
        pool.in_use.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: Some(conn),
            pool,
            broken: false,
        }
    }

    /// Flag the connection as permanently broken; it is closed instead of
    /// being probed and pooled on release.
    pub fn invalidate(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// The pool this connection came from, which may since have been replaced.
    pub fn pool(&self) -> &Pool<M> {
        &self.pool
    }

    pub fn age(&self) -> Duration {
        self.inner.as_ref().map(|c| c.age()).unwrap_or_default()
    }

    /// Hand the connection back, running the liveness probe if enabled.
    ///
    /// The return runs on its own task, so cancelling the caller while the
    /// probe is in flight still puts the connection (or its slot) back.
    pub async fn release(mut self) {
        if let Some(conn) = self.inner.take() {
            let pool = self.pool.clone();
            let broken = self.broken;
            _ = tokio::spawn(async move { pool.recycle(conn, broken).await }).await;
        }
    }
}

impl<M: Manager> Debug for ConnectionGuard<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("broken", &self.broken)
            .field("pool", &self.pool)
            .finish()
    }
}

impl<M: Manager> Deref for ConnectionGuard<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self.inner.as_ref().unwrap().connection
    }
}

impl<M: Manager> DerefMut for ConnectionGuard<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner.as_mut().unwrap().connection
    }
}

impl<M: Manager> Drop for ConnectionGuard<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.inner.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let pool = self.pool.clone();
                    let broken = self.broken;
                    handle.spawn(async move {
                        pool.recycle(conn, broken).await;
                    });
                }
                // no runtime to probe on, give the slot back
                Err(_) => self.pool.discard(conn),
            }
        }
    }
}
