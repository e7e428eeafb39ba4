use crate::Manager;
use async_trait::async_trait;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

/// How often [`DurationManager`] really probes a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Probe on every release
    NoLimit,
    /// Skip the probe if the connection passed one within this window
    SkipInterval(Duration),
    /// Fail the probe once the connection is older than this
    MaxLifetime(Duration),
}

/// A connection with the instants [`DurationManager`] needs.
#[derive(Debug)]
pub struct DurationConnection<T> {
    inner: T,
    opened: Instant,
    verified: Instant,
}

impl<T> DurationConnection<T> {
    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }

    /// Time since the last probe that actually ran and passed.
    pub fn since_verified(&self) -> Duration {
        self.verified.elapsed()
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T> Deref for DurationConnection<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T> DerefMut for DurationConnection<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DurationError<E: std::error::Error + 'static> {
    #[error(transparent)]
    Inner(E),
    #[error("connection exceeded max lifetime of {0:?}")]
    Lifetime(Duration),
}

/// Manager wrapper that takes the liveness probe off the hot release path
/// for connections that were verified recently, or retires connections past
/// a per-connection lifetime.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use alias_pool::{Manager, Pool, PoolSettings};
/// use alias_pool::plugin::{DurationManager, CheckMode};
///
/// struct MyManager;
///
/// #[async_trait::async_trait]
/// impl Manager for MyManager {
///     type Connection = ();
///     type Error = std::io::Error;
///
///     async fn connect(&self) -> Result<Self::Connection, Self::Error> {
///         Ok(())
///     }
///
///     async fn check(&self, _conn: &mut Self::Connection) -> Result<(), Self::Error> {
///         Ok(())
///     }
/// }
///
/// let manager = DurationManager::new(MyManager, CheckMode::SkipInterval(Duration::from_secs(30)));
/// let pool = Pool::new("default", PoolSettings::default(), manager);
/// ```
pub struct DurationManager<M: Manager> {
    pub manager: M,
    pub mode: CheckMode,
}

impl<M: Manager> DurationManager<M> {
    pub fn new(manager: M, mode: CheckMode) -> Self {
        Self { manager, mode }
    }
}

#[async_trait]
impl<M: Manager> Manager for DurationManager<M> {
    type Connection = DurationConnection<M::Connection>;
    type Error = DurationError<M::Error>;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let inner = self.manager.connect().await.map_err(DurationError::Inner)?;
        let now = Instant::now();
        Ok(DurationConnection {
            inner,
            opened: now,
            verified: now,
        })
    }

    async fn check(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        match self.mode {
            CheckMode::NoLimit => {}
            CheckMode::SkipInterval(window) => {
                if conn.verified.elapsed() < window {
                    return Ok(());
                }
            }
            CheckMode::MaxLifetime(max) => {
                if conn.opened.elapsed() > max {
                    return Err(DurationError::Lifetime(max));
                }
            }
        }
        self.manager
            .check(&mut conn.inner)
            .await
            .map_err(DurationError::Inner)?;
        conn.verified = Instant::now();
        Ok(())
    }

    async fn close(&self, conn: Self::Connection) {
        self.manager.close(conn.inner).await
    }

    fn is_fatal(&self, err: &Self::Error) -> bool {
        match err {
            DurationError::Inner(e) => self.manager.is_fatal(e),
            DurationError::Lifetime(_) => false,
        }
    }
}
