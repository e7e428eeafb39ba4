#![allow(dead_code)]

use alias_pool::{Manager, PoolSettings};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct TestConnection {
    pub id: u64,
    /// a poisoned connection fails its next probe
    pub poisoned: bool,
}

/// In-memory driver. Clones share counters and switches, so a test can keep
/// one handle while the pool owns another.
#[derive(Debug, Clone, Default)]
pub struct TestManager {
    pub connects: Arc<AtomicU64>,
    pub checks: Arc<AtomicU64>,
    pub closes: Arc<AtomicU64>,
    /// every probe fails
    pub fail_check: Arc<AtomicBool>,
    /// connects fail with a transient error
    pub refuse: Arc<AtomicBool>,
    /// connects fail with a fatal error
    pub deny: Arc<AtomicBool>,
    /// this many upcoming connects fail with a transient error
    pub refuse_next: Arc<AtomicU64>,
    pub connect_delay: Duration,
    pub check_delay: Duration,
}

impl TestManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_delay(mut self, d: Duration) -> Self {
        self.connect_delay = d;
        self
    }

    pub fn with_check_delay(mut self, d: Duration) -> Self {
        self.check_delay = d;
        self
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn set_fail_check(&self, v: bool) {
        self.fail_check.store(v, Ordering::SeqCst);
    }

    pub fn set_refuse(&self, v: bool) {
        self.refuse.store(v, Ordering::SeqCst);
    }

    pub fn set_deny(&self, v: bool) {
        self.deny.store(v, Ordering::SeqCst);
    }

    pub fn refuse_next(&self, n: u64) {
        self.refuse_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Manager for TestManager {
    type Connection = TestConnection;
    type Error = io::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "password authentication failed",
            ));
        }
        let refuse_once = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse_once || self.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "too many clients already",
            ));
        }
        Ok(TestConnection {
            id: NEXT_CONN.fetch_add(1, Ordering::SeqCst),
            poisoned: false,
        })
    }

    async fn check(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if !self.check_delay.is_zero() {
            tokio::time::sleep(self.check_delay).await;
        }
        if conn.poisoned || self.fail_check.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "server closed the connection"));
        }
        Ok(())
    }

    async fn close(&self, _conn: Self::Connection) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn is_fatal(&self, err: &Self::Error) -> bool {
        err.kind() == io::ErrorKind::PermissionDenied
    }
}

/// Small pool settings for tests: `min` warm, `max` baseline, `overflow` burst.
pub fn settings(min: u64, max: u64, overflow: u64) -> PoolSettings {
    PoolSettings::new()
        .with_min_connections(min)
        .with_max_connections(max)
        .with_max_overflow(overflow)
        .with_acquire_timeout(Duration::from_secs(2))
}
