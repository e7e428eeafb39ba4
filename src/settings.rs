use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::fmt::{Debug, Formatter};
use std::time::Duration;

/// Where a pool's physical connections go.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "HOST", default = "default_host")]
    pub host: String,
    #[serde(rename = "PORT", default = "default_port")]
    pub port: u16,
    #[serde(rename = "USER", default)]
    pub user: String,
    #[serde(rename = "PASSWORD", default)]
    pub password: String,
    #[serde(rename = "NAME", default)]
    pub database: String,
}

impl Default for ConnectParams {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: String::new(),
            password: String::new(),
            database: String::new(),
        }
    }
}

impl Debug for ConnectParams {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .finish()
    }
}

/// Per-alias pool configuration, frozen once the pool is built.
///
/// Deserializes from an option table keyed the way database settings are
/// usually written (`MIN_CONNECTIONS`, `POOL_TIMEOUT`, ...). Durations are
/// given in seconds and may be fractional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PoolSettings {
    /// Connections opened up front and kept across idle periods
    #[serde(rename = "MIN_CONNECTIONS", default = "default_min")]
    pub min_connections: u64,
    /// Ceiling of baseline connections
    #[serde(rename = "MAX_CONNECTIONS", default = "default_max")]
    pub max_connections: u64,
    /// Burst allowance above `max_connections`, closed again on release
    #[serde(rename = "MAX_OVERFLOW", default = "default_overflow")]
    pub max_overflow: u64,
    #[serde(
        rename = "POOL_TIMEOUT",
        default = "default_acquire_timeout",
        deserialize_with = "seconds"
    )]
    pub acquire_timeout: Duration,
    /// Age after which the whole pool is regenerated
    #[serde(
        rename = "POOL_MAX_CONN_AGE",
        default = "default_max_pool_age",
        deserialize_with = "seconds"
    )]
    pub max_pool_age: Duration,
    /// Probe connections when they are released
    #[serde(rename = "CONN_HEALTH_CHECKS", default = "default_true")]
    pub health_checks: bool,
    /// Utilization above which the pool counts as overloaded
    #[serde(rename = "POOL_RECYCLE_THRESHOLD", default = "default_recycle_threshold")]
    pub recycle_threshold: f64,
    #[serde(flatten)]
    pub connect: ConnectParams,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: default_min(),
            max_connections: default_max(),
            max_overflow: default_overflow(),
            acquire_timeout: default_acquire_timeout(),
            max_pool_age: default_max_pool_age(),
            health_checks: true,
            recycle_threshold: default_recycle_threshold(),
            connect: ConnectParams::default(),
        }
    }
}

impl PoolSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_connections(mut self, n: u64) -> Self {
        self.min_connections = n;
        self
    }

    pub fn with_max_connections(mut self, n: u64) -> Self {
        self.max_connections = n;
        self
    }

    pub fn with_max_overflow(mut self, n: u64) -> Self {
        self.max_overflow = n;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_max_pool_age(mut self, age: Duration) -> Self {
        self.max_pool_age = age;
        self
    }

    pub fn with_health_checks(mut self, enabled: bool) -> Self {
        self.health_checks = enabled;
        self
    }

    pub fn with_recycle_threshold(mut self, ratio: f64) -> Self {
        self.recycle_threshold = ratio;
        self
    }

    pub fn with_connect(mut self, connect: ConnectParams) -> Self {
        self.connect = connect;
        self
    }

    /// Hard ceiling on physical connections, overflow included.
    pub fn capacity(&self) -> u64 {
        self.max_connections + self.max_overflow
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("MAX_CONNECTIONS must be at least 1".to_string()));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::Config(format!(
                "MIN_CONNECTIONS ({}) must not exceed MAX_CONNECTIONS ({})",
                self.min_connections, self.max_connections
            )));
        }
        if !(self.recycle_threshold > 0.0 && self.recycle_threshold <= 1.0) {
            return Err(Error::Config(format!(
                "POOL_RECYCLE_THRESHOLD must be in (0, 1], got {}",
                self.recycle_threshold
            )));
        }
        Ok(())
    }
}

fn seconds<'de, D>(d: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(d)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_min() -> u64 {
    20
}

fn default_max() -> u64 {
    100
}

fn default_overflow() -> u64 {
    10
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_max_pool_age() -> Duration {
    Duration::from_secs(1800)
}

fn default_true() -> bool {
    true
}

fn default_recycle_threshold() -> f64 {
    0.8
}
