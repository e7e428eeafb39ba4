#[macro_use]
mod defer;
pub mod error;
pub mod facade;
pub mod guard;
pub mod monitor;
pub mod plugin;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod settings;
pub mod state;
pub mod time_connection;

use async_trait::async_trait;

/// Manager opens, probes and closes physical connections for one database target.
///
/// This is the only place the pool touches the database driver.
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    type Connection: Send + 'static;

    type Error: std::error::Error + Send + Sync + 'static;

    /// open a new physical connection
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// liveness probe, an Err retires the connection
    async fn check(&self, conn: &mut Self::Connection) -> Result<(), Self::Error>;

    /// close a physical connection; the default just drops it
    async fn close(&self, conn: Self::Connection) {
        drop(conn);
    }

    /// Whether a connect error can never succeed on retry
    /// (rejected credentials, unknown database, bad parameters).
    fn is_fatal(&self, _err: &Self::Error) -> bool {
        false
    }
}

pub use error::{Error, Result};
pub use facade::Databases;
pub use guard::ConnectionGuard;
pub use monitor::{HealthMonitor, MonitorConfig};
pub use pool::Pool;
pub use registry::Registry;
pub use retry::RetryPolicy;
pub use settings::{ConnectParams, PoolSettings};
pub use state::{State, Status};
