use crate::error::{Error, Result};
use crate::guard::ConnectionGuard;
use crate::registry::Registry;
use crate::retry::RetryPolicy;
use crate::settings::PoolSettings;
use crate::state::State;
use crate::Manager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// What the surrounding application talks to: configured aliases, one shared
/// [`Registry`], and the retry policy applied to every acquisition.
pub struct Databases<M: Manager> {
    registry: Arc<Registry<M>>,
    settings: HashMap<String, PoolSettings>,
    retry: RetryPolicy,
}

impl<M: Manager> Databases<M> {
    pub fn new(registry: Arc<Registry<M>>, retry: RetryPolicy) -> Self {
        Self {
            registry,
            settings: HashMap::new(),
            retry,
        }
    }

    /// Builds the facade from an alias → options table, validating every entry.
    pub fn from_options(
        registry: Arc<Registry<M>>,
        retry: RetryPolicy,
        options: HashMap<String, PoolSettings>,
    ) -> Result<Self> {
        let mut databases = Self::new(registry, retry);
        for (alias, settings) in options {
            databases.configure(&alias, settings)?;
        }
        Ok(databases)
    }

    pub fn configure(&mut self, alias: &str, settings: PoolSettings) -> Result<()> {
        settings.validate().map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("alias `{alias}`: {msg}")),
            other => other,
        })?;
        self.settings.insert(alias.to_string(), settings);
        Ok(())
    }

    pub fn registry(&self) -> &Arc<Registry<M>> {
        &self.registry
    }

    pub fn settings(&self, alias: &str) -> Option<&PoolSettings> {
        self.settings.get(alias)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// A ready-to-use connection for `alias`.
    ///
    /// Every attempt resolves the alias's current pool again, so an attempt
    /// turned away by a pool being replaced lands on its successor. The first
    /// transient connect failure of a call (typically the server's client
    /// ceiling) rebuilds the alias's pool before the backoff retries go on.
    pub async fn obtain_connection(&self, alias: &str) -> Result<ConnectionGuard<M>> {
        let settings = self
            .settings
            .get(alias)
            .ok_or_else(|| Error::Config(format!("database alias `{alias}` is not configured")))?;
        let rebuilt = &AtomicBool::new(false);
        self.retry
            .run(move |_attempt| async move {
                let pool = self.registry.get_or_create_pool(alias, settings).await?;
                match pool.get_timeout(Some(settings.acquire_timeout)).await {
                    Err(e @ Error::Transient { .. }) if !rebuilt.swap(true, Ordering::Relaxed) => {
                        warn!(alias, error = %e, "connect refused, rebuilding pool");
                        if let Err(rebuild) = self.registry.regenerate(alias, "connection ceiling").await {
                            debug!(alias, error = %rebuild, "emergency rebuild failed, keeping pool");
                        }
                        Err(e)
                    }
                    other => other,
                }
            })
            .await
    }

    /// Returns `conn` to the pool it was checked out from, even if that pool
    /// has been replaced in the meantime.
    pub async fn release_connection(&self, alias: &str, conn: ConnectionGuard<M>) {
        if conn.pool().alias() != alias {
            warn!(
                alias,
                owner = conn.pool().alias(),
                "connection released under a different alias than it came from"
            );
        }
        conn.release().await
    }

    /// Flag `conn` as permanently broken so release closes it.
    pub fn mark_broken(&self, conn: &mut ConnectionGuard<M>) {
        conn.invalidate();
    }

    pub fn pool_status(&self, alias: &str) -> Option<State> {
        self.registry.status(alias)
    }

    /// Drains every pool and stops the monitor.
    pub async fn close_all(&self) {
        self.registry.shutdown().await
    }
}
