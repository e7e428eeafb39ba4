use crate::error::{Error, Result};
use crate::monitor::{HealthMonitor, MonitorConfig, MonitorHandle};
use crate::pool::Pool;
use crate::settings::PoolSettings;
use crate::state::State;
use crate::Manager;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Builds the driver-side [`Manager`] for an alias.
pub type ManagerFactory<M> = dyn Fn(&str, &PoolSettings) -> Result<M> + Send + Sync;

struct Entry<M: Manager> {
    /// snapshot taken at first registration
    settings: PoolSettings,
    current: RwLock<Option<Pool<M>>>,
    /// serializes creation and regeneration for this alias only
    build: tokio::sync::Mutex<()>,
}

/// Process-wide map from alias to its current pool.
///
/// Create one per process (or per test) and share it by `Arc`.
pub struct Registry<M: Manager> {
    entries: RwLock<HashMap<String, Arc<Entry<M>>>>,
    factory: Box<ManagerFactory<M>>,
    drain_grace: Duration,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl<M: Manager> Registry<M> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str, &PoolSettings) -> Result<M> + Send + Sync + 'static,
    {
        Self {
            entries: RwLock::new(HashMap::new()),
            factory: Box::new(factory),
            drain_grace: Duration::from_secs(30),
            monitor: Mutex::new(None),
        }
    }

    /// How long a replaced or closed pool waits for checked-out connections.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn drain_grace(&self) -> Duration {
        self.drain_grace
    }

    /// Returns the current pool for `alias`, building it on first use.
    ///
    /// Concurrent first callers for one alias wait for a single build; other
    /// aliases are not held up. A build failure is returned as is and the
    /// next caller tries again. Settings that differ from the ones the alias
    /// was first registered with are refused with [`Error::Config`].
    pub async fn get_or_create_pool(&self, alias: &str, settings: &PoolSettings) -> Result<Pool<M>> {
        let entry = self.entry_or_insert(alias, settings)?;
        if let Some(pool) = entry.current.read().clone() {
            return Ok(pool);
        }
        let _building = entry.build.lock().await;
        if let Some(pool) = entry.current.read().clone() {
            return Ok(pool);
        }
        let pool = self.build(alias, &entry.settings).await?;
        *entry.current.write() = Some(pool.clone());
        Ok(pool)
    }

    /// The entry of `alias`, registering `settings` for it on first use.
    /// Settings are fixed once registered; different ones are refused.
    fn entry_or_insert(&self, alias: &str, settings: &PoolSettings) -> Result<Arc<Entry<M>>> {
        let existing = self.entries.read().get(alias).cloned();
        let entry = match existing {
            Some(entry) => entry,
            None => self
                .entries
                .write()
                .entry(alias.to_string())
                .or_insert_with(|| {
                    Arc::new(Entry {
                        settings: settings.clone(),
                        current: RwLock::new(None),
                        build: tokio::sync::Mutex::new(()),
                    })
                })
                .clone(),
        };
        if entry.settings != *settings {
            warn!(alias, "pool settings differ from the registered ones");
            return Err(Error::Config(format!(
                "alias `{alias}` is already registered with different settings"
            )));
        }
        Ok(entry)
    }

    async fn build(&self, alias: &str, settings: &PoolSettings) -> Result<Pool<M>> {
        let manager = (self.factory)(alias, settings)?;
        Pool::open(alias, settings.clone(), manager).await
    }

    /// Current pool of `alias`, if one has been built.
    pub fn pool(&self, alias: &str) -> Option<Pool<M>> {
        let entries = self.entries.read();
        let entry = entries.get(alias)?;
        let pool = entry.current.read().clone();
        pool
    }

    pub(crate) fn pools(&self) -> Vec<(String, Pool<M>)> {
        self.entries
            .read()
            .iter()
            .filter_map(|(alias, entry)| entry.current.read().clone().map(|p| (alias.clone(), p)))
            .collect()
    }

    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.entries.read().keys().cloned().collect();
        aliases.sort();
        aliases
    }

    pub fn status(&self, alias: &str) -> Option<State> {
        self.pool(alias).map(|p| p.state())
    }

    pub fn statuses(&self) -> Vec<State> {
        let mut states: Vec<State> = self.pools().into_iter().map(|(_, p)| p.state()).collect();
        states.sort_by(|a, b| a.alias.cmp(&b.alias));
        states
    }

    /// Replaces the pool of `alias` with a fresh one built from the same
    /// settings. The old pool stops taking acquisitions in the same step and
    /// is drained in the background. If the build fails the old pool stays
    /// current.
    pub async fn regenerate(&self, alias: &str, reason: &str) -> Result<Pool<M>> {
        let entry = self
            .entries
            .read()
            .get(alias)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no pool registered for alias `{alias}`")))?;
        let _building = entry.build.lock().await;
        let fresh = match self.build(alias, &entry.settings).await {
            Ok(pool) => pool,
            Err(e) => {
                error!(alias, reason, error = %e, "pool regeneration failed, keeping current pool");
                return Err(e);
            }
        };
        let old = {
            let mut current = entry.current.write();
            let old = current.replace(fresh.clone());
            if let Some(old) = &old {
                old.mark_draining();
            }
            old
        };
        info!(
            alias,
            reason,
            old = old.as_ref().map(|p| p.id()),
            new = fresh.id(),
            "pool regenerated"
        );
        if let Some(old) = old {
            let grace = self.drain_grace;
            tokio::spawn(async move {
                old.drain_and_close(grace).await;
            });
        }
        Ok(fresh)
    }

    /// Closes idle connections of `alias` down to `min_connections`.
    pub async fn reset_pool(&self, alias: &str) -> Result<u64> {
        let pool = self
            .pool(alias)
            .ok_or_else(|| Error::Config(format!("no pool registered for alias `{alias}`")))?;
        let closed = pool.shrink_idle(pool.settings().min_connections).await;
        info!(alias, closed, "pool reset");
        Ok(closed)
    }

    /// Forgets `alias` and drains its pool. Returns false if it was unknown.
    pub async fn close_pool(&self, alias: &str) -> bool {
        let Some(entry) = self.entries.write().remove(alias) else {
            return false;
        };
        let pool = entry.current.write().take();
        if let Some(pool) = pool {
            pool.drain_and_close(self.drain_grace).await;
        }
        true
    }

    /// Stops the monitor and drains every pool.
    pub async fn shutdown(&self) {
        self.stop_monitor().await;
        let entries: Vec<_> = self.entries.write().drain().collect();
        let mut tasks = Vec::with_capacity(entries.len());
        for (_, entry) in entries {
            if let Some(pool) = entry.current.write().take() {
                let grace = self.drain_grace;
                tasks.push(tokio::spawn(async move { pool.drain_and_close(grace).await }));
            }
        }
        for task in tasks {
            _ = task.await;
        }
        info!("all connection pools closed");
    }

    /// Starts the background health monitor. Returns false if it is already running.
    pub fn start_monitor(self: &Arc<Self>, config: MonitorConfig) -> bool {
        let mut slot = self.monitor.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(HealthMonitor::new(self, config).spawn());
        true
    }

    /// Stops the monitor and waits for its task to end. Returns false if it
    /// was not running.
    pub async fn stop_monitor(&self) -> bool {
        let handle = self.monitor.lock().take();
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub fn monitor_running(&self) -> bool {
        self.monitor.lock().is_some()
    }
}
