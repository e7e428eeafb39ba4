//! Background sweep over every pool of a [`Registry`].
//!
//! Each sweep looks at three signals per pool:
//!
//! - utilization above the pool's `recycle_threshold` for several sweeps in a
//!   row is logged as overload (nothing else is done about it),
//! - a pool older than `max_pool_age` is regenerated,
//! - a failure rate above `error_rate_threshold` among the acquisitions and
//!   releases since the previous sweep also regenerates the pool.
//!
//! A pool that is kept is topped back up to `min_connections` when retired
//! connections left it below that floor.

use crate::registry::Registry;
use crate::Manager;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Consecutive overloaded sweeps before overload is reported
    pub overload_intervals: u32,
    /// Failure share of one interval that triggers regeneration
    pub error_rate_threshold: f64,
    /// Operations an interval needs before its error rate counts
    pub min_samples: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            overload_intervals: 3,
            error_rate_threshold: 0.5,
            min_samples: 10,
        }
    }
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_overload_intervals(mut self, n: u32) -> Self {
        self.overload_intervals = n.max(1);
        self
    }

    pub fn with_error_rate_threshold(mut self, ratio: f64) -> Self {
        self.error_rate_threshold = ratio;
        self
    }

    pub fn with_min_samples(mut self, n: u64) -> Self {
        self.min_samples = n;
        self
    }
}

/// What one sweep saw and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inspected: Vec<String>,
    pub overloaded: Vec<String>,
    pub regenerated: Vec<String>,
    /// Pools topped back up to `min_connections`
    pub replenished: Vec<String>,
    /// Regenerations that failed; the old pool stays in service
    pub failed: Vec<String>,
}

pub struct HealthMonitor<M: Manager> {
    registry: Weak<Registry<M>>,
    config: MonitorConfig,
    overload_streaks: HashMap<String, u32>,
}

impl<M: Manager> HealthMonitor<M> {
    pub fn new(registry: &Arc<Registry<M>>, config: MonitorConfig) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            config,
            overload_streaks: HashMap::new(),
        }
    }

    /// One pass over all pools. Not cancellable halfway: callers that need
    /// to stop the monitor do so between sweeps.
    pub async fn sweep(&mut self) -> SweepReport {
        let mut report = SweepReport::default();
        let Some(registry) = self.registry.upgrade() else {
            return report;
        };
        let mut pools = registry.pools();
        pools.sort_by(|a, b| a.0.cmp(&b.0));
        self.overload_streaks
            .retain(|alias, _| pools.iter().any(|(a, _)| a == alias));

        for (alias, pool) in pools {
            report.inspected.push(alias.clone());
            let settings = pool.settings();
            let state = pool.state();

            let streak = self.overload_streaks.entry(alias.clone()).or_insert(0);
            if state.utilization() > settings.recycle_threshold {
                *streak += 1;
            } else {
                *streak = 0;
            }
            if *streak >= self.config.overload_intervals {
                warn!(
                    alias = %alias,
                    usage = state.usage_percent(),
                    in_use = state.in_use,
                    size = state.size,
                    sweeps = *streak,
                    "pool is nearing capacity"
                );
                report.overloaded.push(alias.clone());
            }

            let (ops, failures) = pool.take_interval();
            let reason = if pool.age() >= settings.max_pool_age {
                Some("max pool age reached")
            } else if ops >= self.config.min_samples
                && failures as f64 / ops as f64 > self.config.error_rate_threshold
            {
                Some("elevated error rate")
            } else {
                None
            };
            let Some(reason) = reason else {
                if pool.replenish().await > 0 {
                    report.replenished.push(alias);
                }
                continue;
            };
            debug!(alias = %alias, ops, failures, reason, "scheduling pool regeneration");
            match registry.regenerate(&alias, reason).await {
                Ok(_) => {
                    self.overload_streaks.remove(&alias);
                    report.regenerated.push(alias);
                }
                Err(_) => report.failed.push(alias),
            }
        }
        report
    }

    /// Runs `sweep` every `interval` on a background task.
    pub(crate) fn spawn(mut self) -> MonitorHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.changed() => break,
                }
                if self.registry.strong_count() == 0 {
                    break;
                }
                let report = self.sweep().await;
                debug!(
                    inspected = report.inspected.len(),
                    regenerated = report.regenerated.len(),
                    failed = report.failed.len(),
                    "pool monitor sweep done"
                );
            }
            debug!("pool monitor stopped");
        });
        MonitorHandle { stop, task }
    }
}

/// Owner side of a running monitor.
pub struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn stop(self) {
        _ = self.stop.send(true);
        _ = self.task.await;
    }
}
