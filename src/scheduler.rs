//! Periodic housekeeping and dump of the state tables.
//!
//! The scheduler runs as a background tokio task next to whatever feeds the
//! cache. Each cycle applies the configured ttls and then writes `items.gz`
//! and `triggers.gz`, so a restart loses at most one interval of state.
//!
//! Both steps are blocking file and lock work and run on the blocking pool.
//! A failed cycle is logged and the next tick tries again.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use crate::config::StateConfig;
use crate::error::{Result, StateError};
use crate::state::{GlbState, PersistStats};
use crate::types::now_ms;
use log::{error, info};

/// Configuration for the periodic dump.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Interval between dump cycles
    pub interval: Duration,
    /// Whether the scheduler is enabled
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            enabled: true,
        }
    }
}

impl From<&StateConfig> for SchedulerConfig {
    fn from(config: &StateConfig) -> Self {
        Self {
            interval: config.dump_interval,
            enabled: !config.dump_interval.is_zero(),
        }
    }
}

/// Scheduler for periodic housekeeping and dumps.
pub struct DumpScheduler {
    state: Arc<GlbState>,
    config: SchedulerConfig,
    /// Timestamp of the last successful dump
    last_dump_at: Arc<RwLock<u64>>,
}

impl DumpScheduler {
    /// Creates a scheduler; `last_dump()` reports the creation time until the first dump.
    ///
    /// # Example
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use state::{DumpScheduler, GlbState, NoHistory, SchedulerConfig, StateConfig};
    ///
    /// let state = Arc::new(GlbState::new(StateConfig::default(), Arc::new(NoHistory)));
    /// let scheduler = Arc::new(DumpScheduler::new(state, SchedulerConfig::default()));
    /// ```
    pub fn new(state: Arc<GlbState>, config: SchedulerConfig) -> Self {
        Self {
            state,
            config,
            last_dump_at: Arc::new(RwLock::new(now_ms())),
        }
    }

    /// Milliseconds since UNIX epoch of the last successful dump.
    pub fn last_dump(&self) -> u64 {
        *self.last_dump_at.read()
    }

    /// Runs dump cycles until the task is dropped. Returns at once when disabled.
    ///
    /// # Example
    /// ```rust,ignore
    /// let scheduler_clone = scheduler.clone();
    /// tokio::spawn(async move {
    ///     scheduler_clone.start().await;
    /// });
    /// ```
    pub async fn start(self: Arc<Self>) {
        if !self.config.enabled || self.config.interval.is_zero() {
            info!("Scheduled state dump is disabled, skipping");
            return;
        }

        info!(
            "Starting scheduled state dump with {}-second interval",
            self.config.interval.as_secs()
        );

        let mut ticker = interval(self.config.interval);
        // First tick completes immediately; the state was just loaded.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.do_dump().await;
        }
    }

    async fn do_dump(&self) {
        let start = now_ms();
        match self.run_once().await {
            Ok(stats) => {
                info!(
                    "Scheduled dump completed: {} items, {} values, {} triggers in {}ms",
                    stats.items,
                    stats.values,
                    stats.triggers,
                    now_ms().saturating_sub(start)
                );
            }
            Err(e) => {
                error!("Scheduled dump failed: {}", e);
            }
        }
    }

    /// Runs one housekeeping and dump cycle.
    pub async fn run_once(&self) -> Result<PersistStats> {
        let state = self.state.clone();
        let stats = tokio::task::spawn_blocking(move || {
            let removed = state.housekeep()?;
            if removed > 0 {
                info!("Housekeeping removed {} elements", removed);
            }
            state.dump()
        })
        .await
        .map_err(|e| StateError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        *self.last_dump_at.write() = now_ms();
        Ok(stats)
    }
}
