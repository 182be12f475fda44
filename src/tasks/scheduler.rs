//! # Scheduler
//!
//! Single cooperative loop that ticks every task on its cadence and runs
//! the watchdog sweep. Ticking only decides whether to spawn a worker;
//! the work itself always runs in a separate OS process, so a stage that
//! blocks on CPU or I/O can never stall the scheduler or other stages.
//!
//! Graceful shutdown waits while any task is alive, up to the grace
//! deadline, then force-kills the remainder.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, sleep, Instant};
use tracing::{info, trace};

use super::registry::TaskRegistry;
use crate::config::SchedulerConfig;
use crate::error::Result;

/// Drives the registry's tick and watchdog loops.
pub struct Scheduler {
    registry: Arc<TaskRegistry>,
    config: SchedulerConfig,
}

/// Shutdown wait predicate: stop waiting once the grace deadline passes
/// or no task is alive — never because tasks are still alive.
pub fn should_stop_waiting(now: Instant, deadline: Instant, alive_count: usize) -> bool {
    now >= deadline || alive_count == 0
}

impl Scheduler {
    pub fn new(registry: Arc<TaskRegistry>, config: SchedulerConfig) -> Self {
        Self { registry, config }
    }

    /// Run until a shutdown signal arrives. The loop itself never raises:
    /// task-local errors are consumed inside the registry.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut tick = interval(Duration::from_secs(self.config.tick_seconds.max(1)));
        let mut watchdog = interval(Duration::from_secs(
            self.config.watchdog_interval_seconds.max(1),
        ));
        // consume the immediate first fire of both intervals
        tick.tick().await;
        watchdog.tick().await;

        info!(
            tick_seconds = self.config.tick_seconds,
            watchdog_interval_seconds = self.config.watchdog_interval_seconds,
            "scheduler running"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.registry.tick().await;
                }
                _ = watchdog.tick() => {
                    self.registry.watchdog().await;
                }
                _ = shutdown.recv() => {
                    info!("shutdown signal received");
                    self.drain().await;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Let live workers wrap up within the grace period, then kill the
    /// rest.
    pub async fn drain(&self) {
        let deadline =
            Instant::now() + Duration::from_secs(self.config.shutdown_grace_seconds);
        info!(
            grace_seconds = self.config.shutdown_grace_seconds,
            "waiting for live workers"
        );

        loop {
            let alive = self.registry.alive_count().await;
            if should_stop_waiting(Instant::now(), deadline, alive) {
                break;
            }
            trace!(alive, "workers still alive");
            sleep(Duration::from_millis(250)).await;
        }

        self.registry.kill_all().await;
        info!("scheduler drained");
    }
}
