use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::device::Device;
use crate::persistence::{StatsRecord, StatsStore};

pub const DEFAULT_SAVE_INTERVAL_MS: u64 = 3_600_000;

/// Monotonic time since boot.
#[derive(Debug, Clone, Copy)]
pub struct Uptime {
    boot: Instant,
}

impl Uptime {
    pub fn start() -> Self {
        Self {
            boot: Instant::now(),
        }
    }

    pub fn millis(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub elapsed_ms: u64,
    pub runtime_added_seconds: u64,
    pub saved: bool,
}

/// Folds session runtime into the stats record and persists it on a coarse cadence.
#[derive(Debug)]
pub struct FlushScheduler {
    interval_ms: u64,
    last_save_ms: u64,
}

impl FlushScheduler {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_save_ms: 0,
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn last_save_ms(&self) -> u64 {
        self.last_save_ms
    }

    pub fn due(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_save_ms) >= self.interval_ms
    }

    pub async fn tick(
        &mut self,
        now_ms: u64,
        stats: &mut StatsRecord,
        store: &StatsStore,
    ) -> Option<FlushReport> {
        if !self.due(now_ms) {
            return None;
        }
        Some(self.flush_now(now_ms, stats, store).await)
    }

    /// Flushes regardless of the interval. Used for the scheduled tick and at shutdown.
    pub async fn flush_now(
        &mut self,
        now_ms: u64,
        stats: &mut StatsRecord,
        store: &StatsStore,
    ) -> FlushReport {
        let elapsed_ms = now_ms.saturating_sub(self.last_save_ms);
        let runtime_added_seconds = elapsed_ms / 1000;
        stats.add_runtime(runtime_added_seconds);

        let saved = match store.save(stats).await {
            Ok(()) => {
                tracing::info!(
                    visits = stats.total_visits,
                    runtime_seconds = stats.total_runtime_seconds,
                    "stats saved to storage"
                );
                true
            }
            Err(err) => {
                tracing::error!(error = %err, "stats save skipped");
                false
            }
        };
        self.last_save_ms = now_ms;

        FlushReport {
            elapsed_ms,
            runtime_added_seconds,
            saved,
        }
    }
}

/// Background duty that checks the flush timer until shutdown.
pub async fn run_flush_loop(
    device: Arc<Mutex<Device>>,
    uptime: Uptime,
    mut shutdown: watch::Receiver<()>,
    check_every: Duration,
) -> Result<()> {
    let mut ticker = interval(check_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let mut device = device.lock().await;
                if let Some(report) = device.poll_flush(uptime.millis()).await {
                    tracing::debug!(
                        elapsed_ms = report.elapsed_ms,
                        runtime_added_seconds = report.runtime_added_seconds,
                        saved = report.saved,
                        "flush tick"
                    );
                }
            }
        }
    }
    Ok(())
}

/// Stops the flush loop, then runs the shutdown-equivalent flush.
pub async fn stop_and_flush(
    device: &Mutex<Device>,
    uptime: Uptime,
    shutdown: &watch::Sender<()>,
    flush_task: JoinHandle<Result<()>>,
) -> Result<FlushReport> {
    shutdown.send(()).ok();
    flush_task.await??;
    Ok(device.lock().await.shutdown(uptime.millis()).await)
}
