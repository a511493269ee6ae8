//! Periodic, single-flight run scheduling.

use super::pipeline::{PipelineRunner, RunOutcome};
use crate::error::KeeperError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Counters for the lifetime of the scheduler.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub runs_started: AtomicU64,
    pub runs_skipped: AtomicU64,
    pub runs_rebalanced: AtomicU64,
    pub runs_failed: AtomicU64,
    pub ticks_dropped: AtomicU64,
}

impl SchedulerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_skipped: self.runs_skipped.load(Ordering::Relaxed),
            runs_rebalanced: self.runs_rebalanced.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            ticks_dropped: self.ticks_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub runs_started: u64,
    pub runs_skipped: u64,
    pub runs_rebalanced: u64,
    pub runs_failed: u64,
    pub ticks_dropped: u64,
}

/// Clears the in-flight flag when a run ends, however it ends.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Fires the pipeline on a fixed interval, at most one run at a time.
///
/// The first run starts immediately. Ticks that arrive while a run is
/// active are dropped, not queued.
pub struct Scheduler<R: PipelineRunner> {
    runner: Arc<R>,
    interval: Duration,
    in_flight: Arc<AtomicBool>,
    stats: Arc<SchedulerStats>,
}

impl<R: PipelineRunner> Scheduler<R> {
    pub fn new(runner: Arc<R>, interval: Duration) -> Self {
        Self {
            runner,
            interval,
            in_flight: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Tick until `shutdown` is cancelled, then wait for the active run.
    ///
    /// A run that has already submitted its transaction keeps going until
    /// the outcome is recorded; earlier stages abort on shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut active: Option<JoinHandle<()>> = None;

        info!(interval = ?self.interval, "Scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(handle) = self.try_start(&shutdown) {
                        active = Some(handle);
                    }
                }
            }
        }

        if let Some(handle) = active.take() {
            if !handle.is_finished() {
                info!("Waiting for in-flight run to finish");
            }
            if let Err(e) = handle.await {
                error!(error = %e, "Run task panicked");
            }
        }

        info!("Scheduler stopped");
    }

    /// Start a run unless one is already active.
    fn try_start(&self, shutdown: &CancellationToken) -> Option<JoinHandle<()>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            SchedulerStats::bump(&self.stats.ticks_dropped);
            warn!("Previous run still active, dropping tick");
            return None;
        }

        let guard = InFlightGuard(self.in_flight.clone());
        let runner = self.runner.clone();
        let stats = self.stats.clone();
        let cancel = shutdown.child_token();
        SchedulerStats::bump(&stats.runs_started);

        Some(tokio::spawn(async move {
            let _guard = guard;
            let result = runner.run(cancel).await;
            record_outcome(&stats, result);
        }))
    }
}

fn record_outcome(stats: &SchedulerStats, result: Result<RunOutcome, KeeperError>) {
    match result {
        Ok(RunOutcome::Skipped {
            run_id,
            max_deviation,
        }) => {
            SchedulerStats::bump(&stats.runs_skipped);
            info!(%run_id, max_deviation, "Run finished without rebalance");
        }
        Ok(RunOutcome::Rebalanced(record)) => {
            SchedulerStats::bump(&stats.runs_rebalanced);
            info!(
                run_id = %record.run_id,
                hash = %record.hash,
                block = ?record.block_number,
                "Run finished with confirmed rebalance"
            );
        }
        Err(KeeperError::Cancelled) => {
            info!("Run cancelled by shutdown");
        }
        Err(e) => {
            SchedulerStats::bump(&stats.runs_failed);
            error!(kind = e.kind(), error = %e, "Run failed");
        }
    }
}
