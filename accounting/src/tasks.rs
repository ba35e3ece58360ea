//! Periodic background work: sampling, checkpointing and expiry checks.
//!
//! Each task runs its blocking step on the blocking pool so a slow disk or
//! counter query never stalls the runtime, and all of them stop when the
//! shared [`CancellationToken`] is cancelled.

use crate::error::{AccountingError, Result};
use crate::monitor::Monitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct TaskIntervals {
    pub sample: Duration,
    pub checkpoint: Duration,
    pub checkpoint_timeout: Duration,
    pub expiry_check: Duration,
}

impl Default for TaskIntervals {
    fn default() -> Self {
        Self {
            sample: Duration::from_secs(1),
            checkpoint: Duration::from_secs(300),
            checkpoint_timeout: Duration::from_secs(10),
            expiry_check: Duration::from_secs(3600),
        }
    }
}

pub fn spawn_all(
    monitor: Arc<Monitor>,
    intervals: TaskIntervals,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_sampler(monitor.clone(), intervals.sample, shutdown.clone()),
        spawn_checkpointer(
            monitor.clone(),
            intervals.checkpoint,
            intervals.checkpoint_timeout,
            shutdown.clone(),
        ),
        spawn_expiry_watch(monitor, intervals.expiry_check, shutdown),
    ]
}

pub fn spawn_sampler(
    monitor: Arc<Monitor>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Sampler started, period {:?}", period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let monitor = monitor.clone();
                    match tokio::task::spawn_blocking(move || monitor.tick()).await {
                        Ok(outcome) => debug!(
                            "Tick: total={} bytes, sent={:.0} bit/s, recv={:.0} bit/s",
                            outcome.total.combined(),
                            outcome.report.smoothed.sent_bits_per_sec,
                            outcome.report.smoothed.recv_bits_per_sec
                        ),
                        Err(e) => error!("Sampler tick panicked: {}", e),
                    }
                }
            }
        }
        info!("Sampler stopped");
    })
}

pub fn spawn_checkpointer(
    monitor: Arc<Monitor>,
    period: Duration,
    timeout: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Checkpointer started, period {:?}", period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    // Failures are retried on the next tick.
                    if let Err(e) = checkpoint_with_timeout(monitor.clone(), timeout).await {
                        warn!("Periodic checkpoint failed: {}", e);
                    }
                }
            }
        }
        info!("Checkpointer stopped");
    })
}

pub fn spawn_expiry_watch(
    monitor: Arc<Monitor>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Expiry watch started, period {:?}", period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let monitor = monitor.clone();
                    match tokio::task::spawn_blocking(move || monitor.check_expiry()).await {
                        Ok(true) => {
                            warn!("Lifecycle expired, stopping background tasks");
                            shutdown.cancel();
                            break;
                        }
                        Ok(false) => debug!("Lifecycle still active"),
                        Err(e) => error!("Expiry check panicked: {}", e),
                    }
                }
            }
        }
        info!("Expiry watch stopped");
    })
}

/// Run one checkpoint on the blocking pool, giving up on waiting after `timeout`.
pub async fn checkpoint_with_timeout(monitor: Arc<Monitor>, timeout: Duration) -> Result<()> {
    run_blocking(timeout, move || monitor.checkpoint()).await
}

/// Reset accounting on the blocking pool. The reset ends with a checkpoint,
/// so it is bounded the same way.
pub async fn reset_with_timeout(monitor: Arc<Monitor>, timeout: Duration) -> Result<()> {
    run_blocking(timeout, move || monitor.reset_accounting()).await
}

/// Change the limit on the blocking pool; the new value is written to disk.
pub async fn set_limit_with_timeout(
    monitor: Arc<Monitor>,
    limit: Option<u64>,
    timeout: Duration,
) -> Result<()> {
    run_blocking(timeout, move || monitor.set_limit(limit)).await
}

/// Run `op` on the blocking pool and stop waiting for it after `timeout`.
/// A timed-out operation keeps running to completion in the background.
pub async fn run_blocking<F>(timeout: Duration, op: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(op);
    match time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(AccountingError::Task(e.to_string())),
        Err(_) => Err(AccountingError::StorageTimeout(timeout)),
    }
}

/// Stop every task, then write the final checkpoint.
pub async fn shutdown_and_checkpoint(
    monitor: Arc<Monitor>,
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
    timeout: Duration,
) -> Result<()> {
    shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Background task ended abnormally: {}", e);
        }
    }
    checkpoint_with_timeout(monitor, timeout).await?;
    info!("Final checkpoint written");
    Ok(())
}
