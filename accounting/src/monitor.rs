use crate::BYTES_PER_TIB;
use crate::accumulator::{Accumulator, CumulativeTotal};
use crate::actions::ActionDispatcher;
use crate::counter::{CounterSource, RawSample};
use crate::error::{AccountingError, Result};
use crate::lifecycle::{LifecycleController, LifecycleState};
use crate::rate::{RateEngine, RateReport, Rates, SessionUsage};
use crate::threshold::{self, LimitConfig, ThresholdLatch};
use chrono::{DateTime, Utc};
use common::JsonStore;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Everything a [`Monitor`] is assembled from.
pub struct MonitorParts {
    pub source: Arc<dyn CounterSource>,
    pub dispatcher: Arc<dyn ActionDispatcher>,
    pub totals: JsonStore<CumulativeTotal>,
    pub limit: JsonStore<LimitConfig>,
    pub lifecycle: LifecycleController,
    pub smoothing: f64,
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome {
    pub report: RateReport,
    pub total: CumulativeTotal,
    pub exceeded: bool,
    pub dispatched: bool,
}

/// Payload served to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub uptime_secs: u64,
    /// Seconds since the Unix epoch at which the host booted.
    pub boot_time: u64,
    pub rates: Rates,
    pub session: SessionUsage,
    pub cumulative_total: CumulativeTotal,
    pub cumulative_tib: f64,
    pub limit: Option<u64>,
    pub limit_reached: bool,
    pub remaining_ttl_secs: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub lifecycle: LifecycleState,
}

struct EngineState {
    rate: RateEngine,
    last: Option<RateReport>,
}

struct LimitState {
    config: LimitConfig,
    store: JsonStore<LimitConfig>,
}

/// Shared accounting state, driven by the periodic tasks and queried or
/// mutated by request handlers.
///
/// Lock order: `checkpoint_lock`, `engine`, `accumulator`, `limit`,
/// `latch`, `lifecycle`.
pub struct Monitor {
    source: Arc<dyn CounterSource>,
    dispatcher: Arc<dyn ActionDispatcher>,
    engine: Mutex<EngineState>,
    accumulator: RwLock<Accumulator>,
    limit: RwLock<LimitState>,
    latch: Mutex<ThresholdLatch>,
    lifecycle: Mutex<LifecycleController>,
    checkpoint_lock: Mutex<()>,
}

impl Monitor {
    pub fn new(parts: MonitorParts) -> Self {
        let limit_config = parts.limit.load_or_default();
        if !parts.limit.exists() {
            if let Err(e) = parts.limit.save(&limit_config) {
                warn!(
                    "Failed to create limit record {}: {}",
                    parts.limit.path().display(),
                    e
                );
            }
        }
        info!("Configured limit: {:?} bytes", limit_config.limit);

        let accumulator = Accumulator::load(parts.totals);
        let baseline = parts.source.sample();
        let rate = RateEngine::new(baseline, parts.smoothing);

        Self {
            source: parts.source,
            dispatcher: parts.dispatcher,
            engine: Mutex::new(EngineState { rate, last: None }),
            accumulator: RwLock::new(accumulator),
            limit: RwLock::new(LimitState {
                config: limit_config,
                store: parts.limit,
            }),
            latch: Mutex::new(ThresholdLatch::new(parts.retry_backoff)),
            lifecycle: Mutex::new(parts.lifecycle),
            checkpoint_lock: Mutex::new(()),
        }
    }

    /// Take a fresh sample and run it through the engine.
    pub fn tick(&self) -> TickOutcome {
        let sample = self.source.sample();
        self.process(sample)
    }

    pub fn process(&self, sample: RawSample) -> TickOutcome {
        let (report, total) = {
            let mut engine = self.engine.lock();
            let report = engine.rate.tick(sample, sample.timestamp);
            engine.last = Some(report);

            let mut accumulator = self.accumulator.write();
            accumulator.record_delta(
                report.deltas.sent.contribution(),
                report.deltas.recv.contribution(),
            );
            (report, accumulator.current_total())
        };

        if report.deltas.any_reset() {
            warn!(
                "Counter reset detected (sent={:?}, recv={:?}), rebased session baseline",
                report.deltas.sent, report.deltas.recv
            );
        }

        let limit = self.limit.read().config;
        let exceeded = threshold::check(&total, &limit);
        let dispatched = self.dispatch_if_exceeded(exceeded, &total, &limit);

        TickOutcome {
            report,
            total,
            exceeded,
            dispatched,
        }
    }

    fn dispatch_if_exceeded(
        &self,
        exceeded: bool,
        total: &CumulativeTotal,
        limit: &LimitConfig,
    ) -> bool {
        let mut latch = self.latch.lock();
        if !latch.should_dispatch(exceeded, Instant::now()) {
            return false;
        }

        warn!(
            "Cumulative usage {} bytes reached limit {:?} bytes, shutting down host",
            total.combined(),
            limit.limit
        );
        match self.dispatcher.shutdown_host() {
            Ok(()) => {
                latch.mark_dispatched();
                info!("Host shutdown requested");
                true
            }
            Err(e) => {
                error!("Host shutdown failed, will retry: {}", e);
                false
            }
        }
    }

    pub fn current_total(&self) -> CumulativeTotal {
        self.accumulator.read().current_total()
    }

    pub fn limit(&self) -> LimitConfig {
        self.limit.read().config
    }

    /// Persist the cumulative total. The snapshot is copied under the lock
    /// and written outside it.
    pub fn checkpoint(&self) -> Result<()> {
        let _guard = self.checkpoint_lock.lock();
        if self.lifecycle.lock().state() == LifecycleState::Expired {
            debug!("Skipping checkpoint, lifecycle has expired");
            return Ok(());
        }

        let now = common::now_secs_f64();
        let (snapshot, store) = {
            let accumulator = self.accumulator.read();
            let snapshot = CumulativeTotal {
                last_checkpoint_time: Some(now),
                ..accumulator.current_total()
            };
            (snapshot, accumulator.store().clone())
        };

        store.save(&snapshot)?;
        self.accumulator.write().mark_checkpointed(now);
        debug!(
            "Checkpointed cumulative total: sent={} recv={}",
            snapshot.total_sent, snapshot.total_recv
        );
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn set_limit(&self, limit: Option<u64>) -> Result<()> {
        if limit == Some(0) {
            return Err(AccountingError::InvalidLimit(
                "limit must be greater than zero".to_string(),
            ));
        }

        let config = LimitConfig { limit };
        {
            let mut state = self.limit.write();
            state.store.save(&config)?;
            state.config = config;
        }
        self.latch.lock().rearm();
        info!("Limit set to {:?} bytes", limit);
        Ok(())
    }

    /// Start a fresh session baseline and zero the cumulative total.
    #[instrument(skip(self))]
    pub fn reset_accounting(&self) -> Result<()> {
        let sample = self.source.sample();
        {
            let mut engine = self.engine.lock();
            engine.rate.reset_baseline(sample);
            engine.last = None;
            self.accumulator.write().reset();
        }
        self.latch.lock().rearm();
        self.checkpoint()?;
        info!("Accounting reset");
        Ok(())
    }

    pub fn remaining_ttl(&self) -> Duration {
        self.lifecycle.lock().remaining_ttl(common::now_secs_f64())
    }

    pub fn check_expiry(&self) -> bool {
        self.check_expiry_at(common::now_secs_f64())
    }

    /// Evaluate the time-to-live at `now`; on the transition to EXPIRED
    /// erase persisted state and terminate.
    pub fn check_expiry_at(&self, now: f64) -> bool {
        let _guard = self.checkpoint_lock.lock();
        let mut lifecycle = self.lifecycle.lock();
        if !lifecycle.evaluate(now) {
            return false;
        }
        lifecycle.expire(self.dispatcher.as_ref());
        true
    }

    pub fn get_report(&self) -> Report {
        let host = self.source.host_stats();
        let (rates, session) = {
            let engine = self.engine.lock();
            let rates = engine.last.map(|r| r.smoothed).unwrap_or_default();
            (rates, engine.rate.session_usage())
        };
        let total = self.current_total();
        let limit = self.limit();
        let (remaining, expires_at, lifecycle) = {
            let lifecycle = self.lifecycle.lock();
            (
                lifecycle.remaining_ttl(common::now_secs_f64()),
                lifecycle.expires_at(),
                lifecycle.state(),
            )
        };

        Report {
            cpu_percent: host.cpu_percent,
            memory_percent: host.memory_percent,
            disk_percent: host.disk_percent,
            uptime_secs: host.uptime_secs,
            boot_time: host.boot_time,
            rates,
            session,
            cumulative_total: total,
            cumulative_tib: total.combined() as f64 / BYTES_PER_TIB,
            limit: limit.limit,
            limit_reached: threshold::check(&total, &limit),
            remaining_ttl_secs: remaining.as_secs(),
            expires_at,
            lifecycle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{DEFAULT_TTL, InstallRecord};
    use crate::test_support::{RecordingDispatcher, ScriptedSource, sample};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        source: Arc<ScriptedSource>,
        dispatcher: Arc<RecordingDispatcher>,
    }

    impl Fixture {
        fn new(first: RawSample) -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                source: Arc::new(ScriptedSource::new([first])),
                dispatcher: Arc::new(RecordingDispatcher::default()),
            }
        }

        fn totals(&self) -> JsonStore<CumulativeTotal> {
            JsonStore::new(self.dir.path().join("network_totals.json"))
        }

        fn limit(&self) -> JsonStore<LimitConfig> {
            JsonStore::new(self.dir.path().join("network_limit.json"))
        }

        fn install(&self) -> JsonStore<InstallRecord> {
            JsonStore::new(self.dir.path().join("install.json"))
        }

        fn monitor(&self) -> Monitor {
            let lifecycle =
                LifecycleController::activate(self.install(), DEFAULT_TTL, common::now_secs_f64())
                    .with_cleanup_targets([
                        self.totals().path().to_path_buf(),
                        self.limit().path().to_path_buf(),
                    ]);
            Monitor::new(MonitorParts {
                source: self.source.clone(),
                dispatcher: self.dispatcher.clone(),
                totals: self.totals(),
                limit: self.limit(),
                lifecycle,
                smoothing: 1.0,
                retry_backoff: Duration::ZERO,
            })
        }
    }

    #[test]
    fn total_is_monotonic_across_counter_resets() {
        let fixture = Fixture::new(sample(100, 100, 0.0));
        let monitor = fixture.monitor();

        let readings = [(200, 150), (50, 20), (150, 90), (10, 5), (500, 400)];
        let mut previous = monitor.current_total().combined();
        for (i, (sent, recv)) in readings.iter().enumerate() {
            let outcome = monitor.process(sample(*sent, *recv, (i + 1) as f64));
            let combined = outcome.total.combined();
            assert!(combined >= previous, "total decreased at tick {}", i);
            previous = combined;
        }
        // 100 + 50 + 100 + 10 + 490 sent, 50 + 20 + 70 + 5 + 395 received
        assert_eq!(monitor.current_total().total_sent, 750);
        assert_eq!(monitor.current_total().total_recv, 540);
    }

    #[test]
    fn limit_dispatches_shutdown_exactly_once() {
        let fixture = Fixture::new(sample(0, 0, 0.0));
        let monitor = fixture.monitor();
        monitor.set_limit(Some(1_000)).unwrap();

        let before = monitor.process(sample(450, 450, 1.0));
        assert!(!before.exceeded);
        assert!(!before.dispatched);

        let crossing = monitor.process(sample(550, 550, 2.0));
        assert!(crossing.exceeded);
        assert!(crossing.dispatched);

        for t in 3..10 {
            let after = monitor.process(sample(600 + t, 600, t as f64));
            assert!(after.exceeded);
            assert!(!after.dispatched);
        }
        assert_eq!(fixture.dispatcher.shutdowns(), 1);
    }

    #[test]
    fn failed_shutdown_is_retried() {
        let fixture = Fixture::new(sample(0, 0, 0.0));
        fixture.dispatcher.set_failing(true);
        let monitor = fixture.monitor();
        monitor.set_limit(Some(10)).unwrap();

        assert!(!monitor.process(sample(20, 0, 1.0)).dispatched);
        fixture.dispatcher.set_failing(false);
        assert!(monitor.process(sample(21, 0, 2.0)).dispatched);
        assert!(!monitor.process(sample(22, 0, 3.0)).dispatched);
        assert_eq!(fixture.dispatcher.shutdowns(), 2);
    }

    #[test]
    fn checkpointed_total_is_restored_after_restart() {
        let fixture = Fixture::new(sample(0, 0, 0.0));
        let monitor = fixture.monitor();
        monitor.process(sample(1_234, 5_678, 1.0));
        monitor.checkpoint().unwrap();
        drop(monitor);

        // New process, new boot: the raw counters start over.
        fixture.source.push_all([sample(3, 4, 100.0)]);
        let restarted = fixture.monitor();
        let total = restarted.current_total();
        assert_eq!((total.total_sent, total.total_recv), (1_234, 5_678));

        restarted.process(sample(13, 14, 101.0));
        assert_eq!(restarted.current_total().combined(), 1_234 + 5_678 + 20);
    }

    #[test]
    fn limit_is_persisted_and_zero_is_rejected() {
        let fixture = Fixture::new(sample(0, 0, 0.0));
        let monitor = fixture.monitor();
        assert_eq!(fixture.limit().load(), Some(LimitConfig { limit: None }));

        monitor.set_limit(Some(5_000)).unwrap();
        assert_eq!(fixture.limit().load().unwrap().limit, Some(5_000));

        let err = monitor.set_limit(Some(0)).unwrap_err();
        assert!(matches!(err, AccountingError::InvalidLimit(_)));
        assert_eq!(monitor.limit().limit, Some(5_000));

        monitor.set_limit(None).unwrap();
        assert_eq!(fixture.limit().load().unwrap().limit, None);
    }

    #[test]
    fn reset_accounting_zeroes_total_and_rearms_latch() {
        let fixture = Fixture::new(sample(0, 0, 0.0));
        let monitor = fixture.monitor();
        monitor.set_limit(Some(100)).unwrap();
        assert!(monitor.process(sample(200, 0, 1.0)).dispatched);

        fixture.source.push_all([sample(200, 0, 2.0)]);
        monitor.reset_accounting().unwrap();
        assert_eq!(monitor.current_total().combined(), 0);
        assert_eq!(fixture.totals().load().unwrap().total_sent, 0);

        assert!(!monitor.process(sample(250, 0, 3.0)).exceeded);
        assert!(monitor.process(sample(300, 0, 4.0)).dispatched);
        assert_eq!(fixture.dispatcher.shutdowns(), 2);
    }

    #[test]
    fn expiry_erases_state_once_and_blocks_later_checkpoints() {
        let fixture = Fixture::new(sample(0, 0, 0.0));
        let monitor = fixture.monitor();
        monitor.process(sample(10, 10, 1.0));
        monitor.checkpoint().unwrap();
        assert!(fixture.totals().exists());

        let far_future = common::now_secs_f64() + DEFAULT_TTL.as_secs_f64() + 60.0;
        assert!(monitor.check_expiry_at(far_future));
        assert!(!monitor.check_expiry_at(far_future + 3_600.0));
        assert_eq!(fixture.dispatcher.terminations(), 1);

        assert!(!fixture.totals().exists());
        assert!(!fixture.limit().exists());
        assert!(!fixture.install().exists());

        monitor.checkpoint().unwrap();
        assert!(!fixture.totals().exists());
        assert_eq!(monitor.remaining_ttl(), Duration::ZERO);
    }

    #[test]
    fn report_reflects_current_state() {
        let fixture = Fixture::new(sample(0, 0, 0.0));
        let monitor = fixture.monitor();
        monitor.set_limit(Some(1_000)).unwrap();
        monitor.process(sample(300, 200, 1.0));

        let report = monitor.get_report();
        assert_eq!(report.cumulative_total.combined(), 500);
        assert_eq!(report.session.bytes_sent, 300);
        assert_eq!(report.rates.sent_bits_per_sec, 2_400.0);
        assert_eq!(report.limit, Some(1_000));
        assert!(!report.limit_reached);
        assert_eq!(report.lifecycle, LifecycleState::Active);
        assert!(report.remaining_ttl_secs > 0);
        assert_eq!(report.cpu_percent, 12.5);
        assert_eq!(report.boot_time, 1_700_000_000);
    }
}
