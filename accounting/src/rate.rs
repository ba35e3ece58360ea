//! Turns successive raw counter readings into per-tick deltas and rates.
//!
//! OS counters restart near zero when the host reboots (or wrap on
//! rollover). A reading lower than the previous one is reported as
//! [`CounterDelta::Reset`] carrying the post-reset value, which is the
//! amount that has flowed since the reset. Negative deltas never leave
//! this module.

use crate::counter::RawSample;
use serde::Serialize;

/// Contribution of one counter over one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterDelta {
    Normal(u64),
    /// The counter went backwards; the value is the new raw reading.
    Reset(u64),
}

impl CounterDelta {
    pub fn between(previous: u64, now: u64) -> Self {
        match now.checked_sub(previous) {
            Some(delta) => CounterDelta::Normal(delta),
            None => CounterDelta::Reset(now),
        }
    }

    pub fn contribution(self) -> u64 {
        match self {
            CounterDelta::Normal(delta) | CounterDelta::Reset(delta) => delta,
        }
    }

    pub fn is_reset(self) -> bool {
        matches!(self, CounterDelta::Reset(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickDeltas {
    pub sent: CounterDelta,
    pub recv: CounterDelta,
    pub disk_read: CounterDelta,
    pub disk_write: CounterDelta,
}

impl TickDeltas {
    pub fn any_reset(&self) -> bool {
        self.sent.is_reset()
            || self.recv.is_reset()
            || self.disk_read.is_reset()
            || self.disk_write.is_reset()
    }
}

/// Network rates in bits per second, disk rates in bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Rates {
    pub sent_bits_per_sec: f64,
    pub recv_bits_per_sec: f64,
    pub disk_read_bytes_per_sec: f64,
    pub disk_write_bytes_per_sec: f64,
}

impl Rates {
    fn from_deltas(deltas: &TickDeltas, elapsed_secs: f64) -> Self {
        Self {
            sent_bits_per_sec: deltas.sent.contribution() as f64 * 8.0 / elapsed_secs,
            recv_bits_per_sec: deltas.recv.contribution() as f64 * 8.0 / elapsed_secs,
            disk_read_bytes_per_sec: deltas.disk_read.contribution() as f64 / elapsed_secs,
            disk_write_bytes_per_sec: deltas.disk_write.contribution() as f64 / elapsed_secs,
        }
    }

    fn blend(&self, instant: &Rates, alpha: f64) -> Self {
        let mix = |old: f64, new: f64| alpha * new + (1.0 - alpha) * old;
        Self {
            sent_bits_per_sec: mix(self.sent_bits_per_sec, instant.sent_bits_per_sec),
            recv_bits_per_sec: mix(self.recv_bits_per_sec, instant.recv_bits_per_sec),
            disk_read_bytes_per_sec: mix(
                self.disk_read_bytes_per_sec,
                instant.disk_read_bytes_per_sec,
            ),
            disk_write_bytes_per_sec: mix(
                self.disk_write_bytes_per_sec,
                instant.disk_write_bytes_per_sec,
            ),
        }
    }
}

/// Usage since the session baseline, never negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionUsage {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateReport {
    pub deltas: TickDeltas,
    /// Rates over this tick alone; zero when the elapsed time was not positive.
    pub instant: Rates,
    pub smoothed: Rates,
    pub session: SessionUsage,
    pub elapsed_secs: f64,
}

pub struct RateEngine {
    baseline: RawSample,
    previous: RawSample,
    previous_time: f64,
    alpha: f64,
    smoothed: Option<Rates>,
}

impl RateEngine {
    /// `smoothing` is the EWMA weight given to the newest rate; `1.0` disables smoothing.
    pub fn new(initial: RawSample, smoothing: f64) -> Self {
        let alpha = if smoothing.is_finite() && smoothing > 0.0 {
            smoothing.min(1.0)
        } else {
            1.0
        };
        let mut engine = Self {
            baseline: initial,
            previous: initial,
            previous_time: initial.timestamp,
            alpha,
            smoothed: None,
        };
        engine.reset_baseline(initial);
        engine
    }

    pub fn reset_baseline(&mut self, now: RawSample) {
        self.baseline = now;
        self.previous = now;
        self.previous_time = now.timestamp;
        self.smoothed = None;
    }

    pub fn tick(&mut self, now: RawSample, now_time: f64) -> RateReport {
        let elapsed_secs = now_time - self.previous_time;
        let deltas = TickDeltas {
            sent: CounterDelta::between(self.previous.bytes_sent, now.bytes_sent),
            recv: CounterDelta::between(self.previous.bytes_recv, now.bytes_recv),
            disk_read: CounterDelta::between(self.previous.disk_read_bytes, now.disk_read_bytes),
            disk_write: CounterDelta::between(
                self.previous.disk_write_bytes,
                now.disk_write_bytes,
            ),
        };

        // A counter that went backwards restarts its session count from the new reading.
        if deltas.sent.is_reset() {
            self.baseline.bytes_sent = now.bytes_sent;
        }
        if deltas.recv.is_reset() {
            self.baseline.bytes_recv = now.bytes_recv;
        }
        if deltas.disk_read.is_reset() {
            self.baseline.disk_read_bytes = now.disk_read_bytes;
        }
        if deltas.disk_write.is_reset() {
            self.baseline.disk_write_bytes = now.disk_write_bytes;
        }

        let instant = if elapsed_secs > 0.0 {
            let instant = Rates::from_deltas(&deltas, elapsed_secs);
            self.smoothed = Some(match self.smoothed {
                Some(smoothed) => smoothed.blend(&instant, self.alpha),
                None => instant,
            });
            instant
        } else {
            Rates::default()
        };

        self.previous = now;
        self.previous_time = now_time;

        RateReport {
            deltas,
            instant,
            smoothed: self.smoothed.unwrap_or_default(),
            session: self.session_usage(),
            elapsed_secs,
        }
    }

    pub fn session_usage(&self) -> SessionUsage {
        SessionUsage {
            bytes_sent: self.previous.bytes_sent.saturating_sub(self.baseline.bytes_sent),
            bytes_recv: self.previous.bytes_recv.saturating_sub(self.baseline.bytes_recv),
            disk_read_bytes: self
                .previous
                .disk_read_bytes
                .saturating_sub(self.baseline.disk_read_bytes),
            disk_write_bytes: self
                .previous
                .disk_write_bytes
                .saturating_sub(self.baseline.disk_write_bytes),
        }
    }
}
