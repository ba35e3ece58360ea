use crate::accumulator::CumulativeTotal;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Administrator-configured cumulative usage ceiling, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    #[serde(default)]
    pub limit: Option<u64>,
}

/// True when a limit is configured and sent plus received has reached it.
pub fn check(total: &CumulativeTotal, limit: &LimitConfig) -> bool {
    match limit.limit {
        Some(limit) => total.combined() >= limit,
        None => false,
    }
}

/// Keeps the limit action to one dispatch per crossing.
///
/// The latch closes only after a successful dispatch. Failed attempts are
/// retried, spaced by `retry_backoff`.
#[derive(Debug)]
pub struct ThresholdLatch {
    triggered: bool,
    last_attempt: Option<Instant>,
    retry_backoff: Duration,
}

impl ThresholdLatch {
    pub fn new(retry_backoff: Duration) -> Self {
        Self {
            triggered: false,
            last_attempt: None,
            retry_backoff,
        }
    }

    /// Returns true when the caller should dispatch now.
    pub fn should_dispatch(&mut self, exceeded: bool, now: Instant) -> bool {
        if !exceeded || self.triggered {
            return false;
        }
        if let Some(last) = self.last_attempt {
            if now.saturating_duration_since(last) < self.retry_backoff {
                return false;
            }
        }
        self.last_attempt = Some(now);
        true
    }

    pub fn mark_dispatched(&mut self) {
        self.triggered = true;
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    /// Open the latch again, after the limit changes or accounting is reset.
    pub fn rearm(&mut self) {
        self.triggered = false;
        self.last_attempt = None;
    }
}

impl Default for ThresholdLatch {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
