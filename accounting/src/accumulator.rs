use common::JsonStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// All network traffic observed across every session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CumulativeTotal {
    pub total_sent: u64,
    pub total_recv: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_time: Option<f64>,
}

impl CumulativeTotal {
    pub fn combined(&self) -> u64 {
        self.total_sent.saturating_add(self.total_recv)
    }
}

/// Owns the in-memory cumulative total and its durable record.
///
/// Deltas are unsigned, so a negative contribution cannot reach the total;
/// counter resets are resolved upstream by [`crate::rate::RateEngine`].
pub struct Accumulator {
    total: CumulativeTotal,
    store: JsonStore<CumulativeTotal>,
}

impl Accumulator {
    pub fn load(store: JsonStore<CumulativeTotal>) -> Self {
        let total = store.load_or_default();
        info!(
            "Loaded cumulative total from {}: sent={} recv={}",
            store.path().display(),
            total.total_sent,
            total.total_recv
        );
        Self { total, store }
    }

    pub fn record_delta(&mut self, sent_delta: u64, recv_delta: u64) {
        let sent = self.total.total_sent.checked_add(sent_delta);
        let recv = self.total.total_recv.checked_add(recv_delta);
        if sent.is_none() || recv.is_none() {
            warn!("Cumulative total saturated at u64::MAX");
        }
        self.total.total_sent = sent.unwrap_or(u64::MAX);
        self.total.total_recv = recv.unwrap_or(u64::MAX);
    }

    pub fn current_total(&self) -> CumulativeTotal {
        self.total
    }

    /// Persist the current total. Callers that must not hold a lock across
    /// disk I/O use [`Accumulator::store`] with a copied snapshot instead.
    pub fn checkpoint(&mut self, now: f64) -> common::Result<()> {
        let snapshot = CumulativeTotal {
            last_checkpoint_time: Some(now),
            ..self.total
        };
        self.store.save(&snapshot)?;
        self.mark_checkpointed(now);
        Ok(())
    }

    pub fn mark_checkpointed(&mut self, now: f64) {
        self.total.last_checkpoint_time = Some(now);
    }

    /// Administrative reset back to zero totals.
    pub fn reset(&mut self) {
        self.total = CumulativeTotal {
            last_checkpoint_time: self.total.last_checkpoint_time,
            ..CumulativeTotal::default()
        };
    }

    pub fn store(&self) -> &JsonStore<CumulativeTotal> {
        &self.store
    }
}
