pub mod accumulator;
pub mod actions;
pub mod counter;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod rate;
pub mod tasks;
pub mod threshold;

#[cfg(test)]
mod test_support;

pub use accumulator::{Accumulator, CumulativeTotal};
pub use actions::ActionDispatcher;
pub use counter::{CounterSource, HostStats, RawSample, SystemCounterSource};
pub use error::{AccountingError, Result};
pub use lifecycle::{InstallRecord, LifecycleController, LifecycleState};
pub use monitor::{Monitor, MonitorParts, Report, TickOutcome};
pub use rate::{CounterDelta, RateEngine, RateReport, Rates, SessionUsage};
pub use tasks::TaskIntervals;
pub use threshold::{LimitConfig, ThresholdLatch};

/// Bytes per tebibyte, the unit the dashboard shows cumulative usage in.
pub const BYTES_PER_TIB: f64 = 1024.0 * 1024.0 * 1024.0 * 1024.0;
