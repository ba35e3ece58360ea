use crate::actions::ActionDispatcher;
use crate::counter::{CounterSource, HostStats, RawSample};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Plays back queued samples, then keeps returning the last one.
#[derive(Default)]
pub struct ScriptedSource {
    queue: Mutex<VecDeque<RawSample>>,
    last: Mutex<RawSample>,
}

impl ScriptedSource {
    pub fn new(samples: impl IntoIterator<Item = RawSample>) -> Self {
        let source = Self::default();
        source.push_all(samples);
        source
    }

    pub fn push_all(&self, samples: impl IntoIterator<Item = RawSample>) {
        self.queue.lock().extend(samples);
    }
}

impl CounterSource for ScriptedSource {
    fn sample(&self) -> RawSample {
        let mut last = self.last.lock();
        if let Some(next) = self.queue.lock().pop_front() {
            *last = next;
        }
        *last
    }

    fn host_stats(&self) -> HostStats {
        HostStats {
            cpu_percent: 12.5,
            memory_percent: 40.0,
            disk_percent: 55.0,
            uptime_secs: 3_600,
            boot_time: 1_700_000_000,
        }
    }
}

#[derive(Default)]
pub struct RecordingDispatcher {
    shutdowns: AtomicUsize,
    terminations: AtomicUsize,
    fail_shutdown: AtomicBool,
}

impl RecordingDispatcher {
    pub fn set_failing(&self, failing: bool) {
        self.fail_shutdown.store(failing, Ordering::SeqCst);
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

impl ActionDispatcher for RecordingDispatcher {
    fn shutdown_host(&self) -> std::io::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_shutdown.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("shutdown refused"));
        }
        Ok(())
    }

    fn terminate_self(&self) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn sample(sent: u64, recv: u64, timestamp: f64) -> RawSample {
    RawSample {
        bytes_sent: sent,
        bytes_recv: recv,
        disk_read_bytes: 0,
        disk_write_bytes: 0,
        timestamp,
    }
}
