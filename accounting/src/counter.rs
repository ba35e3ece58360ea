use crate::rate::CounterDelta;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use sysinfo::{Disks, Networks, System};
use tracing::{debug, warn};

/// One reading of the host-wide counters, summed over devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RawSample {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    /// Seconds since the Unix epoch at which the reading was taken.
    pub timestamp: f64,
}

/// Point-in-time host gauges shown next to the traffic figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HostStats {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub uptime_secs: u64,
    pub boot_time: u64,
}

/// Source of raw OS counters.
///
/// Implementations never fail: when the platform query does not produce a
/// usable reading they hand back the last good sample (or zeros).
pub trait CounterSource: Send + Sync {
    fn sample(&self) -> RawSample;

    fn host_stats(&self) -> HostStats {
        HostStats::default()
    }
}

/// Per-device counter pair, e.g. (transmitted, received) for an interface or
/// (read, written) for a disk.
pub type DeviceReading = (String, [u64; 2]);

/// Folds per-device counters into host-wide totals.
///
/// Deltas are taken per device and then summed, so a device that vanishes
/// (a removed veth or tun, an unplugged NIC) or shows up for the first time
/// moves the totals by nothing. Only a drop within a single device counts as
/// a reset of that device.
#[derive(Debug, Default)]
pub struct DeviceTotals {
    previous: HashMap<String, [u64; 2]>,
    totals: [u64; 2],
    seeded: bool,
}

impl DeviceTotals {
    pub fn update<I>(&mut self, readings: I) -> [u64; 2]
    where
        I: IntoIterator<Item = DeviceReading>,
    {
        let current: HashMap<String, [u64; 2]> = readings.into_iter().collect();

        if !self.seeded {
            self.totals = current.values().fold([0, 0], |acc, counters| {
                [
                    acc[0].saturating_add(counters[0]),
                    acc[1].saturating_add(counters[1]),
                ]
            });
            self.seeded = true;
        } else {
            for (name, counters) in &current {
                let Some(previous) = self.previous.get(name) else {
                    debug!("Device {} appeared, counting from its next reading", name);
                    continue;
                };
                for i in 0..2 {
                    let delta = CounterDelta::between(previous[i], counters[i]);
                    if delta.is_reset() {
                        warn!("Counter of device {} went backwards, treating as reset", name);
                    }
                    self.totals[i] = self.totals[i].saturating_add(delta.contribution());
                }
            }
            for name in self.previous.keys() {
                if !current.contains_key(name) {
                    debug!("Device {} disappeared", name);
                }
            }
        }

        self.previous = current;
        self.totals
    }
}

/// Running host-wide counters built from device readings.
#[derive(Debug, Default)]
pub struct CounterState {
    network: DeviceTotals,
    disk: DeviceTotals,
    last: RawSample,
}

impl CounterState {
    /// Turn one round of device readings into a sample. With no interface
    /// and no disk reported the read is treated as a transient failure and
    /// the last sample is handed back with the new timestamp.
    pub fn observe(
        &mut self,
        interfaces: Vec<DeviceReading>,
        disks: Vec<DeviceReading>,
        timestamp: f64,
    ) -> RawSample {
        if interfaces.is_empty() && disks.is_empty() {
            warn!("No network interfaces or disks reported, reusing last sample");
            return RawSample {
                timestamp,
                ..self.last
            };
        }

        let [bytes_sent, bytes_recv] = self.network.update(interfaces);
        let [disk_read_bytes, disk_write_bytes] = self.disk.update(disks);
        self.last = RawSample {
            bytes_sent,
            bytes_recv,
            disk_read_bytes,
            disk_write_bytes,
            timestamp,
        };
        self.last
    }
}

/// Counter source backed by `sysinfo`.
pub struct SystemCounterSource {
    probe: Mutex<SystemProbe>,
}

struct SystemProbe {
    system: System,
    networks: Networks,
    disks: Disks,
    state: CounterState,
}

impl SystemCounterSource {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();

        Self {
            probe: Mutex::new(SystemProbe {
                system,
                networks: Networks::new_with_refreshed_list(),
                disks: Disks::new_with_refreshed_list(),
                state: CounterState::default(),
            }),
        }
    }
}

impl Default for SystemCounterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for SystemCounterSource {
    fn sample(&self) -> RawSample {
        let mut probe = self.probe.lock();
        probe.networks.refresh(true);
        probe.disks.refresh(true);

        let interfaces: Vec<DeviceReading> = probe
            .networks
            .iter()
            .filter(|(name, _)| !is_loopback(name))
            .map(|(name, data)| {
                (
                    name.clone(),
                    [data.total_transmitted(), data.total_received()],
                )
            })
            .collect();

        let disks: Vec<DeviceReading> = probe
            .disks
            .list()
            .iter()
            .map(|disk| {
                let usage = disk.usage();
                (
                    disk.mount_point().to_string_lossy().into_owned(),
                    [usage.total_read_bytes, usage.total_written_bytes],
                )
            })
            .collect();

        probe
            .state
            .observe(interfaces, disks, common::now_secs_f64())
    }

    fn host_stats(&self) -> HostStats {
        let mut probe = self.probe.lock();
        probe.system.refresh_cpu_usage();
        probe.system.refresh_memory();

        let total_memory = probe.system.total_memory();
        let memory_percent = if total_memory > 0 {
            (probe.system.used_memory() as f64 / total_memory as f64 * 100.0) as f32
        } else {
            0.0
        };

        let disk_percent = probe
            .disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .filter(|disk| disk.total_space() > 0)
            .map(|disk| {
                let used = disk.total_space().saturating_sub(disk.available_space());
                (used as f64 / disk.total_space() as f64 * 100.0) as f32
            })
            .unwrap_or_default();

        let stats = HostStats {
            cpu_percent: probe.system.global_cpu_usage(),
            memory_percent,
            disk_percent,
            uptime_secs: System::uptime(),
            boot_time: System::boot_time(),
        };
        debug!("Host stats: {:?}", stats);
        stats
    }
}

fn is_loopback(name: &str) -> bool {
    name == "lo" || name.starts_with("lo0") || name.to_ascii_lowercase().contains("loopback")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_interfaces_are_skipped() {
        assert!(is_loopback("lo"));
        assert!(is_loopback("lo0"));
        assert!(is_loopback("Loopback Pseudo-Interface 1"));
        assert!(!is_loopback("eth0"));
        assert!(!is_loopback("wlan0"));
    }

    fn device(name: &str, first: u64, second: u64) -> DeviceReading {
        (name.to_string(), [first, second])
    }

    #[test]
    fn vanished_interface_does_not_count_as_traffic() {
        let mut totals = DeviceTotals::default();
        let start = totals.update([
            device("eth0", 10_000_000_000, 500),
            device("veth1a2b", 1_000_000_000, 700),
        ]);
        assert_eq!(start, [11_000_000_000, 1_200]);

        let after = totals.update([device("eth0", 10_000_001_000, 600)]);
        assert_eq!(after, [11_000_001_000, 1_300]);
    }

    #[test]
    fn new_interface_starts_counting_after_first_sighting() {
        let mut totals = DeviceTotals::default();
        totals.update([device("eth0", 1_000, 1_000)]);

        let seen = totals.update([device("eth0", 1_000, 1_000), device("tun0", 5_000, 5_000)]);
        assert_eq!(seen, [1_000, 1_000]);

        let grown = totals.update([device("eth0", 1_000, 1_000), device("tun0", 5_300, 5_100)]);
        assert_eq!(grown, [1_300, 1_100]);
    }

    #[test]
    fn device_counter_drop_is_a_reset_of_that_device_only() {
        let mut totals = DeviceTotals::default();
        totals.update([device("eth0", 800, 800), device("eth1", 200, 200)]);

        let after = totals.update([device("eth0", 50, 800), device("eth1", 300, 200)]);
        assert_eq!(after, [1_000 + 50 + 100, 1_000]);
    }

    #[test]
    fn empty_read_reuses_last_sample_with_fresh_timestamp() {
        let mut state = CounterState::default();
        let first = state.observe(
            vec![device("eth0", 4_000, 3_000)],
            vec![device("/", 700, 900)],
            10.0,
        );
        assert_eq!(first.bytes_sent, 4_000);
        assert_eq!(first.disk_write_bytes, 900);

        let fallback = state.observe(Vec::new(), Vec::new(), 11.0);
        assert_eq!(fallback, RawSample { timestamp: 11.0, ..first });

        let next = state.observe(
            vec![device("eth0", 4_500, 3_000)],
            vec![device("/", 700, 900)],
            12.0,
        );
        assert_eq!(next.bytes_sent, 4_500);
    }

    #[test]
    fn empty_read_before_any_sample_yields_zeros() {
        let mut state = CounterState::default();
        let sample = state.observe(Vec::new(), Vec::new(), 5.0);
        assert_eq!(sample, RawSample { timestamp: 5.0, ..RawSample::default() });
    }

    #[test]
    fn system_source_produces_timestamped_samples() {
        let source = SystemCounterSource::new();
        let first = source.sample();
        let second = source.sample();
        assert!(first.timestamp > 0.0);
        assert!(second.timestamp >= first.timestamp);
    }
}
