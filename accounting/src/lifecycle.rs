//! Install-time tracking and the one-way ACTIVE -> EXPIRED transition.

use crate::actions::ActionDispatcher;
use chrono::{DateTime, Utc};
use common::JsonStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstallRecord {
    /// Seconds since the Unix epoch.
    pub install_time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Active,
    Expired,
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub already_gone: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, std::io::Error)>,
}

pub struct LifecycleController {
    record: InstallRecord,
    ttl: Duration,
    state: LifecycleState,
    store: JsonStore<InstallRecord>,
    cleanup_targets: Vec<PathBuf>,
}

impl LifecycleController {
    /// Load the install record, writing one stamped `now` on first run.
    pub fn activate(store: JsonStore<InstallRecord>, ttl: Duration, now: f64) -> Self {
        let record = match store.load() {
            Some(record) => {
                info!(
                    "Install record found at {}: install_time={}",
                    store.path().display(),
                    record.install_time
                );
                record
            }
            None => {
                let record = InstallRecord { install_time: now };
                match store.save(&record) {
                    Ok(()) => info!("Wrote install record to {}", store.path().display()),
                    Err(e) => error!(
                        "Failed to write install record {}: {}",
                        store.path().display(),
                        e
                    ),
                }
                record
            }
        };

        let cleanup_targets = vec![store.path().to_path_buf()];
        let controller = Self {
            record,
            ttl,
            state: LifecycleState::Active,
            store,
            cleanup_targets,
        };
        if let Some(expires_at) = controller.expires_at() {
            info!("Lifecycle expires at {}", expires_at.to_rfc3339());
        }
        controller
    }

    /// Additional files erased on expiry, alongside the install record.
    pub fn with_cleanup_targets<I>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        for target in targets {
            if !self.cleanup_targets.contains(&target) {
                self.cleanup_targets.push(target);
            }
        }
        self
    }

    pub fn install_time(&self) -> f64 {
        self.record.install_time
    }

    /// Wall-clock instant at which the time-to-live runs out.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let expiry_secs = self.record.install_time + self.ttl.as_secs_f64();
        DateTime::from_timestamp_millis((expiry_secs * 1000.0) as i64)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn cleanup_targets(&self) -> &[PathBuf] {
        &self.cleanup_targets
    }

    pub fn remaining_ttl(&self, now: f64) -> Duration {
        if self.state == LifecycleState::Expired {
            return Duration::ZERO;
        }
        // A clock that moved behind the install time counts as no time elapsed.
        let elapsed = Duration::try_from_secs_f64((now - self.record.install_time).max(0.0))
            .unwrap_or(Duration::MAX);
        self.ttl.saturating_sub(elapsed)
    }

    pub fn is_expired(&self, now: f64) -> bool {
        self.remaining_ttl(now).is_zero()
    }

    /// Moves to EXPIRED when the TTL has run out. Returns true only on the
    /// call that performs the transition.
    pub fn evaluate(&mut self, now: f64) -> bool {
        if self.state == LifecycleState::Expired || !self.is_expired(now) {
            return false;
        }
        warn!(
            "Time-to-live of {:?} since install at {} has run out",
            self.ttl, self.record.install_time
        );
        self.state = LifecycleState::Expired;
        true
    }

    /// Erase every cleanup target, then terminate the process regardless of
    /// individual removal failures.
    pub fn expire(&mut self, dispatcher: &dyn ActionDispatcher) -> CleanupReport {
        self.state = LifecycleState::Expired;
        let report = cleanup(&self.cleanup_targets);
        if let Err(e) = self.store.remove() {
            warn!("Failed to clear install record leftovers: {}", e);
        }
        info!(
            "Cleanup finished: {} removed, {} already gone, {} failed",
            report.removed.len(),
            report.already_gone.len(),
            report.failed.len()
        );
        dispatcher.terminate_self();
        report
    }
}

/// Remove each path. Paths that do not exist are not an error, so running
/// this twice is harmless.
pub fn cleanup(targets: &[PathBuf]) -> CleanupReport {
    let mut report = CleanupReport::default();
    for target in targets {
        match remove_path(target) {
            Ok(true) => report.removed.push(target.clone()),
            Ok(false) => report.already_gone.push(target.clone()),
            Err(e) => {
                error!("Failed to remove {}: {}", target.display(), e);
                report.failed.push((target.clone(), e));
            }
        }
    }
    report
}

fn remove_path(path: &Path) -> std::io::Result<bool> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingDispatcher;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(1_000);
    const NOW: f64 = 1_700_000_000.0;

    fn store_in(dir: &TempDir) -> JsonStore<InstallRecord> {
        JsonStore::new(dir.path().join("install.json"))
    }

    #[test]
    fn first_activation_writes_install_record() {
        let dir = TempDir::new().unwrap();
        let controller = LifecycleController::activate(store_in(&dir), TTL, NOW);
        assert_eq!(controller.install_time(), NOW);
        assert_eq!(
            store_in(&dir).load(),
            Some(InstallRecord { install_time: NOW })
        );
    }

    #[test]
    fn existing_install_record_is_never_overwritten() {
        let dir = TempDir::new().unwrap();
        LifecycleController::activate(store_in(&dir), TTL, NOW);
        let later = LifecycleController::activate(store_in(&dir), TTL, NOW + 500.0);
        assert_eq!(later.install_time(), NOW);
        assert_eq!(store_in(&dir).load().unwrap().install_time, NOW);
    }

    #[test]
    fn expiry_boundary() {
        let dir = TempDir::new().unwrap();
        let ttl = TTL.as_secs_f64();

        let store = store_in(&dir);
        store
            .save(&InstallRecord {
                install_time: NOW - ttl - 1.0,
            })
            .unwrap();
        let expired = LifecycleController::activate(store.clone(), TTL, NOW);
        assert!(expired.is_expired(NOW));
        assert_eq!(expired.remaining_ttl(NOW), Duration::ZERO);

        store
            .save(&InstallRecord {
                install_time: NOW - ttl + 1.0,
            })
            .unwrap();
        let active = LifecycleController::activate(store, TTL, NOW);
        assert!(!active.is_expired(NOW));
        assert_eq!(active.remaining_ttl(NOW), Duration::from_secs(1));
    }

    #[test]
    fn remaining_ttl_is_never_negative_and_caps_at_ttl() {
        let dir = TempDir::new().unwrap();
        let controller = LifecycleController::activate(store_in(&dir), TTL, NOW);
        assert_eq!(controller.remaining_ttl(NOW + 1e9), Duration::ZERO);
        // Clock moved backwards past the install time.
        assert_eq!(controller.remaining_ttl(NOW - 50.0), TTL);
    }

    #[test]
    fn maximum_ttl_never_expires() {
        let dir = TempDir::new().unwrap();
        let mut controller =
            LifecycleController::activate(store_in(&dir), Duration::from_secs(u64::MAX), NOW);
        assert!(!controller.is_expired(NOW + 1e12));
        assert!(controller.remaining_ttl(NOW + 1_000.0) > Duration::from_secs(u64::MAX / 2));
        assert!(!controller.evaluate(NOW + 1e12));
        assert_eq!(controller.expires_at(), None);
    }

    #[test]
    fn expires_at_is_install_time_plus_ttl() {
        let dir = TempDir::new().unwrap();
        let controller = LifecycleController::activate(store_in(&dir), TTL, NOW);
        let expires_at = controller.expires_at().unwrap();
        assert_eq!(expires_at.timestamp(), NOW as i64 + 1_000);
    }

    #[test]
    fn transition_fires_exactly_once() {
        let dir = TempDir::new().unwrap();
        let mut controller = LifecycleController::activate(store_in(&dir), TTL, NOW);
        assert!(!controller.evaluate(NOW + 10.0));
        assert!(controller.evaluate(NOW + 2_000.0));
        assert!(!controller.evaluate(NOW + 3_000.0));
        assert_eq!(controller.state(), LifecycleState::Expired);
    }

    #[test]
    fn corrupt_install_record_is_recreated() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "{install_time:").unwrap();
        let controller = LifecycleController::activate(store, TTL, NOW);
        assert_eq!(controller.install_time(), NOW);
    }

    #[test]
    fn expire_removes_state_and_terminates() {
        let dir = TempDir::new().unwrap();
        let limit_file = dir.path().join("network_limit.json");
        let totals_file = dir.path().join("network_totals.json");
        fs::write(&limit_file, "{\"limit\": null}").unwrap();
        fs::write(&totals_file, "{}").unwrap();

        let dispatcher = RecordingDispatcher::default();
        let mut controller = LifecycleController::activate(store_in(&dir), TTL, NOW)
            .with_cleanup_targets([limit_file.clone(), totals_file.clone()]);

        let report = controller.expire(&dispatcher);
        assert_eq!(report.removed.len(), 3);
        assert!(report.failed.is_empty());
        assert!(!limit_file.exists());
        assert!(!totals_file.exists());
        assert!(!store_in(&dir).exists());
        assert_eq!(dispatcher.terminations(), 1);
    }

    #[test]
    fn cleanup_twice_is_harmless() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("network_totals.json");
        fs::write(&target, "{}").unwrap();
        let targets = vec![target];

        let first = cleanup(&targets);
        assert_eq!(first.removed.len(), 1);
        let second = cleanup(&targets);
        assert!(second.failed.is_empty());
        assert_eq!(second.already_gone.len(), 1);
    }
}
