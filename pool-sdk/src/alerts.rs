//! Threshold alerts over the pool's health state
//!
//! A fixed-rate monitor folds the health manager's counts into one of
//! three levels and notifies registered callbacks on level changes.
//! Recovery back under every threshold emits a single `Info`. Thresholds
//! are set once at start-up; runtime changes go through
//! [`AlertMonitor::set_thresholds`], which takes the monitor lock.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::health::{HealthCounts, HealthManager};
use crate::types::AlertThresholds;

/// Severity of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertLevel {
    /// Informational, e.g. recovery after an alert
    Info,
    /// Degradation worth watching
    Warning,
    /// Majority of the pool is failing
    Critical,
}

/// Structured context delivered with every alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertDetails {
    /// Per-status connection counts at evaluation time
    pub counts: HealthCounts,
    /// Probe failures since the last success
    pub consecutive_failures: u32,
    /// Fraction of tracked connections that are Degraded
    pub degraded_ratio: f64,
    /// Fraction of tracked connections that are Failed
    pub failed_ratio: f64,
}

/// Callback invoked on every emitted alert
pub type AlertCallback = Arc<dyn Fn(AlertLevel, &str, &AlertDetails) + Send + Sync>;

/// Evaluates thresholds and dispatches alerts
pub struct AlertMonitor {
    thresholds: Mutex<AlertThresholds>,
    callbacks: RwLock<Vec<AlertCallback>>,
    last_level: Mutex<Option<AlertLevel>>,
    alerts_emitted: AtomicU64,
}

impl AlertMonitor {
    /// Creates a monitor with the given thresholds and no callbacks
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds: Mutex::new(thresholds),
            callbacks: RwLock::new(Vec::new()),
            last_level: Mutex::new(None),
            alerts_emitted: AtomicU64::new(0),
        }
    }

    /// Registers an alert callback
    pub fn add_callback(&self, callback: AlertCallback) {
        self.callbacks.write().push(callback);
    }

    /// Replaces the thresholds under the monitor lock
    pub fn set_thresholds(&self, thresholds: AlertThresholds) {
        *self.thresholds.lock() = thresholds;
    }

    /// Current thresholds
    pub fn thresholds(&self) -> AlertThresholds {
        self.thresholds.lock().clone()
    }

    /// Alerts emitted over the monitor's lifetime
    pub fn alerts_emitted(&self) -> u64 {
        self.alerts_emitted.load(Ordering::SeqCst)
    }

    /// One evaluation tick
    ///
    /// Emits at most one alert: the new level when it changes, or `Info`
    /// once when the pool recovers below every threshold.
    pub fn evaluate(&self, counts: HealthCounts, consecutive_failures: u32) {
        let thresholds = self.thresholds.lock().clone();
        let total = counts.total();
        let degraded_ratio = if total == 0 {
            0.0
        } else {
            counts.degraded as f64 / total as f64
        };
        let failed_ratio = if total == 0 {
            0.0
        } else {
            counts.failed as f64 / total as f64
        };

        let level = if consecutive_failures >= thresholds.critical_consecutive_failures
            || (total > 0 && failed_ratio >= thresholds.critical_failed_ratio)
        {
            Some(AlertLevel::Critical)
        } else if consecutive_failures >= thresholds.warning_consecutive_failures
            || (total > 0 && degraded_ratio >= thresholds.warning_degraded_ratio)
        {
            Some(AlertLevel::Warning)
        } else {
            None
        };

        let details = AlertDetails {
            counts,
            consecutive_failures,
            degraded_ratio,
            failed_ratio,
        };

        let mut last = self.last_level.lock();
        match (level, *last) {
            (Some(new_level), previous) if previous != Some(new_level) => {
                *last = Some(new_level);
                drop(last);
                let message = match new_level {
                    AlertLevel::Critical => "connection pool critically degraded",
                    AlertLevel::Warning => "connection pool degraded",
                    AlertLevel::Info => "connection pool notice",
                };
                self.emit(new_level, message, &details);
            }
            (None, Some(_)) => {
                *last = None;
                drop(last);
                self.emit(AlertLevel::Info, "connection pool recovered", &details);
            }
            _ => {}
        }
    }

    fn emit(&self, level: AlertLevel, message: &str, details: &AlertDetails) {
        self.alerts_emitted.fetch_add(1, Ordering::SeqCst);
        match level {
            AlertLevel::Critical => tracing::error!(
                failed = details.counts.failed,
                consecutive = details.consecutive_failures,
                "{}",
                message
            ),
            AlertLevel::Warning => tracing::warn!(
                degraded = details.counts.degraded,
                consecutive = details.consecutive_failures,
                "{}",
                message
            ),
            AlertLevel::Info => tracing::info!("{}", message),
        }
        for callback in self.callbacks.read().iter() {
            callback(level, message, details);
        }
    }
}

impl std::fmt::Debug for AlertMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertMonitor")
            .field("last_level", &*self.last_level.lock())
            .field("alerts_emitted", &self.alerts_emitted())
            .finish()
    }
}

/// Cadence of the alert monitor worker
pub(crate) const ALERT_MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Fixed-rate worker evaluating the monitor against live health state
pub(crate) async fn alert_monitor_worker(
    monitor: Arc<AlertMonitor>,
    health: Arc<HealthManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(ALERT_MONITOR_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {}
        }
        monitor.evaluate(health.counts(), health.consecutive_probe_failures());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(healthy: u32, degraded: u32, failed: u32) -> HealthCounts {
        HealthCounts {
            healthy,
            degraded,
            failed,
            repairing: 0,
            unknown: 0,
        }
    }

    fn recording_monitor() -> (Arc<AlertMonitor>, Arc<Mutex<Vec<(AlertLevel, String)>>>) {
        let monitor = Arc::new(AlertMonitor::new(AlertThresholds::default()));
        let seen: Arc<Mutex<Vec<(AlertLevel, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.add_callback(Arc::new(move |level, message, _details| {
            sink.lock().push((level, message.to_string()));
        }));
        (monitor, seen)
    }

    #[test]
    fn test_healthy_pool_emits_nothing() {
        let (monitor, seen) = recording_monitor();
        monitor.evaluate(counts(4, 0, 0), 0);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_warning_on_consecutive_failures() {
        let (monitor, seen) = recording_monitor();
        monitor.evaluate(counts(4, 0, 0), 3);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, AlertLevel::Warning);
    }

    #[test]
    fn test_critical_on_consecutive_failures() {
        let (monitor, seen) = recording_monitor();
        monitor.evaluate(counts(4, 0, 0), 5);
        assert_eq!(seen.lock()[0].0, AlertLevel::Critical);
    }

    #[test]
    fn test_warning_on_degraded_ratio() {
        let (monitor, seen) = recording_monitor();
        // 1 of 4 = 25% degraded.
        monitor.evaluate(counts(3, 1, 0), 0);
        assert_eq!(seen.lock()[0].0, AlertLevel::Warning);
    }

    #[test]
    fn test_critical_on_failed_ratio() {
        let (monitor, seen) = recording_monitor();
        // 2 of 4 = 50% failed.
        monitor.evaluate(counts(2, 0, 2), 0);
        assert_eq!(seen.lock()[0].0, AlertLevel::Critical);
    }

    #[test]
    fn test_same_level_not_repeated() {
        let (monitor, seen) = recording_monitor();
        monitor.evaluate(counts(4, 0, 0), 3);
        monitor.evaluate(counts(4, 0, 0), 4);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_escalation_warning_to_critical() {
        let (monitor, seen) = recording_monitor();
        monitor.evaluate(counts(4, 0, 0), 3);
        monitor.evaluate(counts(4, 0, 0), 5);
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].0, AlertLevel::Critical);
    }

    #[test]
    fn test_recovery_emits_single_info() {
        let (monitor, seen) = recording_monitor();
        monitor.evaluate(counts(4, 0, 0), 5);
        monitor.evaluate(counts(4, 0, 0), 0);
        monitor.evaluate(counts(4, 0, 0), 0);
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].0, AlertLevel::Info);
        assert!(seen[1].1.contains("recovered"));
    }

    #[test]
    fn test_empty_pool_has_no_ratio_alerts() {
        let (monitor, seen) = recording_monitor();
        monitor.evaluate(counts(0, 0, 0), 0);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_details_carry_ratios() {
        let monitor = Arc::new(AlertMonitor::new(AlertThresholds::default()));
        let captured: Arc<Mutex<Option<AlertDetails>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&captured);
        monitor.add_callback(Arc::new(move |_level, _message, details| {
            *sink.lock() = Some(details.clone());
        }));

        monitor.evaluate(counts(1, 1, 2), 0);
        let details = captured.lock().clone().unwrap();
        assert!((details.failed_ratio - 0.5).abs() < f64::EPSILON);
        assert!((details.degraded_ratio - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_runtime_threshold_change() {
        let (monitor, seen) = recording_monitor();
        monitor.set_thresholds(AlertThresholds {
            warning_consecutive_failures: 1,
            ..AlertThresholds::default()
        });
        monitor.evaluate(counts(4, 0, 0), 1);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(monitor.thresholds().warning_consecutive_failures, 1);
    }

    #[test]
    fn test_alerts_emitted_counter() {
        let (monitor, _seen) = recording_monitor();
        monitor.evaluate(counts(4, 0, 0), 5);
        monitor.evaluate(counts(4, 0, 0), 0);
        assert_eq!(monitor.alerts_emitted(), 2);
    }
}
