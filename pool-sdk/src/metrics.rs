//! Metrics collection for the FTP connection pool SDK
//!
//! Counters are monotonic atomics; latencies go into bounded reservoirs
//! (the last 1000 samples) from which min/max/avg and p50/p95/p99 are
//! computed on demand. Snapshots are point-in-time and not atomic across
//! groups. Every emitted field is backed by real samples — nothing is
//! reported as a never-updated zero.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::health::HealthCounts;
use crate::keepalive::KeepAliveStats;
use crate::types::Timestamp;

/// Number of latency samples kept per reservoir
const RESERVOIR_CAPACITY: usize = 1000;

/// Percentile latency statistics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Percentiles {
    /// 50th percentile (median) in milliseconds
    pub p50: f64,
    /// 95th percentile in milliseconds
    pub p95: f64,
    /// 99th percentile in milliseconds
    pub p99: f64,
}

/// Count and latency statistics for one operation kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyStats {
    /// Total recorded operations
    pub total_count: u64,
    /// Operations that succeeded
    pub success_count: u64,
    /// Operations that failed
    pub error_count: u64,
    /// Minimum latency in milliseconds
    pub min_ms: f64,
    /// Maximum latency in milliseconds
    pub max_ms: f64,
    /// Average latency in milliseconds
    pub avg_ms: f64,
    /// Latency percentiles
    pub percentiles: Percentiles,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self {
            total_count: 0,
            success_count: 0,
            error_count: 0,
            min_ms: 0.0,
            max_ms: 0.0,
            avg_ms: 0.0,
            percentiles: Percentiles::default(),
        }
    }
}

/// Internal tracker feeding one `LatencyStats`
#[derive(Debug)]
struct OperationTracker {
    total_count: AtomicU64,
    success_count: AtomicU64,
    error_count: AtomicU64,
    latencies: Mutex<Vec<f64>>,
}

impl OperationTracker {
    fn new() -> Self {
        Self {
            total_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            latencies: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, success: bool, latency_ms: f64) {
        self.total_count.fetch_add(1, Ordering::SeqCst);
        if success {
            self.success_count.fetch_add(1, Ordering::SeqCst);
        } else {
            self.error_count.fetch_add(1, Ordering::SeqCst);
        }

        let mut latencies = self.latencies.lock();
        latencies.push(latency_ms);
        if latencies.len() > RESERVOIR_CAPACITY {
            let excess = latencies.len() - RESERVOIR_CAPACITY;
            latencies.drain(0..excess);
        }
    }

    fn stats(&self) -> LatencyStats {
        let total_count = self.total_count.load(Ordering::SeqCst);
        let success_count = self.success_count.load(Ordering::SeqCst);
        let error_count = self.error_count.load(Ordering::SeqCst);

        let latencies = self.latencies.lock();
        if latencies.is_empty() {
            return LatencyStats {
                total_count,
                success_count,
                error_count,
                ..Default::default()
            };
        }

        let min_ms = latencies.iter().copied().fold(f64::MAX, f64::min);
        let max_ms = latencies.iter().copied().fold(0.0, f64::max);
        let sum: f64 = latencies.iter().sum();
        let avg_ms = sum / latencies.len() as f64;

        let mut sorted = latencies.clone();
        drop(latencies);
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let index = |q: f64| -> f64 {
            let i = (sorted.len() as f64 * q) as usize;
            sorted.get(i.min(sorted.len() - 1)).copied().unwrap_or(0.0)
        };

        LatencyStats {
            total_count,
            success_count,
            error_count,
            min_ms,
            max_ms,
            avg_ms,
            percentiles: Percentiles {
                p50: index(0.50),
                p95: index(0.95),
                p99: index(0.99),
            },
        }
    }
}

/// `connection_pool` snapshot group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionPoolMetrics {
    /// Connections sitting idle
    pub idle_connections: u32,
    /// Connections currently borrowed
    pub active_connections: u32,
    /// Idle + active + under-repair connections
    pub total_connections: u32,
    /// Creations in flight
    pub pending_creates: u32,
    /// Configured capacity ceiling
    pub max_connections: u32,
    /// Configured idle floor
    pub min_connections: u32,
    /// Connections created over the pool's lifetime
    pub connections_created: u64,
    /// Connections destroyed over the pool's lifetime
    pub connections_destroyed: u64,
    /// Destructions triggered by explicit invalidation
    pub connections_invalidated: u64,
}

/// `performance` snapshot group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Borrow operations, end to end
    pub borrow: LatencyStats,
    /// Factory create operations
    pub create: LatencyStats,
    /// Liveness probes
    pub validate: LatencyStats,
}

/// `throughput` snapshot group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThroughputMetrics {
    /// Successful borrows over the pool's lifetime
    pub borrows_total: u64,
    /// Returns over the pool's lifetime
    pub returns_total: u64,
    /// Borrow rate over the pool's uptime
    pub borrows_per_minute: f64,
}

/// `queue` snapshot group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// Borrowers waiting right now
    pub current_waiters: u32,
    /// Most borrowers ever waiting at once
    pub peak_waiters: u32,
    /// Borrows that had to wait
    pub total_waits: u64,
    /// Waits that expired into `PoolExhausted`
    pub wait_timeouts: u64,
}

/// `wait_time` snapshot group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitTimeMetrics {
    /// Shortest observed borrow wait in milliseconds
    pub min_wait_ms: f64,
    /// Longest observed borrow wait in milliseconds
    pub max_wait_ms: f64,
    /// Mean borrow wait in milliseconds
    pub avg_wait_ms: f64,
    /// Borrow wait percentiles
    pub percentiles: Percentiles,
}

/// `resources` snapshot group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// Milliseconds since the pool started
    pub uptime_ms: u64,
    /// Background workers the pool runs
    pub worker_count: u32,
    /// Connections parked on the repair bench
    pub repair_bench_size: u32,
}

/// `health` snapshot group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Per-status connection counts
    pub counts: HealthCounts,
    /// Connections successfully repaired
    pub repaired_connections: u64,
    /// Connections evicted after exhausted repairs
    pub evicted_connections: u64,
    /// Probe failures since the last success
    pub consecutive_probe_failures: u32,
    /// Repair attempts made
    pub repair_attempts: u64,
    /// Repair attempts that succeeded
    pub repair_successes: u64,
    /// Keep-alive driver counters
    pub keep_alive: KeepAliveStats,
    /// Authentication failures observed
    pub authentication_error_count: u64,
    /// Classified error counts by kind name
    pub classified_errors: HashMap<String, u64>,
}

/// Per-breaker counters in the `operation_types` group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationTypeMetrics {
    /// Operations attempted
    pub attempts: u64,
    /// Operations that ultimately succeeded
    pub successes: u64,
    /// Operations that ultimately failed
    pub failures: u64,
    /// Retry sleeps taken
    pub retries: u64,
    /// Breaker state name (`closed` / `open` / `half-open`)
    pub circuit_state: String,
    /// Times the breaker has opened
    pub opened_count: u64,
}

/// Full point-in-time metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Pool occupancy and lifetime counters
    pub connection_pool: ConnectionPoolMetrics,
    /// Operation latencies
    pub performance: PerformanceMetrics,
    /// Borrow/return rates
    pub throughput: ThroughputMetrics,
    /// Waiter queue state
    pub queue: QueueMetrics,
    /// Borrow wait distribution
    pub wait_time: WaitTimeMetrics,
    /// Process-level resources
    pub resources: ResourceMetrics,
    /// Health and repair state
    pub health: HealthMetrics,
    /// Per-circuit-breaker operation counters
    pub operation_types: HashMap<String, OperationTypeMetrics>,
    /// Host-defined gauges
    pub custom: HashMap<String, f64>,
    /// When the snapshot was taken (epoch millis)
    pub taken_at: Timestamp,
}

/// Collects counters and latency samples for the pool
pub struct MetricsCollector {
    started: Instant,
    borrow_tracker: OperationTracker,
    create_tracker: OperationTracker,
    validate_tracker: OperationTracker,
    wait_reservoir: Mutex<Vec<f64>>,
    borrows_total: AtomicU64,
    returns_total: AtomicU64,
    created_total: AtomicU64,
    destroyed_total: AtomicU64,
    invalidated_total: AtomicU64,
    auth_errors: AtomicU64,
    total_waits: AtomicU64,
    wait_timeouts: AtomicU64,
    current_waiters: AtomicU64,
    peak_waiters: AtomicU64,
    repair_attempts: AtomicU64,
    repair_successes: AtomicU64,
    classified: RwLock<HashMap<String, u64>>,
    custom: RwLock<HashMap<String, f64>>,
}

impl MetricsCollector {
    /// Creates an empty collector
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            borrow_tracker: OperationTracker::new(),
            create_tracker: OperationTracker::new(),
            validate_tracker: OperationTracker::new(),
            wait_reservoir: Mutex::new(Vec::new()),
            borrows_total: AtomicU64::new(0),
            returns_total: AtomicU64::new(0),
            created_total: AtomicU64::new(0),
            destroyed_total: AtomicU64::new(0),
            invalidated_total: AtomicU64::new(0),
            auth_errors: AtomicU64::new(0),
            total_waits: AtomicU64::new(0),
            wait_timeouts: AtomicU64::new(0),
            current_waiters: AtomicU64::new(0),
            peak_waiters: AtomicU64::new(0),
            repair_attempts: AtomicU64::new(0),
            repair_successes: AtomicU64::new(0),
            classified: RwLock::new(HashMap::new()),
            custom: RwLock::new(HashMap::new()),
        }
    }

    /// Records a completed borrow attempt
    pub fn record_borrow(&self, success: bool, latency_ms: f64) {
        self.borrow_tracker.record(success, latency_ms);
        if success {
            self.borrows_total.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Records a return
    pub fn record_return(&self) {
        self.returns_total.fetch_add(1, Ordering::SeqCst);
    }

    /// Records a factory create attempt
    pub fn record_create(&self, success: bool, latency_ms: f64) {
        self.create_tracker.record(success, latency_ms);
        if success {
            self.created_total.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Records a liveness probe
    pub fn record_validate(&self, success: bool, latency_ms: f64) {
        self.validate_tracker.record(success, latency_ms);
    }

    /// Records a repair attempt
    pub fn record_repair(&self, success: bool) {
        self.repair_attempts.fetch_add(1, Ordering::SeqCst);
        if success {
            self.repair_successes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Records a destroyed connection
    pub fn record_destroyed(&self) {
        self.destroyed_total.fetch_add(1, Ordering::SeqCst);
    }

    /// Records an explicit invalidation
    pub fn record_invalidated(&self) {
        self.invalidated_total.fetch_add(1, Ordering::SeqCst);
    }

    /// Records an authentication failure
    pub fn record_auth_error(&self) {
        self.auth_errors.fetch_add(1, Ordering::SeqCst);
    }

    /// Bumps the counter for a classified error kind
    pub fn record_classified(&self, kind_name: &str) {
        *self.classified.write().entry(kind_name.to_string()).or_insert(0) += 1;
    }

    /// Records the time a borrow spent acquiring a connection
    pub fn record_wait(&self, wait_ms: f64, had_to_wait: bool) {
        if had_to_wait {
            self.total_waits.fetch_add(1, Ordering::SeqCst);
        }
        let mut reservoir = self.wait_reservoir.lock();
        reservoir.push(wait_ms);
        if reservoir.len() > RESERVOIR_CAPACITY {
            let excess = reservoir.len() - RESERVOIR_CAPACITY;
            reservoir.drain(0..excess);
        }
    }

    /// Records a wait that expired into `PoolExhausted`
    pub fn record_wait_timeout(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::SeqCst);
    }

    /// Notes a borrower entering the wait queue
    pub fn waiter_enqueued(&self) {
        let now = self.current_waiters.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_waiters.fetch_max(now, Ordering::SeqCst);
    }

    /// Notes a borrower leaving the wait queue
    pub fn waiter_dequeued(&self) {
        // Saturating: shutdown can drain the queue wholesale.
        let _ = self
            .current_waiters
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    /// Sets a host-defined gauge
    pub fn set_custom(&self, name: impl Into<String>, value: f64) {
        self.custom.write().insert(name.into(), value);
    }

    /// Milliseconds since the collector was created
    pub fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Lifetime count of successful creates
    pub fn created_total(&self) -> u64 {
        self.created_total.load(Ordering::SeqCst)
    }

    /// Lifetime count of destroyed connections
    pub fn destroyed_total(&self) -> u64 {
        self.destroyed_total.load(Ordering::SeqCst)
    }

    /// Lifetime count of authentication failures
    pub fn auth_error_count(&self) -> u64 {
        self.auth_errors.load(Ordering::SeqCst)
    }

    /// `performance` group from the trackers
    pub fn performance(&self) -> PerformanceMetrics {
        PerformanceMetrics {
            borrow: self.borrow_tracker.stats(),
            create: self.create_tracker.stats(),
            validate: self.validate_tracker.stats(),
        }
    }

    /// `throughput` group
    pub fn throughput(&self) -> ThroughputMetrics {
        let borrows_total = self.borrows_total.load(Ordering::SeqCst);
        let uptime_minutes = (self.uptime_ms() as f64 / 60_000.0).max(1.0 / 60_000.0);
        ThroughputMetrics {
            borrows_total,
            returns_total: self.returns_total.load(Ordering::SeqCst),
            borrows_per_minute: borrows_total as f64 / uptime_minutes,
        }
    }

    /// `queue` group
    pub fn queue(&self) -> QueueMetrics {
        QueueMetrics {
            current_waiters: self.current_waiters.load(Ordering::SeqCst) as u32,
            peak_waiters: self.peak_waiters.load(Ordering::SeqCst) as u32,
            total_waits: self.total_waits.load(Ordering::SeqCst),
            wait_timeouts: self.wait_timeouts.load(Ordering::SeqCst),
        }
    }

    /// `wait_time` group from the wait reservoir
    pub fn wait_time(&self) -> WaitTimeMetrics {
        let reservoir = self.wait_reservoir.lock();
        if reservoir.is_empty() {
            return WaitTimeMetrics::default();
        }
        let min = reservoir.iter().copied().fold(f64::MAX, f64::min);
        let max = reservoir.iter().copied().fold(0.0, f64::max);
        let avg = reservoir.iter().sum::<f64>() / reservoir.len() as f64;

        let mut sorted = reservoir.clone();
        drop(reservoir);
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = |q: f64| -> f64 {
            let i = (sorted.len() as f64 * q) as usize;
            sorted.get(i.min(sorted.len() - 1)).copied().unwrap_or(0.0)
        };

        WaitTimeMetrics {
            min_wait_ms: min,
            max_wait_ms: max,
            avg_wait_ms: avg,
            percentiles: Percentiles {
                p50: index(0.50),
                p95: index(0.95),
                p99: index(0.99),
            },
        }
    }

    /// Repair attempt counters (attempts, successes)
    pub fn repair_counters(&self) -> (u64, u64) {
        (
            self.repair_attempts.load(Ordering::SeqCst),
            self.repair_successes.load(Ordering::SeqCst),
        )
    }

    /// Classified error counts by kind
    pub fn classified_errors(&self) -> HashMap<String, u64> {
        self.classified.read().clone()
    }

    /// Host-defined gauges
    pub fn custom_gauges(&self) -> HashMap<String, f64> {
        self.custom.read().clone()
    }

    /// Lifetime counters the pool folds into the snapshot
    pub fn pool_counters(&self) -> (u64, u64, u64) {
        (
            self.created_total.load(Ordering::SeqCst),
            self.destroyed_total.load(Ordering::SeqCst),
            self.invalidated_total.load(Ordering::SeqCst),
        )
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_collector() {
        let collector = MetricsCollector::new();
        let performance = collector.performance();
        assert_eq!(performance.borrow.total_count, 0);
        assert_eq!(performance.create.total_count, 0);
        assert_eq!(collector.wait_time().max_wait_ms, 0.0);
    }

    #[test]
    fn test_record_borrow_counts() {
        let collector = MetricsCollector::new();
        collector.record_borrow(true, 12.0);
        collector.record_borrow(true, 8.0);
        collector.record_borrow(false, 50.0);

        let stats = collector.performance().borrow;
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.error_count, 1);
        assert!(stats.avg_ms > 0.0);
        assert_eq!(collector.throughput().borrows_total, 2);
    }

    #[test]
    fn test_latency_percentiles() {
        let collector = MetricsCollector::new();
        for i in 1..=100 {
            collector.record_validate(true, i as f64);
        }
        let stats = collector.performance().validate;
        assert_eq!(stats.min_ms, 1.0);
        assert_eq!(stats.max_ms, 100.0);
        assert!(stats.percentiles.p50 >= 40.0 && stats.percentiles.p50 <= 60.0);
        assert!(stats.percentiles.p95 >= 90.0);
        assert!(stats.percentiles.p99 >= 95.0);
    }

    #[test]
    fn test_reservoir_is_bounded() {
        let collector = MetricsCollector::new();
        for i in 0..1500 {
            collector.record_create(true, i as f64);
        }
        let stats = collector.performance().create;
        assert_eq!(stats.total_count, 1500);
        // Only the newest 1000 samples back the distribution.
        assert_eq!(stats.min_ms, 500.0);
    }

    #[test]
    fn test_wait_time_distribution() {
        let collector = MetricsCollector::new();
        collector.record_wait(0.0, false);
        collector.record_wait(25.0, true);
        collector.record_wait(75.0, true);

        let wait = collector.wait_time();
        assert_eq!(wait.min_wait_ms, 0.0);
        assert_eq!(wait.max_wait_ms, 75.0);
        assert!(wait.avg_wait_ms > 0.0);
        assert_eq!(collector.queue().total_waits, 2);
    }

    #[test]
    fn test_waiter_gauges() {
        let collector = MetricsCollector::new();
        collector.waiter_enqueued();
        collector.waiter_enqueued();
        collector.waiter_dequeued();

        let queue = collector.queue();
        assert_eq!(queue.current_waiters, 1);
        assert_eq!(queue.peak_waiters, 2);
    }

    #[test]
    fn test_waiter_dequeue_saturates_at_zero() {
        let collector = MetricsCollector::new();
        collector.waiter_dequeued();
        assert_eq!(collector.queue().current_waiters, 0);
    }

    #[test]
    fn test_classified_error_counts() {
        let collector = MetricsCollector::new();
        collector.record_classified("ConnectionClosed");
        collector.record_classified("ConnectionClosed");
        collector.record_classified("FileNotFound");

        let classified = collector.classified_errors();
        assert_eq!(classified.get("ConnectionClosed"), Some(&2));
        assert_eq!(classified.get("FileNotFound"), Some(&1));
    }

    #[test]
    fn test_auth_error_counter() {
        let collector = MetricsCollector::new();
        collector.record_auth_error();
        assert_eq!(collector.auth_error_count(), 1);
    }

    #[test]
    fn test_custom_gauges() {
        let collector = MetricsCollector::new();
        collector.set_custom("flow.backlog", 17.0);
        assert_eq!(collector.custom_gauges().get("flow.backlog"), Some(&17.0));
    }

    #[test]
    fn test_repair_counters() {
        let collector = MetricsCollector::new();
        collector.record_repair(true);
        collector.record_repair(false);
        assert_eq!(collector.repair_counters(), (2, 1));
    }
}
