//! Connection health tracking, validation, and repair
//!
//! The health manager owns one [`HealthRecord`] per connection and drives
//! the status state machine:
//!
//! ```text
//! Unknown ──ok──▶ Healthy ──soft-fail──▶ Degraded ──hard-fail──▶ Failed
//!                    ▲                      │
//!                    └─────────ok───────────┘
//! Failed ──repair-begin──▶ Repairing ──ok──▶ Healthy
//! Repairing ──fail, attempts<max──▶ Failed
//! Repairing ──fail, attempts=max──▶ Failed (terminal, evicted)
//! ```
//!
//! A *soft fail* is a transient negative reply or a timeout; a *hard fail*
//! is a transport reset/close/refusal or lost authentication. Hard-failed
//! connections are parked on the repair bench — physically out of the idle
//! queue, so they can never be borrowed — until the maintenance sweep
//! repairs or evicts them.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::connection::{ConnectionStore, FtpConnection};
use crate::error::FtpPoolError;
use crate::factory::ConnectionFactory;
use crate::metrics::MetricsCollector;
use crate::protocol::Command;
use crate::types::{now_millis, ConnectionId, PoolSettings, Timestamp};

/// Cached liveness verdict for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// No probe outcome observed yet
    Unknown,
    /// Last probe succeeded
    Healthy,
    /// Last probe soft-failed; still borrowable after recovery
    Degraded,
    /// Hard failure observed; awaiting repair
    Failed,
    /// Repair in progress; never borrowable
    Repairing,
}

impl HealthStatus {
    /// Whether a keep-alive probe makes sense in this state
    pub fn is_usable(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Outcome of one liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Positive completion reply
    Ok,
    /// Transient negative reply or timeout
    SoftFail,
    /// Transport reset/closed/refused, or authentication lost
    HardFail,
}

/// Capacity of the per-connection error-history ring
const ERROR_HISTORY_CAPACITY: usize = 16;

/// Health bookkeeping for one connection
#[derive(Debug)]
pub struct HealthRecord {
    status: HealthStatus,
    last_check: Timestamp,
    last_outcome: String,
    repair_attempts: u32,
    last_repair_attempt: Option<Timestamp>,
    error_history: VecDeque<String>,
}

impl HealthRecord {
    fn new(initial: HealthStatus, outcome: impl Into<String>) -> Self {
        Self {
            status: initial,
            last_check: now_millis(),
            last_outcome: outcome.into(),
            repair_attempts: 0,
            last_repair_attempt: None,
            error_history: VecDeque::with_capacity(ERROR_HISTORY_CAPACITY),
        }
    }

    fn push_error(&mut self, message: String) {
        if self.error_history.len() == ERROR_HISTORY_CAPACITY {
            self.error_history.pop_front();
        }
        self.error_history.push_back(message);
    }
}

/// Serializable view of one health record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReportEntry {
    /// Connection identifier
    pub connection_id: ConnectionId,
    /// Current status
    pub status: HealthStatus,
    /// Timestamp of the last probe or transition (epoch millis)
    pub last_check: Timestamp,
    /// Human-readable outcome of the last probe
    pub last_outcome: String,
    /// Repair attempts since the last successful authentication
    pub repair_attempts: u32,
    /// Most recent errors, oldest first
    pub recent_errors: Vec<String>,
}

/// Aggregate status counts used by metrics and the alert monitor
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HealthCounts {
    /// Connections with status Healthy
    pub healthy: u32,
    /// Connections with status Degraded
    pub degraded: u32,
    /// Connections with status Failed
    pub failed: u32,
    /// Connections with status Repairing
    pub repairing: u32,
    /// Connections with status Unknown
    pub unknown: u32,
}

impl HealthCounts {
    /// Total tracked connections
    pub fn total(&self) -> u32 {
        self.healthy + self.degraded + self.failed + self.repairing + self.unknown
    }
}

/// Tracks per-connection health and runs the maintenance sweep
pub struct HealthManager {
    settings: Arc<PoolSettings>,
    factory: Arc<ConnectionFactory>,
    metrics: Arc<MetricsCollector>,
    records: RwLock<HashMap<ConnectionId, Arc<Mutex<HealthRecord>>>>,
    /// Hard-failed connections parked for repair, keyed by id
    bench: Mutex<HashMap<ConnectionId, FtpConnection>>,
    maintenance_running: AtomicBool,
    consecutive_probe_failures: AtomicU32,
    repaired_total: AtomicU64,
    evicted_total: AtomicU64,
}

impl HealthManager {
    /// Creates a manager bound to the given factory and metrics sink
    pub fn new(
        settings: Arc<PoolSettings>,
        factory: Arc<ConnectionFactory>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            settings,
            factory,
            metrics,
            records: RwLock::new(HashMap::new()),
            bench: Mutex::new(HashMap::new()),
            maintenance_running: AtomicBool::new(false),
            consecutive_probe_failures: AtomicU32::new(0),
            repaired_total: AtomicU64::new(0),
            evicted_total: AtomicU64::new(0),
        }
    }

    /// Registers a freshly created connection
    ///
    /// A completed login is the strongest liveness proof available, so new
    /// records start out `Healthy` rather than `Unknown`.
    pub fn register(&self, id: ConnectionId) {
        let record = Arc::new(Mutex::new(HealthRecord::new(
            HealthStatus::Healthy,
            "authenticated",
        )));
        self.records.write().insert(id, record);
    }

    /// Drops the record for a destroyed connection
    pub fn unregister(&self, id: ConnectionId) {
        self.records.write().remove(&id);
    }

    /// Synchronous status oracle
    ///
    /// Returns `Unknown` for ids that are not (or no longer) tracked.
    pub fn status(&self, id: ConnectionId) -> HealthStatus {
        self.records
            .read()
            .get(&id)
            .map(|record| record.lock().status)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Aggregate per-status counts
    pub fn counts(&self) -> HealthCounts {
        let mut counts = HealthCounts::default();
        for record in self.records.read().values() {
            match record.lock().status {
                HealthStatus::Healthy => counts.healthy += 1,
                HealthStatus::Degraded => counts.degraded += 1,
                HealthStatus::Failed => counts.failed += 1,
                HealthStatus::Repairing => counts.repairing += 1,
                HealthStatus::Unknown => counts.unknown += 1,
            }
        }
        counts
    }

    /// Probe failures observed since the last successful probe
    pub fn consecutive_probe_failures(&self) -> u32 {
        self.consecutive_probe_failures.load(Ordering::SeqCst)
    }

    /// Connections successfully repaired over the manager's lifetime
    pub fn repaired_total(&self) -> u64 {
        self.repaired_total.load(Ordering::SeqCst)
    }

    /// Connections evicted after exhausting repair attempts
    pub fn evicted_total(&self) -> u64 {
        self.evicted_total.load(Ordering::SeqCst)
    }

    /// Number of connections currently parked for repair
    pub fn bench_size(&self) -> usize {
        self.bench.lock().len()
    }

    /// Empties the repair bench, e.g. during pool shutdown
    pub(crate) fn drain_bench(&self) -> Vec<FtpConnection> {
        self.bench.lock().drain().map(|(_, conn)| conn).collect()
    }

    /// Serializable report over all tracked connections
    pub fn report(&self) -> Vec<HealthReportEntry> {
        let records = self.records.read();
        let mut entries: Vec<HealthReportEntry> = records
            .iter()
            .map(|(id, record)| {
                let record = record.lock();
                HealthReportEntry {
                    connection_id: *id,
                    status: record.status,
                    last_check: record.last_check,
                    last_outcome: record.last_outcome.clone(),
                    repair_attempts: record.repair_attempts,
                    recent_errors: record.error_history.iter().cloned().collect(),
                }
            })
            .collect();
        entries.sort_by_key(|entry| entry.connection_id);
        entries
    }

    /// Sends a `NOOP` liveness probe on the given connection
    ///
    /// Stamps `last_tested_at`, classifies the outcome, and applies the
    /// state machine. The caller owns the connection for the duration,
    /// which serializes probes per connection.
    pub async fn validate(&self, conn: &mut FtpConnection) -> ProbeOutcome {
        let started = Instant::now();
        let outcome = match conn.channel_mut().exec(&Command::Noop).await {
            Ok(reply) if reply.is_positive_completion() => ProbeOutcome::Ok,
            Ok(reply) if reply.is_transient_negative() => {
                conn.note_error(format!("NOOP transient reply {}", reply.code));
                ProbeOutcome::SoftFail
            }
            Ok(reply) => {
                // Permanent negative on a NOOP means the session is gone
                // (530 "not logged in" being the canonical case).
                conn.note_error(format!("NOOP rejected with {}", reply.code));
                ProbeOutcome::HardFail
            }
            Err(FtpPoolError::ConnectionTimeout { .. }) => {
                conn.note_error("NOOP timed out".to_string());
                ProbeOutcome::SoftFail
            }
            Err(e) => {
                conn.note_error(e.to_string());
                ProbeOutcome::HardFail
            }
        };
        conn.touch_tested();

        let latency_ms = started.elapsed().as_millis() as f64;
        self.metrics
            .record_validate(outcome == ProbeOutcome::Ok, latency_ms);
        if outcome == ProbeOutcome::Ok {
            self.consecutive_probe_failures.store(0, Ordering::SeqCst);
        } else {
            self.consecutive_probe_failures
                .fetch_add(1, Ordering::SeqCst);
        }

        self.apply_outcome(conn.id(), outcome, conn.last_error());
        outcome
    }

    /// Applies one probe outcome to the connection's record
    ///
    /// Transitions are totally ordered per connection by the record lock.
    fn apply_outcome(&self, id: ConnectionId, outcome: ProbeOutcome, detail: Option<&str>) {
        let records = self.records.read();
        let Some(record) = records.get(&id) else {
            return;
        };
        let mut record = record.lock();
        record.last_check = now_millis();

        let from = record.status;
        match outcome {
            ProbeOutcome::Ok => {
                record.status = HealthStatus::Healthy;
                record.last_outcome = "validate ok".to_string();
                record.repair_attempts = 0;
            }
            ProbeOutcome::SoftFail => {
                if record.status == HealthStatus::Healthy
                    || record.status == HealthStatus::Unknown
                {
                    record.status = HealthStatus::Degraded;
                }
                record.last_outcome = "validate soft-fail".to_string();
                if let Some(detail) = detail {
                    record.push_error(detail.to_string());
                }
            }
            ProbeOutcome::HardFail => {
                // The machine has no Healthy→Failed edge; a hard failure
                // from Healthy passes through Degraded in the same step.
                if record.status == HealthStatus::Healthy {
                    tracing::debug!(connection_id = id, "health: Healthy -> Degraded (hard fail)");
                }
                record.status = HealthStatus::Failed;
                record.last_outcome = "validate hard-fail".to_string();
                if let Some(detail) = detail {
                    record.push_error(detail.to_string());
                }
            }
        }

        if from != record.status {
            tracing::info!(
                connection_id = id,
                from = ?from,
                to = ?record.status,
                "health status changed"
            );
        }
    }

    /// Runs a keep-alive probe on an idle connection
    ///
    /// Invoked by the keep-alive driver. Returns `Some(outcome)` if the
    /// connection could be taken from the idle queue, `None` otherwise.
    pub async fn keep_alive_probe(
        &self,
        store: &dyn ConnectionStore,
        id: ConnectionId,
    ) -> Option<ProbeOutcome> {
        let mut conn = store.take_idle(id)?;
        let outcome = self.validate(&mut conn).await;
        match outcome {
            ProbeOutcome::HardFail => self.park_for_repair(conn),
            _ => store.restore_idle(conn),
        }
        Some(outcome)
    }

    /// Parks a hard-failed connection on the repair bench
    pub fn park_for_repair(&self, conn: FtpConnection) {
        let id = conn.id();
        tracing::warn!(connection_id = id, "connection parked for repair");
        self.bench.lock().insert(id, conn);
    }

    /// One maintenance sweep: validate stale idles, evict over-idle ones,
    /// repair the bench
    ///
    /// Single-flight: a sweep that would overlap a still-running one
    /// returns immediately with 0. Returns the number of connections
    /// repaired.
    pub async fn run_maintenance(&self, store: &dyn ConnectionStore) -> usize {
        if self.maintenance_running.swap(true, Ordering::SeqCst) {
            tracing::debug!("maintenance sweep still running, skipping tick");
            return 0;
        }
        let result = self.maintenance_pass(store).await;
        self.maintenance_running.store(false, Ordering::SeqCst);
        result
    }

    async fn maintenance_pass(&self, store: &dyn ConnectionStore) -> usize {
        let check_interval = self.settings.staleness_threshold_ms();
        let idle_timeout = self.settings.connection_idle_timeout_ms;
        let min_connections = self.settings.min_connections as usize;

        // Pass 1: evict over-idle connections beyond the configured floor,
        // then re-validate stale ones.
        let snapshots = store.idle_snapshots();
        let mut idle_count = snapshots.len();
        let now = now_millis();

        for snapshot in snapshots {
            let idle_ms = (now - snapshot.last_used_at).max(0) as u64;
            let untested_ms = (now - snapshot.last_tested_at).max(0) as u64;

            if idle_ms >= idle_timeout && idle_count > min_connections {
                if let Some(mut conn) = store.take_idle(snapshot.id) {
                    tracing::info!(connection_id = conn.id(), idle_ms, "evicting idle connection");
                    self.factory.close(&mut conn).await;
                    store.forget(conn.id());
                    idle_count -= 1;
                }
                continue;
            }

            if untested_ms >= check_interval {
                if let Some(mut conn) = store.take_idle(snapshot.id) {
                    match self.validate(&mut conn).await {
                        ProbeOutcome::HardFail => {
                            self.park_for_repair(conn);
                            idle_count -= 1;
                        }
                        _ => store.restore_idle(conn),
                    }
                }
            }
        }

        // Pass 2: repair the bench.
        self.repair_pass(store).await
    }

    async fn repair_pass(&self, store: &dyn ConnectionStore) -> usize {
        let now = now_millis();
        let due: Vec<ConnectionId> = {
            let bench = self.bench.lock();
            bench
                .keys()
                .copied()
                .filter(|id| self.repair_due(*id, now))
                .collect()
        };

        let mut repaired = 0;
        for id in due {
            let Some(conn) = self.bench.lock().remove(&id) else {
                continue;
            };
            if self.repair_one(store, conn).await {
                repaired += 1;
            }
        }

        if repaired > 0 {
            tracing::info!(repaired, "maintenance sweep repaired connections");
        }
        repaired
    }

    fn repair_due(&self, id: ConnectionId, now: Timestamp) -> bool {
        let records = self.records.read();
        let Some(record) = records.get(&id) else {
            // Untracked bench entry; let the repair pass clean it up.
            return true;
        };
        let record = record.lock();
        if record.repair_attempts >= self.settings.max_repair_attempts {
            return true; // due for eviction
        }
        match record.last_repair_attempt {
            Some(last) => (now - last).max(0) as u64 >= self.settings.repair_backoff_ms,
            None => true,
        }
    }

    /// Attempts to repair one benched connection
    ///
    /// Returns true if the connection went back into service.
    async fn repair_one(&self, store: &dyn ConnectionStore, mut conn: FtpConnection) -> bool {
        let id = conn.id();

        // Terminal: attempts exhausted, evict instead of retrying forever.
        if self.repair_attempts(id) >= self.settings.max_repair_attempts {
            tracing::warn!(connection_id = id, "repair attempts exhausted, evicting");
            self.factory.close(&mut conn).await;
            store.forget(id);
            self.evicted_total.fetch_add(1, Ordering::SeqCst);
            return false;
        }

        self.set_status(id, HealthStatus::Repairing, "repair started");
        conn.channel_mut().force_close().await;

        match self.factory.create_channel().await {
            Ok(channel) => {
                conn.rebind(channel);
                self.metrics.record_repair(true);
                self.repaired_total.fetch_add(1, Ordering::SeqCst);
                {
                    let records = self.records.read();
                    if let Some(record) = records.get(&id) {
                        let mut record = record.lock();
                        record.status = HealthStatus::Healthy;
                        record.last_outcome = "repair ok".to_string();
                        record.last_check = now_millis();
                        record.repair_attempts = 0;
                    }
                }
                tracing::info!(connection_id = id, "connection repaired");
                store.restore_idle(conn);
                true
            }
            Err(e) => {
                conn.bump_reconnect_attempts();
                conn.note_error(e.to_string());
                self.metrics.record_repair(false);

                let exhausted = {
                    let records = self.records.read();
                    match records.get(&id) {
                        Some(record) => {
                            let mut record = record.lock();
                            record.repair_attempts += 1;
                            record.last_repair_attempt = Some(now_millis());
                            record.status = HealthStatus::Failed;
                            record.last_outcome = format!("repair failed: {}", e);
                            record.push_error(e.to_string());
                            record.repair_attempts >= self.settings.max_repair_attempts
                        }
                        None => true,
                    }
                };

                if exhausted {
                    tracing::warn!(connection_id = id, error = %e, "repair failed terminally, evicting");
                    self.factory.close(&mut conn).await;
                    store.forget(id);
                    self.evicted_total.fetch_add(1, Ordering::SeqCst);
                } else {
                    tracing::warn!(connection_id = id, error = %e, "repair failed, will retry");
                    self.bench.lock().insert(id, conn);
                }
                false
            }
        }
    }

    /// Marks a connection Failed out-of-band, e.g. from a recovery strategy
    pub fn mark_failed(&self, id: ConnectionId, reason: &str) {
        self.set_status(id, HealthStatus::Failed, reason);
    }

    fn set_status(&self, id: ConnectionId, status: HealthStatus, outcome: &str) {
        let records = self.records.read();
        if let Some(record) = records.get(&id) {
            let mut record = record.lock();
            record.status = status;
            record.last_outcome = outcome.to_string();
            record.last_check = now_millis();
        }
    }

    fn repair_attempts(&self, id: ConnectionId) -> u32 {
        self.records
            .read()
            .get(&id)
            .map(|record| record.lock().repair_attempts)
            .unwrap_or(u32::MAX)
    }
}

impl std::fmt::Debug for HealthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthManager")
            .field("tracked", &self.records.read().len())
            .field("bench", &self.bench.lock().len())
            .finish()
    }
}
