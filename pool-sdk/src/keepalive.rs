//! Keep-alive driver: idle-prevention probes against the server's timeout
//!
//! Holds its own `ConnectionId → KeepAliveRecord` map, independent of pool
//! membership. The pool records borrow/return activity here; a dedicated
//! worker sweeps the records and asks the health manager to probe every
//! connection that has sat idle for at least half the keep-alive interval.
//! Probe failures only bump counters — acting on them is the maintenance
//! sweep's job.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::connection::ConnectionStore;
use crate::health::{HealthManager, ProbeOutcome};
use crate::types::{now_millis, ConnectionId, PoolSettings, Timestamp};

/// Keep-alive bookkeeping for one registered connection
#[derive(Debug, Clone)]
pub struct KeepAliveRecord {
    /// Last borrow/return or successful probe (epoch millis)
    pub last_activity: Timestamp,
    /// Last probe of any outcome (epoch millis)
    pub last_probe: Option<Timestamp>,
    /// Probes sent for this connection
    pub probes_sent: u64,
    /// Probes that came back with a positive completion
    pub probes_succeeded: u64,
    /// Probes that failed
    pub probes_failed: u64,
}

impl KeepAliveRecord {
    fn new() -> Self {
        Self {
            last_activity: now_millis(),
            last_probe: None,
            probes_sent: 0,
            probes_succeeded: 0,
            probes_failed: 0,
        }
    }

    /// Milliseconds since the last recorded activity
    pub fn idle_millis(&self) -> u64 {
        (now_millis() - self.last_activity).max(0) as u64
    }
}

/// Aggregate keep-alive counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct KeepAliveStats {
    /// Currently registered connections
    pub registered: u64,
    /// Probes sent over the driver's lifetime
    pub probes_sent: u64,
    /// Probes that succeeded
    pub probes_succeeded: u64,
    /// Probes that failed
    pub probes_failed: u64,
}

/// Schedules keep-alive probes for registered connections
pub struct KeepAliveDriver {
    settings: Arc<PoolSettings>,
    records: RwLock<HashMap<ConnectionId, Mutex<KeepAliveRecord>>>,
    sweep_running: AtomicBool,
    probes_sent: AtomicU64,
    probes_succeeded: AtomicU64,
    probes_failed: AtomicU64,
}

impl KeepAliveDriver {
    /// Creates a driver with the configured cadence
    pub fn new(settings: Arc<PoolSettings>) -> Self {
        Self {
            settings,
            records: RwLock::new(HashMap::new()),
            sweep_running: AtomicBool::new(false),
            probes_sent: AtomicU64::new(0),
            probes_succeeded: AtomicU64::new(0),
            probes_failed: AtomicU64::new(0),
        }
    }

    /// Starts tracking a connection
    pub fn register(&self, id: ConnectionId) {
        self.records
            .write()
            .insert(id, Mutex::new(KeepAliveRecord::new()));
    }

    /// Stops tracking a destroyed connection
    pub fn unregister(&self, id: ConnectionId) {
        self.records.write().remove(&id);
    }

    /// Records borrow/return activity, resetting the idle clock
    pub fn record_activity(&self, id: ConnectionId) {
        let records = self.records.read();
        if let Some(record) = records.get(&id) {
            record.lock().last_activity = now_millis();
        }
    }

    /// Copy of one record, if tracked
    pub fn record(&self, id: ConnectionId) -> Option<KeepAliveRecord> {
        self.records.read().get(&id).map(|r| r.lock().clone())
    }

    /// Aggregate counters
    pub fn stats(&self) -> KeepAliveStats {
        KeepAliveStats {
            registered: self.records.read().len() as u64,
            probes_sent: self.probes_sent.load(Ordering::SeqCst),
            probes_succeeded: self.probes_succeeded.load(Ordering::SeqCst),
            probes_failed: self.probes_failed.load(Ordering::SeqCst),
        }
    }

    /// One sweep over all registered records
    ///
    /// A record is eligible once its idle time reaches half the keep-alive
    /// interval and the connection's cached status is usable. Single-flight:
    /// overlapping sweeps are skipped, not queued. Returns the number of
    /// probes performed.
    pub async fn sweep(&self, store: &dyn ConnectionStore, health: &HealthManager) -> usize {
        if self.sweep_running.swap(true, Ordering::SeqCst) {
            tracing::debug!("keep-alive sweep still running, skipping tick");
            return 0;
        }
        let probed = self.sweep_pass(store, health).await;
        self.sweep_running.store(false, Ordering::SeqCst);
        probed
    }

    async fn sweep_pass(&self, store: &dyn ConnectionStore, health: &HealthManager) -> usize {
        let threshold = self.settings.keep_alive_interval_ms / 2;
        let due: Vec<ConnectionId> = {
            let records = self.records.read();
            records
                .iter()
                .filter(|(_, record)| record.lock().idle_millis() >= threshold)
                .map(|(id, _)| *id)
                .collect()
        };

        let mut probed = 0;
        for id in due {
            if !health.status(id).is_usable() {
                continue;
            }

            // Borrowed connections come back as None; their borrower's
            // traffic is keep-alive enough.
            let Some(outcome) = health.keep_alive_probe(store, id).await else {
                continue;
            };
            probed += 1;
            self.probes_sent.fetch_add(1, Ordering::SeqCst);

            let records = self.records.read();
            if let Some(record) = records.get(&id) {
                let mut record = record.lock();
                record.probes_sent += 1;
                record.last_probe = Some(now_millis());
                if outcome == ProbeOutcome::Ok {
                    record.probes_succeeded += 1;
                    record.last_activity = now_millis();
                } else {
                    record.probes_failed += 1;
                }
            }
            drop(records);

            match outcome {
                ProbeOutcome::Ok => {
                    self.probes_succeeded.fetch_add(1, Ordering::SeqCst);
                }
                _ => {
                    self.probes_failed.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(connection_id = id, "keep-alive probe failed");
                }
            }
        }
        probed
    }
}

impl std::fmt::Debug for KeepAliveDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveDriver")
            .field("registered", &self.records.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AsyncStream, ControlChannel, Dialer};
    use crate::connection::{ConnectionSnapshot, FtpConnection};
    use crate::error::FtpPoolError;
    use crate::factory::ConnectionFactory;
    use crate::metrics::MetricsCollector;
    use async_trait::async_trait;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct NoDialer;

    #[async_trait]
    impl Dialer for NoDialer {
        async fn dial(&self, settings: &PoolSettings) -> crate::Result<Box<dyn AsyncStream>> {
            Err(FtpPoolError::ConnectionRefused {
                host: settings.endpoint(),
            })
        }
    }

    /// Minimal idle store backed by a map
    struct TestStore {
        idle: Mutex<HashMap<ConnectionId, FtpConnection>>,
        forgotten: Mutex<Vec<ConnectionId>>,
    }

    impl TestStore {
        fn new() -> Self {
            Self {
                idle: Mutex::new(HashMap::new()),
                forgotten: Mutex::new(Vec::new()),
            }
        }

        fn insert(&self, conn: FtpConnection) {
            self.idle.lock().insert(conn.id(), conn);
        }
    }

    impl ConnectionStore for TestStore {
        fn idle_snapshots(&self) -> Vec<ConnectionSnapshot> {
            self.idle.lock().values().map(|c| c.snapshot()).collect()
        }

        fn take_idle(&self, id: ConnectionId) -> Option<FtpConnection> {
            self.idle.lock().remove(&id)
        }

        fn restore_idle(&self, conn: FtpConnection) {
            self.insert(conn);
        }

        fn forget(&self, id: ConnectionId) {
            self.forgotten.lock().push(id);
        }
    }

    fn settings() -> Arc<PoolSettings> {
        // Half-interval of 0 ms makes every record immediately eligible.
        let mut settings = PoolSettings::default();
        settings.keep_alive_interval_ms = 0;
        settings.connection_idle_timeout_ms = 1;
        Arc::new(settings)
    }

    fn health(settings: &Arc<PoolSettings>) -> HealthManager {
        let factory = Arc::new(ConnectionFactory::new(
            Arc::clone(settings),
            Arc::new(NoDialer),
            None,
        ));
        HealthManager::new(Arc::clone(settings), factory, Arc::new(MetricsCollector::new()))
    }

    /// Connection whose peer answers every command with `200 Ok`
    fn responsive_connection(id: ConnectionId) -> FtpConnection {
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(server);
            let mut reader = BufReader::new(read_half);
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return;
                }
                if write_half.write_all(b"200 Ok\r\n").await.is_err() {
                    return;
                }
            }
        });
        let settings = Arc::new(PoolSettings::default());
        let channel = ControlChannel::new(Box::new(client), "test:21", 1000);
        FtpConnection::new(id, settings, channel)
    }

    #[test]
    fn test_register_and_activity() {
        let driver = KeepAliveDriver::new(Arc::new(PoolSettings::default()));
        driver.register(1);
        driver.record_activity(1);
        let record = driver.record(1).unwrap();
        assert_eq!(record.probes_sent, 0);
        assert!(record.idle_millis() < 1000);
    }

    #[test]
    fn test_unregister_drops_record() {
        let driver = KeepAliveDriver::new(Arc::new(PoolSettings::default()));
        driver.register(1);
        driver.unregister(1);
        assert!(driver.record(1).is_none());
    }

    #[tokio::test]
    async fn test_sweep_skips_fresh_records() {
        // Default interval: half-threshold is 30s, nothing is eligible.
        let settings = Arc::new(PoolSettings::default());
        let driver = KeepAliveDriver::new(Arc::clone(&settings));
        let health = health(&settings);
        let store = TestStore::new();

        driver.register(1);
        health.register(1);
        store.insert(responsive_connection(1));

        let probed = driver.sweep(&store, &health).await;
        assert_eq!(probed, 0);
        assert_eq!(driver.stats().probes_sent, 0);
    }

    #[tokio::test]
    async fn test_sweep_probes_eligible_connection() {
        let settings = settings();
        let driver = KeepAliveDriver::new(Arc::clone(&settings));
        let health = health(&settings);
        let store = TestStore::new();

        driver.register(1);
        health.register(1);
        store.insert(responsive_connection(1));

        let probed = driver.sweep(&store, &health).await;
        assert_eq!(probed, 1);

        let stats = driver.stats();
        assert_eq!(stats.probes_sent, 1);
        assert_eq!(stats.probes_succeeded, 1);
        assert_eq!(stats.probes_failed, 0);

        // The connection went back to the idle store.
        assert!(store.take_idle(1).is_some());
    }

    #[tokio::test]
    async fn test_sweep_skips_borrowed_connection() {
        let settings = settings();
        let driver = KeepAliveDriver::new(Arc::clone(&settings));
        let health = health(&settings);
        let store = TestStore::new();

        // Registered and healthy, but not in the idle store (borrowed).
        driver.register(1);
        health.register(1);

        let probed = driver.sweep(&store, &health).await;
        assert_eq!(probed, 0);
    }

    #[tokio::test]
    async fn test_sweep_counts_failed_probe() {
        let settings = settings();
        let driver = KeepAliveDriver::new(Arc::clone(&settings));
        let health = health(&settings);
        let store = TestStore::new();

        driver.register(1);
        health.register(1);

        // Dead peer: the probe hard-fails and the connection is benched.
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let channel = ControlChannel::new(Box::new(client), "test:21", 100);
        store.insert(FtpConnection::new(
            1,
            Arc::new(PoolSettings::default()),
            channel,
        ));

        let probed = driver.sweep(&store, &health).await;
        assert_eq!(probed, 1);
        assert_eq!(driver.stats().probes_failed, 1);
        // Hard failure: parked for repair rather than restored.
        assert!(store.take_idle(1).is_none());
        assert_eq!(health.bench_size(), 1);
    }

    #[tokio::test]
    async fn test_sweep_skips_unusable_status() {
        let settings = settings();
        let driver = KeepAliveDriver::new(Arc::clone(&settings));
        let health = health(&settings);
        let store = TestStore::new();

        driver.register(1);
        health.register(1);
        health.mark_failed(1, "test");
        store.insert(responsive_connection(1));

        let probed = driver.sweep(&store, &health).await;
        assert_eq!(probed, 0);
    }
}
