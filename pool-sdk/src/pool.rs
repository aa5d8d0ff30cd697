//! Bounded pool of FTP control connections
//!
//! The pool dispenses connections through [`FtpConnectionPool::borrow`],
//! takes them back through `give_back`/`invalidate`, and keeps itself
//! stocked via a background replenisher. Waiting borrowers form a FIFO
//! queue; returned connections are handed to the oldest waiter before
//! they touch the idle queue. The health manager and keep-alive driver
//! see the pool only through the [`ConnectionStore`] capability, so the
//! ownership graph stays acyclic.
//!
//! Capacity accounting: `total` counts every live connection (idle,
//! borrowed, parked for repair, or mid-creation). Creation is only
//! attempted after reserving a slot under the state lock, which keeps
//! `active + idle ≤ max_connections` at all times.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::channel::{Dialer, TlsUpgrader};
use crate::connection::{ConnectionSnapshot, ConnectionStore, FtpConnection};
use crate::error::FtpPoolError;
use crate::factory::ConnectionFactory;
use crate::health::{HealthManager, HealthStatus, ProbeOutcome};
use crate::keepalive::KeepAliveDriver;
use crate::metrics::{
    ConnectionPoolMetrics, HealthMetrics, MetricsCollector, MetricsSnapshot, ResourceMetrics,
};
use crate::recovery::RecoveryExecutor;
use crate::types::{now_millis, ConnectionId, PoolSettings};
use crate::Result;

/// How long shutdown waits for a worker before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Safety-net cadence for the replenisher between nudges
const REPLENISH_TICK: Duration = Duration::from_secs(30);
/// Consecutive create failures before a replenish pass gives up until
/// the next tick
const REPLENISH_MAX_BACKOFFS: u32 = 5;
/// Base delay of the replenisher's failure backoff
const REPLENISH_BACKOFF_BASE_MS: u64 = 500;
/// Ceiling of the replenisher's failure backoff
const REPLENISH_BACKOFF_MAX_MS: u64 = 30_000;
/// Background workers the pool spawns (replenisher, maintenance, keep-alive)
const WORKER_COUNT: u32 = 3;

/// Outcome of the synchronous, lock-guarded half of `acquire_one`
enum AcquireOutcome {
    Connection(FtpConnection),
    Create,
    Wait(oneshot::Receiver<FtpConnection>),
}

/// State behind the pool lock
struct PoolState {
    idle: VecDeque<FtpConnection>,
    waiters: VecDeque<oneshot::Sender<FtpConnection>>,
    /// Every live connection: idle, borrowed, benched, or mid-creation
    total: u32,
    /// Creations in flight (counted in `total`)
    pending: u32,
    /// Borrower-owned connections
    active: u32,
}

/// Shared pool internals; implements the store capability
pub(crate) struct PoolCore {
    settings: Arc<PoolSettings>,
    factory: Arc<ConnectionFactory>,
    health: Arc<HealthManager>,
    keepalive: Arc<KeepAliveDriver>,
    metrics: Arc<MetricsCollector>,
    state: Mutex<PoolState>,
    closed: AtomicBool,
    clear_generation: AtomicU64,
    replenishing: AtomicBool,
    replenish_tx: mpsc::UnboundedSender<()>,
}

impl PoolCore {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn nudge_replenisher(&self) {
        let _ = self.replenish_tx.send(());
    }

    /// Synchronous half of `acquire_one`: takes the lock, decides the
    /// outcome, and releases the lock before returning — kept separate so
    /// the `MutexGuard` never has to live across an `.await` point.
    fn try_acquire_sync(&self) -> Result<AcquireOutcome> {
        let mut state = self.state.lock();
        if self.is_closed() {
            return Err(FtpPoolError::PoolClosed);
        }

        if let Some(conn) = state.idle.pop_front() {
            state.active += 1;
            return Ok(AcquireOutcome::Connection(conn));
        }

        if state.total < self.settings.max_connections {
            state.total += 1;
            state.pending += 1;
            return Ok(AcquireOutcome::Create);
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Ok(AcquireOutcome::Wait(rx))
    }

    /// Obtains one connection: idle first, then create, then wait
    ///
    /// Returns the connection and the time spent waiting on the queue.
    async fn acquire_one(&self, max_wait: Duration) -> Result<(FtpConnection, Duration)> {
        let mut rx = match self.try_acquire_sync()? {
            AcquireOutcome::Connection(conn) => return Ok((conn, Duration::ZERO)),
            AcquireOutcome::Create => {
                let conn = self.create_for_borrow().await?;
                return Ok((conn, Duration::ZERO));
            }
            AcquireOutcome::Wait(rx) => {
                self.metrics.waiter_enqueued();
                rx
            }
        };

        let waited = Instant::now();
        match timeout(max_wait, &mut rx).await {
            Ok(Ok(conn)) => {
                self.metrics.waiter_dequeued();
                Ok((conn, waited.elapsed()))
            }
            Ok(Err(_)) => {
                // Sender dropped: the pool shut down underneath us.
                self.metrics.waiter_dequeued();
                Err(FtpPoolError::PoolClosed)
            }
            Err(_) => {
                self.metrics.waiter_dequeued();
                // A returner may have handed us a connection in the same
                // instant the timer fired; don't drop it on the floor.
                if let Ok(conn) = rx.try_recv() {
                    return Ok((conn, waited.elapsed()));
                }
                self.metrics.record_wait_timeout();
                Err(FtpPoolError::PoolExhausted {
                    max_connections: self.settings.max_connections,
                    wait_ms: max_wait.as_millis() as u64,
                })
            }
        }
    }

    /// Creates a connection for a borrower holding a reserved slot
    async fn create_for_borrow(&self) -> Result<FtpConnection> {
        let started = Instant::now();
        match self.factory.create().await {
            Ok(conn) => {
                self.metrics
                    .record_create(true, started.elapsed().as_millis() as f64);
                self.admit(&conn);
                let mut state = self.state.lock();
                state.pending -= 1;
                state.active += 1;
                Ok(conn)
            }
            Err(e) => {
                self.metrics
                    .record_create(false, started.elapsed().as_millis() as f64);
                self.note_create_failure(&e);
                let mut state = self.state.lock();
                state.pending -= 1;
                state.total -= 1;
                drop(state);
                Err(e)
            }
        }
    }

    /// Registers a freshly created connection with the managers
    fn admit(&self, conn: &FtpConnection) {
        self.health.register(conn.id());
        self.keepalive.register(conn.id());
    }

    fn note_create_failure(&self, error: &FtpPoolError) {
        self.metrics.record_classified(error.kind_name());
        if error.is_auth_error() {
            self.metrics.record_auth_error();
        }
        tracing::warn!(error = %error, "connection creation failed");
    }

    /// Hands a connection to the oldest live waiter, or parks it idle
    ///
    /// `was_active` names the previous owner: a borrower (true) or a
    /// manager/creator (false).
    fn route_connection(&self, mut conn: FtpConnection, was_active: bool) {
        let mut state = self.state.lock();
        if was_active {
            state.active -= 1;
        }
        loop {
            match state.waiters.pop_front() {
                Some(waiter) => match waiter.send(conn) {
                    Ok(()) => {
                        state.active += 1;
                        return;
                    }
                    // That borrower timed out; try the next one.
                    Err(returned) => conn = returned,
                },
                None => {
                    state.idle.push_back(conn);
                    return;
                }
            }
        }
    }

    /// Takes a returned connection back in, applying the return policy
    async fn return_connection(&self, mut conn: FtpConnection, generation: u64) {
        self.metrics.record_return();
        let id = conn.id();

        if self.is_closed() {
            self.destroy(conn, true).await;
            return;
        }

        if generation < self.clear_generation.load(Ordering::SeqCst) {
            tracing::debug!(connection_id = id, "destroying connection returned after clear");
            self.destroy(conn, true).await;
            return;
        }

        if self.health.status(id) != HealthStatus::Healthy {
            tracing::info!(connection_id = id, "invalidating unhealthy returned connection");
            self.metrics.record_invalidated();
            self.destroy(conn, true).await;
            return;
        }

        conn.touch_used();
        self.keepalive.record_activity(id);
        self.route_connection(conn, true);
    }

    /// Closes a connection and erases it from the books
    async fn destroy(&self, mut conn: FtpConnection, was_active: bool) {
        self.factory.close(&mut conn).await;
        self.finish_removal(conn.id(), was_active);
    }

    /// Accounting tail of every removal path
    fn finish_removal(&self, id: ConnectionId, was_active: bool) {
        {
            let mut state = self.state.lock();
            state.total = state.total.saturating_sub(1);
            if was_active {
                state.active = state.active.saturating_sub(1);
            }
        }
        self.health.unregister(id);
        self.keepalive.unregister(id);
        self.metrics.record_destroyed();
        if !self.is_closed() {
            self.nudge_replenisher();
        }
    }

    /// One replenish pass: create until the min-idle floor is met
    ///
    /// Single-flight; failures back off exponentially and give up after a
    /// few rounds until the next tick. Non-recoverable failures (bad
    /// credentials, bad configuration) stop the pass immediately — redialing
    /// cannot fix those.
    async fn replenish_pass(&self) {
        if self.replenishing.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut backoffs: u32 = 0;

        while !self.is_closed() {
            let reserved = {
                let mut state = self.state.lock();
                let stocked = state.idle.len() as u32 + state.active + state.pending;
                let deficit = self.settings.min_connections.saturating_sub(stocked);
                let capacity = self.settings.max_connections.saturating_sub(state.total);
                if deficit.min(capacity) == 0 {
                    false
                } else {
                    state.total += 1;
                    state.pending += 1;
                    true
                }
            };
            if !reserved {
                break;
            }

            let started = Instant::now();
            match self.factory.create().await {
                Ok(conn) => {
                    self.metrics
                        .record_create(true, started.elapsed().as_millis() as f64);
                    self.admit(&conn);
                    self.state.lock().pending -= 1;
                    tracing::debug!(connection_id = conn.id(), "replenished idle connection");
                    self.route_connection(conn, false);
                    backoffs = 0;
                }
                Err(e) => {
                    self.metrics
                        .record_create(false, started.elapsed().as_millis() as f64);
                    self.note_create_failure(&e);
                    {
                        let mut state = self.state.lock();
                        state.pending -= 1;
                        state.total -= 1;
                    }
                    if !e.is_recoverable() || backoffs >= REPLENISH_MAX_BACKOFFS {
                        break;
                    }
                    let delay = (REPLENISH_BACKOFF_BASE_MS << backoffs.min(16))
                        .min(REPLENISH_BACKOFF_MAX_MS);
                    backoffs += 1;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }

        self.replenishing.store(false, Ordering::SeqCst);
    }

    /// Current occupancy gauges (idle, active, total, pending)
    fn gauges(&self) -> (u32, u32, u32, u32) {
        let state = self.state.lock();
        (
            state.idle.len() as u32,
            state.active,
            state.total,
            state.pending,
        )
    }
}

impl ConnectionStore for PoolCore {
    fn idle_snapshots(&self) -> Vec<ConnectionSnapshot> {
        self.state.lock().idle.iter().map(|c| c.snapshot()).collect()
    }

    fn take_idle(&self, id: ConnectionId) -> Option<FtpConnection> {
        let mut state = self.state.lock();
        let position = state.idle.iter().position(|c| c.id() == id)?;
        state.idle.remove(position)
    }

    fn restore_idle(&self, conn: FtpConnection) {
        self.route_connection(conn, false);
    }

    fn forget(&self, id: ConnectionId) {
        self.finish_removal(id, false);
    }
}

/// A borrowed connection, tagged for exactly-once return
///
/// Hand it back with [`FtpConnectionPool::give_back`] or
/// [`FtpConnectionPool::invalidate`]. Dropping the guard without either
/// is tolerated — the connection is closed and the books are fixed — but
/// it is logged as a client bug.
pub struct PooledFtp {
    conn: Option<FtpConnection>,
    generation: u64,
    core: Arc<PoolCore>,
}

impl PooledFtp {
    /// The connection's id
    pub fn id(&self) -> ConnectionId {
        self.connection().id()
    }

    /// Shared access to the connection
    pub fn connection(&self) -> &FtpConnection {
        self.conn.as_ref().expect("borrowed connection already returned")
    }

    /// Exclusive access to the connection, e.g. for file operations
    pub fn connection_mut(&mut self) -> &mut FtpConnection {
        self.conn.as_mut().expect("borrowed connection already returned")
    }

    fn take(mut self) -> (FtpConnection, u64, Arc<PoolCore>) {
        let conn = self.conn.take().expect("borrowed connection already returned");
        let generation = self.generation;
        let core = Arc::clone(&self.core);
        (conn, generation, core)
    }
}

impl std::fmt::Debug for PooledFtp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledFtp")
            .field("connection", &self.conn)
            .finish()
    }
}

impl Drop for PooledFtp {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Dropping the guard closes the socket; fix the books so the
            // replenisher can fill the hole.
            tracing::warn!(
                connection_id = conn.id(),
                "borrowed connection dropped without return; closing it"
            );
            self.core.finish_removal(conn.id(), true);
        }
    }
}

/// Self-healing pool of authenticated FTP control connections
pub struct FtpConnectionPool {
    settings: Arc<PoolSettings>,
    core: Arc<PoolCore>,
    health: Arc<HealthManager>,
    keepalive: Arc<KeepAliveDriver>,
    recovery: Arc<RecoveryExecutor>,
    metrics: Arc<MetricsCollector>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl FtpConnectionPool {
    /// Builds the pool, spawns its workers, and warms up `min_connections`
    ///
    /// Warm-up failures are recorded and logged but do not fail start-up;
    /// the pool surfaces them on the first borrow instead.
    pub async fn start(
        settings: Arc<PoolSettings>,
        dialer: Arc<dyn Dialer>,
        tls: Option<Arc<dyn TlsUpgrader>>,
    ) -> Result<Arc<Self>> {
        settings.validate()?;

        let metrics = Arc::new(MetricsCollector::new());
        let factory = Arc::new(ConnectionFactory::new(
            Arc::clone(&settings),
            dialer,
            tls,
        ));
        let health = Arc::new(HealthManager::new(
            Arc::clone(&settings),
            Arc::clone(&factory),
            Arc::clone(&metrics),
        ));
        let keepalive = Arc::new(KeepAliveDriver::new(Arc::clone(&settings)));
        let recovery = Arc::new(RecoveryExecutor::new(
            settings.retry.clone(),
            settings.breaker.clone(),
            Arc::clone(&metrics),
            Arc::clone(&health),
        ));

        let (replenish_tx, replenish_rx) = mpsc::unbounded_channel();
        let core = Arc::new(PoolCore {
            settings: Arc::clone(&settings),
            factory: Arc::clone(&factory),
            health: Arc::clone(&health),
            keepalive: Arc::clone(&keepalive),
            metrics: Arc::clone(&metrics),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                total: 0,
                pending: 0,
                active: 0,
            }),
            closed: AtomicBool::new(false),
            clear_generation: AtomicU64::new(0),
            replenishing: AtomicBool::new(false),
            replenish_tx,
        });

        // Warm-up before the pool is handed out.
        core.replenish_pass().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = vec![
            tokio::spawn(replenish_worker(
                Arc::clone(&core),
                replenish_rx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(maintenance_worker(
                Arc::clone(&core),
                Arc::clone(&health),
                shutdown_rx.clone(),
            )),
            tokio::spawn(keepalive_worker(
                Arc::clone(&core),
                Arc::clone(&health),
                Arc::clone(&keepalive),
                shutdown_rx,
            )),
        ];

        tracing::info!(
            endpoint = %settings.endpoint(),
            min = settings.min_connections,
            max = settings.max_connections,
            "connection pool started"
        );

        Ok(Arc::new(Self {
            settings,
            core,
            health,
            keepalive,
            recovery,
            metrics,
            workers: Mutex::new(workers),
            shutdown_tx,
        }))
    }

    /// Borrows a connection, waiting up to the configured `max_wait_ms`
    pub async fn borrow(&self) -> Result<PooledFtp> {
        self.borrow_with_wait(Duration::from_millis(self.settings.max_wait_ms))
            .await
    }

    /// Borrows a connection with an explicit saturation patience
    ///
    /// An unhealthy selection is invalidated and retried once; a second
    /// unhealthy selection fails with `NoHealthyConnection`.
    pub async fn borrow_with_wait(&self, max_wait: Duration) -> Result<PooledFtp> {
        let started = Instant::now();

        if self.core.is_closed() {
            return Err(FtpPoolError::PoolClosed);
        }
        if self.settings.max_connections == 0 {
            self.metrics.record_borrow(false, 0.0);
            return Err(FtpPoolError::PoolExhausted {
                max_connections: 0,
                wait_ms: 0,
            });
        }

        let mut unhealthy_seen: u32 = 0;
        loop {
            let (mut conn, waited) = match self.core.acquire_one(max_wait).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    self.metrics
                        .record_borrow(false, started.elapsed().as_millis() as f64);
                    return Err(e);
                }
            };

            let id = conn.id();
            if self.health.status(id) == HealthStatus::Healthy {
                conn.touch_used();
                self.keepalive.record_activity(id);
                self.metrics
                    .record_wait(waited.as_millis() as f64, !waited.is_zero());
                self.metrics
                    .record_borrow(true, started.elapsed().as_millis() as f64);
                return Ok(PooledFtp {
                    conn: Some(conn),
                    generation: self.core.clear_generation.load(Ordering::SeqCst),
                    core: Arc::clone(&self.core),
                });
            }

            tracing::warn!(
                connection_id = id,
                status = ?self.health.status(id),
                "borrow selected an unhealthy connection; invalidating"
            );
            self.metrics.record_invalidated();
            self.core.destroy(conn, true).await;

            unhealthy_seen += 1;
            if unhealthy_seen > 1 {
                self.metrics
                    .record_borrow(false, started.elapsed().as_millis() as f64);
                return Err(FtpPoolError::NoHealthyConnection);
            }
        }
    }

    /// Returns a borrowed connection to the pool
    ///
    /// Total function: unhealthy or post-clear connections are destroyed
    /// instead of parked, and handles from another pool are routed to
    /// their owner with a log line.
    pub async fn give_back(&self, handle: PooledFtp) {
        if !Arc::ptr_eq(&handle.core, &self.core) {
            tracing::warn!(
                connection_id = handle.id(),
                "connection returned to a pool that does not own it"
            );
        }
        let (conn, generation, core) = handle.take();
        core.return_connection(conn, generation).await;
    }

    /// Removes a borrowed connection from service and closes it
    pub async fn invalidate(&self, handle: PooledFtp) {
        let (conn, _, core) = handle.take();
        tracing::info!(connection_id = conn.id(), "connection invalidated by caller");
        core.metrics.record_invalidated();
        core.destroy(conn, true).await;
    }

    /// Destroys all idle connections; actives are destroyed on return
    pub async fn clear(&self) {
        self.core.clear_generation.fetch_add(1, Ordering::SeqCst);
        let drained: Vec<FtpConnection> = {
            let mut state = self.core.state.lock();
            state.idle.drain(..).collect()
        };
        tracing::info!(count = drained.len(), "clearing idle connections");
        for conn in drained {
            self.core.destroy(conn, false).await;
        }
    }

    /// Re-validates every idle connection in place
    ///
    /// Hard-failed entries are destroyed (and the min-idle floor
    /// replenished); the rest go back into the queue. Returns the number
    /// of entries destroyed.
    pub async fn refresh_idle(&self) -> usize {
        let mut destroyed = 0;
        for snapshot in self.core.idle_snapshots() {
            let Some(mut conn) = self.core.take_idle(snapshot.id) else {
                continue;
            };
            match self.health.validate(&mut conn).await {
                ProbeOutcome::HardFail => {
                    self.core.destroy(conn, false).await;
                    destroyed += 1;
                }
                _ => self.core.restore_idle(conn),
            }
        }
        destroyed
    }

    /// Runs one health maintenance sweep immediately
    ///
    /// The periodic worker does this on its own cadence; hosts call it to
    /// force a sweep, e.g. from an admin endpoint. Returns the number of
    /// connections repaired.
    pub async fn run_maintenance_now(&self) -> usize {
        let repaired = self.health.run_maintenance(&*self.core).await;
        self.core.nudge_replenisher();
        repaired
    }

    /// Point-in-time metrics snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        let (idle, active, total, pending) = self.core.gauges();
        let (created, destroyed, invalidated) = self.metrics.pool_counters();
        let (repair_attempts, repair_successes) = self.metrics.repair_counters();

        MetricsSnapshot {
            connection_pool: ConnectionPoolMetrics {
                idle_connections: idle,
                active_connections: active,
                total_connections: total,
                pending_creates: pending,
                max_connections: self.settings.max_connections,
                min_connections: self.settings.min_connections,
                connections_created: created,
                connections_destroyed: destroyed,
                connections_invalidated: invalidated,
            },
            performance: self.metrics.performance(),
            throughput: self.metrics.throughput(),
            queue: self.metrics.queue(),
            wait_time: self.metrics.wait_time(),
            resources: ResourceMetrics {
                uptime_ms: self.metrics.uptime_ms(),
                worker_count: WORKER_COUNT,
                repair_bench_size: self.health.bench_size() as u32,
            },
            health: HealthMetrics {
                counts: self.health.counts(),
                repaired_connections: self.health.repaired_total(),
                evicted_connections: self.health.evicted_total(),
                consecutive_probe_failures: self.health.consecutive_probe_failures(),
                repair_attempts,
                repair_successes,
                keep_alive: self.keepalive.stats(),
                authentication_error_count: self.metrics.auth_error_count(),
                classified_errors: self.metrics.classified_errors(),
            },
            operation_types: self.recovery.operation_metrics(),
            custom: self.metrics.custom_gauges(),
            taken_at: now_millis(),
        }
    }

    /// The retry/circuit-breaker wrapper for file operations
    pub fn recovery(&self) -> &Arc<RecoveryExecutor> {
        &self.recovery
    }

    /// The health manager's synchronous status oracle
    pub fn health_status(&self, id: ConnectionId) -> HealthStatus {
        self.health.status(id)
    }

    /// The health manager (reports, counts)
    pub fn health(&self) -> &Arc<HealthManager> {
        &self.health
    }

    /// The keep-alive driver (stats)
    pub fn keepalive(&self) -> &Arc<KeepAliveDriver> {
        &self.keepalive
    }

    /// The metrics collector (custom gauges)
    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Whether `shutdown` has begun
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Shuts the pool down; one-shot idempotent, never blocks indefinitely
    ///
    /// Cancels waiting borrowers with `PoolClosed`, stops the workers
    /// (bounded grace, then abort), and destroys idle and benched
    /// connections. Borrowed connections are closed when returned.
    pub async fn shutdown(&self) {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("connection pool shutting down");
        let _ = self.shutdown_tx.send(true);

        // Cancel pending waits: dropping the senders resolves every
        // waiting borrow with PoolClosed.
        let (waiters, idle) = {
            let mut state = self.core.state.lock();
            let waiters: Vec<_> = state.waiters.drain(..).collect();
            let idle: Vec<FtpConnection> = state.idle.drain(..).collect();
            (waiters, idle)
        };
        drop(waiters);

        // Stop the workers with a bounded grace.
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for mut worker in workers {
            if timeout(SHUTDOWN_GRACE, &mut worker).await.is_err() {
                worker.abort();
            }
        }

        // Destroy idle and benched connections.
        for conn in idle {
            self.core.destroy(conn, false).await;
        }
        for conn in self.health.drain_bench() {
            self.core.destroy(conn, false).await;
        }

        tracing::info!("connection pool shut down");
    }
}

impl std::fmt::Debug for FtpConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (idle, active, total, pending) = self.core.gauges();
        f.debug_struct("FtpConnectionPool")
            .field("endpoint", &self.settings.endpoint())
            .field("idle", &idle)
            .field("active", &active)
            .field("total", &total)
            .field("pending", &pending)
            .field("closed", &self.core.is_closed())
            .finish()
    }
}

/// Replenisher: keeps the idle floor stocked, driven by nudges and a tick
async fn replenish_worker(
    core: Arc<PoolCore>,
    mut nudges: mpsc::UnboundedReceiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(REPLENISH_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = nudges.recv() => {}
            _ = tick.tick() => {}
        }
        if core.is_closed() {
            break;
        }
        core.replenish_pass().await;
    }
}

/// Maintenance: periodic health validation, repair, and idle eviction
async fn maintenance_worker(
    core: Arc<PoolCore>,
    health: Arc<HealthManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(Duration::from_millis(
        core.settings.health_check_interval_ms(),
    ));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of a tokio interval fires immediately; skip it so a
    // fresh pool is not probed at startup.
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {}
        }
        if core.is_closed() {
            break;
        }
        let repaired = health.run_maintenance(&*core).await;
        if repaired > 0 {
            core.nudge_replenisher();
        }
    }
}

/// Keep-alive: sweeps registered records at half the configured interval
async fn keepalive_worker(
    core: Arc<PoolCore>,
    health: Arc<HealthManager>,
    keepalive: Arc<KeepAliveDriver>,
    mut shutdown: watch::Receiver<bool>,
) {
    let cadence = (core.settings.keep_alive_interval_ms / 2).max(100);
    let mut tick = interval(Duration::from_millis(cadence));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {}
        }
        if core.is_closed() {
            break;
        }
        keepalive.sweep(&*core, &health).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::AsyncStream;
    use async_trait::async_trait;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Dialer that fabricates an in-memory FTP server per dial
    struct MockServerDialer;

    #[async_trait]
    impl Dialer for MockServerDialer {
        async fn dial(&self, _settings: &PoolSettings) -> Result<Box<dyn AsyncStream>> {
            let (client, server) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let (read_half, mut write_half) = tokio::io::split(server);
                let mut reader = BufReader::new(read_half);
                if write_half.write_all(b"220 Mock ready\r\n").await.is_err() {
                    return;
                }
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let verb = line.split_whitespace().next().unwrap_or("").to_uppercase();
                    let reply: &[u8] = match verb.as_str() {
                        "USER" => b"331 Password required\r\n",
                        "PASS" => b"230 Logged in\r\n",
                        "TYPE" => b"200 Type set\r\n",
                        "OPTS" => b"200 UTF8 on\r\n",
                        "NOOP" => b"200 Ok\r\n",
                        "QUIT" => b"221 Bye\r\n",
                        _ => b"502 Not implemented\r\n",
                    };
                    if write_half.write_all(reply).await.is_err() {
                        return;
                    }
                }
            });
            Ok(Box::new(client))
        }
    }

    /// Dialer that always refuses
    struct RefusingDialer;

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self, settings: &PoolSettings) -> Result<Box<dyn AsyncStream>> {
            Err(FtpPoolError::ConnectionRefused {
                host: settings.endpoint(),
            })
        }
    }

    fn settings(min: u32, max: u32) -> Arc<PoolSettings> {
        let mut settings = PoolSettings::new("mock", 21)
            .with_credentials("user", "pw")
            .with_capacity(min, max)
            .with_max_wait(200);
        settings.control_timeout_ms = 1000;
        Arc::new(settings)
    }

    async fn pool_with(min: u32, max: u32) -> Arc<FtpConnectionPool> {
        FtpConnectionPool::start(settings(min, max), Arc::new(MockServerDialer), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_warm_up_reaches_min_idle() {
        let pool = pool_with(2, 5).await;
        let snapshot = pool.metrics();
        assert_eq!(snapshot.connection_pool.idle_connections, 2);
        assert_eq!(snapshot.connection_pool.active_connections, 0);
        assert_eq!(snapshot.connection_pool.connections_created, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_borrow_and_return_preserve_totals() {
        let pool = pool_with(1, 4).await;

        let handle = pool.borrow().await.unwrap();
        let snapshot = pool.metrics();
        assert_eq!(snapshot.connection_pool.active_connections, 1);

        pool.give_back(handle).await;
        let snapshot = pool.metrics();
        assert_eq!(snapshot.connection_pool.active_connections, 0);
        assert_eq!(snapshot.connection_pool.idle_connections, 1);
        assert_eq!(snapshot.throughput.borrows_total, 1);
        assert_eq!(snapshot.throughput.returns_total, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalidate_decrements_totals() {
        let pool = pool_with(0, 4).await;

        let handle = pool.borrow().await.unwrap();
        assert_eq!(pool.metrics().connection_pool.total_connections, 1);

        pool.invalidate(handle).await;
        let snapshot = pool.metrics();
        assert_eq!(snapshot.connection_pool.total_connections, 0);
        assert_eq!(snapshot.connection_pool.connections_invalidated, 1);
        assert_eq!(snapshot.connection_pool.connections_destroyed, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_borrow_against_zero_capacity_fails_immediately() {
        let pool = pool_with(0, 0).await;
        let started = Instant::now();
        let err = pool.borrow().await.unwrap_err();
        assert!(matches!(err, FtpPoolError::PoolExhausted { .. }));
        assert!(started.elapsed() < Duration::from_millis(100));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_saturated_borrow_times_out_with_pool_exhausted() {
        let pool = pool_with(0, 1).await;
        let holder = pool.borrow().await.unwrap();

        let started = Instant::now();
        let err = pool
            .borrow_with_wait(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FtpPoolError::PoolExhausted { .. }));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(45), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(500), "waited {:?}", waited);
        assert_eq!(pool.metrics().queue.wait_timeouts, 1);

        pool.give_back(holder).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_waiter_receives_returned_connection_fifo() {
        let pool = pool_with(0, 1).await;
        let holder = pool.borrow().await.unwrap();
        let held_id = holder.id();

        let waiter_pool = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            waiter_pool
                .borrow_with_wait(Duration::from_millis(500))
                .await
        });

        // Give the waiter time to enqueue, then release.
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.give_back(holder).await;

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.id(), held_id);

        let snapshot = pool.metrics();
        assert!(snapshot.wait_time.max_wait_ms >= 40.0);
        assert_eq!(snapshot.queue.total_waits, 1);

        pool.give_back(handle).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_unhealthy_idle_connection_is_replaced_on_borrow() {
        let pool = pool_with(1, 4).await;
        // Warm-up created exactly one connection; ids start at 1.
        let idle_id = 1;
        pool.health().mark_failed(idle_id, "test kill");

        let handle = pool.borrow().await.unwrap();
        // The failed idle entry was invalidated and a fresh one created.
        assert_ne!(handle.id(), idle_id);
        assert_eq!(pool.health_status(handle.id()), HealthStatus::Healthy);

        let snapshot = pool.metrics();
        assert_eq!(snapshot.connection_pool.connections_invalidated, 1);

        pool.give_back(handle).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_unhealthy_selections_fail_with_no_healthy_connection() {
        // Two failed idle entries and a dialer that cannot create more.
        let pool = FtpConnectionPool::start(settings(2, 2), Arc::new(MockServerDialer), None)
            .await
            .unwrap();
        pool.health().mark_failed(1, "test");
        pool.health().mark_failed(2, "test");

        // Creation capacity exists after the first invalidation, but the
        // second pop still hits the other failed entry first.
        let err = pool.borrow().await.unwrap_err();
        assert!(matches!(err, FtpPoolError::NoHealthyConnection), "got {:?}", err);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_unhealthy_return_is_invalidated() {
        let pool = pool_with(0, 2).await;
        let handle = pool.borrow().await.unwrap();
        let id = handle.id();

        pool.health().mark_failed(id, "went away");
        pool.give_back(handle).await;

        let snapshot = pool.metrics();
        assert_eq!(snapshot.connection_pool.idle_connections, 0);
        assert_eq!(snapshot.connection_pool.connections_destroyed, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_destroys_idle_and_actives_on_return() {
        let pool = pool_with(0, 4).await;
        let active = pool.borrow().await.unwrap();
        let idle = pool.borrow().await.unwrap();
        pool.give_back(idle).await;
        assert_eq!(pool.metrics().connection_pool.idle_connections, 1);

        pool.clear().await;
        assert_eq!(pool.metrics().connection_pool.idle_connections, 0);

        // The still-borrowed connection dies on return.
        pool.give_back(active).await;
        let snapshot = pool.metrics();
        assert_eq!(snapshot.connection_pool.idle_connections, 0);
        assert_eq!(snapshot.connection_pool.total_connections, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let pool = pool_with(1, 2).await;
        pool.shutdown().await;
        pool.shutdown().await;
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn test_borrow_after_shutdown_fails_fast() {
        let pool = pool_with(0, 2).await;
        pool.shutdown().await;
        let err = pool.borrow().await.unwrap_err();
        assert!(matches!(err, FtpPoolError::PoolClosed));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiters() {
        let pool = pool_with(0, 1).await;
        let holder = pool.borrow().await.unwrap();

        let waiter_pool = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            waiter_pool.borrow_with_wait(Duration::from_secs(10)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.shutdown().await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(FtpPoolError::PoolClosed)));

        // The in-flight borrower's return closes the connection.
        pool.give_back(holder).await;
        assert_eq!(pool.metrics().connection_pool.total_connections, 0);
    }

    #[tokio::test]
    async fn test_active_connection_closed_on_return_after_shutdown() {
        let pool = pool_with(0, 2).await;
        let handle = pool.borrow().await.unwrap();
        pool.shutdown().await;

        pool.give_back(handle).await;
        let snapshot = pool.metrics();
        assert_eq!(snapshot.connection_pool.total_connections, 0);
        assert_eq!(snapshot.connection_pool.active_connections, 0);
    }

    #[tokio::test]
    async fn test_create_failure_propagates_classified_error() {
        let pool = FtpConnectionPool::start(settings(0, 2), Arc::new(RefusingDialer), None)
            .await
            .unwrap();
        let err = pool.borrow().await.unwrap_err();
        assert!(matches!(err, FtpPoolError::ConnectionRefused { .. }));

        // The reserved slot was released on failure.
        assert_eq!(pool.metrics().connection_pool.total_connections, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_handle_fixes_the_books() {
        let pool = pool_with(0, 2).await;
        let handle = pool.borrow().await.unwrap();
        assert_eq!(pool.metrics().connection_pool.total_connections, 1);

        drop(handle);
        let snapshot = pool.metrics();
        assert_eq!(snapshot.connection_pool.total_connections, 0);
        assert_eq!(snapshot.connection_pool.active_connections, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_refresh_idle_replaces_dead_connections() {
        let pool = pool_with(2, 4).await;
        assert_eq!(pool.metrics().connection_pool.idle_connections, 2);

        // Healthy peers answer NOOP; nothing is destroyed.
        let destroyed = pool.refresh_idle().await;
        assert_eq!(destroyed, 0);
        assert_eq!(pool.metrics().connection_pool.idle_connections, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_metrics_snapshot_groups_are_populated() {
        let pool = pool_with(1, 3).await;
        let handle = pool.borrow().await.unwrap();
        pool.give_back(handle).await;

        let snapshot = pool.metrics();
        assert_eq!(snapshot.connection_pool.max_connections, 3);
        assert_eq!(snapshot.connection_pool.min_connections, 1);
        assert!(snapshot.performance.create.total_count >= 1);
        assert!(snapshot.performance.borrow.total_count >= 1);
        assert!(snapshot.resources.uptime_ms < 60_000);
        assert_eq!(snapshot.resources.worker_count, WORKER_COUNT);
        assert_eq!(snapshot.operation_types.len(), 3);
        assert!(snapshot.operation_types.contains_key("transfers"));
        assert_eq!(snapshot.health.counts.healthy, 1);
        pool.shutdown().await;
    }
}
