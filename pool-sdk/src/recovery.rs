//! Error recovery: retry with backoff, circuit breaking, and strategies
//!
//! Operations run through [`RecoveryExecutor::execute`], which gates each
//! attempt on one of three named circuit breakers (`connection`,
//! `transfers`, `file-operations`), retries recoverable failures with
//! exponential backoff and ±20% jitter, and applies a fixed per-kind
//! recovery strategy (e.g. marking a connection failed so the maintenance
//! sweep repairs it).

use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::FtpPoolError;
use crate::health::HealthManager;
use crate::metrics::{MetricsCollector, OperationTypeMetrics};
use crate::types::{CircuitBreakerSettings, ConnectionId, RetryPolicy};
use crate::Result;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation
    Closed,
    /// Rejecting calls after too many recent failures
    Open,
    /// Cool-down elapsed; one probe call admitted
    HalfOpen,
}

impl BreakerState {
    /// Stable lowercase name used in metrics
    pub fn name(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Failure instants within the sliding window
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// A named circuit breaker with a sliding failure window
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    settings: CircuitBreakerSettings,
    inner: Mutex<BreakerInner>,
    opened_count: AtomicU64,
}

impl CircuitBreaker {
    /// Creates a closed breaker
    pub fn new(name: &'static str, settings: CircuitBreakerSettings) -> Self {
        Self {
            name,
            settings,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
            opened_count: AtomicU64::new(0),
        }
    }

    /// The breaker's name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current state, advancing Open to HalfOpen if the cool-down elapsed
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Times this breaker has opened
    pub fn opened_count(&self) -> u64 {
        self.opened_count.load(Ordering::SeqCst)
    }

    /// Admits or rejects one call
    ///
    /// Open breakers reject until the cool-down elapses, then admit a
    /// single half-open probe; a second caller during the probe is
    /// rejected.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= Duration::from_millis(self.settings.cooldown_ms))
                    .unwrap_or(true);
                if cooled {
                    tracing::info!(breaker = self.name, "circuit breaker half-open");
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(FtpPoolError::CircuitOpen {
                        breaker: self.name.to_string(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(FtpPoolError::CircuitOpen {
                        breaker: self.name.to_string(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Records a successful call; closes the breaker
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!(breaker = self.name, "circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// Records a failed call; may open the breaker
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                // The probe failed; straight back to open.
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                self.opened_count.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(breaker = self.name, "circuit breaker re-opened");
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                let now = Instant::now();
                let window = Duration::from_millis(self.settings.window_ms);
                inner.failures.push_back(now);
                while let Some(first) = inner.failures.front() {
                    if now.duration_since(*first) > window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() as u32 >= self.settings.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    self.opened_count.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(
                        breaker = self.name,
                        failures = inner.failures.len(),
                        "circuit breaker opened"
                    );
                }
            }
        }
    }
}

/// Operation kinds, each mapped to a named breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Connection establishment and validation
    Connection,
    /// Data transfers
    Transfers,
    /// Directory and file manipulation
    FileOperations,
}

impl OperationKind {
    /// The breaker name for this kind
    pub fn breaker_name(&self) -> &'static str {
        match self {
            OperationKind::Connection => "connection",
            OperationKind::Transfers => "transfers",
            OperationKind::FileOperations => "file-operations",
        }
    }
}

/// Recovery strategy selected per error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Mark the connection failed; the maintenance sweep redials it
    ReconnectWithBackoff,
    /// Abort the transfer, then reconnect
    AbortThenReconnect,
    /// Re-validate the connection and fix data-channel state
    ValidateAndFix,
    /// Nothing to do beyond propagation
    NoOp,
}

/// Fixed strategy table keyed by error kind
pub fn action_for(error: &FtpPoolError) -> RecoveryAction {
    match error {
        FtpPoolError::ConnectionError { .. }
        | FtpPoolError::ConnectionTimeout { .. }
        | FtpPoolError::ConnectionClosed { .. }
        | FtpPoolError::ConnectionRefused { .. } => RecoveryAction::ReconnectWithBackoff,
        FtpPoolError::TransferError { .. } => RecoveryAction::AbortThenReconnect,
        FtpPoolError::DataConnectionError { .. } => RecoveryAction::ValidateAndFix,
        _ => RecoveryAction::NoOp,
    }
}

#[derive(Debug, Default)]
struct KindCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
}

/// Runs operations with retry, backoff, and circuit breaking
pub struct RecoveryExecutor {
    retry: RetryPolicy,
    connection_breaker: CircuitBreaker,
    transfers_breaker: CircuitBreaker,
    file_ops_breaker: CircuitBreaker,
    connection_counters: KindCounters,
    transfers_counters: KindCounters,
    file_ops_counters: KindCounters,
    metrics: Arc<MetricsCollector>,
    health: Arc<HealthManager>,
}

impl RecoveryExecutor {
    /// Creates an executor with one breaker per operation kind
    pub fn new(
        retry: RetryPolicy,
        breaker_settings: CircuitBreakerSettings,
        metrics: Arc<MetricsCollector>,
        health: Arc<HealthManager>,
    ) -> Self {
        Self {
            retry,
            connection_breaker: CircuitBreaker::new("connection", breaker_settings.clone()),
            transfers_breaker: CircuitBreaker::new("transfers", breaker_settings.clone()),
            file_ops_breaker: CircuitBreaker::new("file-operations", breaker_settings),
            connection_counters: KindCounters::default(),
            transfers_counters: KindCounters::default(),
            file_ops_counters: KindCounters::default(),
            metrics,
            health,
        }
    }

    /// The breaker backing the given operation kind
    pub fn breaker(&self, kind: OperationKind) -> &CircuitBreaker {
        match kind {
            OperationKind::Connection => &self.connection_breaker,
            OperationKind::Transfers => &self.transfers_breaker,
            OperationKind::FileOperations => &self.file_ops_breaker,
        }
    }

    fn counters(&self, kind: OperationKind) -> &KindCounters {
        match kind {
            OperationKind::Connection => &self.connection_counters,
            OperationKind::Transfers => &self.transfers_counters,
            OperationKind::FileOperations => &self.file_ops_counters,
        }
    }

    /// Runs an operation with circuit breaking and bounded retry
    ///
    /// Recoverable failures are retried up to `max_retries` times with
    /// `retry_delay × 2^(attempt-1)` backoff and ±20% jitter;
    /// non-recoverable failures and exhausted retries propagate. With
    /// `max_retries = 0` the operation runs exactly once.
    pub async fn execute<T, F, Fut>(
        &self,
        kind: OperationKind,
        connection_id: Option<ConnectionId>,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breaker(kind);
        let counters = self.counters(kind);
        let mut attempt: u32 = 1;

        loop {
            breaker.try_acquire()?;
            counters.attempts.fetch_add(1, Ordering::SeqCst);

            match operation().await {
                Ok(value) => {
                    breaker.record_success();
                    counters.successes.fetch_add(1, Ordering::SeqCst);
                    return Ok(value);
                }
                Err(error) => {
                    breaker.record_failure();
                    self.metrics.record_classified(error.kind_name());
                    if error.is_auth_error() {
                        self.metrics.record_auth_error();
                    }
                    self.apply_strategy(&error, connection_id);

                    let retry_allowed = error.is_recoverable() && attempt <= self.retry.max_retries;
                    if !retry_allowed {
                        counters.failures.fetch_add(1, Ordering::SeqCst);
                        return Err(error);
                    }

                    let delay = jittered(self.retry.delay_for_attempt(attempt));
                    tracing::debug!(
                        kind = kind.breaker_name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after recoverable failure"
                    );
                    counters.retries.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Applies the fixed recovery strategy for one classified failure
    fn apply_strategy(&self, error: &FtpPoolError, connection_id: Option<ConnectionId>) {
        match action_for(error) {
            RecoveryAction::ReconnectWithBackoff | RecoveryAction::AbortThenReconnect => {
                if let Some(id) = connection_id {
                    // The maintenance sweep redials failed connections
                    // with its own backoff.
                    self.health.mark_failed(id, error.kind_name());
                }
            }
            RecoveryAction::ValidateAndFix => {
                // The connection re-validates on its way back into the
                // pool; nothing to schedule here.
            }
            RecoveryAction::NoOp => {}
        }
    }

    /// Per-breaker counters for the metrics snapshot
    pub fn operation_metrics(&self) -> HashMap<String, OperationTypeMetrics> {
        let mut map = HashMap::new();
        for kind in [
            OperationKind::Connection,
            OperationKind::Transfers,
            OperationKind::FileOperations,
        ] {
            let counters = self.counters(kind);
            let breaker = self.breaker(kind);
            map.insert(
                kind.breaker_name().to_string(),
                OperationTypeMetrics {
                    attempts: counters.attempts.load(Ordering::SeqCst),
                    successes: counters.successes.load(Ordering::SeqCst),
                    failures: counters.failures.load(Ordering::SeqCst),
                    retries: counters.retries.load(Ordering::SeqCst),
                    circuit_state: breaker.state().name().to_string(),
                    opened_count: breaker.opened_count(),
                },
            );
        }
        map
    }
}

impl std::fmt::Debug for RecoveryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryExecutor")
            .field("connection", &self.connection_breaker.state())
            .field("transfers", &self.transfers_breaker.state())
            .field("file_operations", &self.file_ops_breaker.state())
            .finish()
    }
}

/// Applies ±20% jitter to a backoff delay
fn jittered(delay_ms: u64) -> Duration {
    if delay_ms == 0 {
        return Duration::ZERO;
    }
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((delay_ms as f64 * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AsyncStream, Dialer};
    use crate::factory::ConnectionFactory;
    use crate::types::PoolSettings;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct NoDialer;

    #[async_trait]
    impl Dialer for NoDialer {
        async fn dial(&self, settings: &PoolSettings) -> Result<Box<dyn AsyncStream>> {
            Err(FtpPoolError::ConnectionRefused {
                host: settings.endpoint(),
            })
        }
    }

    fn health() -> Arc<HealthManager> {
        let settings = Arc::new(PoolSettings::default());
        let factory = Arc::new(ConnectionFactory::new(
            Arc::clone(&settings),
            Arc::new(NoDialer),
            None,
        ));
        Arc::new(HealthManager::new(
            settings,
            factory,
            Arc::new(MetricsCollector::new()),
        ))
    }

    fn executor(retry: RetryPolicy, breaker: CircuitBreakerSettings) -> RecoveryExecutor {
        RecoveryExecutor::new(retry, breaker, Arc::new(MetricsCollector::new()), health())
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            retry_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    fn transfer_error() -> FtpPoolError {
        FtpPoolError::TransferError {
            path: None,
            details: "injected".to_string(),
        }
    }

    #[test]
    fn test_breaker_opens_at_threshold() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerSettings {
                failure_threshold: 3,
                window_ms: 60_000,
                cooldown_ms: 60_000,
            },
        );
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.opened_count(), 1);
    }

    #[test]
    fn test_open_breaker_rejects() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerSettings {
                failure_threshold: 1,
                window_ms: 60_000,
                cooldown_ms: 60_000,
            },
        );
        breaker.record_failure();
        let err = breaker.try_acquire().unwrap_err();
        assert!(matches!(err, FtpPoolError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_half_open_after_cooldown_and_close_on_success() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerSettings {
                failure_threshold: 1,
                window_ms: 60_000,
                cooldown_ms: 20,
            },
        );
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        // One probe admitted, a second rejected while it is in flight.
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_half_open_reopens_on_failure() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerSettings {
                failure_threshold: 1,
                window_ms: 60_000,
                cooldown_ms: 20,
            },
        );
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(breaker.try_acquire().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.opened_count(), 2);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_strategy_table() {
        assert_eq!(
            action_for(&FtpPoolError::ConnectionClosed {
                connection_id: None,
                details: "x".to_string()
            }),
            RecoveryAction::ReconnectWithBackoff
        );
        assert_eq!(action_for(&transfer_error()), RecoveryAction::AbortThenReconnect);
        assert_eq!(
            action_for(&FtpPoolError::DataConnectionError {
                details: "x".to_string()
            }),
            RecoveryAction::ValidateAndFix
        );
        assert_eq!(
            action_for(&FtpPoolError::FileNotFound {
                path: "/x".to_string()
            }),
            RecoveryAction::NoOp
        );
    }

    #[tokio::test]
    async fn test_execute_success_passes_through() {
        let executor = executor(fast_retry(), CircuitBreakerSettings::default());
        let result: Result<u32> = executor
            .execute(OperationKind::FileOperations, None, || async { Ok(42) })
            .await;
        assert_eq!(result.unwrap(), 42);

        let metrics = executor.operation_metrics();
        let ops = metrics.get("file-operations").unwrap();
        assert_eq!(ops.attempts, 1);
        assert_eq!(ops.successes, 1);
    }

    #[tokio::test]
    async fn test_execute_retries_recoverable_until_exhausted() {
        let executor = executor(fast_retry(), CircuitBreakerSettings {
            failure_threshold: 100,
            window_ms: 60_000,
            cooldown_ms: 60_000,
        });

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result: Result<()> = executor
            .execute(OperationKind::Transfers, None, move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(transfer_error()) }
            })
            .await;

        assert!(result.is_err());
        // max_retries = 3 -> four attempts in total.
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let metrics = executor.operation_metrics();
        let ops = metrics.get("transfers").unwrap();
        assert_eq!(ops.retries, 3);
        assert_eq!(ops.failures, 1);
    }

    #[tokio::test]
    async fn test_zero_retries_means_single_attempt() {
        let executor = executor(RetryPolicy::no_retry(), CircuitBreakerSettings::default());

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result: Result<()> = executor
            .execute(OperationKind::Transfers, None, move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(transfer_error()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_recoverable_not_retried() {
        let executor = executor(fast_retry(), CircuitBreakerSettings::default());

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result: Result<()> = executor
            .execute(OperationKind::FileOperations, None, move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(FtpPoolError::FileNotFound {
                        path: "/missing".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(FtpPoolError::FileNotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_under_injected_failures_then_fails_fast() {
        // Threshold 5, no retries: drive ten consecutive transfer errors.
        let executor = executor(
            RetryPolicy::no_retry(),
            CircuitBreakerSettings {
                failure_threshold: 5,
                window_ms: 60_000,
                cooldown_ms: 60_000,
            },
        );

        let mut breaker_tripped = 0;
        for _ in 0..10 {
            let result: Result<()> = executor
                .execute(OperationKind::Transfers, None, || async {
                    Err(transfer_error())
                })
                .await;
            if matches!(result, Err(FtpPoolError::CircuitOpen { .. })) {
                breaker_tripped += 1;
            }
        }

        assert_eq!(executor.breaker(OperationKind::Transfers).state(), BreakerState::Open);
        // First five calls fail on the network; the rest fail fast.
        assert_eq!(breaker_tripped, 5);

        // Fail-fast calls never invoke the operation.
        let touched = Arc::new(AtomicU32::new(0));
        let touched_clone = Arc::clone(&touched);
        let result: Result<()> = executor
            .execute(OperationKind::Transfers, None, move || {
                touched_clone.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(FtpPoolError::CircuitOpen { .. })));
        assert_eq!(touched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reconnect_strategy_marks_connection_failed() {
        let health = health();
        health.register(9);
        let executor = RecoveryExecutor::new(
            RetryPolicy::no_retry(),
            CircuitBreakerSettings::default(),
            Arc::new(MetricsCollector::new()),
            Arc::clone(&health),
        );

        let result: Result<()> = executor
            .execute(OperationKind::Connection, Some(9), || async {
                Err(FtpPoolError::ConnectionClosed {
                    connection_id: Some(9),
                    details: "reset".to_string(),
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(health.status(9), crate::health::HealthStatus::Failed);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        for _ in 0..100 {
            let delay = jittered(1000);
            let ms = delay.as_millis() as u64;
            assert!((800..=1200).contains(&ms), "jittered delay {} out of range", ms);
        }
    }

    #[test]
    fn test_breaker_names() {
        assert_eq!(OperationKind::Connection.breaker_name(), "connection");
        assert_eq!(OperationKind::Transfers.breaker_name(), "transfers");
        assert_eq!(OperationKind::FileOperations.breaker_name(), "file-operations");
    }
}
