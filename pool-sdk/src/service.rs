//! Service façade over the connection pool
//!
//! [`FtpPoolService`] is what a host data-flow runtime holds: it
//! validates the settings, optionally installs the `tracing` subscriber,
//! builds the factory/managers/pool, runs the alert monitor, and exposes
//! the borrow/return API together with metrics and health reports.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::alerts::{alert_monitor_worker, AlertCallback, AlertMonitor};
use crate::channel::{Dialer, DirectDialer, TlsUpgrader};
use crate::health::HealthReportEntry;
use crate::metrics::MetricsSnapshot;
use crate::pool::{FtpConnectionPool, PooledFtp};
use crate::types::{AlertThresholds, ConnectionId, LogConfig, LogFormat, LogLevel, PoolSettings};
use crate::Result;

/// Grace for the alert worker during shutdown
const ALERT_WORKER_GRACE: Duration = Duration::from_secs(5);

/// Entry point for hosts embedding the FTP connection pool
pub struct FtpPoolService {
    settings: Arc<PoolSettings>,
    pool: Arc<FtpConnectionPool>,
    alerts: Arc<AlertMonitor>,
    alert_worker: Mutex<Option<JoinHandle<()>>>,
    alert_shutdown: watch::Sender<bool>,
}

impl FtpPoolService {
    /// Starts the service with the default direct TCP dialer and no TLS
    pub async fn start(settings: PoolSettings) -> Result<Self> {
        Self::start_with(settings, Arc::new(DirectDialer), None).await
    }

    /// Starts the service with host-provided dialer and TLS collaborators
    ///
    /// Steps, in order:
    /// 1. Validate the settings.
    /// 2. Initialize logging when a `LogConfig` is present.
    /// 3. Build the pool (factory, health manager, keep-alive driver,
    ///    recovery executor) and warm up `min_connections`.
    /// 4. Start the alert monitor.
    pub async fn start_with(
        settings: PoolSettings,
        dialer: Arc<dyn Dialer>,
        tls: Option<Arc<dyn TlsUpgrader>>,
    ) -> Result<Self> {
        settings.validate()?;

        if let Some(log_config) = &settings.log_config {
            Self::initialize_logging(log_config);
        }

        tracing::info!(
            endpoint = %settings.endpoint(),
            user = %settings.username,
            "starting FTP connection pool service"
        );

        let settings = Arc::new(settings);
        let pool = FtpConnectionPool::start(Arc::clone(&settings), dialer, tls).await?;

        let alerts = Arc::new(AlertMonitor::new(settings.alert_thresholds.clone()));
        let (alert_shutdown, shutdown_rx) = watch::channel(false);
        let alert_worker = tokio::spawn(alert_monitor_worker(
            Arc::clone(&alerts),
            Arc::clone(pool.health()),
            shutdown_rx,
        ));

        tracing::info!("FTP connection pool service started");

        Ok(Self {
            settings,
            pool,
            alerts,
            alert_worker: Mutex::new(Some(alert_worker)),
            alert_shutdown,
        })
    }

    /// Installs a `tracing` subscriber per the log configuration
    ///
    /// Best effort: if the host already installed a global subscriber,
    /// theirs wins.
    fn initialize_logging(log_config: &LogConfig) {
        use tracing_subscriber::EnvFilter;

        let level_filter = match log_config.level {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_filter));

        let result = match log_config.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .json()
                .with_current_span(true)
                .with_thread_ids(log_config.include_thread_ids)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_thread_ids(log_config.include_thread_ids)
                .try_init(),
        };
        if result.is_err() {
            tracing::debug!("a tracing subscriber is already installed");
        }
    }

    /// Borrows a connection (configured `max_wait_ms` patience)
    pub async fn borrow(&self) -> Result<PooledFtp> {
        self.pool.borrow().await
    }

    /// Borrows a connection with an explicit saturation patience
    pub async fn borrow_with_wait(&self, max_wait: Duration) -> Result<PooledFtp> {
        self.pool.borrow_with_wait(max_wait).await
    }

    /// Returns a borrowed connection
    pub async fn give_back(&self, handle: PooledFtp) {
        self.pool.give_back(handle).await
    }

    /// Removes a borrowed connection from service
    pub async fn invalidate(&self, handle: PooledFtp) {
        self.pool.invalidate(handle).await
    }

    /// Destroys all idle connections
    pub async fn clear(&self) {
        self.pool.clear().await
    }

    /// Re-validates every idle connection in place
    pub async fn refresh_idle(&self) -> usize {
        self.pool.refresh_idle().await
    }

    /// Forces one health maintenance sweep
    pub async fn run_maintenance_now(&self) -> usize {
        self.pool.run_maintenance_now().await
    }

    /// Point-in-time metrics snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.pool.metrics()
    }

    /// Health report over all tracked connections
    pub fn health_report(&self) -> Vec<HealthReportEntry> {
        self.pool.health().report()
    }

    /// Cached health status for one connection
    pub fn health_status(&self, id: ConnectionId) -> crate::health::HealthStatus {
        self.pool.health_status(id)
    }

    /// Registers an alert callback
    pub fn set_alert_callback(&self, callback: AlertCallback) {
        self.alerts.add_callback(callback);
    }

    /// Replaces the alert thresholds at runtime
    pub fn set_alert_thresholds(&self, thresholds: AlertThresholds) {
        self.alerts.set_thresholds(thresholds);
    }

    /// Sets a host-defined gauge surfaced under `custom` in the snapshot
    pub fn set_custom_metric(&self, name: impl Into<String>, value: f64) {
        self.pool.collector().set_custom(name, value);
    }

    /// The underlying pool, for hosts composing their own wrappers
    pub fn pool(&self) -> &Arc<FtpConnectionPool> {
        &self.pool
    }

    /// The immutable settings the service was started with
    pub fn settings(&self) -> &Arc<PoolSettings> {
        &self.settings
    }

    /// Whether shutdown has begun
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Shuts down the alert monitor and the pool; idempotent
    pub async fn shutdown(&self) {
        let _ = self.alert_shutdown.send(true);
        if let Some(mut worker) = self.alert_worker.lock().take() {
            if timeout(ALERT_WORKER_GRACE, &mut worker).await.is_err() {
                worker.abort();
            }
        }
        self.pool.shutdown().await;
    }
}

impl std::fmt::Debug for FtpPoolService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpPoolService")
            .field("endpoint", &self.settings.endpoint())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FtpPoolError;

    #[tokio::test]
    async fn test_invalid_settings_rejected_at_start() {
        let settings = PoolSettings::default().with_capacity(9, 3);
        let err = FtpPoolService::start(settings).await.unwrap_err();
        assert!(matches!(err, FtpPoolError::InvalidConfiguration { .. }));
    }

    #[tokio::test]
    async fn test_idle_timeout_violation_rejected_at_start() {
        let settings = PoolSettings::default().with_keep_alive(60_000, 30_000);
        assert!(FtpPoolService::start(settings).await.is_err());
    }
}
