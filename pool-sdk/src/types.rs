//! Core data types for the FTP connection pool SDK
//!
//! This module defines the identifiers, enumerations, and configuration
//! types used throughout the pool: endpoint settings, capacities, timeouts,
//! TLS posture, retry/circuit-breaker policies, and alert thresholds.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FtpPoolError;
use crate::Result;

/// Unique identifier for a pooled control connection
///
/// Assigned monotonically by the connection factory and preserved across
/// repairs of the same connection.
pub type ConnectionId = u64;

/// Unix timestamp in milliseconds
pub type Timestamp = i64;

/// Returns the current time as a `Timestamp`
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// Transfer mode applied to a control channel after login
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    /// ASCII mode (`TYPE A`)
    Ascii,
    /// Binary / image mode (`TYPE I`)
    Binary,
}

impl TransferMode {
    /// Returns the argument of the `TYPE` command for this mode
    pub fn type_code(&self) -> char {
        match self {
            TransferMode::Ascii => 'A',
            TransferMode::Binary => 'I',
        }
    }
}

/// Character encoding used on the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlEncoding {
    /// UTF-8 control channel (`OPTS UTF8 ON` is sent after login)
    Utf8,
    /// Plain ASCII control channel
    Ascii,
}

/// TLS posture of the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsMode {
    /// Plain FTP, no TLS
    None,
    /// FTPS with TLS from the first byte (implicit)
    Implicit,
    /// FTPS negotiated with `AUTH TLS` after the greeting (explicit)
    Explicit,
}

/// Outbound proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyType {
    /// SOCKS proxy
    Socks,
    /// HTTP CONNECT proxy
    Http,
}

/// Outbound proxy settings
///
/// The pool itself never dials through a proxy; these settings are handed
/// to the host-provided [`Dialer`](crate::channel::Dialer) implementation.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Proxy protocol
    pub proxy_type: ProxyType,
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Optional proxy username
    pub username: Option<String>,
    /// Optional proxy password
    pub password: Option<String>,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("proxy_type", &self.proxy_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Reference to a trust store the host's TLS collaborator loads
#[derive(Clone)]
pub struct TrustStoreConfig {
    /// Filesystem path of the trust store
    pub path: String,
    /// Optional trust store password
    pub password: Option<String>,
    /// Store format, e.g. `PKCS12`
    pub store_type: String,
}

impl fmt::Debug for TrustStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustStoreConfig")
            .field("path", &self.path)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("store_type", &self.store_type)
            .finish()
    }
}

/// Retry policy for recoverable failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the initial try
    pub max_retries: u32,
    /// Base delay before the first retry, in milliseconds
    pub retry_delay_ms: u64,
    /// Ceiling for the exponential backoff, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy that never retries
    ///
    /// Operations are attempted exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Returns the backoff delay for the given 1-based attempt, without jitter
    ///
    /// The delay doubles per attempt (`retry_delay × 2^(attempt-1)`) and is
    /// capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(16);
        self.retry_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms)
    }
}

/// Circuit breaker tuning
#[derive(Debug, Clone)]
pub struct CircuitBreakerSettings {
    /// Failures within the window that open the breaker
    pub failure_threshold: u32,
    /// Sliding failure window, in milliseconds
    pub window_ms: u64,
    /// Cool-down before the breaker admits a half-open probe, in milliseconds
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            cooldown_ms: 30_000,
        }
    }
}

/// Thresholds driving the alert monitor
#[derive(Debug, Clone)]
pub struct AlertThresholds {
    /// Consecutive probe failures that raise a Warning
    pub warning_consecutive_failures: u32,
    /// Degraded-connection ratio that raises a Warning
    pub warning_degraded_ratio: f64,
    /// Consecutive probe failures that raise a Critical
    pub critical_consecutive_failures: u32,
    /// Failed-connection ratio that raises a Critical
    pub critical_failed_ratio: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning_consecutive_failures: 3,
            warning_degraded_ratio: 0.25,
            critical_consecutive_failures: 5,
            critical_failed_ratio: 0.5,
        }
    }
}

/// Log verbosity for the optional subscriber initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable text output
    Text,
    /// Structured JSON output
    Json,
}

/// Logging configuration
///
/// When present, [`FtpPoolService::start`](crate::service::FtpPoolService::start)
/// installs a `tracing` subscriber with these settings. Hosts that manage
/// their own subscriber leave this unset.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level emitted (overridable via `RUST_LOG`)
    pub level: LogLevel,
    /// Output format
    pub format: LogFormat,
    /// Include thread ids in log lines
    pub include_thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
            include_thread_ids: false,
        }
    }
}

/// Minimum transfer buffer size accepted by `validate()`
pub const MIN_BUFFER_SIZE: usize = 1024;
/// Maximum transfer buffer size accepted by `validate()`
pub const MAX_BUFFER_SIZE: usize = 100 * 1024 * 1024;
/// Floor applied to the derived health maintenance interval
pub const MAINTENANCE_FLOOR_MS: u64 = 15_000;

/// Immutable pool configuration
///
/// Built once when the service is enabled and shared by reference across
/// all components; never mutated afterwards.
#[derive(Clone)]
pub struct PoolSettings {
    /// Remote FTP server hostname
    pub hostname: String,
    /// Remote FTP server control port
    pub port: u16,
    /// Login username
    pub username: String,
    /// Login password (masked in Debug output, never logged)
    pub password: String,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Data channel socket timeout in milliseconds (recorded for transfer collaborators)
    pub data_timeout_ms: u64,
    /// Control channel reply timeout in milliseconds
    pub control_timeout_ms: u64,
    /// Use active mode for data channels instead of passive
    pub active_mode: bool,
    /// Inclusive local port range for active-mode data channels
    pub active_port_range: Option<(u16, u16)>,
    /// External address reported in active mode (NAT traversal)
    pub active_external_address: Option<String>,
    /// Maximum connections the pool may hold (idle + active)
    pub max_connections: u32,
    /// Idle connection floor the pool replenishes towards
    pub min_connections: u32,
    /// How long a borrow waits on a saturated pool, in milliseconds
    pub max_wait_ms: u64,
    /// Keep-alive probe cadence in milliseconds
    pub keep_alive_interval_ms: u64,
    /// Idle time after which a connection is evicted, in milliseconds
    pub connection_idle_timeout_ms: u64,
    /// Transfer buffer size in bytes
    pub buffer_size: usize,
    /// Control channel encoding
    pub control_encoding: ControlEncoding,
    /// Default transfer mode applied after login
    pub transfer_mode: TransferMode,
    /// TLS posture
    pub tls_mode: TlsMode,
    /// TLS protocol allowlist handed to the TLS collaborator
    pub enabled_protocols: Vec<String>,
    /// TLS cipher-suite allowlist handed to the TLS collaborator
    pub enabled_cipher_suites: Vec<String>,
    /// Whether the TLS collaborator should validate the server certificate
    pub validate_server_certificate: bool,
    /// Optional trust store reference
    pub trust_store: Option<TrustStoreConfig>,
    /// Optional outbound proxy
    pub proxy: Option<ProxyConfig>,
    /// Retry policy for recoverable failures
    pub retry: RetryPolicy,
    /// Circuit breaker tuning
    pub breaker: CircuitBreakerSettings,
    /// Alert thresholds
    pub alert_thresholds: AlertThresholds,
    /// Ceiling on repair attempts before a connection is evicted
    pub max_repair_attempts: u32,
    /// Backoff between repair attempts on the same connection, in milliseconds
    pub repair_backoff_ms: u64,
    /// Optional logging configuration
    pub log_config: Option<LogConfig>,
}

impl fmt::Debug for PoolSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSettings")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("max_wait_ms", &self.max_wait_ms)
            .field("keep_alive_interval_ms", &self.keep_alive_interval_ms)
            .field(
                "connection_idle_timeout_ms",
                &self.connection_idle_timeout_ms,
            )
            .field("tls_mode", &self.tls_mode)
            .field("active_mode", &self.active_mode)
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 21,
            username: "anonymous".to_string(),
            password: String::new(),
            connect_timeout_ms: 30_000,
            data_timeout_ms: 30_000,
            control_timeout_ms: 10_000,
            active_mode: false,
            active_port_range: None,
            active_external_address: None,
            max_connections: 8,
            min_connections: 1,
            max_wait_ms: 5_000,
            keep_alive_interval_ms: 60_000,
            connection_idle_timeout_ms: 300_000,
            buffer_size: 64 * 1024,
            control_encoding: ControlEncoding::Utf8,
            transfer_mode: TransferMode::Binary,
            tls_mode: TlsMode::None,
            enabled_protocols: Vec::new(),
            enabled_cipher_suites: Vec::new(),
            validate_server_certificate: true,
            trust_store: None,
            proxy: None,
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerSettings::default(),
            alert_thresholds: AlertThresholds::default(),
            max_repair_attempts: 3,
            repair_backoff_ms: 5_000,
            log_config: None,
        }
    }
}

impl PoolSettings {
    /// Creates settings for the given endpoint
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            ..Default::default()
        }
    }

    /// Sets the login credentials
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Sets the pool capacities
    pub fn with_capacity(mut self, min_connections: u32, max_connections: u32) -> Self {
        self.min_connections = min_connections;
        self.max_connections = max_connections;
        self
    }

    /// Sets the saturated-borrow patience
    pub fn with_max_wait(mut self, max_wait_ms: u64) -> Self {
        self.max_wait_ms = max_wait_ms;
        self
    }

    /// Sets the connect, control, and data timeouts
    pub fn with_timeouts(mut self, connect_ms: u64, control_ms: u64, data_ms: u64) -> Self {
        self.connect_timeout_ms = connect_ms;
        self.control_timeout_ms = control_ms;
        self.data_timeout_ms = data_ms;
        self
    }

    /// Sets the keep-alive cadence and idle-eviction threshold
    pub fn with_keep_alive(mut self, interval_ms: u64, idle_timeout_ms: u64) -> Self {
        self.keep_alive_interval_ms = interval_ms;
        self.connection_idle_timeout_ms = idle_timeout_ms;
        self
    }

    /// Sets the TLS posture
    pub fn with_tls(mut self, mode: TlsMode) -> Self {
        self.tls_mode = mode;
        self
    }

    /// Sets the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the circuit breaker tuning
    pub fn with_breaker(mut self, breaker: CircuitBreakerSettings) -> Self {
        self.breaker = breaker;
        self
    }

    /// Sets the outbound proxy
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Sets the default transfer mode
    pub fn with_transfer_mode(mut self, mode: TransferMode) -> Self {
        self.transfer_mode = mode;
        self
    }

    /// Sets the logging configuration
    pub fn with_log_config(mut self, log_config: LogConfig) -> Self {
        self.log_config = Some(log_config);
        self
    }

    /// How long a connection may go unprobed before a sweep re-validates it
    ///
    /// `min(idle_timeout / 4, keep_alive_interval / 2)`.
    pub fn staleness_threshold_ms(&self) -> u64 {
        (self.connection_idle_timeout_ms / 4).min(self.keep_alive_interval_ms / 2)
    }

    /// Derived cadence of the health maintenance sweep
    ///
    /// The staleness threshold clamped to the 15 second floor, which
    /// keeps the worker from spinning on aggressive keep-alive settings.
    pub fn health_check_interval_ms(&self) -> u64 {
        self.staleness_threshold_ms().max(MAINTENANCE_FLOOR_MS)
    }

    /// Validates the settings, returning the first violation found
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(FtpPoolError::InvalidConfiguration {
                option: "hostname".to_string(),
                details: "hostname must not be empty".to_string(),
            });
        }
        if self.port == 0 {
            return Err(FtpPoolError::InvalidConfiguration {
                option: "port".to_string(),
                details: "port must be non-zero".to_string(),
            });
        }
        if self.username.is_empty() {
            return Err(FtpPoolError::InvalidConfiguration {
                option: "username".to_string(),
                details: "username must not be empty".to_string(),
            });
        }
        if self.min_connections > self.max_connections {
            return Err(FtpPoolError::InvalidConfiguration {
                option: "minConnections".to_string(),
                details: format!(
                    "minConnections ({}) must not exceed maxConnections ({})",
                    self.min_connections, self.max_connections
                ),
            });
        }
        if self.connection_idle_timeout_ms <= self.keep_alive_interval_ms {
            return Err(FtpPoolError::InvalidConfiguration {
                option: "connectionIdleTimeout".to_string(),
                details: format!(
                    "connectionIdleTimeout ({} ms) must exceed keepAliveInterval ({} ms)",
                    self.connection_idle_timeout_ms, self.keep_alive_interval_ms
                ),
            });
        }
        if self.buffer_size < MIN_BUFFER_SIZE || self.buffer_size > MAX_BUFFER_SIZE {
            return Err(FtpPoolError::InvalidConfiguration {
                option: "bufferSize".to_string(),
                details: format!(
                    "bufferSize ({}) must be between {} and {} bytes",
                    self.buffer_size, MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
                ),
            });
        }
        if let Some((start, end)) = self.active_port_range {
            if start == 0 || start > end {
                return Err(FtpPoolError::InvalidConfiguration {
                    option: "activePortRange".to_string(),
                    details: format!("invalid port range {}-{}", start, end),
                });
            }
        }
        if let Some(proxy) = &self.proxy {
            if proxy.host.is_empty() || proxy.port == 0 {
                return Err(FtpPoolError::InvalidConfiguration {
                    option: "proxyHost".to_string(),
                    details: "proxy host and port must be set".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Remote endpoint as `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}
