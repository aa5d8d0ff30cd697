//! FTP Connection Pool SDK
//!
//! A persistent, self-healing pool of FTP/FTPS control connections for
//! data-flow runtimes that perform file-transfer operations against one
//! remote server.
//!
//! # Features
//!
//! - Bounded borrow/return pool with FIFO fairness and min-idle replenishment
//! - Per-connection health tracking with background validation and repair
//! - Keep-alive probes against server idle timeouts
//! - Typed error taxonomy with reply-code classification
//! - Retry with exponential backoff, jitter, and named circuit breakers
//! - Metrics snapshots and threshold-based alerting
//!
//! # Example
//!
//! ```ignore
//! use ftp_pool_sdk::{FtpPoolService, PoolSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = PoolSettings::new("ftp.example.com", 21)
//!         .with_credentials("ingest", "secret")
//!         .with_capacity(2, 8);
//!
//!     let service = FtpPoolService::start(settings).await?;
//!
//!     let conn = service.borrow().await?;
//!     // ... drive file operations over the control channel ...
//!     service.give_back(conn).await;
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod alerts;
pub mod channel;
pub mod connection;
pub mod error;
pub mod factory;
pub mod health;
pub mod keepalive;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod recovery;
pub mod service;
pub mod types;

pub use alerts::{AlertCallback, AlertDetails, AlertLevel, AlertMonitor};
pub use channel::{AsyncStream, ControlChannel, Dialer, DirectDialer, TlsUpgrader};
pub use connection::{ConnectionSnapshot, ConnectionStore, FtpConnection};
pub use error::{classify_io, classify_reply, ErrorContext, FtpPoolError};
pub use factory::ConnectionFactory;
pub use health::{HealthCounts, HealthManager, HealthReportEntry, HealthStatus, ProbeOutcome};
pub use keepalive::{KeepAliveDriver, KeepAliveRecord, KeepAliveStats};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use pool::{FtpConnectionPool, PooledFtp};
pub use protocol::{Command, Reply};
pub use recovery::{BreakerState, CircuitBreaker, OperationKind, RecoveryAction, RecoveryExecutor};
pub use service::FtpPoolService;
pub use types::*;

/// Result type alias using FtpPoolError
pub type Result<T> = std::result::Result<T, FtpPoolError>;
