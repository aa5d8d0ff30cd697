//! Error types and failure classification for the FTP connection pool SDK
//!
//! This module defines the full error taxonomy for pool, transport, and
//! protocol failures, together with the classifier that maps raw FTP reply
//! codes and I/O errors onto it. Classification is a pure function: the
//! same input always yields the same kind.

use std::io;
use thiserror::Error;

use crate::types::ConnectionId;

/// The main error type for the FTP connection pool SDK
///
/// Covers transport failures, protocol-level negative replies, semantic
/// file-system errors reported by the server, and pool lifecycle errors.
#[derive(Error, Debug, Clone)]
pub enum FtpPoolError {
    // Transport errors
    /// Generic connection failure (DNS, routing, unexpected socket error)
    #[error("Connection error to {host}: {details}")]
    ConnectionError {
        /// The remote endpoint
        host: String,
        /// Details of the underlying failure
        details: String,
    },

    /// Connection or reply wait timed out
    #[error("Connection timeout to {host} after {timeout_ms}ms")]
    ConnectionTimeout {
        /// The remote endpoint
        host: String,
        /// The timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// The control channel was closed or reset by the peer
    #[error("Connection closed: {details}")]
    ConnectionClosed {
        /// The affected connection, when known
        connection_id: Option<ConnectionId>,
        /// Details of the close
        details: String,
    },

    /// The server refused the TCP connection
    #[error("Connection refused by {host}")]
    ConnectionRefused {
        /// The remote endpoint
        host: String,
    },

    // Authentication errors
    /// Login rejected by the server
    #[error("Authentication failed: {reason}")]
    AuthenticationError {
        /// Reason reported by the server
        reason: String,
    },

    /// Credentials rejected as invalid
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Operation denied for the authenticated user
    #[error("Insufficient permissions for {path}")]
    InsufficientPermissions {
        /// The path that was denied
        path: String,
    },

    // File system errors
    /// Remote file does not exist or is unavailable
    #[error("File not found: {path}")]
    FileNotFound {
        /// The missing path
        path: String,
    },

    /// Remote file already exists
    #[error("File already exists: {path}")]
    FileAlreadyExists {
        /// The conflicting path
        path: String,
    },

    /// Remote directory does not exist
    #[error("Directory not found: {path}")]
    DirectoryNotFound {
        /// The missing directory
        path: String,
    },

    /// Remote directory is not empty
    #[error("Directory not empty: {path}")]
    DirectoryNotEmpty {
        /// The non-empty directory
        path: String,
    },

    /// Path rejected by the server
    #[error("Invalid path: {path}")]
    InvalidPath {
        /// The rejected path
        path: String,
    },

    // Transfer errors
    /// Transfer failed with a transient server condition
    #[error("Transfer error{}: {details}", fmt_path(.path))]
    TransferError {
        /// The affected path, when known
        path: Option<String>,
        /// Details reported by the server
        details: String,
    },

    /// Transfer aborted by the server or client
    #[error("Transfer aborted{}", fmt_path(.path))]
    TransferAborted {
        /// The affected path, when known
        path: Option<String>,
    },

    /// Transfer exceeded its deadline
    #[error("Transfer timed out after {timeout_ms}ms{}", fmt_path(.path))]
    TransferTimeout {
        /// The affected path, when known
        path: Option<String>,
        /// The timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// Server reported exhausted storage
    #[error("Insufficient storage on server{}", fmt_path(.path))]
    InsufficientStorage {
        /// The affected path, when known
        path: Option<String>,
    },

    /// Data channel could not be opened
    #[error("Data connection error: {details}")]
    DataConnectionError {
        /// Details of the failure
        details: String,
    },

    /// Data channel establishment timed out
    #[error("Data connection timed out after {timeout_ms}ms")]
    DataConnectionTimeout {
        /// The timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    // Protocol errors
    /// Uncategorized negative completion from the server
    #[error("Server error (reply {reply_code}): {message}")]
    ServerError {
        /// The FTP reply code
        reply_code: u32,
        /// The reply text
        message: String,
    },

    /// Server does not implement the command
    #[error("Command not supported: {command}")]
    CommandNotSupported {
        /// The rejected command verb
        command: String,
    },

    /// Commands issued in an order the server rejects
    #[error("Invalid command sequence: {details}")]
    InvalidSequence {
        /// Details reported by the server
        details: String,
    },

    /// Client-side protocol violation
    #[error("Client error: {details}")]
    ClientError {
        /// Details of the violation
        details: String,
    },

    /// Configuration value rejected
    #[error("Invalid configuration for '{option}': {details}")]
    InvalidConfiguration {
        /// The offending option name
        option: String,
        /// Why the value was rejected
        details: String,
    },

    // Pool errors
    /// Borrow timed out on a saturated pool
    #[error("Connection pool exhausted ({max_connections} connections) after waiting {wait_ms}ms")]
    PoolExhausted {
        /// The configured capacity
        max_connections: u32,
        /// How long the borrower waited, in milliseconds
        wait_ms: u64,
    },

    /// Internal pool bookkeeping failure
    #[error("Pool error: {details}")]
    PoolError {
        /// Details of the failure
        details: String,
    },

    /// Operation attempted on a shut-down pool
    #[error("Connection pool is closed")]
    PoolClosed,

    /// No healthy connection could be selected within the bounded retry
    #[error("No healthy connection available")]
    NoHealthyConnection,

    /// Circuit breaker rejected the operation without touching the network
    #[error("Circuit breaker '{breaker}' is open")]
    CircuitOpen {
        /// The breaker that rejected the call
        breaker: String,
    },

    /// Failure that matched no classification rule
    #[error("Unexpected error: {details}")]
    UnexpectedError {
        /// Details of the failure
        details: String,
    },

    /// Liveness probe failed
    #[error("Validation failed: {details}")]
    ValidationError {
        /// Details of the probe failure
        details: String,
    },
}

// Display helper for optional path context.
pub(crate) fn fmt_path(path: &Option<String>) -> String {
    match path {
        Some(p) => format!(" for {}", p),
        None => String::new(),
    }
}

impl FtpPoolError {
    /// Returns true if a bounded automatic retry is appropriate
    ///
    /// The flag is fixed per kind; `ServerError` derives it from the reply
    /// code class (4xx transient, 5xx permanent).
    pub fn is_recoverable(&self) -> bool {
        match self {
            FtpPoolError::ConnectionError { .. }
            | FtpPoolError::ConnectionTimeout { .. }
            | FtpPoolError::ConnectionClosed { .. }
            | FtpPoolError::ConnectionRefused { .. }
            | FtpPoolError::TransferError { .. }
            | FtpPoolError::TransferAborted { .. }
            | FtpPoolError::TransferTimeout { .. }
            | FtpPoolError::DataConnectionError { .. }
            | FtpPoolError::DataConnectionTimeout { .. }
            | FtpPoolError::InvalidSequence { .. } => true,
            FtpPoolError::ServerError { reply_code, .. } => *reply_code < 500,
            _ => false,
        }
    }

    /// Returns true if this error concerns the transport layer
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            FtpPoolError::ConnectionError { .. }
                | FtpPoolError::ConnectionTimeout { .. }
                | FtpPoolError::ConnectionClosed { .. }
                | FtpPoolError::ConnectionRefused { .. }
        )
    }

    /// Returns true if this error concerns authentication
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            FtpPoolError::AuthenticationError { .. } | FtpPoolError::InvalidCredentials
        )
    }

    /// Returns true if this error reflects pool state rather than the server
    pub fn is_pool_error(&self) -> bool {
        matches!(
            self,
            FtpPoolError::PoolExhausted { .. }
                | FtpPoolError::PoolError { .. }
                | FtpPoolError::PoolClosed
                | FtpPoolError::NoHealthyConnection
                | FtpPoolError::CircuitOpen { .. }
        )
    }

    /// Stable name of the error kind, used for counters and alert details
    pub fn kind_name(&self) -> &'static str {
        match self {
            FtpPoolError::ConnectionError { .. } => "ConnectionError",
            FtpPoolError::ConnectionTimeout { .. } => "ConnectionTimeout",
            FtpPoolError::ConnectionClosed { .. } => "ConnectionClosed",
            FtpPoolError::ConnectionRefused { .. } => "ConnectionRefused",
            FtpPoolError::AuthenticationError { .. } => "AuthenticationError",
            FtpPoolError::InvalidCredentials => "InvalidCredentials",
            FtpPoolError::InsufficientPermissions { .. } => "InsufficientPermissions",
            FtpPoolError::FileNotFound { .. } => "FileNotFound",
            FtpPoolError::FileAlreadyExists { .. } => "FileAlreadyExists",
            FtpPoolError::DirectoryNotFound { .. } => "DirectoryNotFound",
            FtpPoolError::DirectoryNotEmpty { .. } => "DirectoryNotEmpty",
            FtpPoolError::InvalidPath { .. } => "InvalidPath",
            FtpPoolError::TransferError { .. } => "TransferError",
            FtpPoolError::TransferAborted { .. } => "TransferAborted",
            FtpPoolError::TransferTimeout { .. } => "TransferTimeout",
            FtpPoolError::InsufficientStorage { .. } => "InsufficientStorage",
            FtpPoolError::DataConnectionError { .. } => "DataConnectionError",
            FtpPoolError::DataConnectionTimeout { .. } => "DataConnectionTimeout",
            FtpPoolError::ServerError { .. } => "ServerError",
            FtpPoolError::CommandNotSupported { .. } => "CommandNotSupported",
            FtpPoolError::InvalidSequence { .. } => "InvalidSequence",
            FtpPoolError::ClientError { .. } => "ClientError",
            FtpPoolError::InvalidConfiguration { .. } => "InvalidConfiguration",
            FtpPoolError::PoolExhausted { .. } => "PoolExhausted",
            FtpPoolError::PoolError { .. } => "PoolError",
            FtpPoolError::PoolClosed => "PoolClosed",
            FtpPoolError::NoHealthyConnection => "NoHealthyConnection",
            FtpPoolError::CircuitOpen { .. } => "CircuitOpen",
            FtpPoolError::UnexpectedError { .. } => "UnexpectedError",
            FtpPoolError::ValidationError { .. } => "ValidationError",
        }
    }
}

/// Context attached to a classification
///
/// Names the operation and resources involved so that classified errors
/// carry actionable detail without exposing secrets.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// The operation being performed, e.g. `auth` or `validate`
    pub operation: String,
    /// The affected remote path, when applicable
    pub path: Option<String>,
    /// The remote endpoint
    pub host: String,
    /// The affected connection, when known
    pub connection_id: Option<ConnectionId>,
}

impl ErrorContext {
    /// Creates a context for the given operation and endpoint
    pub fn new(operation: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            host: host.into(),
            path: None,
            connection_id: None,
        }
    }

    /// Attaches a remote path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attaches a connection id
    pub fn with_connection(mut self, id: ConnectionId) -> Self {
        self.connection_id = Some(id);
        self
    }

    fn path_or(&self, fallback: &str) -> String {
        self.path.clone().unwrap_or_else(|| fallback.to_string())
    }
}

/// Classifies an FTP negative reply into the error taxonomy
///
/// The mapping is fixed; the first matching rule wins. 2xx/3xx codes are
/// not failures and classify as `UnexpectedError` if passed in.
pub fn classify_reply(reply_code: u32, text: &str, ctx: &ErrorContext) -> FtpPoolError {
    match reply_code {
        421 => FtpPoolError::ConnectionClosed {
            connection_id: ctx.connection_id,
            details: format!("service closing control connection: {}", text),
        },
        425 => FtpPoolError::DataConnectionError {
            details: text.to_string(),
        },
        426 => FtpPoolError::TransferAborted {
            path: ctx.path.clone(),
        },
        430 => FtpPoolError::InvalidCredentials,
        450 | 550 => FtpPoolError::FileNotFound {
            path: ctx.path_or("<unknown>"),
        },
        451 => FtpPoolError::TransferError {
            path: ctx.path.clone(),
            details: text.to_string(),
        },
        452 | 552 => FtpPoolError::InsufficientStorage {
            path: ctx.path.clone(),
        },
        501 => FtpPoolError::InvalidConfiguration {
            option: ctx.operation.clone(),
            details: text.to_string(),
        },
        502 | 504 => FtpPoolError::CommandNotSupported {
            command: ctx.operation.clone(),
        },
        503 => FtpPoolError::InvalidSequence {
            details: text.to_string(),
        },
        530 | 532 => FtpPoolError::AuthenticationError {
            reason: text.to_string(),
        },
        551 | 553 => FtpPoolError::InvalidPath {
            path: ctx.path_or("<unknown>"),
        },
        code @ 400..=599 => FtpPoolError::ServerError {
            reply_code: code,
            message: text.to_string(),
        },
        code => FtpPoolError::UnexpectedError {
            details: format!(
                "reply {} in operation '{}': {}",
                code, ctx.operation, text
            ),
        },
    }
}

/// Classifies a transport-level I/O error into the error taxonomy
pub fn classify_io(err: &io::Error, ctx: &ErrorContext) -> FtpPoolError {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => FtpPoolError::ConnectionClosed {
            connection_id: ctx.connection_id,
            details: format!("{} during {}", err, ctx.operation),
        },
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FtpPoolError::ConnectionTimeout {
            host: ctx.host.clone(),
            timeout_ms: 0,
        },
        io::ErrorKind::ConnectionRefused => FtpPoolError::ConnectionRefused {
            host: ctx.host.clone(),
        },
        io::ErrorKind::NotFound | io::ErrorKind::AddrNotAvailable => FtpPoolError::ConnectionError {
            host: ctx.host.clone(),
            details: format!("address resolution failed: {}", err),
        },
        _ => FtpPoolError::ConnectionError {
            host: ctx.host.clone(),
            details: format!("{} during {}", err, ctx.operation),
        },
    }
}


// Property-Based Tests
#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    // Classification is a pure function: same input, same kind.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_classifier_is_deterministic(
            code in 100u32..=699u32,
            text in "[ -~]{0,40}",
        ) {
            let ctx = ErrorContext::new("op", "host:21");
            let a = classify_reply(code, &text, &ctx);
            let b = classify_reply(code, &text, &ctx);
            prop_assert_eq!(a.kind_name(), b.kind_name());
            prop_assert_eq!(a.is_recoverable(), b.is_recoverable());
        }
    }

    // Every 4xx/5xx reply classifies into a non-Unexpected kind.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_negative_replies_are_always_classified(code in 400u32..=599u32) {
            let ctx = ErrorContext::new("op", "host:21");
            let err = classify_reply(code, "negative", &ctx);
            prop_assert_ne!(err.kind_name(), "UnexpectedError");
        }
    }

    // 4xx transient codes never classify as non-recoverable ServerError,
    // and 5xx never as recoverable ServerError.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_server_error_recoverability_follows_class(code in 400u32..=599u32) {
            let ctx = ErrorContext::new("op", "host:21");
            if let FtpPoolError::ServerError { reply_code, .. } =
                classify_reply(code, "negative", &ctx)
            {
                let err = classify_reply(code, "negative", &ctx);
                prop_assert_eq!(err.is_recoverable(), reply_code < 500);
            }
        }
    }
}
