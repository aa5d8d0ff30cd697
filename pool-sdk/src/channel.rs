//! Transport layer for one FTP control channel
//!
//! A [`ControlChannel`] couples a buffered byte stream with the command/
//! reply codec and the configured control timeout. The stream itself is
//! produced through two collaborator seams: [`Dialer`] (TCP, or the host's
//! proxy tunnel) and [`TlsUpgrader`] (the host's TLS stack, fed by its
//! trust-store loader). The pool ships only the direct TCP dialer.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{classify_io, classify_reply, ErrorContext, FtpPoolError};
use crate::protocol::{read_reply, write_command, Command, Reply};
use crate::types::PoolSettings;
use crate::Result;

/// Byte stream a control channel can run over
///
/// Implemented by plain TCP sockets and by whatever the TLS collaborator
/// returns from an upgrade.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Opens the raw byte stream for a new control channel
///
/// Hosts that route through a SOCKS or HTTP proxy provide their own
/// implementation honoring [`PoolSettings::proxy`]; the default
/// [`DirectDialer`] connects straight to the configured endpoint.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dials the remote endpoint within the connect timeout
    async fn dial(&self, settings: &PoolSettings) -> Result<Box<dyn AsyncStream>>;
}

/// Direct TCP dialer used when no proxy collaborator is installed
#[derive(Debug, Default)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, settings: &PoolSettings) -> Result<Box<dyn AsyncStream>> {
        if settings.proxy.is_some() {
            return Err(FtpPoolError::InvalidConfiguration {
                option: "proxyType".to_string(),
                details: "proxy configured but no proxy-capable dialer installed".to_string(),
            });
        }

        let endpoint = settings.endpoint();
        let ctx = ErrorContext::new("dial", endpoint.clone());
        let stream = timeout(
            Duration::from_millis(settings.connect_timeout_ms),
            TcpStream::connect(&endpoint),
        )
        .await
        .map_err(|_| FtpPoolError::ConnectionTimeout {
            host: endpoint.clone(),
            timeout_ms: settings.connect_timeout_ms,
        })?
        .map_err(|e| classify_io(&e, &ctx))?;

        // Control channels are chatty; disable Nagle.
        stream.set_nodelay(true).map_err(|e| classify_io(&e, &ctx))?;

        Ok(Box::new(stream))
    }
}

/// Wraps an established stream in TLS
///
/// The host wires its TLS stack (protocol/cipher allowlists, trust store,
/// certificate validation) behind this seam. Configuring a TLS mode
/// without installing an upgrader fails connection creation with
/// `InvalidConfiguration`.
#[async_trait]
pub trait TlsUpgrader: Send + Sync {
    /// Performs the TLS handshake over the given stream
    async fn upgrade(
        &self,
        stream: Box<dyn AsyncStream>,
        settings: &PoolSettings,
    ) -> Result<Box<dyn AsyncStream>>;
}

/// One buffered FTP control channel
pub struct ControlChannel {
    stream: BufStream<Box<dyn AsyncStream>>,
    host: String,
    control_timeout: Duration,
}

impl ControlChannel {
    /// Wraps a freshly opened stream
    pub fn new(stream: Box<dyn AsyncStream>, host: impl Into<String>, control_timeout_ms: u64) -> Self {
        Self {
            stream: BufStream::new(stream),
            host: host.into(),
            control_timeout: Duration::from_millis(control_timeout_ms),
        }
    }

    /// The remote endpoint this channel talks to
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Unwraps the underlying stream, e.g. for a TLS upgrade
    ///
    /// Any buffered but unread bytes are discarded; callers only do this
    /// at protocol points where the line is quiet.
    pub fn into_inner(self) -> Box<dyn AsyncStream> {
        self.stream.into_inner()
    }

    /// Reads one reply within the control timeout
    pub async fn read_reply(&mut self, operation: &str) -> Result<Reply> {
        let ctx = ErrorContext::new(operation, self.host.clone());
        match timeout(self.control_timeout, read_reply(&mut self.stream)).await {
            Ok(Ok(reply)) => {
                tracing::trace!(code = reply.code, operation, "reply received");
                Ok(reply)
            }
            Ok(Err(e)) => Err(classify_io(&e, &ctx)),
            Err(_) => Err(FtpPoolError::ConnectionTimeout {
                host: self.host.clone(),
                timeout_ms: self.control_timeout.as_millis() as u64,
            }),
        }
    }

    /// Sends a command and reads its reply, without judging the outcome
    pub async fn exec(&mut self, command: &Command) -> Result<Reply> {
        let ctx = ErrorContext::new(command.verb(), self.host.clone());
        tracing::trace!(command = %command.redacted(), "sending command");

        match timeout(self.control_timeout, write_command(&mut self.stream, command)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(classify_io(&e, &ctx)),
            Err(_) => {
                return Err(FtpPoolError::ConnectionTimeout {
                    host: self.host.clone(),
                    timeout_ms: self.control_timeout.as_millis() as u64,
                })
            }
        }

        self.read_reply(command.verb()).await
    }

    /// Sends a command and classifies any negative reply into an error
    pub async fn expect_success(&mut self, command: &Command) -> Result<Reply> {
        let reply = self.exec(command).await?;
        if reply.is_failure() {
            let ctx = ErrorContext::new(command.verb(), self.host.clone());
            return Err(classify_reply(reply.code, &reply.text(), &ctx));
        }
        Ok(reply)
    }

    /// Force-closes the underlying transport, swallowing errors
    pub async fn force_close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(host = %self.host, error = %e, "transport shutdown failed");
        }
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("host", &self.host)
            .field("control_timeout", &self.control_timeout)
            .finish()
    }
}
