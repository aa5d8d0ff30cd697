//! Connection factory: dial, authenticate, and configure control channels
//!
//! `create` runs the ordered establishment ladder — dial, optional TLS,
//! greeting, optional `AUTH TLS`, login, post-login configuration — and
//! force-closes any partially opened transport on every failure path.
//! `close` is idempotent: a bounded graceful `QUIT`, then a forced
//! transport shutdown with errors swallowed and logged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::channel::{ControlChannel, Dialer, TlsUpgrader};
use crate::connection::FtpConnection;
use crate::error::{classify_reply, ErrorContext, FtpPoolError};
use crate::protocol::Command;
use crate::types::{ControlEncoding, PoolSettings, TlsMode};
use crate::Result;

/// Grace period for the `QUIT` exchange during close
const QUIT_GRACE: Duration = Duration::from_secs(2);

/// Builds and tears down authenticated control connections
pub struct ConnectionFactory {
    settings: Arc<PoolSettings>,
    dialer: Arc<dyn Dialer>,
    tls: Option<Arc<dyn TlsUpgrader>>,
    next_id: AtomicU64,
}

impl ConnectionFactory {
    /// Creates a factory over the given dialer and optional TLS collaborator
    pub fn new(
        settings: Arc<PoolSettings>,
        dialer: Arc<dyn Dialer>,
        tls: Option<Arc<dyn TlsUpgrader>>,
    ) -> Self {
        Self {
            settings,
            dialer,
            tls,
            next_id: AtomicU64::new(1),
        }
    }

    /// Dials and authenticates a brand-new connection
    pub async fn create(&self) -> Result<FtpConnection> {
        let channel = self.create_channel().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(connection_id = id, host = %self.settings.endpoint(), "connection established");
        Ok(FtpConnection::new(id, Arc::clone(&self.settings), channel))
    }

    /// Re-runs the establishment ladder for a repair, without assigning an id
    ///
    /// The caller rebinds the returned channel into the existing connection.
    pub async fn create_channel(&self) -> Result<ControlChannel> {
        // Step 1-2: dial (the host's dialer handles any proxy tunnel).
        let stream = self.dialer.dial(&self.settings).await?;
        let mut channel = ControlChannel::new(
            stream,
            self.settings.endpoint(),
            self.settings.control_timeout_ms,
        );

        match self.establish(&mut channel).await {
            Ok(()) => Ok(channel),
            Err(e) => {
                // Cleanup ladder: no partially opened transport survives a
                // failed step.
                channel.force_close().await;
                Err(e)
            }
        }
    }

    /// Steps 3-6 of the ladder, on an already dialed channel
    async fn establish(&self, channel: &mut ControlChannel) -> Result<()> {
        // Implicit TLS wraps the transport before the first byte.
        if self.settings.tls_mode == TlsMode::Implicit {
            self.upgrade_tls(channel).await?;
        }

        // Step 3: greeting.
        let greeting = channel.read_reply("greeting").await?;
        if greeting.is_failure() {
            let ctx = ErrorContext::new("greeting", self.settings.endpoint());
            return Err(classify_reply(greeting.code, &greeting.text(), &ctx));
        }

        // Step 4: explicit TLS negotiation.
        if self.settings.tls_mode == TlsMode::Explicit {
            channel.expect_success(&Command::AuthTls).await?;
            self.upgrade_tls(channel).await?;
        }

        // Step 5: login.
        self.authenticate(channel).await?;

        // Step 6: post-login settings.
        self.configure(channel).await?;

        Ok(())
    }

    async fn authenticate(&self, channel: &mut ControlChannel) -> Result<()> {
        let user = Command::User(self.settings.username.clone());
        let reply = channel.exec(&user).await?;

        if reply.is_positive_intermediate() {
            let pass = Command::Pass(self.settings.password.clone());
            let reply = channel.exec(&pass).await?;
            if reply.is_failure() {
                let ctx = ErrorContext::new("auth", self.settings.endpoint());
                return Err(classify_reply(reply.code, &reply.text(), &ctx));
            }
        } else if reply.is_failure() {
            let ctx = ErrorContext::new("auth", self.settings.endpoint());
            return Err(classify_reply(reply.code, &reply.text(), &ctx));
        }
        // A 2xx on USER means the server wants no password.

        tracing::debug!(user = %self.settings.username, "login accepted");
        Ok(())
    }

    async fn configure(&self, channel: &mut ControlChannel) -> Result<()> {
        let type_cmd = Command::Type(self.settings.transfer_mode.type_code());
        channel.expect_success(&type_cmd).await?;

        if self.settings.control_encoding == ControlEncoding::Utf8 {
            // Best effort: plenty of servers predate OPTS UTF8.
            match channel.exec(&Command::OptsUtf8On).await {
                Ok(reply) if reply.is_failure() => {
                    tracing::debug!(code = reply.code, "server declined OPTS UTF8 ON");
                }
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }

        // Active-mode parameters and data timeouts are session defaults the
        // transfer collaborators read from the connection's settings; there
        // is nothing to negotiate on the control channel here.
        Ok(())
    }

    async fn upgrade_tls(&self, channel: &mut ControlChannel) -> Result<()> {
        let tls = self.tls.as_ref().ok_or_else(|| FtpPoolError::InvalidConfiguration {
            option: "tlsMode".to_string(),
            details: "TLS mode configured but no TLS upgrader installed".to_string(),
        })?;

        let host = channel.host().to_string();
        let (dead_end, _) = tokio::io::duplex(1);
        let placeholder = ControlChannel::new(
            Box::new(dead_end),
            host.clone(),
            self.settings.control_timeout_ms,
        );
        let plain = std::mem::replace(channel, placeholder).into_inner();
        let upgraded = tls.upgrade(plain, &self.settings).await?;
        *channel = ControlChannel::new(upgraded, host, self.settings.control_timeout_ms);
        Ok(())
    }

    /// Closes a connection, first gracefully then by force
    ///
    /// Safe to call repeatedly; all errors are swallowed and logged.
    pub async fn close(&self, conn: &mut FtpConnection) {
        if conn.is_closed() {
            return;
        }
        conn.mark_closed();

        let id = conn.id();
        let channel = conn.channel_mut();
        match timeout(QUIT_GRACE, channel.exec(&Command::Quit)).await {
            Ok(Ok(reply)) => {
                tracing::debug!(connection_id = id, code = reply.code, "connection quit")
            }
            Ok(Err(e)) => {
                tracing::debug!(connection_id = id, error = %e, "graceful quit failed")
            }
            Err(_) => tracing::debug!(connection_id = id, "graceful quit timed out"),
        }
        channel.force_close().await;
    }
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("endpoint", &self.settings.endpoint())
            .field("tls_mode", &self.settings.tls_mode)
            .finish()
    }
}
