//! Pooled connection record and the store capability
//!
//! An [`FtpConnection`] is the pooled resource: one authenticated control
//! channel plus its bookkeeping. The object is never shared — it moves
//! between exactly one owner at a time (idle queue, borrower, health
//! manager, or factory), and that transfer of ownership is the
//! synchronization point.
//!
//! [`ConnectionStore`] is the narrow capability the pool hands to the
//! health manager and keep-alive driver so they can inspect and service
//! idle connections without holding a reference back to the pool itself.

use std::fmt;
use std::sync::Arc;

use crate::channel::ControlChannel;
use crate::types::{now_millis, ConnectionId, PoolSettings, Timestamp};

/// One authenticated FTP control connection
pub struct FtpConnection {
    id: ConnectionId,
    settings: Arc<PoolSettings>,
    channel: ControlChannel,
    created_at: Timestamp,
    last_used_at: Timestamp,
    last_tested_at: Timestamp,
    working_dir: String,
    reconnect_attempts: u32,
    last_error: Option<String>,
    closed: bool,
}

impl FtpConnection {
    /// Wraps a freshly authenticated channel
    pub(crate) fn new(
        id: ConnectionId,
        settings: Arc<PoolSettings>,
        channel: ControlChannel,
    ) -> Self {
        let now = now_millis();
        Self {
            id,
            settings,
            channel,
            created_at: now,
            last_used_at: now,
            last_tested_at: now,
            working_dir: "/".to_string(),
            reconnect_attempts: 0,
            last_error: None,
            closed: false,
        }
    }

    /// Stable identifier, preserved across repairs
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The pool settings this connection was built from
    pub fn settings(&self) -> &Arc<PoolSettings> {
        &self.settings
    }

    /// Mutable access to the control channel
    pub fn channel_mut(&mut self) -> &mut ControlChannel {
        &mut self.channel
    }

    /// Creation timestamp (epoch millis)
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Last borrow/return activity timestamp (epoch millis)
    pub fn last_used_at(&self) -> Timestamp {
        self.last_used_at
    }

    /// Last liveness probe timestamp (epoch millis)
    pub fn last_tested_at(&self) -> Timestamp {
        self.last_tested_at
    }

    /// Current remote working directory
    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    /// Records a working directory change made by a borrower
    pub fn set_working_dir(&mut self, dir: impl Into<String>) {
        self.working_dir = dir.into();
    }

    /// Number of consecutive failed reconnect attempts
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Message of the most recent failure on this connection
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Whether the channel has been closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Stamps borrow/return activity
    pub(crate) fn touch_used(&mut self) {
        self.last_used_at = now_millis();
    }

    /// Stamps a completed liveness probe
    pub(crate) fn touch_tested(&mut self) {
        self.last_tested_at = now_millis();
    }

    /// Records a failure message
    pub(crate) fn note_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    pub(crate) fn bump_reconnect_attempts(&mut self) {
        self.reconnect_attempts += 1;
    }

    /// Swaps in a freshly authenticated channel after a repair
    ///
    /// The id is preserved; the session state (working directory, error,
    /// reconnect counter) resets because the remote session is new.
    pub(crate) fn rebind(&mut self, channel: ControlChannel) {
        self.channel = channel;
        self.working_dir = "/".to_string();
        self.reconnect_attempts = 0;
        self.last_error = None;
        self.closed = false;
        let now = now_millis();
        self.last_tested_at = now;
        self.last_used_at = now;
    }

    /// Milliseconds since the last borrow/return activity
    pub fn idle_millis(&self) -> u64 {
        (now_millis() - self.last_used_at).max(0) as u64
    }

    /// Milliseconds since the last liveness probe
    pub fn untested_millis(&self) -> u64 {
        (now_millis() - self.last_tested_at).max(0) as u64
    }

    /// Point-in-time copy of the bookkeeping fields
    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            last_tested_at: self.last_tested_at,
            working_dir: self.working_dir.clone(),
            reconnect_attempts: self.reconnect_attempts,
            last_error: self.last_error.clone(),
        }
    }
}

impl fmt::Debug for FtpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpConnection")
            .field("id", &self.id)
            .field("host", &self.channel.host())
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Point-in-time bookkeeping view of one connection
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    /// Connection identifier
    pub id: ConnectionId,
    /// Creation timestamp (epoch millis)
    pub created_at: Timestamp,
    /// Last borrow/return activity (epoch millis)
    pub last_used_at: Timestamp,
    /// Last liveness probe (epoch millis)
    pub last_tested_at: Timestamp,
    /// Remote working directory
    pub working_dir: String,
    /// Consecutive failed reconnect attempts
    pub reconnect_attempts: u32,
    /// Most recent failure message
    pub last_error: Option<String>,
}

/// Narrow pool capability handed to the health manager and keep-alive driver
///
/// Exposes just enough to service idle connections: list them, take one
/// out for a probe (gaining exclusive ownership), hand it back, or report
/// it gone after an eviction. Borrowed connections are invisible here —
/// their owner is responsible for them.
pub trait ConnectionStore: Send + Sync {
    /// Snapshots of every idle connection
    fn idle_snapshots(&self) -> Vec<ConnectionSnapshot>;

    /// Removes the given idle connection from the queue, if still idle
    fn take_idle(&self, id: ConnectionId) -> Option<FtpConnection>;

    /// Returns a previously taken connection to the idle queue
    ///
    /// The store may hand it directly to a queued borrower instead.
    fn restore_idle(&self, conn: FtpConnection);

    /// Records that a taken connection was destroyed instead of restored
    ///
    /// Adjusts capacity accounting and schedules min-idle replenishment.
    fn forget(&self, id: ConnectionId);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ControlChannel;

    fn test_connection(id: ConnectionId) -> FtpConnection {
        let (client, _server) = tokio::io::duplex(64);
        let settings = Arc::new(PoolSettings::default());
        let channel = ControlChannel::new(Box::new(client), settings.endpoint(), 1000);
        FtpConnection::new(id, settings, channel)
    }

    #[tokio::test]
    async fn test_new_connection_bookkeeping() {
        let conn = test_connection(7);
        assert_eq!(conn.id(), 7);
        assert_eq!(conn.working_dir(), "/");
        assert_eq!(conn.reconnect_attempts(), 0);
        assert!(conn.last_error().is_none());
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_rebind_preserves_id_and_resets_session_state() {
        let mut conn = test_connection(3);
        conn.set_working_dir("/incoming");
        conn.note_error("probe failed");
        conn.bump_reconnect_attempts();
        conn.bump_reconnect_attempts();
        assert_eq!(conn.reconnect_attempts(), 2);

        let (client, _server) = tokio::io::duplex(64);
        let channel = ControlChannel::new(Box::new(client), "test:21", 1000);
        conn.rebind(channel);

        assert_eq!(conn.id(), 3);
        assert_eq!(conn.working_dir(), "/");
        assert_eq!(conn.reconnect_attempts(), 0);
        assert!(conn.last_error().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_reflects_state() {
        let mut conn = test_connection(11);
        conn.note_error("timed out");
        let snapshot = conn.snapshot();
        assert_eq!(snapshot.id, 11);
        assert_eq!(snapshot.last_error.as_deref(), Some("timed out"));
        assert_eq!(snapshot.working_dir, "/");
    }

    #[tokio::test]
    async fn test_debug_output_omits_nothing_sensitive() {
        let conn = test_connection(1);
        let rendered = format!("{:?}", conn);
        assert!(rendered.contains("FtpConnection"));
        assert!(rendered.contains("id: 1"));
    }
}
