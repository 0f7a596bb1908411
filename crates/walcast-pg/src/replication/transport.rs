use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use super::envelope::StatusUpdate;
use crate::error::PgResult;

/// A message received on a replication connection in streaming mode.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// CopyData payload (XLogData or primary keepalive, still enveloped).
    CopyData(Bytes),
    /// Anything else (notices, parameter status); ignored by the session.
    Other,
}

/// Why a bounded receive returned without a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecvError {
    /// No message arrived within the wait window.
    #[error("receive timed out")]
    Timeout,
    /// The session is dead: connection closed, server error, copy ended.
    #[error("fatal: {0}")]
    Fatal(String),
    /// A transient failure worth retrying.
    #[error("transient: {0}")]
    Transient(String),
}

impl RecvError {
    /// Classify an I/O failure from the socket.
    pub fn from_io(e: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => RecvError::Timeout,
            ErrorKind::Interrupted => RecvError::Transient(e.to_string()),
            _ => RecvError::Fatal(e.to_string()),
        }
    }
}

/// Replication plane of one session: start the stream, receive messages
/// with a bounded wait, send status updates.
pub trait ReplicationTransport: Send {
    /// Issue START_REPLICATION and switch to streaming mode.
    fn start_replication(
        &mut self,
        slot_name: &str,
        start_lsn: u64,
        plugin_options: &[(String, String)],
    ) -> impl Future<Output = PgResult<()>> + Send;

    /// Wait at most `timeout` for the next message.
    fn recv(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<WireMessage, RecvError>> + Send;

    /// Send a standby status update.
    fn send_status(&mut self, update: StatusUpdate) -> impl Future<Output = PgResult<()>> + Send;

    /// End the stream and close the connection.
    fn close(&mut self) -> impl Future<Output = PgResult<()>> + Send;
}
