//! In-memory slot control and replication transport for driving a
//! `ReplicationSession` without a server.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::sync::CancellationToken;

use crate::error::{PgError, PgResult};
use crate::replication::envelope::{StatusUpdate, PRIMARY_KEEPALIVE_TAG, XLOG_DATA_TAG};
use crate::replication::transport::{RecvError, ReplicationTransport, WireMessage};
use crate::slot::SlotControl;

/// A mock slot controller that records create/drop calls.
#[derive(Clone, Default)]
pub struct MockControl {
    state: Arc<Mutex<ControlState>>,
}

#[derive(Default)]
struct ControlState {
    created: Vec<String>,
    dropped: Vec<String>,
    drop_attempts: u32,
    /// If set, create_slot fails with this error.
    create_error: Option<String>,
    /// Number of drop_slot calls that fail before one succeeds.
    drop_failures: u32,
}

impl MockControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller whose create_slot always fails.
    pub fn failing_create(error_message: impl Into<String>) -> Self {
        let control = Self::new();
        control.state.lock().unwrap().create_error = Some(error_message.into());
        control
    }

    /// Controller whose first `count` drop_slot calls fail.
    pub fn failing_drops(count: u32) -> Self {
        let control = Self::new();
        control.state.lock().unwrap().drop_failures = count;
        control
    }

    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn dropped(&self) -> Vec<String> {
        self.state.lock().unwrap().dropped.clone()
    }

    pub fn drop_attempts(&self) -> u32 {
        self.state.lock().unwrap().drop_attempts
    }
}

impl SlotControl for MockControl {
    fn create_slot(&self, name: &str, _plugin: &str) -> impl Future<Output = PgResult<()>> + Send {
        let state = self.state.clone();
        let name = name.to_string();
        async move {
            let mut state = state.lock().unwrap();

            if let Some(ref error) = state.create_error {
                return Err(PgError::SlotCreationFailed(error.clone()));
            }
            if state.created.contains(&name) && !state.dropped.contains(&name) {
                return Err(PgError::SlotCreationFailed(format!(
                    "replication slot \"{}\" already exists",
                    name
                )));
            }

            state.created.push(name);
            Ok(())
        }
    }

    fn drop_slot(&self, name: &str) -> impl Future<Output = PgResult<()>> + Send {
        let state = self.state.clone();
        let name = name.to_string();
        async move {
            let mut state = state.lock().unwrap();
            state.drop_attempts += 1;

            if state.drop_failures > 0 {
                state.drop_failures -= 1;
                return Err(PgError::SlotDropFailed(format!(
                    "replication slot \"{}\" is active",
                    name
                )));
            }
            if !state.created.contains(&name) {
                return Err(PgError::SlotNotFound(name));
            }

            state.dropped.push(name);
            Ok(())
        }
    }
}

/// A call made on the mock transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOp {
    Start { slot_name: String, start_lsn: u64 },
    Recv,
    Status(StatusUpdate),
    Close,
}

/// A scripted replication transport.
///
/// Each `recv` pops the next scripted result. A scripted `Timeout` waits out
/// the full receive timeout first, like a quiet server. Once the script is
/// exhausted the transport cancels the token given to `cancel_when_exhausted`
/// (if any) and keeps reporting timeouts.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

#[derive(Default)]
struct TransportState {
    script: VecDeque<Result<WireMessage, RecvError>>,
    ops: Vec<TransportOp>,
    start_error: Option<String>,
    status_error: Option<String>,
    on_exhausted: Option<CancellationToken>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that replays `script`, one entry per recv.
    pub fn scripted(script: impl IntoIterator<Item = Result<WireMessage, RecvError>>) -> Self {
        let transport = Self::new();
        transport.state.lock().unwrap().script = script.into_iter().collect();
        transport
    }

    /// Transport whose START_REPLICATION fails.
    pub fn failing_start(error_message: impl Into<String>) -> Self {
        let transport = Self::new();
        transport.state.lock().unwrap().start_error = Some(error_message.into());
        transport
    }

    /// Make every status update fail with `error_message`.
    pub fn fail_status_updates(&self, error_message: impl Into<String>) {
        self.state.lock().unwrap().status_error = Some(error_message.into());
    }

    /// Cancel `token` when the script runs out.
    pub fn cancel_when_exhausted(&self, token: CancellationToken) {
        self.state.lock().unwrap().on_exhausted = Some(token);
    }

    pub fn push(&self, entry: Result<WireMessage, RecvError>) {
        self.state.lock().unwrap().script.push_back(entry);
    }

    pub fn ops(&self) -> Vec<TransportOp> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn status_updates(&self) -> Vec<StatusUpdate> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                TransportOp::Status(update) => Some(update),
                _ => None,
            })
            .collect()
    }

    pub fn recv_count(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, TransportOp::Recv))
            .count()
    }
}

impl ReplicationTransport for MockTransport {
    fn start_replication(
        &mut self,
        slot_name: &str,
        start_lsn: u64,
        _plugin_options: &[(String, String)],
    ) -> impl Future<Output = PgResult<()>> + Send {
        let state = self.state.clone();
        let slot_name = slot_name.to_string();
        async move {
            let mut state = state.lock().unwrap();
            state.ops.push(TransportOp::Start {
                slot_name,
                start_lsn,
            });

            match state.start_error {
                Some(ref error) => Err(PgError::StartReplication(error.clone())),
                None => Ok(()),
            }
        }
    }

    fn recv(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<WireMessage, RecvError>> + Send {
        let state = self.state.clone();
        async move {
            let next = {
                let mut state = state.lock().unwrap();
                state.ops.push(TransportOp::Recv);
                let next = state.script.pop_front();
                if next.is_none() {
                    if let Some(token) = state.on_exhausted.as_ref() {
                        token.cancel();
                        return Err(RecvError::Timeout);
                    }
                }
                next
            };

            match next {
                Some(Err(RecvError::Timeout)) | None => {
                    tokio::time::sleep(timeout).await;
                    Err(RecvError::Timeout)
                }
                Some(result) => result,
            }
        }
    }

    fn send_status(&mut self, update: StatusUpdate) -> impl Future<Output = PgResult<()>> + Send {
        let state = self.state.clone();
        async move {
            let mut state = state.lock().unwrap();

            if let Some(ref error) = state.status_error {
                return Err(PgError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    error.clone(),
                )));
            }

            state.ops.push(TransportOp::Status(update));
            Ok(())
        }
    }

    fn close(&mut self) -> impl Future<Output = PgResult<()>> + Send {
        let state = self.state.clone();
        async move {
            state.lock().unwrap().ops.push(TransportOp::Close);
            Ok(())
        }
    }
}

/// XLogData CopyData payload carrying `payload` at `wal_start`.
pub fn xlog_data(wal_start: u64, payload: &[u8]) -> WireMessage {
    let mut buf = BytesMut::with_capacity(25 + payload.len());
    buf.put_u8(XLOG_DATA_TAG);
    buf.put_u64(wal_start);
    buf.put_u64(wal_start + payload.len() as u64);
    buf.put_i64(0);
    buf.put_slice(payload);
    WireMessage::CopyData(buf.freeze())
}

/// Primary keepalive CopyData payload.
pub fn keepalive(wal_end: u64, reply_requested: bool) -> WireMessage {
    let mut buf = BytesMut::with_capacity(18);
    buf.put_u8(PRIMARY_KEEPALIVE_TAG);
    buf.put_u64(wal_end);
    buf.put_i64(0);
    buf.put_u8(u8::from(reply_requested));
    WireMessage::CopyData(buf.freeze())
}

/// Raw CopyData payload.
pub fn raw(data: &'static [u8]) -> WireMessage {
    WireMessage::CopyData(Bytes::from_static(data))
}
