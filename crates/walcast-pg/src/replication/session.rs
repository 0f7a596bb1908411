//! The replication session: slot lifecycle, keepalive scheduling and the
//! bounded-wait receive loop.
//!
//! A session creates its slot, starts streaming, and loops until it is
//! cancelled or the stream dies. Whatever the exit path, once the slot exists
//! the session closes the connection and drops the slot before returning.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walcast_core::{
    format_lsn, Checkpoint, CheckpointStore, Dispatcher, KeepaliveScheduler, StreamSettings,
};

use super::decoder::{Decoded, WalDecoder};
use super::envelope::StatusUpdate;
use super::transport::{RecvError, ReplicationTransport, WireMessage};
use crate::error::{PgError, PgResult};
use crate::slot::{generate_slot_name, validate_slot_name, SlotControl};

const SLOT_DROP_ATTEMPTS: u32 = 3;
const SLOT_DROP_BACKOFF: Duration = Duration::from_millis(250);

/// Counters and positions reported when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub slot_name: String,
    /// CopyData messages received.
    pub messages: u64,
    /// Events delivered to the sink.
    pub events: u64,
    /// Events the sink dropped under backpressure.
    pub dropped: u64,
    /// Messages that could not be decoded.
    pub skipped: u64,
    pub status_updates: u64,
    /// Highest position acknowledged as flushed. Unless dropped events are
    /// acknowledged, this stops before the first message that lost events.
    pub flushed_lsn: u64,
}

/// Cursor and counters of a running session.
#[derive(Debug)]
struct StreamState {
    summary: SessionSummary,
    start_lsn: u64,
    received_lsn: u64,
    checkpointed_lsn: u64,
    /// Events dispatched by earlier runs, carried in the checkpoint.
    prior_events: u64,
    /// Set once a message lost events; the flushed position stays put.
    flush_held: bool,
}

impl StreamState {
    fn new(slot_name: String, start_lsn: u64, prior_events: u64) -> Self {
        Self {
            summary: SessionSummary {
                slot_name,
                flushed_lsn: start_lsn,
                ..Default::default()
            },
            start_lsn,
            received_lsn: start_lsn,
            checkpointed_lsn: start_lsn,
            prior_events,
            flush_held: false,
        }
    }

    fn observe(&mut self, lsn: u64) {
        self.received_lsn = self.received_lsn.max(lsn);
    }

    fn status(&self, reply_requested: bool) -> StatusUpdate {
        StatusUpdate {
            write_lsn: self.received_lsn,
            flush_lsn: self.summary.flushed_lsn,
            apply_lsn: self.summary.flushed_lsn,
            reply_requested,
        }
    }
}

/// One replication session over a control connection `C` and a replication
/// transport `T`.
pub struct ReplicationSession<C, T> {
    settings: StreamSettings,
    control: C,
    transport: T,
    dispatcher: Dispatcher,
    checkpoint: Option<CheckpointStore>,
}

impl<C: SlotControl, T: ReplicationTransport> ReplicationSession<C, T> {
    pub fn new(settings: StreamSettings, control: C, transport: T, dispatcher: Dispatcher) -> Self {
        Self {
            settings,
            control,
            transport,
            dispatcher,
            checkpoint: None,
        }
    }

    /// Persist the flushed position to `store` and resume from it.
    pub fn with_checkpoint(mut self, store: CheckpointStore) -> Self {
        self.checkpoint = Some(store);
        self
    }

    /// Run until `cancel` fires or the stream fails.
    ///
    /// Cancellation is a normal stop and returns `Ok`. Errors are returned only
    /// after the slot has been released.
    pub async fn run(mut self, cancel: CancellationToken) -> PgResult<SessionSummary> {
        let slot_name = match &self.settings.slot_name {
            Some(name) => name.clone(),
            None => generate_slot_name(&self.settings.slot_prefix),
        };
        validate_slot_name(&slot_name)?;

        let (start_lsn, prior_events) = self.resume_position()?;

        self.control
            .create_slot(&slot_name, &self.settings.plugin)
            .await?;
        info!(slot = %slot_name, plugin = %self.settings.plugin, "Replication slot created");

        let mut state = StreamState::new(slot_name, start_lsn, prior_events);
        let result = self.stream(&mut state, &cancel).await;

        match &result {
            Ok(()) => info!(slot = %state.summary.slot_name, "Replication session stopping"),
            Err(e) => error!(
                slot = %state.summary.slot_name,
                error = %e,
                "Replication session failed"
            ),
        }

        self.shutdown(&mut state).await;

        result.map(|()| state.summary)
    }

    /// Start position: configured LSN, else checkpoint, else let the slot decide.
    fn resume_position(&self) -> PgResult<(u64, u64)> {
        let stored = match &self.checkpoint {
            Some(store) => store.load()?,
            None => None,
        };

        let (checkpoint_lsn, prior_events) = match stored {
            Some(cp) if cp.consumer == self.settings.slot_prefix => {
                info!(
                    lsn = %format_lsn(cp.lsn),
                    events = cp.events_dispatched,
                    "Loaded checkpoint"
                );
                (cp.lsn, cp.events_dispatched)
            }
            Some(cp) => {
                warn!(
                    consumer = %cp.consumer,
                    prefix = %self.settings.slot_prefix,
                    "Ignoring checkpoint written for another consumer"
                );
                (0, 0)
            }
            None => (0, 0),
        };

        Ok((self.settings.start_lsn.unwrap_or(checkpoint_lsn), prior_events))
    }

    async fn stream(&mut self, state: &mut StreamState, cancel: &CancellationToken) -> PgResult<()> {
        self.transport
            .start_replication(
                &state.summary.slot_name,
                state.start_lsn,
                &self.settings.plugin_options,
            )
            .await
            .map_err(|e| match e {
                PgError::StartReplication(_) => e,
                other => PgError::StartReplication(other.to_string()),
            })?;

        let receive_timeout = self.settings.receive_timeout;
        let mut scheduler = KeepaliveScheduler::new(self.settings.keepalive_interval, Instant::now());
        let mut decoder = WalDecoder::new();
        let mut consecutive_errors: u32 = 0;

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            if scheduler.poll(Instant::now()) {
                self.report_progress(state, false).await;
            }

            let received = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                received = self.transport.recv(receive_timeout) => received,
            };

            match received {
                Ok(WireMessage::CopyData(data)) => {
                    consecutive_errors = 0;
                    state.summary.messages += 1;

                    match decoder.decode(data) {
                        Decoded::Changes {
                            wal_start, events, ..
                        } => {
                            state.observe(wal_start);
                            if !events.is_empty() {
                                let report = match self.dispatcher.dispatch(events).await {
                                    Ok(report) => report,
                                    Err(e) => break Err(e.into()),
                                };
                                state.summary.events += report.delivered as u64;
                                state.summary.dropped += report.dropped as u64;

                                if report.dropped > 0
                                    && !self.settings.ack_dropped
                                    && !state.flush_held
                                {
                                    warn!(
                                        wal_start = %format_lsn(wal_start),
                                        flushed_lsn = %format_lsn(state.summary.flushed_lsn),
                                        "Events dropped; holding the flushed position for replay"
                                    );
                                    state.flush_held = true;
                                }
                            }
                            if !state.flush_held {
                                state.summary.flushed_lsn = state.summary.flushed_lsn.max(wal_start);
                            }
                        }
                        Decoded::Keepalive {
                            wal_end,
                            reply_requested,
                        } => {
                            state.observe(wal_end);
                            if reply_requested {
                                debug!(wal_end = %format_lsn(wal_end), "Server requested a reply");
                                self.report_progress(state, false).await;
                                scheduler.reset(Instant::now());
                            }
                        }
                        Decoded::Skipped { .. } => {}
                    }
                }
                Ok(WireMessage::Other) => consecutive_errors = 0,
                Err(RecvError::Timeout) => {}
                Err(RecvError::Fatal(reason)) => {
                    break Err(PgError::SessionClosed(reason));
                }
                Err(RecvError::Transient(reason)) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= self.settings.max_consecutive_errors {
                        break Err(PgError::SessionClosed(format!(
                            "{} consecutive receive errors, last: {}",
                            consecutive_errors, reason
                        )));
                    }

                    let delay = self.settings.retry_delay(consecutive_errors);
                    warn!(
                        error = %reason,
                        attempt = consecutive_errors,
                        delay_ms = delay.as_millis() as u64,
                        "Transient receive error, backing off"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        state.summary.skipped = decoder.skipped();
        result
    }

    /// Send a standby status update and checkpoint the flushed position.
    /// Failures are logged; the loop carries on.
    async fn report_progress(&mut self, state: &mut StreamState, reply_requested: bool) {
        let update = state.status(reply_requested);

        match self.transport.send_status(update).await {
            Ok(()) => {
                state.summary.status_updates += 1;
                debug!(
                    write_lsn = %format_lsn(update.write_lsn),
                    flush_lsn = %format_lsn(update.flush_lsn),
                    "Sent standby status update"
                );
            }
            Err(e) => warn!(error = %e, "Failed to send standby status update"),
        }

        if state.summary.flushed_lsn > state.checkpointed_lsn {
            self.save_checkpoint(state);
        }
    }

    fn save_checkpoint(&self, state: &mut StreamState) {
        let Some(store) = &self.checkpoint else {
            return;
        };

        let checkpoint = Checkpoint {
            consumer: self.settings.slot_prefix.clone(),
            lsn: state.summary.flushed_lsn,
            events_dispatched: state.prior_events + state.summary.events,
            updated_at: None,
        };

        match store.save(&checkpoint) {
            Ok(()) => state.checkpointed_lsn = checkpoint.lsn,
            Err(e) => warn!(
                path = %store.path().display(),
                error = %e,
                "Failed to save checkpoint"
            ),
        }
    }

    /// Close the connection, then release the slot.
    async fn shutdown(&mut self, state: &mut StreamState) {
        let slot_name = state.summary.slot_name.clone();

        if state.summary.flushed_lsn > state.checkpointed_lsn {
            self.save_checkpoint(state);
        }

        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Failed to close replication connection cleanly");
        }

        for attempt in 1..=SLOT_DROP_ATTEMPTS {
            match self.control.drop_slot(&slot_name).await {
                Ok(()) => {
                    info!(
                        slot = %slot_name,
                        messages = state.summary.messages,
                        events = state.summary.events,
                        "Replication slot dropped"
                    );
                    return;
                }
                Err(e) if attempt < SLOT_DROP_ATTEMPTS => {
                    let delay = SLOT_DROP_BACKOFF * 2u32.pow(attempt - 1);
                    warn!(
                        slot = %slot_name,
                        attempt = attempt,
                        error = %e,
                        "Failed to drop replication slot, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        slot = %slot_name,
                        error = %e,
                        "Failed to drop replication slot; drop it manually to release WAL"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use walcast_core::{Backpressure, ChangeEvent, ChangeKind, DispatchError, Value};

    use super::*;
    use crate::mock::{keepalive, raw, xlog_data, MockControl, MockTransport, TransportOp};

    const INSERT: &[u8] = br#"{"change":[{"kind":"insert","schema":"public","table":"users","columnnames":["id","name"],"columnvalues":[1,"Ann"]}]}"#;

    fn collecting() -> (Dispatcher, Arc<Mutex<Vec<ChangeEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let dispatcher = Dispatcher::callback(move |event| sink.lock().unwrap().push(event));
        (dispatcher, seen)
    }

    fn session(
        settings: StreamSettings,
        control: &MockControl,
        transport: &MockTransport,
        dispatcher: Dispatcher,
    ) -> ReplicationSession<MockControl, MockTransport> {
        ReplicationSession::new(settings, control.clone(), transport.clone(), dispatcher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_update_sent_when_interval_elapses_between_timeouts() {
        // 10s interval, 5s receive timeout: two empty waits reach the deadline.
        let control = MockControl::new();
        let transport = MockTransport::scripted([
            Err(RecvError::Timeout),
            Err(RecvError::Timeout),
            Ok(xlog_data(0x500, INSERT)),
        ]);
        let cancel = CancellationToken::new();
        transport.cancel_when_exhausted(cancel.clone());
        let (dispatcher, seen) = collecting();

        let summary = session(StreamSettings::default(), &control, &transport, dispatcher)
            .run(cancel)
            .await
            .unwrap();

        let ops = transport.ops();
        let status_positions: Vec<usize> = ops
            .iter()
            .enumerate()
            .filter(|(_, op)| matches!(op, TransportOp::Status(_)))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(status_positions, vec![3]);
        assert!(matches!(ops[0], TransportOp::Start { .. }));
        assert_eq!(&ops[1..3], &[TransportOp::Recv, TransportOp::Recv]);
        assert_eq!(ops[4], TransportOp::Recv);
        assert_eq!(ops.last(), Some(&TransportOp::Close));

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Insert);
        assert_eq!(events[0].get("name"), Some(&Value::String("Ann".into())));

        assert_eq!(summary.events, 1);
        assert_eq!(summary.status_updates, 1);
        assert_eq!(summary.flushed_lsn, 0x500);
        assert_eq!(control.dropped(), control.created());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_updates_bounded_by_interval() {
        let control = MockControl::new();
        let transport = MockTransport::scripted((0..12).map(|_| Err(RecvError::Timeout)));
        let cancel = CancellationToken::new();
        transport.cancel_when_exhausted(cancel.clone());

        // 12 waits of 5s = 60s of silence.
        session(StreamSettings::default(), &control, &transport, Dispatcher::log())
            .run(cancel)
            .await
            .unwrap();

        let updates = transport.status_updates().len();
        assert!((5..=6).contains(&updates), "got {} status updates", updates);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_session_drops_slot() {
        let control = MockControl::new();
        let transport = MockTransport::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = session(StreamSettings::default(), &control, &transport, Dispatcher::log())
            .run(cancel)
            .await
            .unwrap();

        assert_eq!(control.created(), vec![summary.slot_name.clone()]);
        assert_eq!(control.dropped(), vec![summary.slot_name]);
        assert_eq!(transport.recv_count(), 0);
        assert_eq!(transport.ops().last(), Some(&TransportOp::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_a_pending_receive() {
        let control = MockControl::new();
        let transport = MockTransport::new();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        session(StreamSettings::default(), &control, &transport, Dispatcher::log())
            .run(cancel)
            .await
            .unwrap();

        assert!(start.elapsed() < StreamSettings::default().receive_timeout);
        assert_eq!(control.dropped().len(), 1);
    }

    #[tokio::test]
    async fn test_create_failure_skips_drop() {
        let control = MockControl::failing_create("replication slot already exists");
        let transport = MockTransport::new();

        let result = session(StreamSettings::default(), &control, &transport, Dispatcher::log())
            .run(CancellationToken::new())
            .await;

        assert!(matches!(result, Err(PgError::SlotCreationFailed(_))));
        assert!(control.dropped().is_empty());
        assert_eq!(control.drop_attempts(), 0);
        assert!(transport.ops().is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_drops_slot_without_streaming() {
        let control = MockControl::new();
        let transport = MockTransport::failing_start("logical decoding requires wal_level >= logical");

        let result = session(StreamSettings::default(), &control, &transport, Dispatcher::log())
            .run(CancellationToken::new())
            .await;

        assert!(matches!(result, Err(PgError::StartReplication(_))));
        assert_eq!(transport.recv_count(), 0);
        assert_eq!(transport.ops().last(), Some(&TransportOp::Close));
        assert_eq!(control.dropped(), control.created());
        assert_eq!(control.dropped().len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_receive_error_ends_session() {
        let control = MockControl::new();
        let transport = MockTransport::scripted([
            Ok(xlog_data(0x10, INSERT)),
            Err(RecvError::Fatal("server closed the connection".into())),
            Ok(xlog_data(0x20, INSERT)),
        ]);
        let (dispatcher, seen) = collecting();

        let result = session(StreamSettings::default(), &control, &transport, dispatcher)
            .run(CancellationToken::new())
            .await;

        assert!(matches!(result, Err(PgError::SessionClosed(_))));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(transport.recv_count(), 2);
        assert_eq!(control.dropped().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_escalate_after_limit() {
        let control = MockControl::new();
        let transport = MockTransport::scripted(
            (0..5).map(|_| Err(RecvError::Transient("interrupted".into()))),
        );
        let settings = StreamSettings {
            max_consecutive_errors: 3,
            ..Default::default()
        };

        let result = session(settings, &control, &transport, Dispatcher::log())
            .run(CancellationToken::new())
            .await;

        assert!(matches!(result, Err(PgError::SessionClosed(_))));
        assert_eq!(transport.recv_count(), 3);
        assert_eq!(control.dropped().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_receive_resets_error_count() {
        let control = MockControl::new();
        let transport = MockTransport::scripted([
            Err(RecvError::Transient("interrupted".into())),
            Err(RecvError::Transient("interrupted".into())),
            Ok(keepalive(0x40, false)),
            Err(RecvError::Transient("interrupted".into())),
            Err(RecvError::Transient("interrupted".into())),
        ]);
        let cancel = CancellationToken::new();
        transport.cancel_when_exhausted(cancel.clone());
        let settings = StreamSettings {
            max_consecutive_errors: 3,
            ..Default::default()
        };

        let summary = session(settings, &control, &transport, Dispatcher::log())
            .run(cancel)
            .await
            .unwrap();

        assert_eq!(summary.messages, 1);
        assert_eq!(control.dropped().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_messages_are_skipped() {
        let control = MockControl::new();
        let transport = MockTransport::scripted([
            Ok(xlog_data(0x10, b"{not json")),
            Ok(raw(b"x")),
            Ok(xlog_data(0x20, INSERT)),
        ]);
        let cancel = CancellationToken::new();
        transport.cancel_when_exhausted(cancel.clone());
        let (dispatcher, seen) = collecting();

        let summary = session(StreamSettings::default(), &control, &transport, dispatcher)
            .run(cancel)
            .await
            .unwrap();

        assert_eq!(summary.messages, 3);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.events, 1);
        assert_eq!(seen.lock().unwrap()[0].lsn, 0x20);
    }

    #[tokio::test]
    async fn test_events_dispatched_in_wal_order() {
        let control = MockControl::new();
        let transport = MockTransport::scripted([
            Ok(xlog_data(
                0x10,
                br#"{"change":[{"kind":"insert","schema":"public","table":"t","columnnames":["id"],"columnvalues":[1]},{"kind":"update","schema":"public","table":"t","columnnames":["id"],"columnvalues":[1]}]}"#,
            )),
            Ok(xlog_data(0x20, br#"{"change":[]}"#)),
            Ok(xlog_data(
                0x30,
                br#"{"change":[{"kind":"delete","schema":"public","table":"t","oldkeys":{"keynames":["id"],"keyvalues":[1]}}]}"#,
            )),
        ]);
        let cancel = CancellationToken::new();
        transport.cancel_when_exhausted(cancel.clone());
        let (dispatcher, seen) = collecting();

        let summary = session(StreamSettings::default(), &control, &transport, dispatcher)
            .run(cancel)
            .await
            .unwrap();

        let kinds: Vec<ChangeKind> = seen.lock().unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]
        );
        assert_eq!(summary.flushed_lsn, 0x30);
        assert_eq!(summary.skipped, 0);
    }

    #[tokio::test]
    async fn test_closed_consumer_ends_session_and_drops_slot() {
        let control = MockControl::new();
        let transport = MockTransport::scripted([Ok(xlog_data(0x10, INSERT))]);
        let (dispatcher, receiver) = Dispatcher::channel(4, Backpressure::Reject);
        drop(receiver);

        let result = session(StreamSettings::default(), &control, &transport, dispatcher)
            .run(CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(PgError::Dispatch(DispatchError::ConsumerClosed))
        ));
        assert_eq!(control.dropped().len(), 1);
    }

    #[tokio::test]
    async fn test_reply_requested_gets_immediate_status() {
        let control = MockControl::new();
        let transport = MockTransport::scripted([Ok(keepalive(0x16B3748, true))]);
        let cancel = CancellationToken::new();
        transport.cancel_when_exhausted(cancel.clone());

        let summary = session(StreamSettings::default(), &control, &transport, Dispatcher::log())
            .run(cancel)
            .await
            .unwrap();

        let ops = transport.ops();
        assert_eq!(ops[1], TransportOp::Recv);
        match &ops[2] {
            TransportOp::Status(update) => {
                assert_eq!(update.write_lsn, 0x16B3748);
                assert_eq!(update.flush_lsn, 0);
            }
            other => panic!("expected status update, got {:?}", other),
        }
        assert_eq!(summary.status_updates, 1);
    }

    #[tokio::test]
    async fn test_failed_status_update_is_not_fatal() {
        let control = MockControl::new();
        let transport =
            MockTransport::scripted([Ok(keepalive(0x10, true)), Ok(xlog_data(0x20, INSERT))]);
        transport.fail_status_updates("broken pipe");
        let cancel = CancellationToken::new();
        transport.cancel_when_exhausted(cancel.clone());

        let summary = session(StreamSettings::default(), &control, &transport, Dispatcher::log())
            .run(cancel)
            .await
            .unwrap();

        assert_eq!(summary.status_updates, 0);
        assert_eq!(summary.events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_drop_retried() {
        let control = MockControl::failing_drops(2);
        let transport = MockTransport::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        session(StreamSettings::default(), &control, &transport, Dispatcher::log())
            .run(cancel)
            .await
            .unwrap();

        assert_eq!(control.drop_attempts(), 3);
        assert_eq!(control.dropped().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_drop_failure_is_not_fatal() {
        let control = MockControl::failing_drops(10);
        let transport = MockTransport::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = session(StreamSettings::default(), &control, &transport, Dispatcher::log())
            .run(cancel)
            .await;

        assert!(result.is_ok());
        assert_eq!(control.drop_attempts(), SLOT_DROP_ATTEMPTS);
        assert!(control.dropped().is_empty());
    }

    #[tokio::test]
    async fn test_fixed_slot_name() {
        let control = MockControl::new();
        let transport = MockTransport::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let settings = StreamSettings {
            slot_name: Some("orders_cdc".into()),
            ..Default::default()
        };

        let summary = session(settings, &control, &transport, Dispatcher::log())
            .run(cancel)
            .await
            .unwrap();

        assert_eq!(summary.slot_name, "orders_cdc");
        assert_eq!(
            transport.ops()[0],
            TransportOp::Start {
                slot_name: "orders_cdc".into(),
                start_lsn: 0
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_fixed_slot_name_rejected_before_create() {
        let control = MockControl::new();
        let settings = StreamSettings {
            slot_name: Some("Orders-CDC".into()),
            ..Default::default()
        };

        let result = session(settings, &control, &MockTransport::new(), Dispatcher::log())
            .run(CancellationToken::new())
            .await;

        assert!(matches!(result, Err(PgError::InvalidSlotName(_))));
        assert!(control.created().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_resume_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        store
            .save(&Checkpoint {
                consumer: "walcast".into(),
                lsn: 0x500,
                events_dispatched: 7,
                updated_at: None,
            })
            .unwrap();

        let control = MockControl::new();
        let transport = MockTransport::scripted([Ok(xlog_data(0x600, INSERT))]);
        let cancel = CancellationToken::new();
        transport.cancel_when_exhausted(cancel.clone());

        session(StreamSettings::default(), &control, &transport, Dispatcher::log())
            .with_checkpoint(store.clone())
            .run(cancel)
            .await
            .unwrap();

        assert!(matches!(
            transport.ops()[0],
            TransportOp::Start { start_lsn: 0x500, .. }
        ));

        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.lsn, 0x600);
        assert_eq!(saved.events_dispatched, 8);
        assert!(saved.updated_at.is_some());
    }

    const TWO_INSERTS: &[u8] = br#"{"change":[{"kind":"insert","schema":"public","table":"users","columnnames":["id"],"columnvalues":[2]},{"kind":"insert","schema":"public","table":"users","columnnames":["id"],"columnvalues":[3]}]}"#;

    #[tokio::test]
    async fn test_dropped_events_hold_flushed_position() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));

        // The first message fills the queue; nothing drains it.
        let (dispatcher, _receiver) = Dispatcher::channel(1, Backpressure::Reject);
        let transport = MockTransport::scripted([
            Ok(xlog_data(0x600, INSERT)),
            Ok(xlog_data(0x700, TWO_INSERTS)),
            Ok(keepalive(0x800, true)),
        ]);
        let cancel = CancellationToken::new();
        transport.cancel_when_exhausted(cancel.clone());

        let summary = session(StreamSettings::default(), &MockControl::new(), &transport, dispatcher)
            .with_checkpoint(store.clone())
            .run(cancel)
            .await
            .unwrap();

        assert_eq!(summary.events, 1);
        assert_eq!(summary.dropped, 2);
        assert_eq!(summary.flushed_lsn, 0x600);

        let updates = transport.status_updates();
        let last = updates.last().unwrap();
        assert_eq!(last.write_lsn, 0x800);
        assert_eq!(last.flush_lsn, 0x600);

        assert_eq!(store.load().unwrap().unwrap().lsn, 0x600);
    }

    #[tokio::test]
    async fn test_dropped_events_acknowledged_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));

        let (dispatcher, _receiver) = Dispatcher::channel(1, Backpressure::Reject);
        let transport = MockTransport::scripted([
            Ok(xlog_data(0x600, INSERT)),
            Ok(xlog_data(0x700, TWO_INSERTS)),
        ]);
        let cancel = CancellationToken::new();
        transport.cancel_when_exhausted(cancel.clone());

        let settings = StreamSettings {
            ack_dropped: true,
            ..Default::default()
        };
        let summary = session(settings, &MockControl::new(), &transport, dispatcher)
            .with_checkpoint(store.clone())
            .run(cancel)
            .await
            .unwrap();

        assert_eq!(summary.dropped, 2);
        assert_eq!(summary.flushed_lsn, 0x700);
        assert_eq!(store.load().unwrap().unwrap().lsn, 0x700);
    }

    #[tokio::test]
    async fn test_configured_start_lsn_wins_over_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        store
            .save(&Checkpoint {
                consumer: "walcast".into(),
                lsn: 0x500,
                ..Default::default()
            })
            .unwrap();

        let transport = MockTransport::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let settings = StreamSettings {
            start_lsn: Some(0x900),
            ..Default::default()
        };

        session(settings, &MockControl::new(), &transport, Dispatcher::log())
            .with_checkpoint(store)
            .run(cancel)
            .await
            .unwrap();

        assert!(matches!(
            transport.ops()[0],
            TransportOp::Start { start_lsn: 0x900, .. }
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_of_other_consumer_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        store
            .save(&Checkpoint {
                consumer: "billing".into(),
                lsn: 0x500,
                ..Default::default()
            })
            .unwrap();

        let transport = MockTransport::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        session(StreamSettings::default(), &MockControl::new(), &transport, Dispatcher::log())
            .with_checkpoint(store)
            .run(cancel)
            .await
            .unwrap();

        assert!(matches!(
            transport.ops()[0],
            TransportOp::Start { start_lsn: 0, .. }
        ));
    }
}
