//! Delivery of decoded change events to the consumer.
//!
//! Dispatch runs inline with the receive loop. A slow `Callback` sink stalls
//! the loop (and with it keepalives), so consumers doing real work should use
//! the `Channel` sink and process events on their own task. A blocking channel
//! waits at most one backpressure timeout per message, however many events
//! the message carries.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::types::ChangeEvent;

/// What the channel sink does when the consumer queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Wait up to `timeout` per message for room, then drop whatever of the
    /// message is still undelivered.
    Block { timeout: Duration },
    /// Drop the event immediately.
    Reject,
}

impl Default for Backpressure {
    fn default() -> Self {
        Backpressure::Block {
            timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("event consumer has gone away")]
    ConsumerClosed,
}

/// Outcome of dispatching one message's events.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Where events go.
pub enum Sink {
    /// One log line per event.
    Log,
    /// Invoke a closure for every event.
    Callback(Box<dyn FnMut(ChangeEvent) + Send>),
    /// Push onto a bounded queue drained by another task.
    Channel {
        sender: mpsc::Sender<ChangeEvent>,
        backpressure: Backpressure,
    },
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::Log => f.write_str("Log"),
            Sink::Callback(_) => f.write_str("Callback"),
            Sink::Channel { backpressure, .. } => f
                .debug_struct("Channel")
                .field("backpressure", backpressure)
                .finish(),
        }
    }
}

/// Hands decoded events to the registered sink, in decode order.
#[derive(Debug)]
pub struct Dispatcher {
    sink: Sink,
    delivered: u64,
    dropped: u64,
}

impl Dispatcher {
    pub fn new(sink: Sink) -> Self {
        Self {
            sink,
            delivered: 0,
            dropped: 0,
        }
    }

    /// Dispatcher that logs every event.
    pub fn log() -> Self {
        Self::new(Sink::Log)
    }

    /// Dispatcher that calls `f` for every event.
    pub fn callback(f: impl FnMut(ChangeEvent) + Send + 'static) -> Self {
        Self::new(Sink::Callback(Box::new(f)))
    }

    /// Dispatcher feeding a bounded queue. Returns the consumer end.
    pub fn channel(
        capacity: usize,
        backpressure: Backpressure,
    ) -> (Self, mpsc::Receiver<ChangeEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self::new(Sink::Channel {
                sender,
                backpressure,
            }),
            receiver,
        )
    }

    /// Deliver all events from one decoded message.
    pub async fn dispatch(
        &mut self,
        events: Vec<ChangeEvent>,
    ) -> Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport::default();
        let deadline = match &self.sink {
            Sink::Channel {
                backpressure: Backpressure::Block { timeout },
                ..
            } => Some(Instant::now() + *timeout),
            _ => None,
        };

        for event in events {
            let delivered = match &mut self.sink {
                Sink::Log => {
                    info!(
                        kind = %event.kind,
                        schema = %event.schema,
                        table = %event.table,
                        columns = event.columns.len(),
                        lsn = event.lsn,
                        "Change detected"
                    );
                    true
                }
                Sink::Callback(f) => {
                    f(event);
                    true
                }
                Sink::Channel { sender, .. } => send_before(sender, deadline, event).await?,
            };

            if delivered {
                report.delivered += 1;
            } else {
                report.dropped += 1;
            }
        }

        self.delivered += report.delivered as u64;
        self.dropped += report.dropped as u64;

        if report.dropped > 0 {
            warn!(
                dropped = report.dropped,
                total_dropped = self.dropped,
                "Consumer queue full, events dropped"
            );
        }

        Ok(report)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Send `event`, waiting for room until `deadline`. Without a deadline, or
/// once it has passed, a full queue drops the event.
async fn send_before(
    sender: &mpsc::Sender<ChangeEvent>,
    deadline: Option<Instant>,
    event: ChangeEvent,
) -> Result<bool, DispatchError> {
    let remaining = deadline
        .map(|deadline| deadline.saturating_duration_since(Instant::now()))
        .unwrap_or_default();

    if remaining.is_zero() {
        return match sender.try_send(event) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::ConsumerClosed),
        };
    }

    match sender.send_timeout(event, remaining).await {
        Ok(()) => Ok(true),
        Err(mpsc::error::SendTimeoutError::Timeout(_)) => Ok(false),
        Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(DispatchError::ConsumerClosed),
    }
}
