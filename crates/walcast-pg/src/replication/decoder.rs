use bytes::Bytes;
use tracing::{debug, warn};
use walcast_core::{decode_payload, format_lsn, ChangeEvent};

use super::envelope::{parse_copy_data, ReplicationMessage};

/// Result of decoding one CopyData payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A WAL data chunk and the change events it carried (possibly none).
    Changes {
        wal_start: u64,
        wal_end: u64,
        events: Vec<ChangeEvent>,
    },
    /// A server heartbeat.
    Keepalive { wal_end: u64, reply_requested: bool },
    /// The message could not be decoded and was dropped.
    Skipped { reason: String },
}

/// Turns CopyData payloads into change events.
///
/// Decoding failures never propagate: a malformed envelope or payload is
/// logged and reported as `Decoded::Skipped`.
#[derive(Debug, Default)]
pub struct WalDecoder {
    skipped: u64,
}

impl WalDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, data: Bytes) -> Decoded {
        let message = match parse_copy_data(data) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Discarding malformed replication message");
                return self.skip(e.to_string());
            }
        };

        match message {
            ReplicationMessage::XLogData {
                wal_start,
                wal_end,
                data,
                ..
            } => match decode_payload(&data, wal_start) {
                Ok(events) => {
                    debug!(
                        wal_start = %format_lsn(wal_start),
                        count = events.len(),
                        "Decoded XLogData"
                    );
                    Decoded::Changes {
                        wal_start,
                        wal_end,
                        events,
                    }
                }
                Err(e) => {
                    warn!(
                        wal_start = %format_lsn(wal_start),
                        bytes = data.len(),
                        error = %e,
                        "Failed to decode wal2json payload"
                    );
                    self.skip(e.to_string())
                }
            },
            ReplicationMessage::PrimaryKeepalive {
                wal_end,
                reply_requested,
                ..
            } => Decoded::Keepalive {
                wal_end,
                reply_requested,
            },
        }
    }

    /// Number of messages dropped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn skip(&mut self, reason: String) -> Decoded {
        self.skipped += 1;
        Decoded::Skipped { reason }
    }
}
