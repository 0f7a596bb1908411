//! CopyData payloads of the streaming replication sub-protocol.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-replication.html

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::error::{PgError, PgResult};

/// Type marker of a WAL data chunk.
pub const XLOG_DATA_TAG: u8 = b'w';
/// Type marker of a primary keepalive.
pub const PRIMARY_KEEPALIVE_TAG: u8 = b'k';
/// Type marker of a standby status update.
pub const STANDBY_STATUS_TAG: u8 = b'r';

const XLOG_HEADER_LEN: usize = 1 + 8 + 8 + 8;
const KEEPALIVE_LEN: usize = 1 + 8 + 8 + 1;
/// Encoded size of a standby status update.
pub const STANDBY_STATUS_LEN: usize = 1 + 8 + 8 + 8 + 8 + 1;

/// Microseconds between the Unix epoch and 2000-01-01 00:00:00 UTC.
pub const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// A CopyData message received on a replication connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationMessage {
    XLogData {
        wal_start: u64,
        wal_end: u64,
        /// Microseconds since 2000-01-01.
        server_time: i64,
        data: Bytes,
    },
    PrimaryKeepalive {
        wal_end: u64,
        server_time: i64,
        reply_requested: bool,
    },
}

/// Positions reported back to the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Last WAL position received.
    pub write_lsn: u64,
    /// Last WAL position durably handled.
    pub flush_lsn: u64,
    /// Last WAL position applied.
    pub apply_lsn: u64,
    /// Ask the server to answer with a keepalive right away.
    pub reply_requested: bool,
}

/// Validate and strip the envelope of one CopyData payload.
pub fn parse_copy_data(data: Bytes) -> PgResult<ReplicationMessage> {
    let tag = *data
        .first()
        .ok_or_else(|| PgError::Envelope("empty CopyData payload".into()))?;

    match tag {
        XLOG_DATA_TAG => {
            if data.len() < XLOG_HEADER_LEN {
                return Err(PgError::Envelope(format!(
                    "XLogData header truncated: {} bytes",
                    data.len()
                )));
            }

            let mut cursor = Cursor::new(&data[1..XLOG_HEADER_LEN]);
            let wal_start = cursor.read_u64::<BigEndian>()?;
            let wal_end = cursor.read_u64::<BigEndian>()?;
            let server_time = cursor.read_i64::<BigEndian>()?;

            Ok(ReplicationMessage::XLogData {
                wal_start,
                wal_end,
                server_time,
                data: data.slice(XLOG_HEADER_LEN..),
            })
        }
        PRIMARY_KEEPALIVE_TAG => {
            if data.len() < KEEPALIVE_LEN {
                return Err(PgError::Envelope(format!(
                    "keepalive truncated: {} bytes",
                    data.len()
                )));
            }

            let mut cursor = Cursor::new(&data[1..KEEPALIVE_LEN]);
            let wal_end = cursor.read_u64::<BigEndian>()?;
            let server_time = cursor.read_i64::<BigEndian>()?;
            let reply_requested = cursor.read_u8()? != 0;

            Ok(ReplicationMessage::PrimaryKeepalive {
                wal_end,
                server_time,
                reply_requested,
            })
        }
        other => Err(PgError::Envelope(format!(
            "unknown message type: {} (0x{:02X})",
            other as char, other
        ))),
    }
}

/// Encode a standby status update stamped with the current time.
pub fn encode_standby_status(update: &StatusUpdate) -> Bytes {
    encode_standby_status_at(update, pg_now())
}

fn encode_standby_status_at(update: &StatusUpdate, clock: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(STANDBY_STATUS_LEN);
    buf.put_u8(STANDBY_STATUS_TAG);
    buf.put_u64(update.write_lsn);
    buf.put_u64(update.flush_lsn);
    buf.put_u64(update.apply_lsn);
    buf.put_i64(clock);
    buf.put_u8(u8::from(update.reply_requested));
    buf.freeze()
}

/// Current time in PostgreSQL epoch microseconds.
pub fn pg_now() -> i64 {
    Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

/// Convert PostgreSQL epoch microseconds to a UTC timestamp.
pub fn pg_timestamp(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros.checked_add(PG_EPOCH_OFFSET_MICROS)?)
}
