//! Logical replication streaming.

pub mod connection;
pub mod decoder;
pub mod envelope;
pub mod session;
pub mod transport;

pub use connection::{start_replication_command, ReplicationConnection};
pub use decoder::{Decoded, WalDecoder};
pub use envelope::{
    encode_standby_status, parse_copy_data, pg_now, pg_timestamp, ReplicationMessage,
    StatusUpdate,
};
pub use session::{ReplicationSession, SessionSummary};
pub use transport::{RecvError, ReplicationTransport, WireMessage};
