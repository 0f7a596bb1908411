mod connect;
mod error;
pub mod mock;
pub mod replication;
pub mod slot;

pub use connect::{connect_control, requires_tls, ConnectionTarget};
pub use error::{PgError, PgResult};
pub use replication::{
    Decoded, RecvError, ReplicationConnection, ReplicationMessage, ReplicationSession,
    ReplicationTransport, SessionSummary, StatusUpdate, WalDecoder, WireMessage,
};
pub use slot::{
    create_slot, drop_slot, generate_slot_name, list_slots, slot_exists, validate_slot_name,
    SlotControl, SlotInfo,
};
pub use walcast_core::{format_lsn, parse_lsn};
