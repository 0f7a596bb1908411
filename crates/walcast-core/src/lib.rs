pub mod checkpoint;
pub mod dispatch;
pub mod error;
pub mod keepalive;
pub mod lsn;
pub mod settings;
pub mod types;
pub mod wal2json;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use dispatch::{Backpressure, DispatchError, DispatchReport, Dispatcher, Sink};
pub use error::{Error, Result};
pub use keepalive::KeepaliveScheduler;
pub use lsn::{format_lsn, parse_lsn};
pub use settings::{is_valid_slot_name, StreamSettings, DEFAULT_PLUGIN, MAX_SLOT_NAME_LEN};
pub use types::{ChangeEvent, ChangeKind, Column, Value};
pub use wal2json::decode_payload;
