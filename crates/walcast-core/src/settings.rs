use std::time::Duration;

/// Default decoding plugin.
pub const DEFAULT_PLUGIN: &str = "wal2json";

/// PostgreSQL identifier limit (NAMEDATALEN - 1).
pub const MAX_SLOT_NAME_LEN: usize = 63;

/// Slot names may only contain lower case letters, digits and underscores.
pub fn is_valid_slot_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_SLOT_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Runtime settings for one replication session.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    /// Prefix for generated slot names.
    pub slot_prefix: String,
    /// Fixed slot name; when unset a unique name is generated per run.
    pub slot_name: Option<String>,
    /// Output plugin the slot is created with.
    pub plugin: String,
    /// Options passed to the plugin in START_REPLICATION.
    pub plugin_options: Vec<(String, String)>,
    /// Maximum time between standby status updates.
    pub keepalive_interval: Duration,
    /// Upper bound on a single wait for the next message.
    pub receive_timeout: Duration,
    /// Transient receive errors tolerated in a row before the session ends.
    pub max_consecutive_errors: u32,
    /// First backoff delay after a transient receive error.
    pub retry_base_delay: Duration,
    /// Start position; when unset the checkpoint (or the slot) decides.
    pub start_lsn: Option<u64>,
    /// Acknowledge messages whose events were dropped under backpressure.
    /// When false the flushed position stops at the last message delivered
    /// in full, so a resumed run replays what the consumer missed.
    pub ack_dropped: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            slot_prefix: "walcast".to_string(),
            slot_name: None,
            plugin: DEFAULT_PLUGIN.to_string(),
            plugin_options: vec![("pretty-print".to_string(), "0".to_string())],
            keepalive_interval: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(5),
            max_consecutive_errors: 10,
            retry_base_delay: Duration::from_millis(100),
            start_lsn: None,
            ack_dropped: false,
        }
    }
}

impl StreamSettings {
    /// Backoff before the next receive after `attempt` consecutive transient
    /// errors, capped at the receive timeout.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.receive_timeout)
    }
}
