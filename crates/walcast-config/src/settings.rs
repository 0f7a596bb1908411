use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::ConfigResult;

/// Raw configuration as parsed from walcast.toml.
#[derive(Debug, Deserialize)]
pub struct WalcastConfig {
    /// Source database.
    pub postgres: PostgresConfig,
    /// Replication slot naming and plugin.
    #[serde(default)]
    pub slot: SlotConfig,
    /// Receive loop timing.
    #[serde(default)]
    pub stream: StreamConfig,
    /// Event delivery.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Resume position storage.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl WalcastConfig {
    /// Parse a config from a TOML string.
    pub fn parse(toml_str: &str) -> ConfigResult<Self> {
        let config: WalcastConfig = toml::from_str(toml_str)?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
pub struct PostgresConfig {
    /// libpq key/value string or postgres:// URL; may contain ${VAR} references.
    pub connection_string: String,
}

#[derive(Debug, Deserialize)]
pub struct SlotConfig {
    /// Prefix for generated slot names.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Fixed slot name instead of a generated one.
    pub name: Option<String>,
    /// Logical decoding output plugin.
    #[serde(default = "default_plugin")]
    pub plugin: String,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            name: None,
            plugin: default_plugin(),
        }
    }
}

fn default_prefix() -> String {
    "walcast".to_string()
}

fn default_plugin() -> String {
    walcast_core::DEFAULT_PLUGIN.to_string()
}

#[derive(Debug, Deserialize)]
pub struct StreamConfig {
    /// Maximum time between standby status updates.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,
    /// Upper bound on one wait for the next message.
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_ms: u64,
    /// Transient receive errors tolerated in a row.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// First retry delay after a transient error.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    /// Start position in X/Y form.
    pub start_lsn: Option<String>,
    /// Options passed to the output plugin.
    #[serde(default = "default_plugin_options")]
    pub plugin_options: BTreeMap<String, String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: default_keepalive_interval(),
            receive_timeout_ms: default_receive_timeout(),
            max_consecutive_errors: default_max_consecutive_errors(),
            retry_base_delay_ms: default_retry_base_delay(),
            start_lsn: None,
            plugin_options: default_plugin_options(),
        }
    }
}

fn default_keepalive_interval() -> u64 {
    10_000
}

fn default_receive_timeout() -> u64 {
    5_000
}

fn default_max_consecutive_errors() -> u32 {
    10
}

fn default_retry_base_delay() -> u64 {
    100
}

fn default_plugin_options() -> BTreeMap<String, String> {
    [("pretty-print".to_string(), "0".to_string())]
        .into_iter()
        .collect()
}

/// Which sink the CLI dispatches to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// One log line per event.
    #[default]
    Log,
    /// JSON lines on stdout, via the bounded queue.
    Json,
}

/// Policy when the consumer queue is full.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    /// Wait up to block_timeout_ms per message, then drop.
    #[default]
    Block,
    /// Drop immediately.
    Reject,
}

#[derive(Debug, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub sink: SinkKind,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub backpressure: BackpressureMode,
    #[serde(default = "default_block_timeout")]
    pub block_timeout_ms: u64,
    /// Advance the flushed position past messages with dropped events.
    #[serde(default)]
    pub ack_dropped: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::default(),
            queue_capacity: default_queue_capacity(),
            backpressure: BackpressureMode::default(),
            block_timeout_ms: default_block_timeout(),
            ack_dropped: false,
        }
    }
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_block_timeout() -> u64 {
    1_000
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckpointConfig {
    /// File holding the last acknowledged position; unset disables resume.
    pub path: Option<String>,
}
