use thiserror::Error;

/// Errors that can occur when parsing or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("invalid slot prefix '{value}': use lower case letters, digits and '_' (at most {max} characters)")]
    InvalidSlotPrefix { value: String, max: usize },

    #[error("invalid slot name '{value}': use lower case letters, digits and '_' (at most 63 characters)")]
    InvalidSlotName { value: String },

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: String },

    #[error("receive_timeout_ms ({receive_timeout_ms}) must be less than keepalive_interval_ms ({keepalive_interval_ms})")]
    TimeoutOrdering {
        receive_timeout_ms: u64,
        keepalive_interval_ms: u64,
    },

    #[error("invalid start_lsn '{value}': expected X/Y hex format")]
    InvalidStartLsn { value: String },

    #[error("max_consecutive_errors must be at least 1")]
    InvalidErrorLimit,

    #[error("queue_capacity must be at least 1")]
    InvalidQueueCapacity,

    #[error("invalid plugin option '{key}': keys must be non-empty and contain no quotes")]
    InvalidPluginOption { key: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
