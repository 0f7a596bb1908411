use std::time::Duration;

use walcast_core::{is_valid_slot_name, parse_lsn, Backpressure, StreamSettings, MAX_SLOT_NAME_LEN};

use crate::error::{ConfigError, ConfigResult};
use crate::settings::{BackpressureMode, DispatchConfig, WalcastConfig};

/// Room left for the "_" + 12 hex digit suffix of generated slot names.
const SLOT_SUFFIX_LEN: usize = 13;

/// Validate a parsed configuration.
pub fn validate_config(config: &WalcastConfig) -> ConfigResult<()> {
    validate_connection(config)?;
    validate_slot(config)?;
    validate_stream(config)?;
    validate_dispatch(&config.dispatch)?;
    Ok(())
}

fn validate_connection(config: &WalcastConfig) -> ConfigResult<()> {
    if config.postgres.connection_string.trim().is_empty() {
        return Err(ConfigError::MissingField {
            field: "postgres.connection_string".to_string(),
        });
    }
    Ok(())
}

fn validate_slot(config: &WalcastConfig) -> ConfigResult<()> {
    let prefix = &config.slot.prefix;
    let max = MAX_SLOT_NAME_LEN - SLOT_SUFFIX_LEN;
    if prefix.len() > max || !is_valid_slot_name(prefix) {
        return Err(ConfigError::InvalidSlotPrefix {
            value: prefix.clone(),
            max,
        });
    }

    if let Some(name) = &config.slot.name {
        if !is_valid_slot_name(name) {
            return Err(ConfigError::InvalidSlotName {
                value: name.clone(),
            });
        }
    }

    if config.slot.plugin.trim().is_empty() {
        return Err(ConfigError::MissingField {
            field: "slot.plugin".to_string(),
        });
    }
    Ok(())
}

fn validate_stream(config: &WalcastConfig) -> ConfigResult<()> {
    let stream = &config.stream;

    if stream.keepalive_interval_ms == 0 {
        return Err(ConfigError::ZeroDuration {
            field: "keepalive_interval_ms".to_string(),
        });
    }
    if stream.receive_timeout_ms == 0 {
        return Err(ConfigError::ZeroDuration {
            field: "receive_timeout_ms".to_string(),
        });
    }
    if stream.receive_timeout_ms >= stream.keepalive_interval_ms {
        return Err(ConfigError::TimeoutOrdering {
            receive_timeout_ms: stream.receive_timeout_ms,
            keepalive_interval_ms: stream.keepalive_interval_ms,
        });
    }

    if stream.max_consecutive_errors == 0 {
        return Err(ConfigError::InvalidErrorLimit);
    }

    if let Some(lsn) = &stream.start_lsn {
        parse_lsn(lsn).map_err(|_| ConfigError::InvalidStartLsn { value: lsn.clone() })?;
    }

    for key in stream.plugin_options.keys() {
        if key.is_empty() || key.contains('"') || key.contains('\'') {
            return Err(ConfigError::InvalidPluginOption { key: key.clone() });
        }
    }
    Ok(())
}

fn validate_dispatch(dispatch: &DispatchConfig) -> ConfigResult<()> {
    if dispatch.queue_capacity == 0 {
        return Err(ConfigError::InvalidQueueCapacity);
    }
    if dispatch.backpressure == BackpressureMode::Block && dispatch.block_timeout_ms == 0 {
        return Err(ConfigError::ZeroDuration {
            field: "block_timeout_ms".to_string(),
        });
    }
    Ok(())
}

/// Convert a validated config into session settings.
pub fn to_stream_settings(config: &WalcastConfig) -> ConfigResult<StreamSettings> {
    validate_config(config)?;

    let stream = &config.stream;
    let start_lsn = match &stream.start_lsn {
        Some(lsn) => Some(
            parse_lsn(lsn).map_err(|_| ConfigError::InvalidStartLsn { value: lsn.clone() })?,
        ),
        None => None,
    };

    Ok(StreamSettings {
        slot_prefix: config.slot.prefix.clone(),
        slot_name: config.slot.name.clone(),
        plugin: config.slot.plugin.clone(),
        plugin_options: stream
            .plugin_options
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        keepalive_interval: Duration::from_millis(stream.keepalive_interval_ms),
        receive_timeout: Duration::from_millis(stream.receive_timeout_ms),
        max_consecutive_errors: stream.max_consecutive_errors,
        retry_base_delay: Duration::from_millis(stream.retry_base_delay_ms),
        start_lsn,
        ack_dropped: config.dispatch.ack_dropped,
    })
}

/// Backpressure policy for the channel sink.
pub fn to_backpressure(dispatch: &DispatchConfig) -> Backpressure {
    match dispatch.backpressure {
        BackpressureMode::Block => Backpressure::Block {
            timeout: Duration::from_millis(dispatch.block_timeout_ms),
        },
        BackpressureMode::Reject => Backpressure::Reject,
    }
}
