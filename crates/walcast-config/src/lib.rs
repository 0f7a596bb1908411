mod error;
mod settings;
mod validation;

pub use error::{ConfigError, ConfigResult};
pub use settings::{
    BackpressureMode, CheckpointConfig, DispatchConfig, PostgresConfig, SinkKind, SlotConfig,
    StreamConfig, WalcastConfig,
};
pub use validation::{to_backpressure, to_stream_settings, validate_config};
