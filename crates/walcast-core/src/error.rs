use thiserror::Error;

/// Errors that can occur in walcast-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("duplicate column '{column}' in {schema}.{table}")]
    DuplicateColumn {
        schema: String,
        table: String,
        column: String,
    },

    #[error("invalid LSN format: {0}")]
    InvalidLsn(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
