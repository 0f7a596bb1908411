use thiserror::Error;

#[derive(Debug, Error)]
pub enum PgError {
    #[error("postgres error: {0}")]
    Postgres(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("replication slot '{0}' does not exist")]
    SlotNotFound(String),

    #[error("failed to create replication slot: {0}")]
    SlotCreationFailed(String),

    #[error("failed to drop replication slot: {0}")]
    SlotDropFailed(String),

    #[error("invalid replication slot name '{0}'")]
    InvalidSlotName(String),

    #[error("failed to start replication: {0}")]
    StartReplication(String),

    #[error("replication session closed: {0}")]
    SessionClosed(String),

    #[error("malformed replication message: {0}")]
    Envelope(String),

    #[error("invalid LSN format: {0}")]
    InvalidLsn(String),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] walcast_core::DispatchError),

    #[error(transparent)]
    Core(#[from] walcast_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_postgres::Error> for PgError {
    fn from(e: tokio_postgres::Error) -> Self {
        // Extract database error details if available
        if let Some(db_err) = e.as_db_error() {
            let msg = format!(
                "{}: {} (code: {})",
                db_err.severity(),
                db_err.message(),
                db_err.code().code()
            );
            PgError::Postgres(msg)
        } else {
            PgError::Postgres(e.to_string())
        }
    }
}

pub type PgResult<T> = Result<T, PgError>;
