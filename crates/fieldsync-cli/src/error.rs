use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] fieldsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Entity ID cannot be empty")]
    EmptyEntityId,
    #[error("Entity not found for id/prefix: {0}")]
    EntityNotFound(String),
    #[error("{0}")]
    AmbiguousEntityId(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Draft not found: {0}")]
    DraftNotFound(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Sync is not configured. Pass --api-url and --token, or set FIELDSYNC_API_URL and FIELDSYNC_ACCESS_TOKEN."
    )]
    SyncNotConfigured,
}
